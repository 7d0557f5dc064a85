//! WebSocket client for the signaling hub.
//!
//! The hub is a topic relay: frames address a topic (`t`), a peer
//! (`p`), or carry a request id (`r`). This client splits the socket
//! into a writer task fed by a channel and a reader task that routes
//! inbound frames into [`HubEvent`]s, resolving request/response pairs
//! along the way.

use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use parley_proto::{
    CombinedId, HubFrame, TOPIC_ADD_PEER, TOPIC_ALL, TOPIC_PEERS, TOPIC_REMOVE_PEER,
    TOPIC_RESPONSE,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// How long a request may wait for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Outbound direct messages use this topic; the relay routes them by
/// the `p` field.
const TOPIC_DIRECT: &str = "direct";

/// What the reader task surfaces to the swarm.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Full membership snapshot; supersedes everything known before.
    Peers(Vec<CombinedId>),
    AddPeer(CombinedId),
    RemovePeer(CombinedId),
    /// A frame addressed to us, `from` being the sender.
    Direct { from: CombinedId, data: Value },
    /// A room-wide broadcast; sender present when the relay stamps it.
    Broadcast {
        from: Option<CombinedId>,
        data: Value,
    },
    /// Anything published on another subscribed topic (server and SFU
    /// traffic). `request_id` is set when the sender expects a reply.
    Topic {
        topic: String,
        data: Value,
        request_id: Option<String>,
    },
    /// The socket is gone; pending requests have been failed.
    Closed,
}

/// Connection parameters for one hub session.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Base URL, e.g. `wss://hub.example.com/rooms` (http/https are
    /// rewritten to ws/wss).
    pub url: String,
    pub room: String,
    pub my_id: CombinedId,
    /// Opaque auth token placed in the query string.
    pub token: Option<String>,
    /// Topics to subscribe beyond the implicit personal channel.
    pub subscriptions: Vec<String>,
}

enum WriterCmd {
    Frame(HubFrame),
    Close,
}

struct HubInner {
    my_id: CombinedId,
    writer: mpsc::UnboundedSender<WriterCmd>,
    closed: AtomicBool,
    requests: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    request_seq: AtomicU64,
}

impl HubInner {
    fn send_frame(&self, frame: HubFrame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::HubNotConnected);
        }
        self.writer
            .send(WriterCmd::Frame(frame))
            .map_err(|_| Error::HubNotConnected)
    }
}

/// Handle to a connected hub session. Cheap to clone.
#[derive(Clone)]
pub struct SignalingHub {
    inner: Arc<HubInner>,
}

impl SignalingHub {
    /// Open the socket and spawn the reader/writer tasks. The returned
    /// receiver yields routed frames until [`HubEvent::Closed`].
    pub async fn connect(config: HubConfig) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>)> {
        let url = build_url(&config)?;
        debug!(room = %config.room, "connecting to hub");
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCmd>();
        let inner = Arc::new(HubInner {
            my_id: config.my_id.clone(),
            writer: writer_tx,
            closed: AtomicBool::new(false),
            requests: Mutex::new(HashMap::new()),
            request_seq: AtomicU64::new(0),
        });

        tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCmd::Frame(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(err) => {
                                warn!(error = %err, "dropping unserializable hub frame");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    WriterCmd::Close => break,
                }
            }
            let _ = sink.close().await;
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame: HubFrame = match message {
                    Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "ignoring malformed hub frame");
                            continue;
                        }
                    },
                    Ok(Message::Binary(bytes)) => match serde_json::from_slice(&bytes) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "ignoring malformed hub frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if let Some(event) = reader_inner.route(frame) {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
            reader_inner.closed.store(true, Ordering::Release);
            reader_inner.requests.lock().clear();
            let _ = event_tx.send(HubEvent::Closed);
        });

        Ok((Self { inner }, event_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Publish on a topic.
    pub fn broadcast(&self, topic: &str, data: Value) -> Result<()> {
        self.inner.send_frame(HubFrame::broadcast(topic, data))
    }

    /// Send to one peer connection.
    pub fn send_direct(&self, to: &CombinedId, data: Value) -> Result<()> {
        self.inner.send_frame(HubFrame::direct(to, TOPIC_DIRECT, data))
    }

    /// Publish on a topic and await the matching response frame.
    pub async fn send_request(&self, topic: &str, data: Value, timeout: Duration) -> Result<Value> {
        let seq = self.inner.request_seq.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("{};{seq}", self.inner.my_id);
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().insert(request_id.clone(), tx);

        if let Err(err) = self
            .inner
            .send_frame(HubFrame::request(topic, data, request_id.clone()))
        {
            self.inner.requests.lock().remove(&request_id);
            return Err(err);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(Error::HubNotConnected),
            Err(_) => {
                self.inner.requests.lock().remove(&request_id);
                Err(Error::RequestTimeout(topic.to_string()))
            }
        }
    }

    /// Answer a server-initiated request carrying `request_id`.
    pub fn respond(&self, request_id: &str, data: Value) -> Result<()> {
        self.inner
            .send_frame(HubFrame::request(TOPIC_RESPONSE, data, request_id))
    }

    /// Subscribe to an additional topic on the live session.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.inner.send_frame(HubFrame::subscribe(topic))
    }

    /// Close the session; the reader will surface [`HubEvent::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.writer.send(WriterCmd::Close);
    }
}

impl HubInner {
    fn route(&self, frame: HubFrame) -> Option<HubEvent> {
        let topic = frame.t.as_deref().unwrap_or("");
        match topic {
            TOPIC_RESPONSE => {
                if let Some(request_id) = frame.r {
                    if let Some(tx) = self.requests.lock().remove(&request_id) {
                        let _ = tx.send(frame.d.unwrap_or(Value::Null));
                    } else {
                        debug!(request_id, "response for unknown request");
                    }
                }
                None
            }
            TOPIC_PEERS => {
                let ids = frame
                    .d
                    .as_ref()
                    .and_then(Value::as_array)
                    .map(|list| {
                        list.iter()
                            .filter_map(Value::as_str)
                            .filter_map(CombinedId::parse)
                            .filter(|id| *id != self.my_id)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(HubEvent::Peers(ids))
            }
            TOPIC_ADD_PEER => {
                let id = frame.d.as_ref().and_then(Value::as_str).and_then(CombinedId::parse)?;
                (id != self.my_id).then_some(HubEvent::AddPeer(id))
            }
            TOPIC_REMOVE_PEER => {
                let id = frame.d.as_ref().and_then(Value::as_str).and_then(CombinedId::parse)?;
                Some(HubEvent::RemovePeer(id))
            }
            TOPIC_ALL => Some(HubEvent::Broadcast {
                from: frame.p.as_deref().and_then(CombinedId::parse),
                data: frame.d.unwrap_or(Value::Null),
            }),
            _ if topic == TOPIC_DIRECT || topic == self.my_id.peer_id.as_str() => {
                let from = frame.p.as_deref().and_then(CombinedId::parse)?;
                Some(HubEvent::Direct {
                    from,
                    data: frame.d.unwrap_or(Value::Null),
                })
            }
            _ => Some(HubEvent::Topic {
                topic: topic.to_string(),
                data: frame.d.unwrap_or(Value::Null),
                request_id: frame.r,
            }),
        }
    }
}

fn build_url(config: &HubConfig) -> Result<Url> {
    let base = normalize_scheme(&config.url);
    let with_room = format!("{}/{}", base.trim_end_matches('/'), config.room);
    let mut url = Url::parse(&with_room).map_err(|err| Error::InvalidUrl(err.to_string()))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("id", &config.my_id.to_string());
        if let Some(token) = &config.token {
            query.append_pair("token", token);
        }
        if !config.subscriptions.is_empty() {
            query.append_pair("subs", &config.subscriptions.join(","));
        }
    }
    Ok(url)
}

fn normalize_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("wss://{url}")
    }
}
