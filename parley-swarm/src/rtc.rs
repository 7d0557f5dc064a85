//! WebRTC-backed [`PeerTransport`].
//!
//! One `RtcTransport` is one connection attempt: it owns the
//! `RTCPeerConnection`, relays its callbacks as [`TransportEvent`]s and
//! applies remote negotiation steps. A replaced instance is marked
//! garbage and goes silent instead of being awaited on teardown.

use crate::config::{IceConfig, IceServer};
use crate::error::{Error, Result};
use crate::transport::{
    LocalTrack, PeerTransport, PeerTransportFactory, RemoteSource, TransportEvent,
    TransportEventTx, TransportHandle,
};
use async_trait::async_trait;
use bytes::Bytes;
use nanoid::nanoid;
use parking_lot::Mutex;
use parley_proto::{CandidateInit, ConnId, MediaKind, PeerId, SignalBody, SignalPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

/// Length of the per-attempt `from` nonce.
const TRANSPORT_ID_LEN: usize = 12;

const DATA_CHANNEL_LABEL: &str = "swarm";

struct RemoteTrack(Arc<TrackRemote>);

impl RemoteSource for RemoteTrack {
    fn media_kind(&self) -> MediaKind {
        match self.0.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    fn msid(&self) -> String {
        self.0.stream_id()
    }
}

struct Shared {
    handle: TransportHandle,
    events: TransportEventTx,
    garbage: AtomicBool,
    /// ICE is up; renegotiation on track changes only makes sense then.
    connected: AtomicBool,
    /// Candidates received before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    /// Created locally on the initiating side, received via
    /// `on_data_channel` on the other.
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.garbage.load(Ordering::Acquire) {
            return;
        }
        let _ = self.events.send((self.handle.clone(), event));
    }
}

pub struct RtcTransport {
    initiator: bool,
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    senders: Mutex<HashMap<String, (Arc<RTCRtpSender>, String)>>,
}

impl RtcTransport {
    async fn new(
        peer_id: &PeerId,
        conn_id: &ConnId,
        initiator: bool,
        ice: &IceConfig,
        local_tracks: &[(String, LocalTrack)],
        events: TransportEventTx,
    ) -> Result<Self> {
        let id = nanoid!(TRANSPORT_ID_LEN);
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice.servers.iter().map(ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let shared = Arc::new(Shared {
            handle: TransportHandle {
                peer_id: peer_id.clone(),
                conn_id: conn_id.clone(),
                transport_id: id,
            },
            events,
            garbage: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            data_channel: Mutex::new(None),
        });

        let shared2 = Arc::clone(&shared);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = Arc::clone(&shared2);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => shared.emit(TransportEvent::Signal(SignalPayload::new(
                        SignalBody::Candidate {
                            candidate: CandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        },
                    ))),
                    Err(err) => warn!(error = %err, "failed to serialize local ice candidate"),
                }
            })
        }));

        let shared2 = Arc::clone(&shared);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let shared = Arc::clone(&shared2);
            Box::pin(async move {
                debug!(transport_id = %shared.handle.transport_id, ?state, "ice connection state");
                match state {
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        shared.connected.store(true, Ordering::Release);
                        shared.emit(TransportEvent::Connected);
                    }
                    RTCIceConnectionState::Disconnected => {
                        shared.connected.store(false, Ordering::Release);
                        shared.emit(TransportEvent::IceDisconnected);
                    }
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                        shared.connected.store(false, Ordering::Release);
                        shared.emit(TransportEvent::Failed);
                    }
                    _ => {}
                }
            })
        }));

        let shared2 = Arc::clone(&shared);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let shared = Arc::clone(&shared2);
            Box::pin(async move {
                debug!(
                    transport_id = %shared.handle.transport_id,
                    stream_id = %track.stream_id(),
                    "remote track"
                );
                shared.emit(TransportEvent::Track(Arc::new(RemoteTrack(track))));
            })
        }));

        let transport = Self {
            initiator,
            pc,
            shared,
            senders: Mutex::new(HashMap::new()),
        };

        if !initiator {
            let shared2 = Arc::clone(&transport.shared);
            transport
                .pc
                .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let shared = Arc::clone(&shared2);
                    Box::pin(async move {
                        wire_data_channel(&dc, &shared);
                        *shared.data_channel.lock() = Some(dc);
                    })
                }));
        }

        for (name, track) in local_tracks {
            transport.add_sender(name, track).await?;
        }
        Ok(transport)
    }

    async fn add_sender(&self, name: &str, track: &LocalTrack) -> Result<()> {
        let stream_id = track.stream_id().to_string();
        let sender = self.pc.add_track(Arc::clone(track)).await?;

        // Drain RTCP so the interceptors keep running.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders
            .lock()
            .insert(name.to_string(), (sender, stream_id));
        Ok(())
    }

    /// Create and send a (re-)offer.
    async fn negotiate(&self) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        self.shared
            .emit(TransportEvent::Signal(SignalPayload::new(SignalBody::Offer {
                sdp,
            })));
        Ok(())
    }

    async fn apply_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc).await?;
        self.shared
            .remote_description_set
            .store(true, Ordering::Release);
        let pending = std::mem::take(&mut *self.shared.pending_candidates.lock());
        for candidate in pending {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn id(&self) -> &str {
        &self.shared.handle.transport_id
    }

    fn initiator(&self) -> bool {
        self.initiator
    }

    fn mark_garbage(&self) {
        self.shared.garbage.store(true, Ordering::Release);
    }

    fn is_garbage(&self) -> bool {
        self.shared.garbage.load(Ordering::Acquire)
    }

    async fn start(&self) -> Result<()> {
        if !self.initiator {
            return Ok(());
        }
        let dc = self.pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
        wire_data_channel(&dc, &self.shared);
        *self.shared.data_channel.lock() = Some(dc);
        self.negotiate().await
    }

    async fn apply(&self, body: SignalBody) -> Result<()> {
        if self.is_garbage() {
            return Ok(());
        }
        match body {
            SignalBody::Offer { sdp } => {
                self.apply_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                let answer = self.pc.create_answer(None).await?;
                let sdp = answer.sdp.clone();
                self.pc.set_local_description(answer).await?;
                self.shared
                    .emit(TransportEvent::Signal(SignalPayload::new(
                        SignalBody::Answer { sdp },
                    )));
                Ok(())
            }
            SignalBody::Answer { sdp } => {
                self.apply_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await
            }
            SignalBody::Candidate { candidate } => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                };
                if self.shared.remote_description_set.load(Ordering::Acquire) {
                    self.pc.add_ice_candidate(init).await?;
                } else {
                    self.shared.pending_candidates.lock().push(init);
                }
                Ok(())
            }
            SignalBody::YouStart => Err(Error::Signaling(
                "you-start is a handoff, not a negotiation step".to_string(),
            )),
        }
    }

    async fn set_track(&self, name: &str, track: Option<LocalTrack>) -> Result<()> {
        let previous = self.senders.lock().remove(name);
        if let Some((sender, _)) = previous {
            self.pc.remove_track(&sender).await?;
        } else if track.is_none() {
            debug!(name, "detach of unattached track ignored");
            return Ok(());
        }
        if let Some(track) = track {
            self.add_sender(name, &track).await?;
        }
        if self.shared.connected.load(Ordering::Acquire) && !self.is_garbage() {
            self.negotiate().await?;
        }
        Ok(())
    }

    fn attached_tracks(&self) -> Vec<(String, String)> {
        self.senders
            .lock()
            .iter()
            .map(|(name, (_, stream_id))| (name.clone(), stream_id.clone()))
            .collect()
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let dc = self.shared.data_channel.lock().clone();
        let Some(dc) = dc else {
            return Err(Error::Transport("data channel not open".to_string()));
        };
        dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        self.mark_garbage();
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, shared: &Arc<Shared>) {
    let shared2 = Arc::clone(shared);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let shared = Arc::clone(&shared2);
        Box::pin(async move {
            shared.emit(TransportEvent::Data(msg.data));
        })
    }));
}

fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Factory producing [`RtcTransport`]s.
#[derive(Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &PeerId,
        conn_id: &ConnId,
        initiator: bool,
        ice: &IceConfig,
        local_tracks: &[(String, LocalTrack)],
        events: TransportEventTx,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport =
            RtcTransport::new(peer_id, conn_id, initiator, ice, local_tracks, events).await?;
        Ok(Arc::new(transport))
    }
}
