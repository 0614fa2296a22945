//! WebRTC-backed transport.
//!
//! Host-side implementation of [`PeerTransport`] over the `webrtc` crate.
//! The transport owns the peer connection, the outbound H.264/Opus sample
//! tracks (fed by an external capture pipeline), and, for the controller
//! role, the ordered reliable `input` side-channel carrying remote-input
//! events.
//!
//! Encoding is delegated outward: applied [`EncodingTarget`]s are published
//! on a watch channel the encoder pipeline subscribes to.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use duocast_core::config::IceConfig;
use duocast_core::models::{ClientRole, IceCandidate, InputEvent};

use crate::transport::{
    EncodingTarget, PeerTransport, Result, TransportError, TransportEvent, TransportFactory,
    TransportState, TransportStats,
};

/// Builds a fresh [`RtcTransport`] per negotiation attempt.
pub struct RtcTransportFactory {
    ice: IceConfig,
}

impl RtcTransportFactory {
    #[must_use]
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        role: ClientRole,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (transport, events_rx) = RtcTransport::new(&self.ice, role).await?;
        Ok((Arc::new(transport), events_rx))
    }
}

/// One live WebRTC peer connection plus its outbound media.
pub struct RtcTransport {
    connection_id: String,
    role: ClientRole,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    input_channel: Option<Arc<RTCDataChannel>>,
    input_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<InputEvent>>>,
    encoding_tx: watch::Sender<Option<EncodingTarget>>,
    closed: AtomicBool,
}

impl RtcTransport {
    /// Build the peer connection, attach outbound tracks, and (controller
    /// role only) open the `input` side-channel.
    pub async fn new(
        ice: &IceConfig,
        role: ClientRole,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let connection_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Sdp(format!("Failed to register codecs: {e}")))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)
                .map_err(|e| TransportError::Sdp(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create peer connection: {e}")))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Trickle disclosure: forward each candidate as it is discovered.
        let candidate_events = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate_events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = candidate_events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => debug!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let state_events = events_tx;
        let state_connection_id = connection_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_events = state_events.clone();
            let connection_id = state_connection_id.clone();
            Box::pin(async move {
                debug!(connection_id = %connection_id, state = ?state, "Peer connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::New => TransportState::New,
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                let _ = state_events.send(TransportEvent::StateChange(mapped));
            })
        }));

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "duocast-screen".to_owned(),
        ));
        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to add video track: {e}")))?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "duocast-screen".to_owned(),
        ));
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to add audio track: {e}")))?;

        // Ordered reliable side-channel for remote input, controller only.
        let (input_channel, input_rx) = if role == ClientRole::Controller {
            let channel = pc
                .create_data_channel(
                    "input",
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| TransportError::Channel(format!("Failed to open input channel: {e}")))?;

            let (input_tx, input_rx) = mpsc::unbounded_channel();
            channel.on_message(Box::new(move |message| {
                let input_tx = input_tx.clone();
                Box::pin(async move {
                    match serde_json::from_slice::<InputEvent>(&message.data) {
                        Ok(event) => {
                            let _ = input_tx.send(event);
                        }
                        Err(e) => debug!(error = %e, "Discarding malformed input event"),
                    }
                })
            }));

            (Some(channel), Some(input_rx))
        } else {
            (None, None)
        };

        info!(connection_id = %connection_id, role = %role, "Peer transport created");

        Ok((
            Self {
                connection_id,
                role,
                pc,
                video_track,
                audio_track,
                input_channel,
                input_rx: parking_lot::Mutex::new(input_rx),
                encoding_tx: watch::channel(None).0,
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[must_use]
    pub fn role(&self) -> ClientRole {
        self.role
    }

    /// Outbound video track for the capture pipeline to write samples into.
    #[must_use]
    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video_track)
    }

    /// Outbound audio track for the capture pipeline.
    #[must_use]
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    /// Remote-input events parsed off the side-channel. Controller role only;
    /// can be taken once.
    pub fn take_input_events(&self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.input_rx.lock().take()
    }

    /// Encoding targets applied by the quality controller, for the encoder
    /// pipeline to act on.
    #[must_use]
    pub fn encoding_watch(&self) -> watch::Receiver<Option<EncodingTarget>> {
        self.encoding_tx.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create offer: {e}")))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set local description: {e}")))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Sdp("No local description after offer".to_string()))?;
        Ok(local.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        self.ensure_open()?;
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| TransportError::Sdp(format!("Failed to parse answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set remote description: {e}")))
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        self.ensure_open()?;
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::Sdp(format!("Failed to parse offer: {e}")))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set remote description: {e}")))
    }

    async fn create_answer(&self) -> Result<String> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create answer: {e}")))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set local description: {e}")))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Sdp("No local description after answer".to_string()))?;
        Ok(local.sdp)
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::Candidate(format!("Failed to add candidate: {e}")))
    }

    async fn apply_encoding_target(&self, target: EncodingTarget) -> Result<()> {
        self.ensure_open()?;
        // Encoding happens outside the transport; publish the target for the
        // encoder pipeline.
        self.encoding_tx.send_replace(Some(target));
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.ensure_open()?;
        let report = self.pc.get_stats().await;

        let mut stats = TransportStats::default();
        for (_key, entry) in &report.reports {
            match entry {
                StatsReportType::OutboundRTP(outbound) if outbound.kind == "video" => {
                    stats.bytes_sent = outbound.bytes_sent;
                    stats.packets_sent = outbound.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                    stats.packets_lost = remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        stats.round_trip_ms = Some(rtt * 1000.0);
                    }
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = &self.input_channel {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Input channel close failed");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(connection_id = %self.connection_id, error = %e, "Peer connection close failed");
        }
        debug!(connection_id = %self.connection_id, "Peer transport closed");
    }
}
