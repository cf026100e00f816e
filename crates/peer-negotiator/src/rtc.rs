//! Binding of the peer and media abstractions onto webrtc-rs.

use async_trait::async_trait;
use signal_proto::{IceCandidate, SessionDescription};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceServer;
use crate::error::{MediaError, PeerError};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaSource, TrackCodec, TrackKind};
use crate::peer::{MediaPeer, PeerConnectionState, PeerEventKind, PeerEventSink, PeerFactory};

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            PeerConnectionState::New
        }
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}

fn to_blob(description: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    Ok(SessionDescription(serde_json::to_value(description)?))
}

fn from_blob(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    Ok(serde_json::from_value(description.0)?)
}

/// Builds peer connections from one shared webrtc API with the default
/// codecs and interceptors.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(blob)) => {
                        sink.emit(PeerEventKind::LocalCandidate(IceCandidate(blob)));
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to encode local candidate")
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to read local candidate")
                    }
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", peer_id = %sink.remote(), ?state, "peer connection state");
                sink.emit(PeerEventKind::StateChanged(map_state(state)));
            })
        }));

        let sink = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            let id = track.id();
            Box::pin(async move {
                if let Some(kind) = kind {
                    sink.emit(PeerEventKind::RemoteTrack { id, kind });
                }
            })
        }));

        Ok(Arc::new(RtcPeer { pc }) as Arc<dyn MediaPeer>)
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        to_blob(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        to_blob(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc.set_local_description(from_blob(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(from_blob(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PeerError> {
        let codec = track.codec();
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type.clone(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                ..Default::default()
            },
            track.id().to_string(),
            stream_id.to_string(),
        ));
        let sender = self
            .pc
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_state(self.pc.connection_state())
    }
}

/// Describes capture tracks for the devices it was told exist. Encoding and
/// writing samples belongs to whoever owns the devices.
pub struct RtcMediaSource {
    available: Vec<TrackKind>,
}

impl Default for RtcMediaSource {
    fn default() -> Self {
        Self {
            available: vec![TrackKind::Audio, TrackKind::Video],
        }
    }
}

impl RtcMediaSource {
    pub fn with_devices(available: Vec<TrackKind>) -> Self {
        Self { available }
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let requested = constraints.requested();
        if requested.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let mut tracks = Vec::with_capacity(requested.len());
        for kind in requested {
            if !self.available.contains(&kind) {
                return Err(MediaError::NoDevice(kind));
            }
            let codec = match kind {
                TrackKind::Audio => TrackCodec::opus(),
                TrackKind::Video => TrackCodec::vp8(),
            };
            tracks.push(LocalTrack::new(format!("{kind}-{}", Uuid::new_v4()), kind, codec));
        }
        Ok(LocalMedia::new(Uuid::new_v4().to_string(), tracks))
    }
}
