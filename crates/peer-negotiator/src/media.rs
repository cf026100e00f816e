use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Mirrors a media track's `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// RTP codec a local track is encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl TrackCodec {
    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
        }
    }

    pub fn vp8() -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: 0,
        }
    }
}

/// An outbound capture track. Clones share the same ready state, so a track
/// stopped through any handle reads `Ended` everywhere.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    codec: TrackCodec,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, codec: TrackCodec) -> Self {
        Self {
            id: id.into(),
            kind,
            codec,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn codec(&self) -> &TrackCodec {
        &self.codec
    }

    pub fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

/// The local camera/microphone capture owned by a controller.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn live_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks
            .iter()
            .filter(|track| track.ready_state() == TrackState::Live)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn all_ended(&self) -> bool {
        self.tracks
            .iter()
            .all(|track| track.ready_state() == TrackState::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn requested(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Acquires local capture. Implementations decide what a "device" is.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}
