//! Media Source - lokale Capture-Geräte
//!
//! Die Engine fordert Media erst an, wenn ein Anruf tatsächlich aufgebaut
//! wird (`place_call` / `accept_call`), und gibt sie beim Ende wieder frei.

use super::audio::{AudioError, AudioHandler};
use super::session::CallKind;
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Video capture is not supported by this media source")]
    VideoUnsupported,

    #[error("Audio device error: {0}")]
    Device(String),
}

impl From<AudioError> for MediaError {
    fn from(error: AudioError) -> Self {
        match error {
            AudioError::NoInputDevice => Self::NoInputDevice,
            AudioError::NoOutputDevice => Self::NoOutputDevice,
            other => Self::Device(other.to_string()),
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Lokaler Track, der an eine PeerSession gehängt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn audio() -> Self {
        Self {
            id: "audio".to_string(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video() -> Self {
        Self {
            id: "video".to_string(),
            kind: TrackKind::Video,
        }
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Erworbene lokale Media eines Anrufs
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Stoppt alle Tracks; mehrfacher Aufruf ist erlaubt
    fn stop(&self);

    fn set_muted(&self, _muted: bool) {}

    fn is_muted(&self) -> bool {
        false
    }

    /// (input, output) im Bereich 0.0 - 1.0
    fn levels(&self) -> (f32, f32) {
        (0.0, 0.0)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, kind: CallKind) -> Result<Box<dyn LocalMedia>, MediaError>;
}

// ============================================================================
// CPAL MEDIA SOURCE
// ============================================================================

/// Mikrofon und Lautsprecher über cpal (nur Audio)
#[derive(Debug, Default, Clone)]
pub struct CpalMediaSource;

impl CpalMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for CpalMediaSource {
    async fn acquire(&self, kind: CallKind) -> Result<Box<dyn LocalMedia>, MediaError> {
        if kind.is_video() {
            return Err(MediaError::VideoUnsupported);
        }

        let handler = AudioHandler::start().await?;
        Ok(Box::new(CpalMedia { handler }))
    }
}

struct CpalMedia {
    handler: AudioHandler,
}

impl LocalMedia for CpalMedia {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![LocalTrack::audio()]
    }

    fn stop(&self) {
        self.handler.stop();
    }

    fn set_muted(&self, muted: bool) {
        self.handler.set_muted(muted);
    }

    fn is_muted(&self) -> bool {
        self.handler.is_muted()
    }

    fn levels(&self) -> (f32, f32) {
        self.handler.get_levels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cpal_source_rejects_video() {
        let result = CpalMediaSource::new().acquire(CallKind::AudioVideo).await;
        assert!(matches!(result, Err(MediaError::VideoUnsupported)));
    }

    #[test]
    fn test_audio_error_mapping() {
        assert_eq!(
            MediaError::from(AudioError::NoInputDevice),
            MediaError::NoInputDevice
        );
        assert!(matches!(
            MediaError::from(AudioError::StreamBuildError("busy".into())),
            MediaError::Device(_)
        ));
    }
}
