//! Error taxonomy for the audio pipeline
//!
//! Every hardware or codec failure is caught at the session boundary and
//! turned into one of these variants plus a state transition.

use thiserror::Error;

/// Errors surfaced by capture and playback sessions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Microphone access was refused by the user or the platform
    #[error("microphone access was denied")]
    PermissionDenied,

    /// No input device exists or it could not be opened
    #[error("no usable input device: {0}")]
    DeviceUnavailable(String),

    /// The capture pipeline stopped unexpectedly
    #[error("encoding failed: {0}")]
    EncodingFailure(String),

    /// Bad URL, unsupported codec or network failure while loading a clip
    #[error("could not load audio: {0}")]
    LoadFailure(String),

    /// The runtime refused to start playback
    #[error("playback was rejected: {0}")]
    PlaybackRejected(String),

    /// A transition was requested from a state that does not allow it
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

impl AudioError {
    pub(crate) fn invalid_state(action: &'static str, state: impl std::fmt::Debug) -> Self {
        AudioError::InvalidState {
            action,
            state: format!("{:?}", state).to_lowercase(),
        }
    }

    /// Message suitable for showing to the user in a toast or inline banner
    pub fn user_message(&self) -> String {
        match self {
            AudioError::PermissionDenied => {
                "Microphone access was denied. Please check your permissions.".to_string()
            }
            AudioError::DeviceUnavailable(_) => {
                "No microphone is available. Connect one and try again.".to_string()
            }
            AudioError::EncodingFailure(_) => {
                "Recording stopped unexpectedly. Please try again.".to_string()
            }
            AudioError::LoadFailure(_) => {
                "Unable to load the audio. Check the file format or the URL.".to_string()
            }
            AudioError::PlaybackRejected(reason) => format!("Playback could not start: {}", reason),
            AudioError::InvalidState { action, state } => {
                format!("Cannot {} right now ({}).", action, state)
            }
        }
    }

    /// Whether the failure came from the microphone rather than the pipeline
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            AudioError::PermissionDenied | AudioError::DeviceUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_renders_lowercase_state() {
        #[derive(Debug)]
        enum Dummy {
            Idle,
        }
        let err = AudioError::invalid_state("pause", Dummy::Idle);
        assert_eq!(err.to_string(), "cannot pause while idle");
    }

    #[test]
    fn device_errors_are_classified() {
        assert!(AudioError::PermissionDenied.is_device_error());
        assert!(AudioError::DeviceUnavailable("none".into()).is_device_error());
        assert!(!AudioError::LoadFailure("404".into()).is_device_error());
    }
}
