//! Error taxonomy for the control agent. Nothing here is fatal to the
//! process: every variant has a local recovery in the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Connect, publish or subscribe failure. Recovered by retrying on the
    /// next due cycle; state is preserved.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound JSON on the command or snapshot channel. The single
    /// message or read is discarded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The sensor snapshot could not be read at all (missing file, I/O).
    #[error("sensor source unavailable: {0}")]
    SensorSource(String),

    /// A decision needed a sensor value that has not been read yet. The
    /// dependent actuator is held OFF.
    #[error("policy input missing: {0}")]
    PolicyInputMissing(&'static str),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<rumqttc::ClientError> for AgentError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
