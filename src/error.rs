use thiserror::Error;

/// Errors returned by the capture control API.
///
/// Per-frame failures (a dropped image, a video append error, a device read error
/// mid-session) never surface here; they end up in logs, `SessionStats` and
/// `EngineStatus`.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture session already running")]
    AlreadyRunning,

    #[error("capture device {device} unavailable")]
    DeviceUnavailable {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("capture output unavailable")]
    Output(#[source] anyhow::Error),

    #[error("failed to spawn capture thread")]
    Spawn(#[from] std::io::Error),

    #[error("capture thread panicked")]
    ThreadPanicked,

    #[error("capture control lock poisoned")]
    Poisoned,
}
