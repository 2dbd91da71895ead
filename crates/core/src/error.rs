/// Result alias that carries the custom [`ImpulserError`] type.
pub type Result<T> = std::result::Result<T, ImpulserError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ImpulserError {
    /// Free-form message, mostly surfaced by the command line front end.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A transform was handed buffers of the wrong length.
    #[error("fft: {0}")]
    Fft(#[from] realfft::FftError),
    /// Malformed configuration document.
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
    /// Arguments that can never be valid, such as a zero fragment size.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// A buffer could not be reserved while loading an impulse response.
    #[error("failed to allocate {requested} samples")]
    Allocation { requested: usize },
    /// Processing was requested before any impulse response was loaded.
    #[error("no impulse response loaded")]
    NotLoaded,
    /// The call is not allowed in the current engine state.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
    /// The background worker is parked; call `resume` first.
    #[error("convolver is suspended")]
    Suspended,
    /// The background worker thread went away.
    #[error("burst worker disconnected")]
    WorkerDisconnected,
}

impl ImpulserError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for ImpulserError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for ImpulserError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
