/// Result alias that carries the custom [`EntrainError`] type.
pub type Result<T> = std::result::Result<T, EntrainError>;

/// Common error type for the core crate.
///
/// Only asset and configuration paths surface errors. The render loop and the
/// event scheduler degrade silently and report through diagnostics instead.
#[derive(Debug, thiserror::Error)]
pub enum EntrainError {
    /// Free-form message for failures without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Manifest or configuration document could not be parsed.
    #[error("parse error: {0}")]
    Json(#[from] serde_json::Error),
    /// A manifest or asset could not be fetched.
    #[error("failed to fetch `{path}`: {reason}")]
    Network { path: String, reason: String },
    /// An audio asset was fetched but could not be decoded.
    #[error("failed to decode sound `{id}`: {reason}")]
    Decode { id: String, reason: String },
    /// Caller supplied a value outside the accepted domain.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// FFT planning or processing failed.
    #[error("fft error: {0}")]
    Fft(String),
    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
}

impl EntrainError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for EntrainError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for EntrainError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for EntrainError {
    fn from(value: realfft::FftError) -> Self {
        Self::Fft(value.to_string())
    }
}

impl From<hound::Error> for EntrainError {
    fn from(value: hound::Error) -> Self {
        Self::msg(format!("wav error: {value}"))
    }
}
