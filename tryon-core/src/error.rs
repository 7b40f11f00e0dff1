use thiserror::Error;

/// Failure of a single try-on run.
///
/// `Input` covers problems with what the caller sent; everything raised by a
/// model or tensor operation is an `Inference` failure.
#[derive(Debug, Error)]
pub enum TryOnError {
    #[error("{0}")]
    Input(String),

    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

impl TryOnError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }
}

impl From<candle_core::Error> for TryOnError {
    fn from(err: candle_core::Error) -> Self {
        Self::Inference(err.into())
    }
}

pub type Result<T> = std::result::Result<T, TryOnError>;
