use candle_core::Shape;
use thiserror::Error;

/// Errors raised while building, loading or running tensor-parallel layers.
///
/// Every variant is fatal for the pipeline that produced it: weight loading is
/// a one-shot step before serving, so there is no retry path.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid layer or quantization configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A checkpoint tensor disagrees with the pre-allocated parameter shape.
    #[error("{name} size mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        got: Shape,
    },

    /// A fused-merge slot received a second tensor.
    #[error("{name} already loaded for slot {slot}")]
    DuplicateFill { name: String, slot: usize },

    /// A required parameter never received a tensor.
    #[error("{name} is not loaded")]
    IncompleteLoad { name: String },

    #[error("collective failure: {0}")]
    Collective(String),

    #[error("layer slot is not bound")]
    NotBound,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Config(format!($($arg)*)))
    };
}

pub(crate) use config_bail;
