//! Error taxonomy for the agent: configuration errors are fatal at
//! startup, decode errors never are (they produce a TX_ACK or are
//! silently dropped), and HAL errors are fatal only for `receive()`.

use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("hal error: {0}")]
    Hal(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal channel closed")]
    Channel,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn hal<S: Into<String>>(msg: S) -> Self {
        Error::Hal(msg.into())
    }

    pub fn channel() -> Self {
        Error::Channel
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

/// Failures decoding a PULL_RESP's `txpk` object or an inbound `rxpk`.
/// These never terminate a worker: the caller maps them to a TX_ACK
/// reason (see [`crate::protocol::TxAckReason`]) or logs and drops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing mandatory field {0}")]
    MissingField(&'static str),
    #[error("invalid modulation {0:?}")]
    InvalidModulation(String),
    #[error("invalid datarate {0:?}")]
    InvalidDataRate(String),
    #[error("invalid bandwidth {0}")]
    InvalidBandwidth(u32),
    #[error("invalid coderate {0:?}")]
    InvalidCodeRate(String),
    #[error("base64 payload does not decode")]
    InvalidBase64,
    #[error("decoded payload length does not match declared size")]
    SizeMismatch,
    #[error("packet failed CRC")]
    InvalidCrc,
    #[error("malformed frame header")]
    MalformedFrame,
    #[error("unsupported RF chain {0}")]
    InvalidRfChain(u32),
}

impl DecodeError {
    pub fn missing_field(name: &'static str) -> Self {
        DecodeError::MissingField(name)
    }

    pub fn invalid_crc() -> Self {
        DecodeError::InvalidCrc
    }

    pub fn invalid_data_rate<S: Into<String>>(s: S) -> Self {
        DecodeError::InvalidDataRate(s.into())
    }
}
