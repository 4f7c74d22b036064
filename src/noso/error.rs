use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MinerError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Empty message from pool")]
    EmptyMessage,

    #[error("Unrecognized pool message: {0}")]
    UnknownMessage(String),

    #[error("Malformed pool message: {0}")]
    Malformed(String),

    #[error("Timed out waiting for the broker to register a subscription")]
    SubscribeTimeout,

    #[error("Broker is closed")]
    BrokerClosed,

    #[error("Timed out waiting for JOINOK")]
    JoinTimeout,

    #[error("Pool rejected the password")]
    PassFailed,

    #[error("Pool reports this address is already connected")]
    AlreadyConnected,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MinerError {
    fn from(err: std::io::Error) -> Self {
        MinerError::Io(err.to_string())
    }
}
