use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The broker link is not in the `Connected` state. Nothing was written.
    #[error("not connected to broker")]
    NotConnected,
    /// `send` was called on a transport handle outside its open window.
    #[error("transport handle is not open")]
    HandleNotOpen,
    #[error("broker link has been shut down")]
    ShutDown,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
