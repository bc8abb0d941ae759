use crate::config::ValidationError;
use std::io;
use streamer::{AttachError, ConnectError, EndReason};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
    #[error("could not build upstream client: {0}")]
    Connector(#[from] ConnectError),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("stream ended: {0}")]
    StreamEnded(EndReason),
}

#[derive(thiserror::Error, Debug)]
pub enum StreamRequestError {
    #[error("channel {0} is not configured")]
    ChannelRemoved(String),
    #[error(transparent)]
    Attach(#[from] AttachError),
}
