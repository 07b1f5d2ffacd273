use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("forward error: {0}")]
    Forward(String),

    #[error("state error: {0}")]
    State(String),
}
