use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}
