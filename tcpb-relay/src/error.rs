use std::io;
use thiserror::Error;

/// 监听器错误
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}
