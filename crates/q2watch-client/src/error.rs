// error.rs — client error taxonomy
//
// Malformed packets never surface here: the decoder drops the remainder
// of the offending payload and keeps the connection. Errors are reserved
// for conditions a consumer has to act on.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket bind/send failure. Fatal for the current connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The configured server address did not resolve.
    #[error("bad server address: {0}")]
    BadAddress(String),

    /// The server refused us during the handshake (OOB disconnect or
    /// print). Drives the reconnect policy.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The reconnect policy gave up.
    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    /// A monitor status query went unanswered. Non-fatal; the next
    /// interval retries.
    #[error("status query timed out")]
    MonitorTimeout,

    /// connect() called while a connection is already up.
    #[error("already connected")]
    AlreadyConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;
