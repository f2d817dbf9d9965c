use thiserror::Error;

/// Message shown when every connection attempt to the server failed.
pub const CONNECT_FAILED: &str = "Не удалось установить соединение с сервером.";
/// Message shown when an established link to the server dropped.
pub const CONNECTION_LOST: &str = "Потеряно соединение с сервером.";

/// Errors produced by the frame codec. `Malformed` input drops the peer,
/// while an `UnknownShape` object is answered with `400 "bad request"` and
/// the connection kept alive.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Not valid UTF-8 JSON, or decoded to something other than an object.
    #[error("frame is not a JSON object")]
    Malformed,
    /// A JSON object matching no recognised request or reply shape.
    #[error("frame shape not recognised")]
    UnknownShape,
    /// Only JSON objects may be framed for transmission.
    #[error("only JSON objects can be framed")]
    NotAnObject,
    /// The encoded frame would not fit in a single wire read.
    #[error("frame exceeds {} bytes", crate::wire::MAX_FRAME_SIZE)]
    Oversize,
}

/// Errors produced while loading, generating or applying RSA key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("key encoding error: {0}")]
    Encoding(String),
}

/// Fatal client-side failure carrying the message the embedding UI shows
/// to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ServerError(pub String);

impl ServerError {
    pub fn new(message: impl Into<String>) -> ServerError {
        ServerError(message.into())
    }
}
