//! Error types for utsushi
//!
//! Codec and transport failures are translated into one of these kinds at
//! the component boundary where they happen. Nothing below this layer
//! leaks an unstructured error to a caller of the public API.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The compressor could not be created or configured.
    ///
    /// Fatal to the capture session, never retried automatically.
    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    /// Operation invoked on an encoder that is not started
    #[error("Encoder not initialized")]
    NotInitialized,

    /// A length prefix declared more bytes than the buffer holds
    #[error("Malformed bitstream: unit at offset {offset} declares {declared} bytes, {remaining} remain")]
    MalformedBitstream {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    /// A key frame arrived without SPS/PPS in its format description
    #[error("Missing parameter sets for key frame")]
    MissingParameterSets,

    /// A reliable or best-effort send could not be handed to the transport
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A clip send or receive did not complete; the whole clip must be resent
    #[error("Transfer incomplete: {0}")]
    TransferIncomplete(String),

    /// Connecting to or accepting a peer failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed control envelope or handshake
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The requested clip does not exist
    #[error("Video not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn encoder_unavailable(msg: impl Into<String>) -> Self {
        Self::EncoderUnavailable(msg.into())
    }

    pub fn send_failed(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }

    pub fn transfer_incomplete(msg: impl Into<String>) -> Self {
        Self::TransferIncomplete(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for the bitstream errors that only invalidate one buffer
    pub fn is_bitstream_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedBitstream { .. } | Self::MissingParameterSets
        )
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
