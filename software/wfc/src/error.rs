//! Error taxonomy of the server and its transports.

use std::time::Duration;

use thiserror::Error;

use wfc_shared::zmtp::ZmtpError;
use wfc_shared::{DecodeError, SchemaError, TurbineId};

use crate::socket::PeerToken;

/// Failures of a request/reply transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zmtp(#[from] ZmtpError),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Transport is already open")]
    AlreadyOpen,

    #[error("No pending request from peer {0}")]
    NoPendingRequest(PeerToken),

    #[error("Transport worker failed: {0}")]
    Worker(String),
}

/// Conditions that end the serving loop
#[derive(Error, Debug)]
pub enum ServerError {
    /// A request did not match the measurement schema. This is fatal:
    /// the transport is closed and no reply is sent.
    #[error("Malformed request: {0}")]
    Decode(#[from] DecodeError),

    /// No request arrived within the configured window
    #[error("Connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    /// The server was started without what it needs to serve requests
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Turbine {0} is not registered")]
    UnknownTurbine(TurbineId),
}
