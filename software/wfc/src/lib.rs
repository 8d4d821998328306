#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;
pub mod socket;
pub mod strategy;

pub use config::{FileConfig, ServerConfig};
pub use error::{ServerError, TransportError};
pub use registry::{ClientSession, Registry};
pub use server::{Server, ServerState};
pub use strategy::ControlStrategy;

pub use wfc_shared;
