#![doc = include_str!("../README.md")]

pub mod client;
pub mod codec;
pub mod schema;
pub mod zmtp;

use std::collections::BTreeMap;

pub use codec::DecodeError;
pub use schema::{Schema, SchemaError};

/// Named numeric channel values, such as one turbine's measurements or setpoints
pub type ChannelMap = BTreeMap<String, f64>;

/// Client-assigned turbine identifier
pub type TurbineId = u32;

/// Measurement channel carrying the sender's turbine id
pub const ID_CHANNEL: &str = "ZMQ_ID";

/// Measurement channel carrying the turbine controller's status flag
pub const STATUS_CHANNEL: &str = "iStatus";

/// Measurement channel carrying the simulation time in seconds
pub const TIME_CHANNEL: &str = "Time";

/// Value of the status channel with which a turbine announces that it is disconnecting
pub const DISCONNECT_STATUS: f64 = -1.0;

/// Address on which the server listens unless configured otherwise
pub const DEFAULT_ADDRESS: &str = "tcp://*:5555";
