//! Per-turbine session bookkeeping.
//!
//! Sessions are created the first time a turbine id is seen and are never
//! removed. A turbine that announces it is disconnecting stays in the
//! registry for accounting, but no longer counts as connected, and nothing
//! it sends afterwards reconnects it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use wfc_shared::{ChannelMap, DISCONNECT_STATUS, STATUS_CHANNEL, Schema, TurbineId};

use crate::error::ServerError;

/// Server-side record of one turbine
#[derive(Clone, Debug)]
pub struct ClientSession {
    /// Client-assigned turbine id
    pub id: TurbineId,

    /// Cleared when the turbine reports a disconnect status
    pub connected: bool,

    /// Most recently received measurements, replaced wholesale on every request
    pub measurements: ChannelMap,

    /// Most recently computed setpoints
    pub setpoints: ChannelMap,

    /// Wall-clock time of the most recent request
    pub last_seen: Option<DateTime<Utc>>,

    /// Number of measurement updates received
    pub requests: u64,
}

impl ClientSession {
    fn new(id: TurbineId, schema: &Schema) -> Self {
        let zeros = |names: &[String]| -> ChannelMap {
            names.iter().map(|n| (n.clone(), 0.0)).collect()
        };
        Self {
            id,
            connected: true,
            measurements: zeros(&schema.measurements),
            setpoints: zeros(&schema.setpoints),
            last_seen: None,
            requests: 0,
        }
    }
}

/// Sessions of every turbine seen during this run, keyed by turbine id
pub struct Registry {
    schema: Schema,
    sessions: BTreeMap<TurbineId, ClientSession>,
}

impl Registry {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            sessions: BTreeMap::new(),
        }
    }

    /// Create a connected, zeroed session for an unseen id.
    /// Known ids are left untouched, including disconnected ones.
    ///
    /// Returns `true` if a new session was created.
    pub fn register(&mut self, id: TurbineId) -> bool {
        if self.sessions.contains_key(&id) {
            return false;
        }

        self.sessions.insert(id, ClientSession::new(id, &self.schema));
        info!("Connected to a new turbine with id = {id}");
        true
    }

    /// Replace a session's measurements and apply its disconnect signal, if any.
    pub fn update_measurements(
        &mut self,
        id: TurbineId,
        measurements: ChannelMap,
    ) -> Result<(), ServerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownTurbine(id))?;

        let disconnecting = measurements.get(STATUS_CHANNEL) == Some(&DISCONNECT_STATUS);
        session.measurements = measurements;
        session.last_seen = Some(Utc::now());
        session.requests += 1;
        debug!("Updated measurements for turbine with id = {id}");

        if disconnecting && session.connected {
            session.connected = false;
            info!("Received disconnect signal from turbine with id = {id}");
        }

        Ok(())
    }

    /// Overwrite a single setpoint of an existing session.
    pub fn set_setpoint(
        &mut self,
        id: TurbineId,
        channel: &str,
        value: f64,
    ) -> Result<(), ServerError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownTurbine(id))?;
        session.setpoints.insert(channel.to_owned(), value);
        debug!("Set setpoint {channel} to {value} for id = {id}");
        Ok(())
    }

    /// Number of sessions that have not reported a disconnect
    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|s| s.connected).count()
    }

    pub fn get(&self, id: TurbineId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Every session seen during this run, in id order
    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}
