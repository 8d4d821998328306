//! Farm-level control strategies.
//!
//! The server hands every request to a single `ControlStrategy`, one turbine
//! at a time, and replies with whatever setpoints it returns. Strategies that
//! coordinate the whole farm keep their own memory of earlier calls.

use wfc_shared::{ChannelMap, TurbineId};

mod lookup;
mod wake_steering;

pub use lookup::YawLookup;
pub use wake_steering::{
    NoSteering, WakeSteeringConfig, WakeSteeringController, YawOptimizer, HOR_WIND_CHANNEL,
    PITCH_OFFSET_CHANNELS, YAW_OFFSET_CHANNEL,
};

/// Computes the setpoints of one turbine from its latest measurements.
///
/// Calls are made from the serving loop with no timeout, so a strategy that
/// blocks stalls every turbine.
pub trait ControlStrategy: Send {
    /// Setpoints for turbine `id` at simulation time `current_time` (s).
    /// Setpoint channels missing from the result are sent as zero.
    fn update(&mut self, id: TurbineId, current_time: f64, measurements: &ChannelMap)
    -> ChannelMap;
}

impl<F> ControlStrategy for F
where
    F: FnMut(TurbineId, f64, &ChannelMap) -> ChannelMap + Send,
{
    fn update(
        &mut self,
        id: TurbineId,
        current_time: f64,
        measurements: &ChannelMap,
    ) -> ChannelMap {
        self(id, current_time, measurements)
    }
}
