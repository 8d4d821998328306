//! Wake steering by periodically re-optimized yaw offsets.
//!
//! Every turbine's measurements are kept in a short rolling history. Once the
//! warm-up period has passed, the farm-wide yaw offsets are recomputed at a
//! fixed interval, and only while talking to the reference turbine, so that a
//! single timestep (one call per turbine) triggers at most one optimization.
//! Between optimizations the last offsets are held.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use wfc_shared::{ChannelMap, TurbineId};

use super::ControlStrategy;

/// Setpoint channel carrying the yaw offset [deg]
pub const YAW_OFFSET_CHANNEL: &str = "ZMQ_YawOffset";

/// Setpoint channels carrying the blade pitch offsets [rad]
pub const PITCH_OFFSET_CHANNELS: [&str; 3] =
    ["ZMQ_PitOffset(1)", "ZMQ_PitOffset(2)", "ZMQ_PitOffset(3)"];

/// Measurement channel carrying the hub-height horizontal wind speed [m/s]
pub const HOR_WIND_CHANNEL: &str = "HorWindV";

/// Source of farm-wide optimal yaw offsets
pub trait YawOptimizer: Send {
    /// Optimal yaw offsets [deg] for every turbine, starting with turbine 1,
    /// given an estimate of the freestream wind speed [m/s].
    /// Turbines beyond the end of the result are held at zero.
    fn optimize(&mut self, freestream_wind_speed: f64) -> Result<Vec<f64>, String>;
}

/// Optimizer that never steers
#[derive(Default, Clone, Copy, Debug)]
pub struct NoSteering;

impl YawOptimizer for NoSteering {
    fn optimize(&mut self, _freestream_wind_speed: f64) -> Result<Vec<f64>, String> {
        Ok(Vec::new())
    }
}

/// Tuning of the wake steering controller
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WakeSteeringConfig {
    /// Simulation time between yaw offset updates [s]
    pub update_rate_s: f64,

    /// Number of measurement sets kept per turbine
    pub memory_size: usize,

    /// Simulation time before which no wake steering is applied [s]
    pub warmup_s: f64,

    /// Number of recent reference turbine samples averaged
    /// to estimate the freestream wind speed
    pub freestream_samples: usize,

    /// The most upstream turbine, whose requests trigger updates
    pub reference_turbine: TurbineId,

    pub min_yaw_deg: f64,
    pub max_yaw_deg: f64,
}

impl Default for WakeSteeringConfig {
    fn default() -> Self {
        Self {
            update_rate_s: 10.0,
            memory_size: 60,
            warmup_s: 60.0,
            freestream_samples: 10,
            reference_turbine: 1,
            min_yaw_deg: -25.0,
            max_yaw_deg: 25.0,
        }
    }
}

impl WakeSteeringConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.update_rate_s.is_finite() && self.update_rate_s >= 0.0) {
            return Err(format!("Invalid update rate {} s", self.update_rate_s));
        }
        if !self.warmup_s.is_finite() {
            return Err(format!("Invalid warm-up time {} s", self.warmup_s));
        }
        if self.memory_size == 0 || self.freestream_samples == 0 {
            return Err("Memory size and freestream sample count must be nonzero".to_owned());
        }
        if !(self.min_yaw_deg <= self.max_yaw_deg) {
            return Err(format!(
                "Invalid yaw limits [{}, {}] deg",
                self.min_yaw_deg, self.max_yaw_deg
            ));
        }
        Ok(())
    }
}

/// Farm controller that steers wakes with yaw offsets and holds pitch offsets at zero
pub struct WakeSteeringController {
    cfg: WakeSteeringConfig,
    optimizer: Box<dyn YawOptimizer>,

    /// Most recent measurements per turbine, oldest first
    history: BTreeMap<TurbineId, VecDeque<ChannelMap>>,

    /// Current yaw offsets, starting with turbine 1
    yaw_offsets_deg: Vec<f64>,

    /// Simulation time of the last yaw offset update
    t_last_update: Option<f64>,
}

impl WakeSteeringController {
    pub fn new(cfg: WakeSteeringConfig, optimizer: Box<dyn YawOptimizer>) -> Result<Self, String> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            optimizer,
            history: BTreeMap::new(),
            yaw_offsets_deg: Vec::new(),
            t_last_update: None,
        })
    }

    /// Current yaw offset of a turbine [deg]
    pub fn yaw_offset(&self, id: TurbineId) -> f64 {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.yaw_offsets_deg.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    /// Stored measurement history of a turbine, oldest first
    pub fn history(&self, id: TurbineId) -> Option<&VecDeque<ChannelMap>> {
        self.history.get(&id)
    }

    fn update_measurement_history(&mut self, id: TurbineId, measurements: &ChannelMap) {
        let memory_size = self.cfg.memory_size;
        let history = self
            .history
            .entry(id)
            .or_insert_with(|| VecDeque::with_capacity(memory_size));
        if history.len() == memory_size {
            history.pop_front();
        }
        history.push_back(measurements.clone());
    }

    /// Mean of the reference turbine's most recent wind speed samples
    fn estimate_freestream(&self) -> Option<f64> {
        let history = self.history.get(&self.cfg.reference_turbine)?;
        let samples: Vec<f64> = history
            .iter()
            .rev()
            .filter_map(|m| m.get(HOR_WIND_CHANNEL).copied())
            .take(self.cfg.freestream_samples)
            .collect();

        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    fn optimize_yaw_angles(&mut self, id: TurbineId, current_time: f64) {
        if current_time < self.cfg.warmup_s || id != self.cfg.reference_turbine {
            return;
        }

        if let Some(t_last) = self.t_last_update {
            if current_time < t_last + self.cfg.update_rate_s {
                info!("[t={current_time:.1} s] Using zero-order hold for wind farm controller setpoints");
                return;
            }
        }

        info!("Updating the wind farm controller setpoints");
        self.t_last_update = Some(current_time);

        let Some(freestream) = self.estimate_freestream() else {
            warn!("No `{HOR_WIND_CHANNEL}` samples from turbine {id}; holding yaw offsets");
            return;
        };
        info!(
            "Estimated freestream wind speed from the last {} samples of turbine {id}: {freestream}",
            self.cfg.freestream_samples
        );

        match self.optimizer.optimize(freestream) {
            Ok(angles) => {
                let (lo, hi) = (self.cfg.min_yaw_deg, self.cfg.max_yaw_deg);
                self.yaw_offsets_deg = angles.iter().map(|a| a.clamp(lo, hi)).collect();
                info!("Optimal yaw angles updated to {:?}", self.yaw_offsets_deg);
            }
            Err(e) => warn!("Yaw optimization failed; holding yaw offsets: {e}"),
        }
    }
}

impl ControlStrategy for WakeSteeringController {
    fn update(
        &mut self,
        id: TurbineId,
        current_time: f64,
        measurements: &ChannelMap,
    ) -> ChannelMap {
        self.update_measurement_history(id, measurements);
        self.optimize_yaw_angles(id, current_time);

        let mut setpoints = ChannelMap::new();
        setpoints.insert(YAW_OFFSET_CHANNEL.to_owned(), self.yaw_offset(id));
        for channel in PITCH_OFFSET_CHANNELS {
            setpoints.insert(channel.to_owned(), 0.0);
        }
        setpoints
    }
}
