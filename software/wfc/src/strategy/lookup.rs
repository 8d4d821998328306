use interpn::one_dim::{Interp1D, RectilinearGrid1D};

use serde::{Deserialize, Serialize};

use super::wake_steering::YawOptimizer;

/// Precomputed optimal yaw offsets of every turbine as a function of
/// freestream wind speed.
///
/// Offsets are interpolated linearly between control points. Outside the
/// table, the nearest control point is held to prevent runaway extrapolation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct YawLookup {
    /// Freestream wind speeds [m/s]. Must be monotonically increasing.
    wind_speed: Vec<f64>,

    /// Yaw offsets [deg] per turbine, starting with turbine 1.
    /// Each row must be the same length as `wind_speed`.
    yaw_offsets_deg: Vec<Vec<f64>>,
}

impl YawLookup {
    /// Validate and store lookup
    pub fn new(wind_speed: Vec<f64>, yaw_offsets_deg: Vec<Vec<f64>>) -> Result<Self, String> {
        let lookup = Self {
            wind_speed,
            yaw_offsets_deg,
        };
        lookup.validate()?;
        Ok(lookup)
    }

    /// Check that wind speeds are monotonic and row lengths are correct
    pub fn validate(&self) -> Result<(), String> {
        if self.wind_speed.is_empty() {
            return Err("Empty yaw lookup".to_owned());
        }
        if !self.wind_speed.is_sorted() {
            return Err("Yaw lookup wind speeds must be monotonically increasing".to_owned());
        }
        for (i, row) in self.yaw_offsets_deg.iter().enumerate() {
            if row.len() != self.wind_speed.len() {
                return Err(format!(
                    "Yaw lookup row for turbine {} has {} entries but there are {} wind speeds",
                    i + 1,
                    row.len(),
                    self.wind_speed.len()
                ));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(format!(
                    "Yaw lookup row for turbine {} has non-finite entries",
                    i + 1
                ));
            }
        }

        Ok(())
    }

    /// Number of turbines covered by the table
    pub fn n_turbines(&self) -> usize {
        self.yaw_offsets_deg.len()
    }

    /// Sample one turbine's row, propagating any errors encountered while
    /// assembling or evaluating the interpolator.
    pub fn eval_checked(&self, turbine_index: usize, wind_speed: f64) -> Result<f64, String> {
        let row = self
            .yaw_offsets_deg
            .get(turbine_index)
            .ok_or_else(|| format!("No yaw lookup row for turbine {}", turbine_index + 1))?;

        if self.wind_speed.len() == 1 {
            return Ok(row[0]);
        }

        let lo = self.wind_speed[0];
        let hi = self.wind_speed[self.wind_speed.len() - 1];
        let ws = wind_speed.clamp(lo, hi);

        let grid = RectilinearGrid1D::new(&self.wind_speed, row).map_err(|e| e.to_owned())?;
        interpn::Linear1D::new(grid)
            .eval_one(ws)
            .map_err(|e| e.to_owned())
    }
}

impl YawOptimizer for YawLookup {
    fn optimize(&mut self, freestream_wind_speed: f64) -> Result<Vec<f64>, String> {
        if !freestream_wind_speed.is_finite() {
            return Err(format!(
                "Cannot look up yaw offsets for wind speed {freestream_wind_speed}"
            ));
        }
        (0..self.n_turbines())
            .map(|i| self.eval_checked(i, freestream_wind_speed))
            .collect()
    }
}
