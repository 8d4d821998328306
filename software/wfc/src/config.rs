//! Server and controller configuration.
//!
//! A single TOML file configures a deployment:
//!
//! ```toml
//! # Either inline `[schema]` lists or a path to a TOML/JSON schema file.
//! # Defaults to the ROSCO ZeroMQ interface.
//! schema_file = "schema.toml"
//!
//! [server]
//! address = "tcp://*:5555"
//! timeout_s = 600.0
//! verbose = false
//! logfile = "wfc.log"
//!
//! [controller]
//! update_rate_s = 10.0
//! warmup_s = 60.0
//!
//! [yaw_lookup]
//! wind_speed = [6.0, 8.0, 10.0]
//! yaw_offsets_deg = [[20.0, 15.0, 0.0], [10.0, 5.0, 0.0], [0.0, 0.0, 0.0]]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use wfc_shared::zmtp::parse_tcp_endpoint;
use wfc_shared::{DEFAULT_ADDRESS, Schema};

use crate::error::ServerError;
use crate::strategy::{
    NoSteering, WakeSteeringConfig, WakeSteeringController, YawLookup, YawOptimizer,
};

/// Options of the request/reply server
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Endpoint to bind, like `tcp://*:5555`
    pub address: String,

    /// Longest wait for the next request before giving up [s]
    pub timeout_s: f64,

    /// Narrate every stage of the loop on stdout
    pub verbose: bool,

    /// Appended to if present. Logging is disabled without one.
    pub logfile: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            timeout_s: 600.0,
            verbose: false,
            logfile: None,
        }
    }
}

impl ServerConfig {
    /// Receive timeout as a duration
    pub fn timeout(&self) -> Result<Duration, ServerError> {
        if !(self.timeout_s > 0.0) {
            return Err(ServerError::Configuration(format!(
                "Timeout must be positive, got {} s",
                self.timeout_s
            )));
        }
        Duration::try_from_secs_f64(self.timeout_s)
            .map_err(|e| ServerError::Configuration(format!("Invalid timeout: {e}")))
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.timeout()?;
        parse_tcp_endpoint(&self.address, "0.0.0.0")
            .map_err(|e| ServerError::Configuration(e.to_string()))?;
        Ok(())
    }
}

/// Contents of a `wfc_server` configuration file
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerConfig,

    /// Inline channel schema
    pub schema: Option<Schema>,

    /// Channel schema file, relative to the configuration file
    pub schema_file: Option<PathBuf>,

    /// Wake steering tuning
    pub controller: WakeSteeringConfig,

    /// Optimal yaw offsets. No wake steering is done without one.
    pub yaw_lookup: Option<YawLookup>,
}

impl FileConfig {
    /// Load a configuration file, resolving relative paths
    /// against the file's directory.
    pub fn from_path(path: &Path) -> Result<Self, ServerError> {
        let text = fs::read_to_string(path).map_err(|e| {
            ServerError::Configuration(format!("Unable to read {}: {e}", path.display()))
        })?;
        let mut cfg = Self::from_toml_str(&text)?;

        let base = path.parent().unwrap_or(Path::new(""));
        if let Some(schema_file) = cfg.schema_file.as_mut() {
            if schema_file.is_relative() {
                *schema_file = base.join(&*schema_file);
            }
        }
        if let Some(logfile) = cfg.server.logfile.as_mut() {
            if logfile.is_relative() {
                *logfile = base.join(&*logfile);
            }
        }

        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ServerError> {
        toml::from_str(text).map_err(|e| ServerError::Configuration(e.to_string()))
    }

    /// The configured schema, or the ROSCO interface if none is configured
    pub fn schema(&self) -> Result<Schema, ServerError> {
        match (&self.schema, &self.schema_file) {
            (Some(_), Some(_)) => Err(ServerError::Configuration(
                "Set either `schema` or `schema_file`, not both".to_owned(),
            )),
            (Some(schema), None) => {
                schema.validate()?;
                Ok(schema.clone())
            }
            (None, Some(path)) => Ok(Schema::from_path(path)?),
            (None, None) => Ok(Schema::default()),
        }
    }

    /// Wake steering controller using the configured yaw lookup, if any
    pub fn controller(&self) -> Result<WakeSteeringController, ServerError> {
        let optimizer: Box<dyn YawOptimizer> = match &self.yaw_lookup {
            Some(lookup) => {
                lookup.validate().map_err(ServerError::Configuration)?;
                Box::new(lookup.clone())
            }
            None => Box::new(NoSteering),
        };
        WakeSteeringController::new(self.controller.clone(), optimizer)
            .map_err(ServerError::Configuration)
    }
}
