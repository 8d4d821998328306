//! Ordered channel names that define the field layout of wire messages.
//!
//! Fields on the wire are untagged, so the order of `measurements` must match
//! the order in which turbine clients serialize their readings, and the order
//! of `setpoints` defines the order in which replies are written.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ID_CHANNEL, STATUS_CHANNEL, TIME_CHANNEL};

/// Measurement channels reported by ROSCO turbine controllers, in wire order
const ROSCO_MEASUREMENTS: [&str; 17] = [
    "ZMQ_ID",
    "iStatus",
    "Time",
    "VS_MechGenPwr",
    "VS_GenPwr",
    "GenSpeed",
    "RotSpeed",
    "GenTq",
    "NacHeading",
    "NacVane",
    "HorWindV",
    "rootMOOP(1)",
    "rootMOOP(2)",
    "rootMOOP(3)",
    "FA_Acc",
    "NacIMU_FA_Acc",
    "Azimuth",
];

/// Setpoint channels accepted by ROSCO turbine controllers, in wire order
const ROSCO_SETPOINTS: [&str; 5] = [
    "ZMQ_TorqueOffset",
    "ZMQ_YawOffset",
    "ZMQ_PitOffset(1)",
    "ZMQ_PitOffset(2)",
    "ZMQ_PitOffset(3)",
];

/// The ROSCO ZeroMQ wind farm control interface
pub static ROSCO_INTERFACE: Lazy<Schema> = Lazy::new(|| Schema {
    measurements: ROSCO_MEASUREMENTS.iter().map(|&s| s.to_owned()).collect(),
    setpoints: ROSCO_SETPOINTS.iter().map(|&s| s.to_owned()).collect(),
});

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Unable to read schema file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML schema: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON schema: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported schema file extension for `{0}`; expected .toml or .json")]
    UnsupportedFormat(PathBuf),

    #[error("Schema has no {0} channels")]
    Empty(&'static str),

    #[error("Duplicate {list} channel `{name}`")]
    Duplicate { list: &'static str, name: String },

    #[error("Schema is missing required measurement channel `{0}`")]
    MissingChannel(&'static str),
}

/// Ordered measurement and setpoint channel names.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Schema {
    /// Measurement channel names in the order the client serializes them
    pub measurements: Vec<String>,

    /// Setpoint channel names in the order the server serializes them
    pub setpoints: Vec<String>,
}

impl Default for Schema {
    fn default() -> Self {
        ROSCO_INTERFACE.clone()
    }
}

impl Schema {
    /// Validate and store channel lists
    pub fn new(measurements: Vec<String>, setpoints: Vec<String>) -> Result<Self, SchemaError> {
        let schema = Self {
            measurements,
            setpoints,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Load a schema from a `.toml` or `.json` file with
    /// `measurements` and `setpoints` lists.
    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_owned(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(SchemaError::UnsupportedFormat(path.to_owned())),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SchemaError> {
        let schema: Self = toml::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check that both lists are populated, names are unique within each list,
    /// and the channels the server depends on are present.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (list, names) in [
            ("measurement", &self.measurements),
            ("setpoint", &self.setpoints),
        ] {
            if names.is_empty() {
                return Err(SchemaError::Empty(list));
            }
            let mut seen = BTreeSet::new();
            for name in names {
                if !seen.insert(name.as_str()) {
                    return Err(SchemaError::Duplicate {
                        list,
                        name: name.clone(),
                    });
                }
            }
        }

        for required in [ID_CHANNEL, STATUS_CHANNEL, TIME_CHANNEL] {
            if !self.measurements.iter().any(|m| m == required) {
                return Err(SchemaError::MissingChannel(required));
            }
        }

        Ok(())
    }

    /// Number of fields in a measurement message
    pub fn num_measurements(&self) -> usize {
        self.measurements.len()
    }

    /// Number of fields in a setpoint message
    pub fn num_setpoints(&self) -> usize {
        self.setpoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rosco_interface_is_valid() {
        let schema = Schema::default();
        schema.validate().unwrap();
        assert_eq!(schema.measurements[0], ID_CHANNEL);
        assert_eq!(schema.num_setpoints(), 5);
        assert_eq!(schema.setpoints[1], "ZMQ_YawOffset");
    }

    #[test]
    fn loads_toml_and_json_files() {
        let toml_text = r#"
            measurements = ["ZMQ_ID", "iStatus", "Time", "HorWindV"]
            setpoints = ["ZMQ_YawOffset", "ZMQ_PitOffset(1)"]
        "#;
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        toml_file.write_all(toml_text.as_bytes()).unwrap();
        let from_toml = Schema::from_path(toml_file.path()).unwrap();

        let json_text = r#"{
            "measurements": ["ZMQ_ID", "iStatus", "Time", "HorWindV"],
            "setpoints": ["ZMQ_YawOffset", "ZMQ_PitOffset(1)"]
        }"#;
        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json_file.write_all(json_text.as_bytes()).unwrap();
        let from_json = Schema::from_path(json_file.path()).unwrap();

        assert_eq!(from_toml, from_json);
        assert_eq!(from_toml.measurements[3], "HorWindV");
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let result = Schema::from_path(file.path());
        assert!(matches!(result, Err(SchemaError::UnsupportedFormat(_))));
    }

    #[test]
    fn rejects_duplicate_channels() {
        let result = Schema::new(
            vec!["ZMQ_ID".into(), "iStatus".into(), "Time".into(), "Time".into()],
            vec!["ZMQ_YawOffset".into()],
        );
        assert!(matches!(result, Err(SchemaError::Duplicate { .. })));
    }

    #[test]
    fn rejects_missing_required_channels() {
        let result = Schema::new(
            vec!["iStatus".into(), "Time".into()],
            vec!["ZMQ_YawOffset".into()],
        );
        assert!(matches!(result, Err(SchemaError::MissingChannel(ID_CHANNEL))));

        let result = Schema::new(vec!["ZMQ_ID".into(), "iStatus".into(), "Time".into()], vec![]);
        assert!(matches!(result, Err(SchemaError::Empty("setpoint"))));
    }
}
