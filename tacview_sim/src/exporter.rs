//! JSON exporter for simulation runs.
//!
//! Exports per-frame snapshots of the engine's resident entities next to
//! the oracle's ground truth, for offline inspection or plotting.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tacview_core::{Affiliation, EntityState, TacticalEntity};

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Ground truth unit positions
    pub ground_truth: Vec<UnitPosition>,

    /// What the engine believes
    pub entities: Vec<EntityFrame>,

    /// Notable happenings (unit dropped out, malformed burst, ...)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitPosition {
    pub uid: String,
    pub lat: f64,
    pub lon: f64,
}

/// One resident entity as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFrame {
    pub uid: String,
    pub lat: f64,
    pub lon: f64,
    pub state: EntityState,
    pub affiliation: Affiliation,
    pub history_len: usize,
}

impl From<&TacticalEntity> for EntityFrame {
    fn from(entity: &TacticalEntity) -> Self {
        Self {
            uid: entity.uid.clone(),
            lat: entity.position.lat,
            lon: entity.position.lon,
            state: entity.state,
            affiliation: entity.affiliation,
            history_len: entity.position_history.len(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub duration_sec: f64,
    pub frames: Vec<SimFrame>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration_and_serializes() {
        let mut export = SimExport::new("steady_patrol", 42);
        export.add_frame(SimFrame {
            time_sec: 5.0,
            ground_truth: vec![UnitPosition {
                uid: "SIM-0000".into(),
                lat: 1.0,
                lon: 2.0,
            }],
            entities: Vec::new(),
            events: Vec::new(),
        });
        export.finalize(true, None);

        assert_eq!(export.duration_sec, 5.0);
        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"scenario\":\"steady_patrol\""));
        assert!(!json.contains("failure_reason"));
        assert!(!json.contains("\"events\""));
    }
}
