//! Chaos scenarios for the simulation harness.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// SIM-001: units report steadily, nothing should go stale
    SteadyPatrol,

    /// SIM-002: units drop out and rejoin; exercises Stale -> expired and refresh
    StaleChurn,

    /// SIM-003: far more units than capacity; exercises eviction order
    CapacityFlood,

    /// SIM-004: valid traffic mixed with malformed reports
    MalformedFeed,

    /// SIM-005: bursts of duplicate and out-of-order reports through the inbound queue
    BurstCoalesce,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown scenario: {0}")]
pub struct ScenarioParseError(pub String);

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyPatrol,
            ScenarioId::StaleChurn,
            ScenarioId::CapacityFlood,
            ScenarioId::MalformedFeed,
            ScenarioId::BurstCoalesce,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyPatrol => "steady_patrol",
            ScenarioId::StaleChurn => "stale_churn",
            ScenarioId::CapacityFlood => "capacity_flood",
            ScenarioId::MalformedFeed => "malformed_feed",
            ScenarioId::BurstCoalesce => "burst_coalesce",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyPatrol => "40 units reporting every 5s, none should go stale",
            ScenarioId::StaleChurn => "30 units, a third fall silent and some rejoin later",
            ScenarioId::CapacityFlood => "500 units against a capacity of 100",
            ScenarioId::MalformedFeed => "valid traffic with 1 in 4 reports malformed",
            ScenarioId::BurstCoalesce => "bursts of duplicate and reordered reports via the inbound queue",
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScenarioId {
    type Err = ScenarioParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_patrol" | "steadypatrol" | "sim-001" => Ok(ScenarioId::SteadyPatrol),
            "stale_churn" | "stalechurn" | "sim-002" => Ok(ScenarioId::StaleChurn),
            "capacity_flood" | "capacityflood" | "sim-003" => Ok(ScenarioId::CapacityFlood),
            "malformed_feed" | "malformedfeed" | "sim-004" => Ok(ScenarioId::MalformedFeed),
            "burst_coalesce" | "burstcoalesce" | "sim-005" => Ok(ScenarioId::BurstCoalesce),
            _ => Err(ScenarioParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("SIM-003".parse::<ScenarioId>().unwrap(), ScenarioId::CapacityFlood);
        assert_eq!("StaleChurn".parse::<ScenarioId>().unwrap(), ScenarioId::StaleChurn);
        let err = "time_warp".parse::<ScenarioId>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown scenario: time_warp");
    }
}
