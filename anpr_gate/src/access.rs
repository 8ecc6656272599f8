//! Access decisions for recognized plates.
//!
//! The vehicle registry itself lives outside this crate; [`AccessRegistry`] is the query seam
//! and [`StaticRegistry`] the configuration-backed implementation the gate ships with.

use crate::plate_detection::plate_format::normalize;
use crate::plate_detection::DetectionResult;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;

pub const DEFAULT_DENIAL_REASON: &str = "vehicle access denied";

/// One registered vehicle.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct VehicleRecord {
    pub plate: String,
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("vehicle registry unavailable: {0}")]
    Unavailable(String),
}

pub trait AccessRegistry: Send + Sync {
    fn lookup(&self, plate: &str) -> Result<Option<VehicleRecord>, RegistryError>;
}

/// Registry held in memory, keyed by normalized plate text.
#[derive(Default)]
pub struct StaticRegistry {
    vehicles: HashMap<String, VehicleRecord>,
}

impl StaticRegistry {
    pub fn new(records: impl IntoIterator<Item = VehicleRecord>) -> Self {
        let vehicles = records
            .into_iter()
            .map(|record| (normalize(&record.plate), record))
            .collect();
        Self { vehicles }
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

impl AccessRegistry for StaticRegistry {
    fn lookup(&self, plate: &str) -> Result<Option<VehicleRecord>, RegistryError> {
        Ok(self.vehicles.get(&normalize(plate)).cloned())
    }
}

/// What the gate decided for one detection. Serialized as the `data` of a detection event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub plate: String,
    pub access_granted: bool,
    pub denial_reason: Option<String>,
    pub owner: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub confidence: f32,
}

pub struct AccessResolver {
    registry: Box<dyn AccessRegistry>,
}

impl AccessResolver {
    pub fn new(registry: Box<dyn AccessRegistry>) -> Self {
        Self { registry }
    }

    /// `None` when the plate is unknown. A failing registry counts as unknown.
    pub fn resolve(&self, detection: &DetectionResult) -> Option<AccessDecision> {
        let record = match self.registry.lookup(&detection.text) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Plate {} is not registered", detection.text);
                return None;
            }
            Err(e) => {
                warn!("Lookup of plate {} failed: {}", detection.text, e);
                return None;
            }
        };

        let denial_reason = if record.allowed {
            None
        } else {
            Some(
                record
                    .reason
                    .unwrap_or_else(|| DEFAULT_DENIAL_REASON.to_string()),
            )
        };

        Some(AccessDecision {
            plate: detection.text.clone(),
            access_granted: record.allowed,
            denial_reason,
            owner: record.owner,
            phone: record.phone,
            email: record.email,
            department: record.department,
            confidence: detection.score,
        })
    }
}
