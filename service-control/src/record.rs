use std::path::Path;

use chrono::{DateTime, Utc};
use insightwatch_core::state_file::{read_json, remove_file, write_json_atomic};
use insightwatch_core::{CoreError, ProcessError};
use serde::{Deserialize, Serialize};

/// Operator-side record of the daemon process. Written by `start`, removed by
/// `stop` and `cleanup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub command: Vec<String>,
}

impl ServiceRecord {
    pub fn load(path: &Path) -> Result<Option<Self>, CoreError> {
        read_json(path).map_err(|e| match e {
            CoreError::Serialization(details) => ProcessError::CorruptRecord {
                path: path.display().to_string(),
                details: details.to_string(),
            }
            .into(),
            other => other,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        write_json_atomic(path, self)
    }

    pub fn remove(path: &Path) -> Result<bool, CoreError> {
        remove_file(path)
    }
}
