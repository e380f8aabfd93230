//! Engine configuration.
//!
//! Every section has defaults, so a config file only lists what it changes:
//!
//! ```json
//! { "queue": { "max_window": 300 }, "season": { "top_n": 50 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::QueueConfig;
use crate::rating::RatingConfig;
use crate::season::SeasonConfig;
use crate::session::SessionConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub queue: QueueConfig,
    pub rating: RatingConfig,
    pub session: SessionConfig,
    pub season: SeasonConfig,
}

impl ArenaConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
