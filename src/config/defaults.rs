//! Default values for configuration

use super::{LanguageSeed, ModelSeed};
use crate::meta::TaskKind;

/// Default SQLite busy timeout in milliseconds
pub fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Default connections per database pool
pub fn default_max_connections() -> u32 {
    5
}

/// Default completion-topic poll timeout in milliseconds
pub fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Default interval between maintenance passes (eviction, stalled-job report)
pub fn default_maintenance_interval_secs() -> u64 {
    60
}

/// Default delay before the first redelivery of a failed completion
pub fn default_redelivery_delay_ms() -> u64 {
    500
}

/// Default cap on the redelivery delay
pub fn default_max_redelivery_delay_ms() -> u64 {
    30_000
}

/// Default: requests keep their results cached
pub fn default_request_cache() -> bool {
    true
}

/// Default seeded languages
pub fn default_languages() -> Vec<LanguageSeed> {
    vec![LanguageSeed {
        tag: "en".to_string(),
        name: "English".to_string(),
    }]
}

/// Default seeded models
pub fn default_models() -> Vec<ModelSeed> {
    vec![ModelSeed {
        name: "t5-large".to_string(),
        family: "T5".to_string(),
        vendor: "Google".to_string(),
        tasks: vec![TaskKind::Summarization, TaskKind::Translation],
    }]
}
