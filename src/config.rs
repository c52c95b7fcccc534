//! Store configuration helpers.
//!
//! This module loads, validates, and normalizes the store-owned config so
//! locking, hashing, and slot policy stay schema-driven.
use crate::durable::atomic_write_json;
use crate::error::{Result, StoreError};
use crate::paths::StorePaths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Current schema version for `config.json`.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Lock timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockConfig {
    pub timeout_ms: u64,
    pub retry_interval_ms: u64,
    /// Age after which a lock without a heartbeat is presumed abandoned.
    pub stale_after_secs: u64,
    /// Window after marker creation during which missing metadata is tolerated.
    pub meta_grace_ms: u64,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn meta_grace(&self) -> Duration {
        Duration::from_millis(self.meta_grace_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 100,
            stale_after_secs: 3600,
            meta_grace_ms: 2000,
        }
    }
}

/// Bounded retry policy for transient filesystem errors during asset moves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 50,
        }
    }
}

/// Policy for one semantic photo slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotConfig {
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allow_override: bool,
    /// Extensions in priority order, e.g. `[".jpg", ".png"]`.
    #[serde(default)]
    pub prefer_order: Vec<String>,
}

impl SlotConfig {
    /// Priority rank of an extension (lower wins); `None` when not accepted.
    ///
    /// An empty `prefer_order` accepts every extension at equal rank.
    pub fn rank_of(&self, extension: Option<&str>) -> Option<usize> {
        if self.prefer_order.is_empty() {
            return Some(0);
        }
        let ext = extension?.to_ascii_lowercase();
        self.prefer_order
            .iter()
            .position(|entry| entry.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub lock: LockConfig,
    /// Fields excluded from the packet identity hash.
    #[serde(default = "default_free_text_fields")]
    pub free_text_fields: Vec<String>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub move_retry: RetryConfig,
}

impl StoreConfig {
    pub fn slot(&self, key: &str) -> Option<&SlotConfig> {
        self.slots.iter().find(|slot| slot.key == key)
    }

    pub fn free_text_set(&self) -> BTreeSet<String> {
        self.free_text_fields.iter().cloned().collect()
    }
}

fn default_free_text_fields() -> Vec<String> {
    ["remarks", "notes", "comment"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_slots() -> Vec<SlotConfig> {
    vec![
        SlotConfig {
            key: "overview".to_string(),
            required: true,
            allow_override: true,
            prefer_order: vec![".jpg".to_string(), ".jpeg".to_string(), ".png".to_string()],
        },
        SlotConfig {
            key: "label_serial".to_string(),
            required: true,
            allow_override: false,
            prefer_order: vec![".jpg".to_string(), ".jpeg".to_string(), ".png".to_string()],
        },
    ]
}

/// Build the default config used when a store has no `config.json`.
pub fn default_config() -> StoreConfig {
    StoreConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        lock: LockConfig::default(),
        free_text_fields: default_free_text_fields(),
        slots: default_slots(),
        move_retry: RetryConfig::default(),
    }
}

/// Load `config.json` from the store root.
pub fn load_config(store_root: &Path) -> Result<StoreConfig> {
    let path = StorePaths::new(store_root.to_path_buf()).config_path();
    let bytes = fs::read(&path).map_err(|err| StoreError::io("read config", &path, err))?;
    let config: StoreConfig = serde_json::from_slice(&bytes)
        .map_err(|err| StoreError::serialization("store config", err))?;
    validate_config(&config)?;
    Ok(config)
}

/// Load `config.json`, falling back to defaults when the file is absent.
pub fn load_config_or_default(store_root: &Path) -> Result<StoreConfig> {
    let path = StorePaths::new(store_root.to_path_buf()).config_path();
    if !path.is_file() {
        return Ok(default_config());
    }
    load_config(store_root)
}

/// Persist a config to disk in a stable JSON format.
pub fn write_config(store_root: &Path, config: &StoreConfig) -> Result<()> {
    validate_config(config)?;
    let path = StorePaths::new(store_root.to_path_buf()).config_path();
    atomic_write_json(&path, config, "store config")?;
    Ok(())
}

fn slot_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_]*$").expect("valid slot key regex"))
}

/// Whether `key` is a well-formed slot key.
pub fn is_valid_slot_key(key: &str) -> bool {
    slot_key_pattern().is_match(key)
}

/// Validate schema version, timing knobs, and slot declarations.
pub fn validate_config(config: &StoreConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(StoreError::Config {
            reason: format!(
                "unsupported config schema_version {}",
                config.schema_version
            ),
        });
    }
    if config.lock.timeout_ms == 0 || config.lock.retry_interval_ms == 0 {
        return Err(StoreError::Config {
            reason: "lock timeout_ms and retry_interval_ms must be non-zero".to_string(),
        });
    }
    if config.lock.stale_after_secs == 0 {
        return Err(StoreError::Config {
            reason: "lock stale_after_secs must be non-zero".to_string(),
        });
    }
    if config.move_retry.attempts == 0 {
        return Err(StoreError::Config {
            reason: "move_retry attempts must be at least 1".to_string(),
        });
    }
    let mut seen = BTreeSet::new();
    for slot in &config.slots {
        if !is_valid_slot_key(&slot.key) {
            return Err(StoreError::Config {
                reason: format!("invalid slot key {:?}", slot.key),
            });
        }
        if !seen.insert(slot.key.as_str()) {
            return Err(StoreError::Config {
                reason: format!("duplicate slot key {:?}", slot.key),
            });
        }
        for ext in &slot.prefer_order {
            if !ext.starts_with('.') || ext.len() < 2 {
                return Err(StoreError::Config {
                    reason: format!(
                        "slot {} prefer_order entry {ext:?} must look like \".jpg\"",
                        slot.key
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
