//! Declarative limiter policy configuration.
//!
//! A policy document lists the limiters to install into a registry:
//!
//! ```yaml
//! limiters:
//!   - key: "api:search"
//!     max_tokens: 100
//!     refill: 1s
//!     sliding: true
//!     block: 500ms
//!     max_penalty: 10
//!     distributed_key: "search"
//! ```
//!
//! Durations are strings of the form `<digits>(ms|s|m|h|d)`; a bare
//! number is milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::limiter::Limit;

/// A complete policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Limiters to install, in order
    #[serde(default)]
    pub limiters: Vec<LimiterSpec>,
}

/// Declaration of one limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSpec {
    /// The limiter key
    pub key: String,
    /// Bucket capacity
    pub max_tokens: i64,
    /// Window duration string
    pub refill: String,
    /// Sliding-window refill (defaults to fixed)
    #[serde(default)]
    pub sliding: bool,
    /// Post-exhaustion cooldown duration string
    #[serde(default)]
    pub block: Option<String>,
    /// Penalty ceiling; 0 disables penalties
    #[serde(default)]
    pub max_penalty: i64,
    /// Shared counter routing key
    #[serde(default)]
    pub distributed_key: Option<String>,
}

impl LimiterSpec {
    /// Resolve the duration strings into a [`Limit`].
    pub fn to_limit(&self) -> Result<Limit> {
        let mut limit = Limit::new(self.max_tokens, parse_duration_ms(&self.refill)?);
        if self.sliding {
            limit = limit.sliding();
        }
        if let Some(ref block) = self.block {
            limit = limit.with_block_ms(parse_duration_ms(block)?);
        }
        if self.max_penalty > 0 {
            limit = limit.with_max_penalty(self.max_penalty);
        }
        if let Some(ref dist_key) = self.distributed_key {
            limit = limit.with_distributed_key(dist_key.clone());
        }
        Ok(limit)
    }
}

impl PolicyConfig {
    /// Parse a policy document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse policy config: {}", e)))
    }

    /// Load a policy document from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

/// Parse a duration string of the form `<digits>(ms|s|m|h|d)` into
/// milliseconds. A bare number is taken as milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(Error::Config(format!(
            "duration '{}' has no numeric part",
            input
        )));
    }

    let value: i64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("duration '{}' is out of range", input)))?;

    let scale = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => {
            return Err(Error::Config(format!(
                "unknown duration unit '{}' in '{}'",
                unit, input
            )))
        }
    };

    value
        .checked_mul(scale)
        .ok_or_else(|| Error::Config(format!("duration '{}' overflows", input)))
}
