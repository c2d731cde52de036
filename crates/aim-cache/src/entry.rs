//! Cache entry records.

use std::path::PathBuf;

use aim_common::{CacheError, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Eviction priority; lower tiers are evicted first regardless of recency
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Evicted first
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Evicted last
    High,
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(Error::validation(format!(
                "invalid priority: {s}, expected one of: low, normal, high"
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Whether an entry's bytes are on disk yet
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Capacity is reserved and a fetch is in flight
    Reserved,
    /// Artifact is materialized and usable
    #[default]
    Ready,
}

/// One materialized (or reserved) model artifact
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheEntry {
    /// Model id (`namespace/name`)
    pub model_id: String,
    /// Local directory holding the artifact
    pub path: PathBuf,
    /// Size in bytes (the size hint while reserved)
    pub size_bytes: u64,
    /// Eviction priority
    #[serde(default)]
    pub priority: Priority,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// Last `ensure` hit or materialization
    pub last_access: DateTime<Utc>,
    /// Entry may be purged after this instant; slides forward on access
    #[serde(default)]
    pub retention_deadline: Option<DateTime<Utc>>,
    /// Number of `ensure` calls served
    #[serde(default)]
    pub access_count: u64,
    /// Reserved or ready
    #[serde(default)]
    pub state: EntryState,
}

impl CacheEntry {
    /// Returns true once the retention deadline has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Returns true if the artifact is usable
    pub fn is_ready(&self) -> bool {
        self.state == EntryState::Ready
    }

    /// Eviction order key: priority, then least recently used, then id
    pub(crate) fn eviction_key(&self) -> (Priority, DateTime<Utc>, &str) {
        (self.priority, self.last_access, self.model_id.as_str())
    }
}

/// Longest accepted id segment, matching the Hugging Face Hub limit
const MAX_SEGMENT_LEN: usize = 96;

/// Check that `model_id` is a Hub-style `name` or `namespace/name`.
///
/// Segments use `[A-Za-z0-9._-]`, may not start or end with `-` or `.`, and
/// may not contain `--` or `..`. Under those rules [`model_dir_name`] is
/// injective and always names a single directory below the models root.
pub fn validate_model_id(model_id: &str) -> Result<(), CacheError> {
    let invalid = |reason: &str| CacheError::InvalidModelId {
        model_id: model_id.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = model_id.split('/').collect();
    if segments.len() > 2 {
        return Err(invalid("expected name or namespace/name"));
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(invalid("segment longer than 96 characters"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("only letters, digits, '-', '_' and '.' are allowed"));
        }
        if segment.starts_with(['-', '.']) || segment.ends_with(['-', '.']) {
            return Err(invalid("segments may not start or end with '-' or '.'"));
        }
        if segment.contains("--") || segment.contains("..") {
            return Err(invalid("'--' and '..' are reserved"));
        }
    }
    Ok(())
}

/// Directory name for a validated model id: `Qwen/Qwen3-32B` → `Qwen--Qwen3-32B`
pub fn model_dir_name(model_id: &str) -> String {
    model_id.replace('/', "--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(priority: Priority, age_secs: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            model_id: "m/x".to_string(),
            path: PathBuf::from("/cache/models/m--x"),
            size_bytes: 1,
            priority,
            created_at: now,
            last_access: now - Duration::seconds(age_secs),
            retention_deadline: None,
            access_count: 0,
            state: EntryState::Ready,
        }
    }

    #[test]
    fn priority_orders_low_first() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn eviction_key_prefers_low_priority_then_oldest() {
        let old_high = entry(Priority::High, 1000);
        let new_low = entry(Priority::Low, 1);
        let old_low = entry(Priority::Low, 500);
        let mut all = [&old_high, &new_low, &old_low];
        all.sort_by(|a, b| a.eviction_key().cmp(&b.eviction_key()));
        assert_eq!(all[0], &old_low);
        assert_eq!(all[1], &new_low);
        assert_eq!(all[2], &old_high);
    }

    #[test]
    fn expiry_uses_deadline() {
        let now = Utc::now();
        let mut e = entry(Priority::Normal, 0);
        assert!(!e.is_expired(now));
        e.retention_deadline = Some(now - Duration::seconds(1));
        assert!(e.is_expired(now));
    }

    #[test]
    fn dir_names_are_distinct_per_model() {
        assert_eq!(model_dir_name("Qwen/Qwen3-32B"), "Qwen--Qwen3-32B");
        assert!(validate_model_id("Qwen/Qwen3-32B").is_ok());
        assert!(validate_model_id("meta-llama/Llama-3.1-8B-Instruct").is_ok());
        assert!(validate_model_id("gpt2").is_ok());
        // would share Qwen/Qwen3-32B's directory
        assert!(validate_model_id("Qwen--Qwen3-32B").is_err());
    }

    #[test]
    fn ids_that_escape_the_models_dir_are_rejected() {
        for id in ["", ".", "..", "../etc", "org/..", "org/.", "a/b/c", "/abs", "org/", "org/m v2", "org/-m", "org/m."] {
            assert!(
                matches!(validate_model_id(id), Err(CacheError::InvalidModelId { .. })),
                "{id:?} should be rejected"
            );
        }
    }
}
