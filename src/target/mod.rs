//! Monitored target data model.
//!
//! A target is one betting-market page that the orchestrator polls through the
//! extraction worker. The JSON shape here is also the on-disk format of the
//! targets file, so field names are camelCase.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, immutable target identifier (UUID v4 on creation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn generate() -> Self {
        TargetId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used to namespace output directories.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        TargetId(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        TargetId(s)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Created, waiting for its prepare run.
    Pending,
    /// Prepare run in flight.
    Preparing,
    /// Seeded, waiting for `startAt`.
    Ready,
    /// Polled on every batch tick.
    Active,
    /// Deactivated by an operator.
    Paused,
    /// Prepare run failed; needs an explicit retry.
    Error,
}

impl TargetStatus {
    pub const ALL: [TargetStatus; 6] = [
        TargetStatus::Pending,
        TargetStatus::Preparing,
        TargetStatus::Ready,
        TargetStatus::Active,
        TargetStatus::Paused,
        TargetStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Preparing => "preparing",
            TargetStatus::Ready => "ready",
            TargetStatus::Active => "active",
            TargetStatus::Paused => "paused",
            TargetStatus::Error => "error",
        }
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    ///
    /// Crash repair (`active -> ready`, `preparing -> pending`) is not an
    /// edge here; it only happens while loading the targets file.
    pub fn can_transition(self, to: TargetStatus) -> bool {
        use TargetStatus::*;
        matches!(
            (self, to),
            (Pending, Preparing)
                | (Preparing, Ready)
                | (Preparing, Active)
                | (Preparing, Error)
                | (Ready, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When polling may begin: `"now"` or an RFC 3339 timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartAt {
    #[default]
    Now,
    At(DateTime<Utc>),
}

impl StartAt {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            StartAt::Now => true,
            StartAt::At(at) => *at <= now,
        }
    }

    pub fn is_now(&self) -> bool {
        matches!(self, StartAt::Now)
    }
}

impl TryFrom<String> for StartAt {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("now") {
            return Ok(StartAt::Now);
        }
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| StartAt::At(dt.with_timezone(&Utc)))
            .map_err(|e| format!("invalid startAt {value:?}: {e}"))
    }
}

impl From<StartAt> for String {
    fn from(value: StartAt) -> Self {
        match value {
            StartAt::Now => "now".to_string(),
            StartAt::At(at) => at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub start_at: StartAt,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    pub interval_ms: u64,
}

/// Recorded for operators; scheduling never consults it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub process_count: u64,
    pub last_item_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeFlags {
    pub in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// One monitored source.
///
/// `status` and `runtimeFlags` are crate-private: only the registry (and the
/// crash repair in the store) may move them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: TargetId,
    pub url: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub priority: Priority,
    pub(crate) status: TargetStatus,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub(crate) runtime_flags: RuntimeFlags,
    pub timestamps: Timestamps,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Target {
    pub fn status(&self) -> TargetStatus {
        self.status
    }

    pub fn in_flight(&self) -> bool {
        self.runtime_flags.in_flight
    }

    /// Host part of the URL, for log lines.
    pub fn host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Administrative add request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTarget {
    pub url: String,
    #[serde(default)]
    pub start_at: Option<StartAt>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl AddTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Validate and build a fresh `pending` target.
    pub fn into_target(
        self,
        default_interval_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Target, String> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err("url is required".to_string());
        }
        let parsed = Url::parse(url).map_err(|e| format!("invalid url {url:?}: {e}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(format!("unsupported url scheme {:?}", parsed.scheme()));
        }
        if parsed.host_str().is_none() {
            return Err(format!("url {url:?} has no host"));
        }

        let interval_ms = self.interval_ms.unwrap_or(default_interval_ms);
        if interval_ms == 0 {
            return Err("intervalMs must be greater than zero".to_string());
        }

        let start_at = self.start_at.unwrap_or_default();
        if let Some(end) = self.end_at {
            let start = match start_at {
                StartAt::Now => now,
                StartAt::At(at) => at,
            };
            if end <= start {
                return Err("endAt must be after startAt".to_string());
            }
        }

        Ok(Target {
            id: TargetId::generate(),
            url: url.to_string(),
            schedule: Schedule {
                start_at,
                end_at: self.end_at,
                interval_ms,
            },
            priority: self.priority.unwrap_or_default(),
            status: TargetStatus::Pending,
            counters: Counters::default(),
            runtime_flags: RuntimeFlags::default(),
            timestamps: Timestamps {
                created_at: now,
                last_seen_at: None,
            },
            last_error: None,
        })
    }
}
