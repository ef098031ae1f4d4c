//! Refresh schedules and the local time-to-live they imply.

use crate::error::{MirrorError, Result};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// How often mirrored records are expected to be re-checked upstream.
///
/// A candidate whose last refresh is older than the schedule's TTL is stale
/// locally and becomes eligible for delta detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Every(std::time::Duration),
}

impl Schedule {
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
            Self::Monthly => Duration::days(30),
            Self::Every(d) => Duration::from_std(*d).unwrap_or(Duration::MAX),
        }
    }

    /// True when a record last refreshed at `last_refresh` is due at `now`.
    /// Records that were never refreshed are always due.
    pub fn is_expired(&self, last_refresh: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_refresh {
            None => true,
            Some(ts) => now.signed_duration_since(ts) >= self.ttl(),
        }
    }
}

static DURATION_RE: OnceLock<Regex> = OnceLock::new();

fn duration_re() -> &'static Regex {
    DURATION_RE.get_or_init(|| Regex::new(r"^(\d+)([smhd])$").expect("duration pattern is valid"))
}

impl FromStr for Schedule {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        match trimmed.as_str() {
            "hourly" => return Ok(Self::Hourly),
            "daily" => return Ok(Self::Daily),
            "weekly" => return Ok(Self::Weekly),
            "monthly" => return Ok(Self::Monthly),
            _ => {}
        }
        let caps = duration_re()
            .captures(&trimmed)
            .ok_or_else(|| MirrorError::InvalidSchedule(s.to_string()))?;
        let n: u64 = caps[1]
            .parse()
            .map_err(|_| MirrorError::InvalidSchedule(s.to_string()))?;
        let secs = match &caps[2] {
            "s" => Some(n),
            "m" => n.checked_mul(60),
            "h" => n.checked_mul(3_600),
            _ => n.checked_mul(86_400),
        }
        .ok_or_else(|| MirrorError::InvalidSchedule(s.to_string()))?;
        if secs == 0 {
            return Err(MirrorError::InvalidSchedule(s.to_string()));
        }
        Ok(Self::Every(std::time::Duration::from_secs(secs)))
    }
}

impl TryFrom<String> for Schedule {
    type Error = MirrorError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Schedule> for String {
    fn from(s: Schedule) -> Self {
        s.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => f.write_str("hourly"),
            Self::Daily => f.write_str("daily"),
            Self::Weekly => f.write_str("weekly"),
            Self::Monthly => f.write_str("monthly"),
            Self::Every(d) => {
                let secs = d.as_secs();
                if secs % 86_400 == 0 {
                    write!(f, "{}d", secs / 86_400)
                } else if secs % 3_600 == 0 {
                    write!(f, "{}h", secs / 3_600)
                } else if secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{secs}s")
                }
            }
        }
    }
}
