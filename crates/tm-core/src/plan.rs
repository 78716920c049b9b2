//! Plan tiers, their admission limits, and the rejection reasons.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

const MB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// PlanTier
// ---------------------------------------------------------------------------

/// A caller's plan level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Unlimited,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Unlimited => "unlimited",
        }
    }

    /// Queue lane used when tier priority is enabled.
    pub fn queue_priority(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Pro => 1,
            Self::Unlimited => 2,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(Error::Validation(format!("unknown plan tier: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// TierLimits
// ---------------------------------------------------------------------------

/// Quotas applied to one tier at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Maximum files in one submission.
    pub max_files: usize,
    /// Maximum size of any single file, in bytes.
    pub max_file_size: u64,
    /// Files accepted per owner per UTC day; `None` means unbounded.
    pub files_per_day: Option<u64>,
    /// Jobs an owner may have queued or active at once.
    pub concurrent_jobs: u32,
}

impl TierLimits {
    /// Built-in limits for a tier.
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                max_files: 5,
                max_file_size: 20 * MB,
                files_per_day: Some(20),
                concurrent_jobs: 1,
            },
            PlanTier::Pro => Self {
                max_files: 20,
                max_file_size: 100 * MB,
                files_per_day: Some(500),
                concurrent_jobs: 5,
            },
            PlanTier::Unlimited => Self {
                max_files: 100,
                max_file_size: 500 * MB,
                files_per_day: None,
                concurrent_jobs: 20,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

/// Why the admission policy refused a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("too many files: {count} submitted, at most {max} allowed")]
    TooManyFiles { count: usize, max: usize },

    #[error("file too large: {name} is {size} bytes, limit is {max} bytes")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("daily quota exceeded: {used} used + {requested} requested > {limit}")]
    DailyQuotaExceeded { used: u64, requested: u64, limit: u64 },

    #[error("concurrency limit exceeded: {active} jobs in flight, limit is {limit}")]
    ConcurrencyLimitExceeded { active: u32, limit: u32 },
}

impl Rejection {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TooManyFiles { .. } => 400,
            Self::FileTooLarge { .. } => 413,
            Self::DailyQuotaExceeded { .. } => 429,
            Self::ConcurrencyLimitExceeded { .. } => 429,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::TooManyFiles { .. } => "too_many_files",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::DailyQuotaExceeded { .. } => "daily_quota_exceeded",
            Self::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
        }
    }
}
