//! Plan-tiered admission policy.
//!
//! Checks run in a fixed order and the first failure wins: file count,
//! per-file size, daily quota, then concurrent jobs.

use tm_core::config::TiersConfig;
use tm_core::{PlanTier, Rejection};

/// What is being submitted.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub tier: PlanTier,
    /// `(name, size)` per file.
    pub files: Vec<(&'a str, u64)>,
}

/// The caller's current consumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerUsage {
    pub files_today: u64,
    pub active_jobs: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    tiers: TiersConfig,
}

impl AdmissionPolicy {
    pub fn new(tiers: TiersConfig) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &TiersConfig {
        &self.tiers
    }

    pub fn authorize(
        &self,
        request: &AdmissionRequest<'_>,
        usage: &CallerUsage,
    ) -> Result<(), Rejection> {
        let limits = self.tiers.limits(request.tier);
        let count = request.files.len();

        if count > limits.max_files {
            return Err(Rejection::TooManyFiles {
                count,
                max: limits.max_files,
            });
        }

        if let Some((name, size)) = request
            .files
            .iter()
            .find(|(_, size)| *size > limits.max_file_size)
        {
            return Err(Rejection::FileTooLarge {
                name: name.to_string(),
                size: *size,
                max: limits.max_file_size,
            });
        }

        if let Some(limit) = limits.files_per_day {
            let requested = count as u64;
            if usage.files_today.saturating_add(requested) > limit {
                return Err(Rejection::DailyQuotaExceeded {
                    used: usage.files_today,
                    requested,
                    limit,
                });
            }
        }

        if usage.active_jobs >= limits.concurrent_jobs {
            return Err(Rejection::ConcurrencyLimitExceeded {
                active: usage.active_jobs,
                limit: limits.concurrent_jobs,
            });
        }

        Ok(())
    }
}
