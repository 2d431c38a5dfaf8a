//! Version ordering for upgrades

use semver::Version;
use std::cmp::Ordering;

use crate::types::{ProvisionerError, Result};

/// Orders a node's reported version against an upgrade target
pub trait VersionComparator: Send + Sync {
    fn compare(&self, current: &str, target: &str) -> Result<Ordering>;
}

/// Semantic version ordering that tolerates a leading `v` and short
/// versions such as `0.29` or `1`
#[derive(Debug, Clone, Copy, Default)]
pub struct SemverComparator;

/// Parse a version leniently, padding missing minor and patch components
pub fn parse_lenient(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(ProvisionerError::Validation("no version given".into()));
    }

    let split = trimmed.find(|c| c == '-' || c == '+').unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(split);

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ProvisionerError::Validation(format!("invalid version {}", raw)));
    }
    while parts.len() < 3 {
        parts.push("0");
    }

    Version::parse(&format!("{}{}", parts.join("."), rest))
        .map_err(|e| ProvisionerError::Validation(format!("invalid version {}: {}", raw, e)))
}

impl VersionComparator for SemverComparator {
    fn compare(&self, current: &str, target: &str) -> Result<Ordering> {
        Ok(parse_lenient(current)?.cmp(&parse_lenient(target)?))
    }
}
