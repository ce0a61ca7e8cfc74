//! Error types for the Pathlink core crate.

use std::time::Duration;
use thiserror::Error;

/// Address parsing and resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    /// Input matches neither the path-aware nor the conventional grammar
    #[error("malformed address {input:?}: {reason}")]
    Malformed {
        /// Offending input
        input: String,
        /// What did not parse
        reason: &'static str,
    },

    /// Input is well-formed but could not be turned into a path-aware address
    #[error("unresolvable address {input:?}: {reason}")]
    Unresolvable {
        /// Offending input
        input: String,
        /// Why resolution failed
        reason: String,
    },
}

impl AddrError {
    pub(crate) fn malformed(input: &str, reason: &'static str) -> Self {
        Self::Malformed {
            input: input.to_string(),
            reason,
        }
    }

    pub(crate) fn unresolvable(input: &str, reason: impl Into<String>) -> Self {
        Self::Unresolvable {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unresolvable { .. })
    }
}

/// Selector policy configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Probe interval must be positive
    #[error("probe interval must be greater than zero")]
    ZeroInterval,

    /// Probe timeout must be positive
    #[error("probe timeout must be greater than zero")]
    ZeroTimeout,

    /// Probe timeout must be strictly below the interval
    #[error("probe timeout {timeout:?} must be strictly less than interval {interval:?}")]
    TimeoutNotBelowInterval {
        /// Configured timeout
        timeout: Duration,
        /// Configured interval
        interval: Duration,
    },

    /// At least one concurrent probe is required
    #[error("active probe count must be at least 1")]
    ZeroActiveCount,

    /// Path refresh interval must be positive
    #[error("path refresh interval must be greater than zero")]
    ZeroRefreshInterval,

    /// Unknown selector policy name
    #[error("unknown selector policy: {0}")]
    UnknownPolicy(String),
}

/// Errors reported by a path resolver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Resolver service cannot be reached
    #[error("resolver unavailable: {0}")]
    Unavailable(String),

    /// Topology data is invalid
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

/// Per-candidate probe failures, absorbed by the selector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// No reply within the probe timeout
    #[error("probe timed out")]
    Timeout,

    /// Path metadata has expired
    #[error("path expired")]
    Expired,

    /// Probe could not be delivered
    #[error("path unreachable: {0}")]
    Unreachable(String),
}
