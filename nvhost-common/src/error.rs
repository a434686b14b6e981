// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Errors reported by every nvhost subsystem.
///
/// `Clone` so a fence can hand the same error to each of its waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("no free {0} available")]
    ResourceExhausted(&'static str),

    #[error("invalid command at word {offset}: {reason}")]
    InvalidCommand { offset: usize, reason: String },

    #[error("operation timed out")]
    TimedOut,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("mapping failed: {0}")]
    MappingFailed(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, HostError>;

const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EOPNOTSUPP: i32 = 95;
const ETIMEDOUT: i32 = 110;

impl HostError {
    /// Shorthand for a firewall rejection.
    pub fn invalid_command(offset: usize, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            offset,
            reason: reason.into(),
        }
    }

    /// Negative errno a character-device front end returns for this error.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::ResourceExhausted(_) => -ENOSPC,
            Self::InvalidCommand { .. } | Self::InvalidParameter(_) => -EINVAL,
            Self::TimedOut => -ETIMEDOUT,
            Self::NotSupported(_) => -EOPNOTSUPP,
            Self::MappingFailed(_) => -ENOMEM,
            Self::InvalidState(_) => -EBUSY,
        }
    }
}
