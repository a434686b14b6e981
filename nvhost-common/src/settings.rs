// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use crate::error::{HostError, Result};

/// Engine settings, populated from config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Syncpoints
    pub num_syncpoints: u32,
    pub num_syncpoint_bases: u32,
    pub syncpoint_pools: Vec<SyncpointPool>,

    // Channels
    pub num_channels: u32,
    pub channel_range: Option<ChannelRange>,
    pub push_buffer_slots: u32,

    // Jobs
    pub default_job_timeout_ms: u32,
    pub firewall: bool,

    // Memory
    pub dma_address_bits: u32,
    pub iommu: bool,
    pub num_memory_contexts: u32,
    pub iova_base: u64,
    pub iova_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_syncpoints: 192,
            num_syncpoint_bases: 64,
            syncpoint_pools: vec![SyncpointPool::new("vblank", 26, 2)],
            num_channels: 14,
            channel_range: None,
            push_buffer_slots: 512,
            default_job_timeout_ms: 10_000,
            firewall: false,
            dma_address_bits: 34,
            iommu: true,
            num_memory_contexts: 8,
            iova_base: 0x0010_0000,
            iova_size: 0xFFF0_0000,
        }
    }
}

impl Settings {
    /// Channels this instance may hand out as `(base, count)`.
    pub fn channels(&self) -> ChannelRange {
        self.channel_range.unwrap_or(ChannelRange {
            base: 0,
            count: self.num_channels,
        })
    }

    pub fn default_job_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.default_job_timeout_ms))
    }

    pub fn pool(&self, name: &str) -> Option<&SyncpointPool> {
        self.syncpoint_pools.iter().find(|p| p.name == name)
    }

    /// Reject combinations the engine cannot be brought up with.
    pub fn validate(&self) -> Result<()> {
        if self.num_syncpoints == 0 || self.num_syncpoints > 1024 {
            return Err(invalid(format!(
                "syncpoint count {} out of range 1..=1024",
                self.num_syncpoints
            )));
        }
        if self.num_syncpoint_bases > 256 {
            return Err(invalid(format!(
                "syncpoint base count {} exceeds 256",
                self.num_syncpoint_bases
            )));
        }
        for (i, pool) in self.syncpoint_pools.iter().enumerate() {
            if pool.count == 0 || pool.end() > self.num_syncpoints {
                return Err(invalid(format!(
                    "syncpoint pool '{}' ({}..{}) outside 0..{}",
                    pool.name,
                    pool.base,
                    pool.end(),
                    self.num_syncpoints
                )));
            }
            for other in &self.syncpoint_pools[i + 1..] {
                if other.name == pool.name {
                    return Err(invalid(format!("duplicate syncpoint pool '{}'", pool.name)));
                }
                if other.base < pool.end() && pool.base < other.end() {
                    return Err(invalid(format!(
                        "syncpoint pools '{}' and '{}' overlap",
                        pool.name, other.name
                    )));
                }
            }
        }

        if self.num_channels == 0 {
            return Err(invalid("channel count is zero".into()));
        }
        let channels = self.channels();
        if channels.count == 0 || channels.end() > self.num_channels {
            return Err(invalid(format!(
                "channel range {}..{} outside 0..{}",
                channels.base,
                channels.end(),
                self.num_channels
            )));
        }
        if self.push_buffer_slots < 4 {
            return Err(invalid(format!(
                "push buffer of {} slots is too small",
                self.push_buffer_slots
            )));
        }

        if !(32..=48).contains(&self.dma_address_bits) {
            return Err(invalid(format!(
                "DMA address width {} out of range 32..=48",
                self.dma_address_bits
            )));
        }
        let iova_end = self.iova_base.checked_add(self.iova_size);
        if self.iova_size == 0
            || self.iova_base & 0xFFF != 0
            || self.iova_size & 0xFFF != 0
            || iova_end.map_or(true, |end| end > 1u64 << 32)
        {
            return Err(invalid(format!(
                "IOVA window 0x{:X}+0x{:X} must be page aligned and below 4 GiB",
                self.iova_base, self.iova_size
            )));
        }

        Ok(())
    }
}

fn invalid(msg: String) -> HostError {
    HostError::InvalidParameter(msg)
}

/// Named block of syncpoints kept out of general allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncpointPool {
    pub name: String,
    pub base: u32,
    pub count: u32,
}

impl SyncpointPool {
    pub fn new(name: &str, base: u32, count: u32) -> Self {
        Self {
            name: name.to_string(),
            base,
            count,
        }
    }

    pub fn end(&self) -> u32 {
        self.base.saturating_add(self.count)
    }

    pub fn contains(&self, id: u32) -> bool {
        id >= self.base && id < self.end()
    }

    /// Parse `name:base:count`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let name = parts.next()?.trim();
        let base = parse_u32(parts.next()?)?;
        let count = parse_u32(parts.next()?)?;
        if name.is_empty() || parts.next().is_some() {
            return None;
        }
        Some(Self::new(name, base, count))
    }
}

/// Channel partition `(base, count)` owned by this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub base: u32,
    pub count: u32,
}

impl ChannelRange {
    pub fn end(&self) -> u32 {
        self.base.saturating_add(self.count)
    }

    /// Parse `base:count`.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, count) = s.trim().split_once(':')?;
        Some(Self {
            base: parse_u32(base)?,
            count: parse_u32(count)?,
        })
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal 64-bit number.
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.channels(), ChannelRange { base: 0, count: 14 });
        assert_eq!(settings.default_job_timeout(), Duration::from_secs(10));
        assert_eq!(settings.pool("vblank").unwrap().base, 26);
    }

    #[test]
    fn test_pool_outside_syncpoints() {
        let settings = Settings {
            syncpoint_pools: vec![SyncpointPool::new("display", 190, 4)],
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(HostError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_overlapping_pools() {
        let settings = Settings {
            syncpoint_pools: vec![
                SyncpointPool::new("vblank", 26, 2),
                SyncpointPool::new("camera", 27, 4),
            ],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_channel_range_outside_table() {
        let settings = Settings {
            channel_range: Some(ChannelRange { base: 10, count: 8 }),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_iova_window_above_4g() {
        let settings = Settings {
            iova_base: 0x1_0000_0000,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(
            SyncpointPool::parse("vblank:26:2"),
            Some(SyncpointPool::new("vblank", 26, 2))
        );
        assert_eq!(SyncpointPool::parse("vblank:26"), None);
        assert_eq!(SyncpointPool::parse(":1:2"), None);
        assert_eq!(
            ChannelRange::parse(" 4 : 0x4 "),
            Some(ChannelRange { base: 4, count: 4 })
        );
        assert_eq!(parse_u32("0x1F"), Some(31));
        assert_eq!(parse_u64("0x1_0000"), None);
        assert_eq!(parse_u64("4096"), Some(4096));
    }
}
