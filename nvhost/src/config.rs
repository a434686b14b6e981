// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use nvhost_common::settings::{parse_u32, parse_u64, ChannelRange, Settings, SyncpointPool};
use std::path::PathBuf;

/// Locate nvhost.ini.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("NVHOST_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("nvhost").join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/nvhost/nvhost.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("nvhost")
            .join("nvhost.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from an INI file, falling back to defaults.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No nvhost config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    let conf = match Ini::load_from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };
    apply(&conf, &mut settings);
    settings
}

fn parse_bool(value: &str) -> bool {
    let value = value.trim();
    value == "true" || value == "1"
}

fn set_u32(target: &mut u32, key: &str, value: &str) {
    match parse_u32(value) {
        Some(v) => *target = v,
        None => warn!("Ignoring invalid {} = {:?}", key, value),
    }
}

fn set_u64(target: &mut u64, key: &str, value: &str) {
    match parse_u64(value) {
        Some(v) => *target = v,
        None => warn!("Ignoring invalid {} = {:?}", key, value),
    }
}

pub fn apply(conf: &Ini, settings: &mut Settings) {
    // [Syncpoints]
    if let Some(section) = conf.section(Some("Syncpoints")) {
        if let Some(count) = section.get("count") {
            set_u32(&mut settings.num_syncpoints, "count", count);
        }
        if let Some(bases) = section.get("bases") {
            set_u32(&mut settings.num_syncpoint_bases, "bases", bases);
        }
        if let Some(pools) = section.get("reserved_pools") {
            let parsed: Option<Vec<_>> = pools
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(SyncpointPool::parse)
                .collect();
            match parsed {
                Some(parsed) => settings.syncpoint_pools = parsed,
                None => warn!("Ignoring invalid reserved_pools = {:?}", pools),
            }
            debug!("Reserved pools: {:?}", settings.syncpoint_pools);
        }
    }

    // [Channels]
    if let Some(section) = conf.section(Some("Channels")) {
        if let Some(count) = section.get("count") {
            set_u32(&mut settings.num_channels, "count", count);
        }
        if let Some(range) = section.get("range") {
            match ChannelRange::parse(range) {
                Some(r) => settings.channel_range = Some(r),
                None => warn!("Ignoring invalid range = {:?}", range),
            }
        }
        if let Some(slots) = section.get("push_buffer_slots") {
            set_u32(&mut settings.push_buffer_slots, "push_buffer_slots", slots);
        }
    }

    // [Jobs]
    if let Some(section) = conf.section(Some("Jobs")) {
        if let Some(timeout) = section.get("default_timeout_ms") {
            set_u32(&mut settings.default_job_timeout_ms, "default_timeout_ms", timeout);
        }
        if let Some(firewall) = section.get("firewall") {
            settings.firewall = parse_bool(firewall);
        }
    }

    // [Memory]
    if let Some(section) = conf.section(Some("Memory")) {
        if let Some(bits) = section.get("dma_address_bits") {
            set_u32(&mut settings.dma_address_bits, "dma_address_bits", bits);
        }
        if let Some(iommu) = section.get("iommu") {
            settings.iommu = parse_bool(iommu);
        }
        if let Some(contexts) = section.get("memory_contexts") {
            set_u32(&mut settings.num_memory_contexts, "memory_contexts", contexts);
        }
        if let Some(base) = section.get("iova_base") {
            set_u64(&mut settings.iova_base, "iova_base", base);
        }
        if let Some(size) = section.get("iova_size") {
            set_u64(&mut settings.iova_size, "iova_size", size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[Syncpoints]\ncount = 64\nbases = 0x10\nreserved_pools = vblank:26:2, camera:40:4\n\n\
             [Channels]\ncount = 8\nrange = 2:4\npush_buffer_slots = 128\n\n\
             [Jobs]\ndefault_timeout_ms = 500\nfirewall = true\n\n\
             [Memory]\niommu = 0\niova_base = 0x100000\n"
        )
        .unwrap();

        let settings = load_config(Some(&file.path().to_path_buf()));
        assert_eq!(settings.num_syncpoints, 64);
        assert_eq!(settings.num_syncpoint_bases, 16);
        assert_eq!(settings.syncpoint_pools.len(), 2);
        assert_eq!(settings.pool("camera"), Some(&SyncpointPool::new("camera", 40, 4)));
        assert_eq!(settings.channel_range, Some(ChannelRange { base: 2, count: 4 }));
        assert_eq!(settings.push_buffer_slots, 128);
        assert_eq!(settings.default_job_timeout_ms, 500);
        assert!(settings.firewall);
        assert!(!settings.iommu);
        assert_eq!(settings.iova_base, 0x10_0000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let conf = Ini::load_from_str(
            "[Syncpoints]\ncount = lots\nreserved_pools = vblank\n[Channels]\nrange = 3\n",
        )
        .unwrap();
        let mut settings = Settings::default();
        apply(&conf, &mut settings);
        let defaults = Settings::default();
        assert_eq!(settings.num_syncpoints, defaults.num_syncpoints);
        assert_eq!(settings.syncpoint_pools, defaults.syncpoint_pools);
        assert_eq!(settings.channel_range, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_config(Some(&dir.path().join("absent.ini")));
        assert_eq!(settings.num_channels, Settings::default().num_channels);
    }
}
