use crate::memory::MAX_TILES;
use tracing::warn;

const VM_BIND_ENV: &str = "DRM_RESIDENCY_VM_BIND";
const SUB_DEVICES_ENV: &str = "DRM_RESIDENCY_SUB_DEVICES";
const MAKE_EACH_RESIDENT_ENV: &str = "DRM_RESIDENCY_MAKE_EACH_RESIDENT";
const WAIT_TIMEOUT_ENV: &str = "DRM_RESIDENCY_WAIT_TIMEOUT_NS";

/// Which residency handler to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VmBindMode {
    /// Explicit binding only when the kernel supports it and the device has several tiles.
    #[default]
    Auto,
    Enabled,
    Disabled,
}

impl VmBindMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "-1" => Some(Self::Auto),
            "1" | "on" | "true" => Some(Self::Enabled),
            "0" | "off" | "false" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResidencyConfig {
    pub vm_bind: VmBindMode,
    /// Tiles exposed by the root device (1..=4).
    pub sub_device_count: u32,
    /// Make every new allocation resident in all registered contexts.
    pub make_each_allocation_resident: bool,
    /// Timeout for fence-completion waits; `-1` waits forever.
    pub wait_timeout_ns: i64,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            vm_bind: VmBindMode::Auto,
            sub_device_count: 1,
            make_each_allocation_resident: false,
            wait_timeout_ns: -1,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl ResidencyConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_vm_bind(mut self, mode: VmBindMode) -> Self {
        self.vm_bind = mode;
        self
    }

    #[must_use]
    pub fn with_sub_device_count(mut self, count: u32) -> Self {
        self.sub_device_count = count.clamp(1, MAX_TILES as u32);
        self
    }

    #[must_use]
    pub const fn with_make_each_allocation_resident(mut self, enabled: bool) -> Self {
        self.make_each_allocation_resident = enabled;
        self
    }

    #[must_use]
    pub const fn with_wait_timeout_ns(mut self, timeout_ns: i64) -> Self {
        self.wait_timeout_ns = timeout_ns;
        self
    }

    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Unparsable values keep their default.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(VM_BIND_ENV) {
            match VmBindMode::parse(&raw) {
                Some(mode) => config.vm_bind = mode,
                None => warn!(key = VM_BIND_ENV, value = %raw, "ignoring invalid setting"),
            }
        }

        if let Some(raw) = lookup(SUB_DEVICES_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(count) if (1..=MAX_TILES as u32).contains(&count) => {
                    config.sub_device_count = count;
                }
                _ => warn!(key = SUB_DEVICES_ENV, value = %raw, "ignoring invalid setting"),
            }
        }

        if let Some(raw) = lookup(MAKE_EACH_RESIDENT_ENV) {
            match parse_bool(&raw) {
                Some(enabled) => config.make_each_allocation_resident = enabled,
                None => warn!(key = MAKE_EACH_RESIDENT_ENV, value = %raw, "ignoring invalid setting"),
            }
        }

        if let Some(raw) = lookup(WAIT_TIMEOUT_ENV) {
            match raw.trim().parse::<i64>() {
                Ok(timeout) if timeout >= -1 => config.wait_timeout_ns = timeout,
                _ => warn!(key = WAIT_TIMEOUT_ENV, value = %raw, "ignoring invalid setting"),
            }
        }

        config
    }

    /// Whether the explicit-bind handler should be used on a kernel that
    /// reports `vm_bind_available`.
    #[must_use]
    pub fn use_vm_bind(&self, vm_bind_available: bool) -> bool {
        match self.vm_bind {
            VmBindMode::Disabled => false,
            VmBindMode::Enabled => {
                if !vm_bind_available {
                    warn!("VM bind requested but not supported by the kernel, using software residency");
                }
                vm_bind_available
            }
            VmBindMode::Auto => vm_bind_available && self.sub_device_count > 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = ResidencyConfig::from_lookup(|_| None);
        assert_eq!(config.vm_bind, VmBindMode::Auto);
        assert_eq!(config.sub_device_count, 1);
        assert!(!config.make_each_allocation_resident);
        assert_eq!(config.wait_timeout_ns, -1);
    }

    #[test]
    fn overrides_are_applied() {
        let config = ResidencyConfig::from_lookup(lookup(&[
            (VM_BIND_ENV, "1"),
            (SUB_DEVICES_ENV, "2"),
            (MAKE_EACH_RESIDENT_ENV, "true"),
            (WAIT_TIMEOUT_ENV, "5000"),
        ]));
        assert_eq!(config.vm_bind, VmBindMode::Enabled);
        assert_eq!(config.sub_device_count, 2);
        assert!(config.make_each_allocation_resident);
        assert_eq!(config.wait_timeout_ns, 5000);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = ResidencyConfig::from_lookup(lookup(&[
            (VM_BIND_ENV, "sometimes"),
            (SUB_DEVICES_ENV, "9"),
            (WAIT_TIMEOUT_ENV, "-7"),
        ]));
        assert_eq!(config.vm_bind, VmBindMode::Auto);
        assert_eq!(config.sub_device_count, 1);
        assert_eq!(config.wait_timeout_ns, -1);
    }

    #[test]
    fn handler_selection() {
        let auto_single = ResidencyConfig::new();
        assert!(!auto_single.use_vm_bind(true));

        let auto_multi = ResidencyConfig::new().with_sub_device_count(2);
        assert!(auto_multi.use_vm_bind(true));
        assert!(!auto_multi.use_vm_bind(false));

        let forced = ResidencyConfig::new().with_vm_bind(VmBindMode::Enabled);
        assert!(forced.use_vm_bind(true));
        assert!(!forced.use_vm_bind(false));

        let off = ResidencyConfig::new().with_vm_bind(VmBindMode::Disabled).with_sub_device_count(4);
        assert!(!off.use_vm_bind(true));
    }
}
