//! Device and renderer configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::hal::{BackendKind, TextureFormat};

/// How strictly API misuse that the device would not catch is reported.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ValidationMode {
    /// No checks.
    Off,
    /// Log a warning and carry on.
    Warn,
    /// Fail the operation.
    Strict,
}

impl Default for ValidationMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ValidationMode::Strict
        } else {
            ValidationMode::Warn
        }
    }
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Ok(ValidationMode::Off),
            "warn" | "1" => Ok(ValidationMode::Warn),
            "strict" | "2" => Ok(ValidationMode::Strict),
            other => Err(format!(
                "unknown validation mode `{other}` (expected off, warn or strict)"
            )),
        }
    }
}

/// Parameters for [`crate::device::Device::create`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub backend: BackendKind,

    /// Adapter preference for the wgpu backend.
    pub power_preference: wgpu::PowerPreference,

    pub validation: ValidationMode,

    /// Upper bound on a single fence wait. `None` waits forever.
    ///
    /// The wgpu backend cannot bound device waits and ignores this.
    pub fence_timeout: Option<Duration>,

    /// Artificial execution delay per submission on the soft backend.
    pub soft_latency: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Wgpu,
            power_preference: wgpu::PowerPreference::HighPerformance,
            validation: ValidationMode::default(),
            fence_timeout: Some(Duration::from_secs(10)),
            soft_latency: Duration::ZERO,
        }
    }
}

impl DeviceConfig {
    pub const BACKEND_VAR: &'static str = "EMBER_BACKEND";
    pub const VALIDATION_VAR: &'static str = "EMBER_VALIDATION";
    pub const FENCE_TIMEOUT_VAR: &'static str = "EMBER_FENCE_TIMEOUT_MS";

    /// Soft backend with defaults everywhere else.
    pub fn soft() -> Self {
        Self {
            backend: BackendKind::Soft,
            ..Self::default()
        }
    }

    /// Defaults overridden by `EMBER_*` environment variables.
    ///
    /// Unparseable values are logged and ignored. A timeout of `0` waits forever.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(Self::BACKEND_VAR) {
            match raw.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => log::warn!("{}: {e}", Self::BACKEND_VAR),
            }
        }
        if let Some(raw) = lookup(Self::VALIDATION_VAR) {
            match raw.parse() {
                Ok(mode) => config.validation = mode,
                Err(e) => log::warn!("{}: {e}", Self::VALIDATION_VAR),
            }
        }
        if let Some(raw) = lookup(Self::FENCE_TIMEOUT_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(0) => config.fence_timeout = None,
                Ok(ms) => config.fence_timeout = Some(Duration::from_millis(ms)),
                Err(e) => log::warn!("{}: {e}", Self::FENCE_TIMEOUT_VAR),
            }
        }

        config
    }
}

/// Parameters for [`crate::render::RenderingSystem`].
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub device: DeviceConfig,
    pub back_buffer_count: u32,
    /// Number of per-object constant slots.
    pub object_count: usize,
    pub clear_color: [f32; 4],
    /// 0 presents immediately, N waits for N vertical blanks.
    pub sync_interval: u32,
    pub back_buffer_format: TextureFormat,
    pub depth_format: TextureFormat,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            back_buffer_count: 2,
            object_count: 1,
            clear_color: [0.0, 0.4, 0.2, 1.0],
            sync_interval: 1,
            back_buffer_format: TextureFormat::Rgba8Unorm,
            depth_format: TextureFormat::Depth32FloatStencil8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name: &str| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn env_overrides_defaults() {
        let config = DeviceConfig::from_lookup(lookup(&[
            ("EMBER_BACKEND", "soft"),
            ("EMBER_VALIDATION", "off"),
            ("EMBER_FENCE_TIMEOUT_MS", "250"),
        ]));
        assert_eq!(config.backend, BackendKind::Soft);
        assert_eq!(config.validation, ValidationMode::Off);
        assert_eq!(config.fence_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_timeout_waits_forever_and_garbage_is_ignored() {
        let config = DeviceConfig::from_lookup(lookup(&[
            ("EMBER_BACKEND", "vulkan-ish"),
            ("EMBER_FENCE_TIMEOUT_MS", "0"),
        ]));
        assert_eq!(config.backend, BackendKind::Wgpu);
        assert_eq!(config.fence_timeout, None);
    }

    #[test]
    fn render_defaults() {
        let c = RenderConfig::default();
        assert_eq!(c.back_buffer_count, 2);
        assert_eq!(c.clear_color, [0.0, 0.4, 0.2, 1.0]);
        assert_eq!(c.sync_interval, 1);
    }
}
