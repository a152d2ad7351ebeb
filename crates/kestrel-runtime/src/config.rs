//! Runtime configuration: backend selection, wait-policy overrides and buffer sizing.
//!
//! Loaded from JSON ([`RuntimeConfig::from_json`]) or from `KESTREL_*` environment variables
//! ([`RuntimeConfig::from_env`]). Unset variables keep their defaults; a variable that is set but
//! does not parse is an error rather than being ignored.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MIN_COMMAND_STREAM_SIZE: usize = 64 * 1024;
pub const DEFAULT_MIN_INDIRECT_HEAP_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CsrKind {
    /// Submit to the kernel driver.
    #[default]
    Hw,
    /// Append to an AUB trace.
    Aub,
    /// Push to a TBX simulator link.
    Tbx,
}

impl FromStr for CsrKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hw" | "hardware" => Ok(Self::Hw),
            "aub" => Ok(Self::Aub),
            "tbx" => Ok(Self::Tbx),
            _ => Err(()),
        }
    }
}

/// Debug overrides for the device's KMD-notify properties. `None` keeps the device default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmdNotifyOverrides {
    pub override_enable_kmd_notify: Option<bool>,
    pub override_kmd_notify_delay_us: Option<i64>,
    pub override_enable_quick_kmd_sleep: Option<bool>,
    pub override_quick_kmd_sleep_delay_us: Option<i64>,
    pub override_enable_quick_kmd_sleep_for_sporadic_waits: Option<bool>,
    pub override_sporadic_wait_threshold_us: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub csr: CsrKind,
    /// Every wait with outstanding work gets an enabled 1 µs timeout.
    pub power_saving_mode: bool,
    #[serde(flatten)]
    pub kmd_notify: KmdNotifyOverrides,
    pub min_command_stream_size: usize,
    pub min_indirect_heap_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            csr: CsrKind::Hw,
            power_saving_mode: false,
            kmd_notify: KmdNotifyOverrides::default(),
            min_command_stream_size: DEFAULT_MIN_COMMAND_STREAM_SIZE,
            min_indirect_heap_size: DEFAULT_MIN_INDIRECT_HEAP_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(csr) = parse_var(&lookup, "KESTREL_CSR")? {
            cfg.csr = csr;
        }
        if let Some(v) = parse_bool(&lookup, "KESTREL_POWER_SAVING_MODE")? {
            cfg.power_saving_mode = v;
        }

        let o = &mut cfg.kmd_notify;
        o.override_enable_kmd_notify = parse_bool(&lookup, "KESTREL_OVERRIDE_ENABLE_KMD_NOTIFY")?;
        o.override_kmd_notify_delay_us =
            parse_var(&lookup, "KESTREL_OVERRIDE_KMD_NOTIFY_DELAY_US")?;
        o.override_enable_quick_kmd_sleep =
            parse_bool(&lookup, "KESTREL_OVERRIDE_ENABLE_QUICK_KMD_SLEEP")?;
        o.override_quick_kmd_sleep_delay_us =
            parse_var(&lookup, "KESTREL_OVERRIDE_QUICK_KMD_SLEEP_DELAY_US")?;
        o.override_enable_quick_kmd_sleep_for_sporadic_waits = parse_bool(
            &lookup,
            "KESTREL_OVERRIDE_ENABLE_QUICK_KMD_SLEEP_FOR_SPORADIC_WAITS",
        )?;
        o.override_sporadic_wait_threshold_us =
            parse_var(&lookup, "KESTREL_OVERRIDE_SPORADIC_WAIT_THRESHOLD_US")?;

        if let Some(v) = parse_var(&lookup, "KESTREL_MIN_COMMAND_STREAM_SIZE")? {
            cfg.min_command_stream_size = v;
        }
        if let Some(v) = parse_var(&lookup, "KESTREL_MIN_INDIRECT_HEAP_SIZE")? {
            cfg.min_indirect_heap_size = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_command_stream_size == 0 {
            return Err(ConfigError::Zero("min_command_stream_size"));
        }
        if self.min_indirect_heap_size == 0 {
            return Err(ConfigError::Zero("min_indirect_heap_size"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv(key)),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv(key)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn env_vars_override_defaults() {
        let cfg = RuntimeConfig::from_lookup(lookup(&[
            ("KESTREL_CSR", "aub"),
            ("KESTREL_POWER_SAVING_MODE", "1"),
            ("KESTREL_OVERRIDE_ENABLE_KMD_NOTIFY", "false"),
            ("KESTREL_OVERRIDE_QUICK_KMD_SLEEP_DELAY_US", "25"),
            ("KESTREL_MIN_COMMAND_STREAM_SIZE", "4096"),
        ]))
        .unwrap();

        assert_eq!(cfg.csr, CsrKind::Aub);
        assert!(cfg.power_saving_mode);
        assert_eq!(cfg.kmd_notify.override_enable_kmd_notify, Some(false));
        assert_eq!(cfg.kmd_notify.override_quick_kmd_sleep_delay_us, Some(25));
        assert_eq!(cfg.kmd_notify.override_kmd_notify_delay_us, None);
        assert_eq!(cfg.min_command_stream_size, 4096);
    }

    #[test]
    fn malformed_env_var_is_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[("KESTREL_CSR", "gpu")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv("KESTREL_CSR")));

        let err = RuntimeConfig::from_lookup(lookup(&[(
            "KESTREL_OVERRIDE_ENABLE_QUICK_KMD_SLEEP",
            "maybe",
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv("KESTREL_OVERRIDE_ENABLE_QUICK_KMD_SLEEP")
        ));
    }

    #[test]
    fn zero_stream_size_is_rejected() {
        let err = RuntimeConfig::from_lookup(lookup(&[("KESTREL_MIN_INDIRECT_HEAP_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("min_indirect_heap_size")));
    }

    #[test]
    fn json_config_with_flattened_overrides() {
        let cfg = RuntimeConfig::from_json(
            r#"{"csr":"tbx","override_enable_kmd_notify":true,"override_kmd_notify_delay_us":150}"#,
        )
        .unwrap();
        assert_eq!(cfg.csr, CsrKind::Tbx);
        assert_eq!(cfg.kmd_notify.override_enable_kmd_notify, Some(true));
        assert_eq!(cfg.kmd_notify.override_kmd_notify_delay_us, Some(150));
        assert_eq!(cfg.min_command_stream_size, DEFAULT_MIN_COMMAND_STREAM_SIZE);
    }
}
