//! Orchestrator instance configuration (`.orchestrator/config.toml`).

use std::fmt;
use std::path::Path;

use serde::Deserialize;

/// Top-level orchestrator settings. Missing file → all defaults (not an
/// error). Missing fields within a present file use their own defaults.
#[derive(Clone, Debug, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub capacity: CapacitySettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Concurrency limits (§4.8, §5).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacitySettings {
    /// Global cap on concurrently `running` nodes across cooperating
    /// instances. `0` defers to `num_cpus::get()`.
    #[serde(default)]
    pub global_cap: u32,
    /// How long a capacity lease may go unrenewed before it is considered
    /// abandoned and reclaimed.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self { global_cap: 0, lease_ttl_secs: default_lease_ttl_secs() }
    }
}

const fn default_lease_ttl_secs() -> u64 {
    30
}

/// Scheduler pump tuning (§4.6).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    #[serde(default = "default_pulse_ms")]
    pub pulse_interval_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { pulse_interval_ms: default_pulse_ms(), worker_threads: default_worker_threads() }
    }
}

const fn default_pulse_ms() -> u64 {
    1000
}

fn default_worker_threads() -> usize {
    num_cpus::get().max(1)
}

/// Structured-logging output (§2.1).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { filter: default_log_filter(), json: false }
    }
}

fn default_log_filter() -> String {
    "info".to_owned()
}

/// Error loading an orchestrator settings file.
#[derive(Debug)]
pub struct SettingsError {
    pub path: Option<std::path::PathBuf>,
    pub message: String,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "settings error: {}", self.message)
        }
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    ///
    /// # Errors
    /// Returns `SettingsError` on an I/O error other than not-found, or on
    /// invalid TOML / unknown fields.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(SettingsError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].chars().filter(|&c| c == '\n').count() + 1;
                message = format!("line {line}: {message}");
            }
            SettingsError { path: None, message }
        })
    }

    #[must_use]
    pub fn effective_global_cap(&self) -> u32 {
        if self.capacity.global_cap == 0 {
            u32::try_from(num_cpus::get()).unwrap_or(u32::MAX).max(1)
        } else {
            self.capacity.global_cap
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn parses_partial_overrides() {
        let settings = Settings::parse("[capacity]\nglobal_cap = 4\n").unwrap();
        assert_eq!(settings.capacity.global_cap, 4);
        assert_eq!(settings.capacity.lease_ttl_secs, 30);
        assert_eq!(settings.scheduler.pulse_interval_ms, 1000);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = Settings::parse("bogus = true\n").unwrap_err();
        assert!(err.message.contains("bogus") || err.message.contains("unknown"));
    }

    #[test]
    fn zero_global_cap_falls_back_to_num_cpus() {
        let settings = Settings::default();
        assert!(settings.effective_global_cap() >= 1);
    }
}
