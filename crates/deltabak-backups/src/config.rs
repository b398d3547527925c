use std::env;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONCURRENCY: usize = 16;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;

/// Policy of one [`crate::clean_vm`] pass.
///
/// With `remove` and `merge` both unset the pass is a pure audit: findings are reported and
/// nothing on the remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanVmOptions {
    /// Delete broken, orphaned and unused artifacts.
    pub remove: bool,
    /// Coalesce unused chains into their used descendant.
    pub merge: bool,
    /// Upper bound on VHDs opened at the same time while walking.
    pub concurrency: usize,
    pub progress_interval_secs: u64,
}

impl Default for CleanVmOptions {
    fn default() -> Self {
        Self {
            remove: false,
            merge: false,
            concurrency: DEFAULT_CONCURRENCY,
            progress_interval_secs: DEFAULT_PROGRESS_INTERVAL_SECS,
        }
    }
}

impl CleanVmOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let mut options: Self = serde_json::from_str(raw)?;
        options.concurrency = options.concurrency.max(1);
        Ok(options)
    }

    /// Apply `DELTABAK_REMOVE`, `DELTABAK_MERGE` and `DELTABAK_CONCURRENCY` on top of `self`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|var| env::var(var).ok())
    }

    fn apply_env(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(remove) = get("DELTABAK_REMOVE").and_then(|v| parse_flag("DELTABAK_REMOVE", &v)) {
            self.remove = remove;
        }
        if let Some(merge) = get("DELTABAK_MERGE").and_then(|v| parse_flag("DELTABAK_MERGE", &v)) {
            self.merge = merge;
        }
        let concurrency = get("DELTABAK_CONCURRENCY").and_then(|value| {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    warn!(value = %value, "ignoring invalid DELTABAK_CONCURRENCY");
                    None
                }
            }
        });
        if let Some(concurrency) = concurrency {
            self.concurrency = concurrency;
        }
        self
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

fn parse_flag(var: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            warn!(var, value, "ignoring invalid boolean");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn json_fields_default_individually() {
        let options = CleanVmOptions::from_json(r#"{"remove": true}"#).unwrap();
        assert!(options.remove);
        assert!(!options.merge);
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.progress_interval(), Duration::from_secs(10));

        let options =
            CleanVmOptions::from_json(r#"{"merge": true, "concurrency": 0, "progressIntervalSecs": 2}"#)
                .unwrap();
        assert!(options.merge);
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.progress_interval_secs, 2);
    }

    #[test]
    fn json_rejects_wrong_types() {
        assert!(CleanVmOptions::from_json(r#"{"remove": "sure"}"#).is_err());
    }

    #[test]
    fn env_overrides_json() {
        let options = CleanVmOptions::default().apply_env(env_of(&[
            ("DELTABAK_REMOVE", " TRUE "),
            ("DELTABAK_MERGE", "1"),
            ("DELTABAK_CONCURRENCY", "4"),
        ]));
        assert!(options.remove);
        assert!(options.merge);
        assert_eq!(options.concurrency, 4);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let base = CleanVmOptions {
            remove: true,
            ..CleanVmOptions::default()
        };
        let options = base.clone().apply_env(env_of(&[
            ("DELTABAK_REMOVE", "maybe"),
            ("DELTABAK_CONCURRENCY", "0"),
        ]));
        assert_eq!(options, base);
    }
}
