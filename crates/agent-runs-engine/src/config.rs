use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use agent_runs_domain::RunError;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "AGENT_RUNS_";

/// Worker, guard and planner tuning.
///
/// Missing YAML fields keep their defaults; `AGENT_RUNS_*` environment
/// variables are applied on top of the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_running_per_tenant: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub run_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub max_runs_per_subject_per_hour: u32,
    pub worker_concurrency: u32,
    pub poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub plan_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_running_per_tenant: 3,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            run_timeout_secs: 120,
            lock_ttl_secs: 300,
            max_runs_per_subject_per_hour: 3,
            worker_concurrency: 4,
            poll_interval_ms: 250,
            sweep_interval_secs: 30,
            plan_version: 1,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns an error when the YAML is malformed or names an unknown field.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid engine config YAML: {err}"))
    }

    /// Defaults, then the optional YAML file, then process environment.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, an override is
    /// not a number, or the result fails [`EngineConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config from {}", path.display()))?;
                Self::from_yaml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENT_RUNS_<FIELD>` overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns an error naming the variable when a value does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_field(&lookup, "MAX_RUNNING_PER_TENANT", &mut self.max_running_per_tenant)?;
        override_field(&lookup, "MAX_RETRIES", &mut self.max_retries)?;
        override_field(&lookup, "BACKOFF_BASE_MS", &mut self.backoff_base_ms)?;
        override_field(&lookup, "BACKOFF_CAP_MS", &mut self.backoff_cap_ms)?;
        override_field(&lookup, "RUN_TIMEOUT_SECS", &mut self.run_timeout_secs)?;
        override_field(&lookup, "LOCK_TTL_SECS", &mut self.lock_ttl_secs)?;
        override_field(
            &lookup,
            "MAX_RUNS_PER_SUBJECT_PER_HOUR",
            &mut self.max_runs_per_subject_per_hour,
        )?;
        override_field(&lookup, "WORKER_CONCURRENCY", &mut self.worker_concurrency)?;
        override_field(&lookup, "POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_field(&lookup, "SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        override_field(&lookup, "PLAN_VERSION", &mut self.plan_version)?;
        Ok(())
    }

    /// # Errors
    /// Returns [`RunError::Configuration`] for zero caps or intervals and for a
    /// backoff base above the backoff cap.
    pub fn validate(&self) -> Result<(), RunError> {
        let positive = [
            ("max_running_per_tenant", u64::from(self.max_running_per_tenant)),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_cap_ms", self.backoff_cap_ms),
            ("run_timeout_secs", self.run_timeout_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
            (
                "max_runs_per_subject_per_hour",
                u64::from(self.max_runs_per_subject_per_hour),
            ),
            ("worker_concurrency", u64::from(self.worker_concurrency)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RunError::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(RunError::Configuration(format!(
                "backoff_base_ms ({}) must not exceed backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        Ok(())
    }

    /// Delay before the retry that follows attempt number `attempts`:
    /// `min(base * 2^(attempts-1), cap)`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> time::Duration {
        let factor = 1_u64
            .checked_shl(attempts.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let millis = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms);
        time::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn run_timeout(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.run_timeout_secs).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn lock_ttl(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.lock_ttl_secs).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

fn override_field<F, T>(lookup: &F, suffix: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    if let Some(raw) = lookup(&key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for {key}: {err}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn yaml_keeps_defaults_for_missing_fields() {
        let config = EngineConfig::from_yaml_str("max_retries: 5\nworker_concurrency: 2\n");
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.max_running_per_tenant, 3);
        assert_eq!(config.run_timeout_secs, 120);
    }

    #[test]
    fn yaml_rejects_unknown_fields() {
        assert!(EngineConfig::from_yaml_str("max_retrys: 5\n").is_err());
    }

    #[test]
    fn env_overrides_apply_after_file_values() {
        let env: BTreeMap<&str, &str> = [
            ("AGENT_RUNS_MAX_RETRIES", "7"),
            ("AGENT_RUNS_BACKOFF_CAP_MS", " 9000 "),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig {
            max_retries: 1,
            ..EngineConfig::default()
        };
        let applied =
            config.apply_env_overrides(|key| env.get(key).map(|value| (*value).to_string()));
        assert!(applied.is_ok());
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.backoff_cap_ms, 9_000);

        let bad = config.apply_env_overrides(|key| {
            (key == "AGENT_RUNS_WORKER_CONCURRENCY").then(|| "four".to_string())
        });
        assert!(bad.is_err_and(|err| err.to_string().contains("AGENT_RUNS_WORKER_CONCURRENCY")));
    }

    #[test]
    fn validate_rejects_zero_caps_and_inverted_backoff() {
        assert!(EngineConfig::default().validate().is_ok());

        let zero_cap = EngineConfig {
            max_running_per_tenant: 0,
            ..EngineConfig::default()
        };
        assert!(zero_cap
            .validate()
            .is_err_and(|err| err.to_string().starts_with("configuration_error:")));

        let inverted = EngineConfig {
            backoff_base_ms: 10_000,
            backoff_cap_ms: 1_000,
            ..EngineConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let config = EngineConfig::default();
        assert_eq!(config.backoff(1).whole_milliseconds(), 1_000);
        assert_eq!(config.backoff(2).whole_milliseconds(), 2_000);
        assert_eq!(config.backoff(3).whole_milliseconds(), 4_000);
        assert_eq!(config.backoff(7).whole_milliseconds(), 60_000);
        assert_eq!(config.backoff(200).whole_milliseconds(), 60_000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_backoff_is_monotone_and_capped(
            base in 1_u64..5_000,
            extra in 0_u64..120_000,
            attempts in 0_u32..80,
        ) {
            let config = EngineConfig {
                backoff_base_ms: base,
                backoff_cap_ms: base + extra,
                ..EngineConfig::default()
            };
            let current = config.backoff(attempts);
            let next = config.backoff(attempts + 1);
            prop_assert!(current <= next);
            prop_assert!(next.whole_milliseconds() <= i128::from(config.backoff_cap_ms));
            prop_assert!(current.whole_milliseconds() >= i128::from(base.min(config.backoff_cap_ms)));
        }
    }
}
