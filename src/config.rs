use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use duration_string::DurationString;
use tracing::*;

use crate::{labels::ProvisionerLabels, retry::RetryPolicy};

pub static THREADS_ENV: &str = "LIB_BUCKET_PROVISIONER_THREADS";
pub static RETRY_INTERVAL_ENV: &str = "LIB_BUCKET_PROVISIONER_RETRY_INTERVAL";
pub static RETRY_TIMEOUT_ENV: &str = "LIB_BUCKET_PROVISIONER_RETRY_TIMEOUT";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Must match the `provisioner` of the storage classes this controller serves
    pub provisioner_name: String,
    /// Number of parallel workers
    pub threads: usize,
    pub labels: ProvisionerLabels,
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    pub fn new(provisioner_name: &str) -> Self {
        Self {
            provisioner_name: provisioner_name.to_string(),
            threads: 1,
            labels: ProvisionerLabels::new(provisioner_name),
            retry: RetryPolicy::default(),
        }
    }

    /// Defaults overridden by the `LIB_BUCKET_PROVISIONER_*` environment variables
    pub fn from_env(provisioner_name: &str) -> Self {
        Self::from_lookup(provisioner_name, |k| std::env::var(k).ok())
    }

    pub fn from_lookup(provisioner_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(provisioner_name);
        if let Some(raw) = lookup(THREADS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.threads = n,
                _ => warn!("ignoring invalid {THREADS_ENV}={raw:?}, running 1 worker"),
            }
        }
        if let Some(d) = lookup(RETRY_INTERVAL_ENV).and_then(|raw| parse_duration(RETRY_INTERVAL_ENV, &raw)) {
            config.retry.interval = d;
        }
        if let Some(d) = lookup(RETRY_TIMEOUT_ENV).and_then(|raw| parse_duration(RETRY_TIMEOUT_ENV, &raw)) {
            config.retry.timeout = d;
        }
        config
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Extra labels for every generated object, on top of the provisioner label
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels = self.labels.merge(labels);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn parse_duration(var: &str, raw: &str) -> Option<Duration> {
    match DurationString::from_str(raw.trim()) {
        Ok(d) => Some(d.into()),
        Err(e) => {
            warn!("ignoring invalid {var}={raw:?}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::PROVISIONER_LABEL_KEY;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_to_one_worker() {
        let config = ControllerConfig::from_lookup("p", env(&[]));
        assert_eq!(config.threads, 1);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn threads_from_env() {
        assert_eq!(ControllerConfig::from_lookup("p", env(&[(THREADS_ENV, "4")])).threads, 4);
        assert_eq!(ControllerConfig::from_lookup("p", env(&[(THREADS_ENV, "zero")])).threads, 1);
        assert_eq!(ControllerConfig::from_lookup("p", env(&[(THREADS_ENV, "0")])).threads, 1);
    }

    #[test]
    fn retry_budget_from_env() {
        let config = ControllerConfig::from_lookup(
            "p",
            env(&[(RETRY_INTERVAL_ENV, "500ms"), (RETRY_TIMEOUT_ENV, "1m")]),
        );
        assert_eq!(config.retry.interval, Duration::from_millis(500));
        assert_eq!(config.retry.timeout, Duration::from_secs(60));
    }

    #[test]
    fn labels_merge_on_top_of_identity() {
        let config = ControllerConfig::new("example.com/s3")
            .with_labels(&BTreeMap::from([("tier".to_string(), "gold".to_string())]));
        let labels = config.labels.as_map();
        assert_eq!(labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(labels.get(PROVISIONER_LABEL_KEY).map(String::as_str), Some("example.com-s3"));
    }
}
