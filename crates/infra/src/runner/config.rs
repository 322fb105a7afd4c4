//! Runner configuration.

use std::str::FromStr;
use std::time::Duration;

use super::RunnerError;

pub const ENV_MAX_NUM_WORKERS: &str = "JOBLINE_MAX_NUM_WORKERS";
pub const ENV_TIMEOUT_SECS: &str = "JOBLINE_TIMEOUT_SECS";
pub const ENV_NUM_JOBS: &str = "JOBLINE_NUM_JOBS";
pub const ENV_EXCLUDE: &str = "JOBLINE_EXCLUDE";

/// Claim waits must outlast one poll by at least this much.
const CLAIM_TIMEOUT_MARGIN: Duration = Duration::from_millis(200);

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Worker slots, and the most rows this runner holds `InProgress` at once.
    pub max_num_workers: usize,
    /// Wall-clock budget for the whole run; `None` runs until `num_jobs` is hit.
    pub timeout: Option<Duration>,
    /// Jobs to claim and process before stopping; `None` for no limit.
    pub num_jobs: Option<usize>,
    /// Job names this runner never claims.
    pub exclude: Vec<String>,
    /// How long one claim attempt polls before looping.
    pub claim_timeout: Duration,
    /// How long a worker waits on the queue before looping.
    pub dequeue_timeout: Duration,
    /// Sleep between empty claim queries.
    pub poll_interval: Duration,
    /// How often a worker renews the claim on the row it is running.
    pub heartbeat_interval: Duration,
    /// Reset `InProgress` rows idle for this long back to `New` at startup.
    /// Must exceed twice `heartbeat_interval`, or live claims would be taken.
    pub reclaim_stale_after: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_num_workers: 10,
            timeout: None,
            num_jobs: None,
            exclude: Vec::new(),
            claim_timeout: Duration::from_millis(400),
            dequeue_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(10),
            reclaim_stale_after: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_max_num_workers(mut self, max: usize) -> Self {
        self.max_num_workers = max;
        self
    }

    /// A zero timeout means "run forever".
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Zero means "no limit".
    pub fn with_num_jobs(mut self, num_jobs: usize) -> Self {
        self.num_jobs = (num_jobs > 0).then_some(num_jobs);
        self
    }

    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reclaim_stale_after(mut self, after: Duration) -> Self {
        self.reclaim_stale_after = (!after.is_zero()).then_some(after);
        self
    }

    /// Read overrides from `JOBLINE_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RunnerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse_var::<usize, _>(&lookup, ENV_MAX_NUM_WORKERS)? {
            config = config.with_max_num_workers(workers);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_TIMEOUT_SECS)? {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(num_jobs) = parse_var::<usize, _>(&lookup, ENV_NUM_JOBS)? {
            config = config.with_num_jobs(num_jobs);
        }
        if let Some(raw) = lookup(ENV_EXCLUDE) {
            config = config.with_exclude(split_names(&raw));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.max_num_workers < 1 {
            return Err(RunnerError::Config(
                "max_num_workers cannot be smaller than one".to_string(),
            ));
        }
        for (name, value) in [
            ("claim_timeout", self.claim_timeout),
            ("dequeue_timeout", self.dequeue_timeout),
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(RunnerError::Config(format!("{name} must be positive")));
            }
        }
        let min_reclaim = self.heartbeat_interval * 2;
        if let Some(after) = self.reclaim_stale_after.filter(|after| *after <= min_reclaim) {
            return Err(RunnerError::Config(format!(
                "reclaim_stale_after ({after:?}) must exceed twice heartbeat_interval ({:?})",
                self.heartbeat_interval
            )));
        }
        Ok(())
    }

    /// Claim wait actually used: never shorter than one poll plus a margin, so
    /// every wait gets at least a second query.
    pub fn effective_claim_timeout(&self) -> Duration {
        if self.claim_timeout <= self.poll_interval {
            self.poll_interval + CLAIM_TIMEOUT_MARGIN
        } else {
            self.claim_timeout
        }
    }
}

/// Split a comma-separated name list, dropping blanks.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, RunnerError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            RunnerError::Config(format!("{key} must be a non-negative integer, got `{raw}`"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_consumer_command() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_num_workers, 10);
        assert_eq!(config.timeout, None);
        assert_eq!(config.num_jobs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_means_unbounded() {
        let config = RunnerConfig::default()
            .with_timeout(Duration::ZERO)
            .with_num_jobs(0)
            .with_reclaim_stale_after(Duration::ZERO);
        assert_eq!(config.timeout, None);
        assert_eq!(config.num_jobs, None);
        assert_eq!(config.reclaim_stale_after, None);
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let err = RunnerConfig::default().with_max_num_workers(0).validate();
        assert!(matches!(err, Err(RunnerError::Config(_))));
    }

    #[test]
    fn claim_timeout_outlasts_the_poll_interval() {
        let config = RunnerConfig::default()
            .with_poll_interval(Duration::from_millis(500))
            .with_claim_timeout(Duration::from_millis(100));
        assert_eq!(config.effective_claim_timeout(), Duration::from_millis(700));

        let config = RunnerConfig::default();
        assert_eq!(config.effective_claim_timeout(), Duration::from_millis(400));
    }

    #[test]
    fn reclaim_threshold_must_outlast_two_heartbeats() {
        let config = RunnerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_reclaim_stale_after(Duration::from_secs(20));
        assert!(matches!(config.validate(), Err(RunnerError::Config(msg)) if msg.contains("heartbeat")));

        let config = config.with_reclaim_stale_after(Duration::from_secs(21));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides_from_the_environment() {
        let config = RunnerConfig::from_lookup(lookup(&[
            (ENV_MAX_NUM_WORKERS, "3"),
            (ENV_TIMEOUT_SECS, "5"),
            (ENV_NUM_JOBS, "0"),
            (ENV_EXCLUDE, "A, B,,"),
        ]))
        .unwrap();

        assert_eq!(config.max_num_workers, 3);
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.num_jobs, None);
        assert_eq!(config.exclude, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn non_integer_values_are_rejected() {
        let err = RunnerConfig::from_lookup(lookup(&[(ENV_TIMEOUT_SECS, "1.5")]));
        assert!(matches!(err, Err(RunnerError::Config(msg)) if msg.contains(ENV_TIMEOUT_SECS)));

        let err = RunnerConfig::from_lookup(lookup(&[(ENV_MAX_NUM_WORKERS, "0")]));
        assert!(matches!(err, Err(RunnerError::Config(_))));
    }
}
