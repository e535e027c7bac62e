//! Operator-wide knobs, grouped by concern.
//!
//! `Default` carries the framework defaults. `Settings::from_env` overrides any
//! of them from `KREACT_*` variables; unparsable values fall back to the default.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kreact_daemons::DaemonSettings;
use kreact_execution::{ErrorsMode, Lifecycle};
use kreact_kubehub::WatchSettings;
use kreact_persist::keys::annotation_key;
use kreact_persist::{
    AnnotationsDiffBaseStorage, AnnotationsProgressStorage, DiffBaseStorage, ProgressStorage,
    SmartProgressStorage, StatusDiffBaseStorage, StatusProgressStorage, DEFAULT_PREFIX,
};

/// Where per-handler progress is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressLayout {
    Annotations,
    Status,
    #[default]
    Smart,
}

impl FromStr for ProgressLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "annotations" => Ok(Self::Annotations),
            "status" => Ok(Self::Status),
            "smart" => Ok(Self::Smart),
            other => Err(format!("unknown progress storage: {other}")),
        }
    }
}

/// Where the last handled essence is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffBaseLayout {
    #[default]
    Annotations,
    Status,
}

impl FromStr for DiffBaseLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "annotations" => Ok(Self::Annotations),
            "status" => Ok(Self::Status),
            other => Err(format!("unknown diff-base storage: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub finalizer: String,
    /// Prefix of the annotations owned by the operator.
    pub prefix: String,
    /// Name of the `status` stanza owned by the operator.
    pub status_field: String,
    pub progress: ProgressLayout,
    pub diffbase: DiffBaseLayout,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            finalizer: format!("{DEFAULT_PREFIX}/finalizer"),
            prefix: DEFAULT_PREFIX.to_string(),
            status_field: "kreact".to_string(),
            progress: ProgressLayout::default(),
            diffbase: DiffBaseLayout::default(),
        }
    }
}

impl PersistenceSettings {
    pub fn progress_storage(&self) -> Arc<dyn ProgressStorage> {
        let annotations = AnnotationsProgressStorage::with_prefix(&self.prefix);
        let status = StatusProgressStorage { field: self.status_field.clone() };
        match self.progress {
            ProgressLayout::Annotations => Arc::new(annotations),
            ProgressLayout::Status => Arc::new(status),
            ProgressLayout::Smart => Arc::new(SmartProgressStorage { annotations, status }),
        }
    }

    pub fn diffbase_storage(&self) -> Arc<dyn DiffBaseStorage> {
        match self.diffbase {
            DiffBaseLayout::Annotations => Arc::new(AnnotationsDiffBaseStorage {
                prefix: self.prefix.clone(),
                key: annotation_key(&self.prefix, "last-handled-configuration"),
            }),
            DiffBaseLayout::Status => {
                Arc::new(StatusDiffBaseStorage { prefix: self.prefix.clone(), field: self.status_field.clone() })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchingSettings {
    pub batch_window: Duration,
    pub idle_timeout: Duration,
    pub exit_timeout: Duration,
    /// Escalating pauses after consecutive API errors of one object; the last
    /// one repeats.
    pub error_delays: Vec<Duration>,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5),
            exit_timeout: Duration::from_secs(2),
            error_delays: [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueingSettings {
    pub worker_limit: Option<usize>,
    pub consistency_timeout: Duration,
}

impl Default for QueueingSettings {
    fn default() -> Self {
        Self { worker_limit: None, consistency_timeout: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionSettings {
    pub lifecycle: Lifecycle,
    pub default_errors: ErrorsMode,
}

#[derive(Debug, Clone)]
pub struct WatchingSettings {
    /// Watch one namespace only; all of them if `None`.
    pub namespace: Option<String>,
    pub reconnect_backoff: Duration,
    /// Capacity of the channel between a watcher and its multiplexer.
    pub queue_capacity: usize,
}

impl Default for WatchingSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            reconnect_backoff: WatchSettings::default().reconnect_backoff,
            queue_capacity: 1024,
        }
    }
}

impl WatchingSettings {
    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings { reconnect_backoff: self.reconnect_backoff }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub persistence: PersistenceSettings,
    pub batching: BatchingSettings,
    pub queueing: QueueingSettings,
    pub execution: ExecutionSettings,
    pub background: DaemonSettings,
    pub watching: WatchingSettings,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key).and_then(|s| s.trim().parse().ok()).map(Duration::from_millis).unwrap_or(default)
}

fn optional_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Option<Duration>) -> Option<Duration> {
    match lookup(key) {
        None => default,
        Some(s) if s.trim().is_empty() => None,
        Some(s) => s.trim().parse().ok().map(Duration::from_millis).or(default),
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`], with variables taken from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        let prefix = lookup("KREACT_PREFIX").unwrap_or(d.persistence.prefix);
        let persistence = PersistenceSettings {
            finalizer: lookup("KREACT_FINALIZER").unwrap_or_else(|| format!("{prefix}/finalizer")),
            status_field: lookup("KREACT_STATUS_FIELD").unwrap_or(d.persistence.status_field),
            progress: parsed(&lookup, "KREACT_PROGRESS_STORAGE", d.persistence.progress),
            diffbase: parsed(&lookup, "KREACT_DIFFBASE_STORAGE", d.persistence.diffbase),
            prefix,
        };
        let error_delays = lookup("KREACT_ERROR_DELAYS_SECS")
            .map(|s| s.split(',').filter_map(|v| v.trim().parse().ok()).map(Duration::from_secs).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .unwrap_or(d.batching.error_delays);
        let batching = BatchingSettings {
            batch_window: millis(&lookup, "KREACT_BATCH_WINDOW_MS", d.batching.batch_window),
            idle_timeout: millis(&lookup, "KREACT_IDLE_TIMEOUT_MS", d.batching.idle_timeout),
            exit_timeout: millis(&lookup, "KREACT_EXIT_TIMEOUT_MS", d.batching.exit_timeout),
            error_delays,
        };
        let queueing = QueueingSettings {
            worker_limit: lookup("KREACT_WORKER_LIMIT").and_then(|s| s.trim().parse().ok()).or(d.queueing.worker_limit),
            consistency_timeout: millis(&lookup, "KREACT_CONSISTENCY_TIMEOUT_MS", d.queueing.consistency_timeout),
        };
        let execution = ExecutionSettings {
            lifecycle: parsed(&lookup, "KREACT_LIFECYCLE", d.execution.lifecycle),
            default_errors: parsed(&lookup, "KREACT_ERRORS", d.execution.default_errors),
        };
        let background = DaemonSettings {
            instant_exit_zero_time_cycles: parsed(
                &lookup,
                "KREACT_INSTANT_EXIT_CYCLES",
                d.background.instant_exit_zero_time_cycles,
            ),
            cancellation_backoff: optional_millis(
                &lookup,
                "KREACT_CANCELLATION_BACKOFF_MS",
                d.background.cancellation_backoff,
            ),
            cancellation_timeout: optional_millis(
                &lookup,
                "KREACT_CANCELLATION_TIMEOUT_MS",
                d.background.cancellation_timeout,
            ),
            stop_recheck: millis(&lookup, "KREACT_STOP_RECHECK_MS", d.background.stop_recheck),
        };
        let watching = WatchingSettings {
            namespace: lookup("KREACT_NAMESPACE").filter(|s| !s.is_empty()).or(d.watching.namespace),
            reconnect_backoff: millis(&lookup, "KREACT_RECONNECT_BACKOFF_MS", d.watching.reconnect_backoff),
            queue_capacity: parsed(&lookup, "KREACT_QUEUE_CAPACITY", d.watching.queue_capacity),
        };
        Self { persistence, batching, queueing, execution, background, watching }
    }

    pub fn queue_settings(&self) -> kreact_queueing::QueueSettings {
        kreact_queueing::QueueSettings {
            worker_limit: self.queueing.worker_limit,
            idle_timeout: self.batching.idle_timeout,
            batch_window: self.batching.batch_window,
            exit_timeout: self.batching.exit_timeout,
            consistency_timeout: self.queueing.consistency_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let s = Settings::from_lookup(lookup(&[]));
        assert_eq!(s.persistence.finalizer, "kreact.dev/finalizer");
        assert_eq!(s.persistence.progress, ProgressLayout::Smart);
        assert_eq!(s.batching.error_delays.first(), Some(&Duration::from_secs(1)));
        assert_eq!(s.execution.lifecycle, Lifecycle::Asap);
        assert_eq!(s.background.cancellation_timeout, None);
        assert_eq!(s.queue_settings().consistency_timeout, Duration::from_secs(5));
    }

    #[test]
    fn overrides_and_garbage() {
        let s = Settings::from_lookup(lookup(&[
            ("KREACT_PREFIX", "example.com"),
            ("KREACT_PROGRESS_STORAGE", "status"),
            ("KREACT_BATCH_WINDOW_MS", "250"),
            ("KREACT_WORKER_LIMIT", "nope"),
            ("KREACT_ERROR_DELAYS_SECS", "2, 4,x,8"),
            ("KREACT_LIFECYCLE", "one_by_one"),
            ("KREACT_ERRORS", "permanent"),
            ("KREACT_CANCELLATION_TIMEOUT_MS", "1500"),
            ("KREACT_NAMESPACE", "default"),
        ]));
        assert_eq!(s.persistence.finalizer, "example.com/finalizer");
        assert_eq!(s.persistence.progress, ProgressLayout::Status);
        assert_eq!(s.batching.batch_window, Duration::from_millis(250));
        assert_eq!(s.queueing.worker_limit, None);
        assert_eq!(s.batching.error_delays, [2, 4, 8].map(Duration::from_secs).to_vec());
        assert_eq!(s.execution.lifecycle, Lifecycle::OneByOne);
        assert_eq!(s.execution.default_errors, ErrorsMode::Permanent);
        assert_eq!(s.background.cancellation_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(s.watching.namespace.as_deref(), Some("default"));
    }
}
