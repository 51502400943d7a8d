//! Counters and a ring buffer of recent notable events.
//!
//! Counters are keyed by name plus optional labels rendered in sorted order,
//! e.g. `social.proxy{outcome=hit}`. Events carry small scalar details;
//! string details are clamped to [`MAX_DETAIL_LEN`] characters. Callers must
//! never pass credentials or secrets as details: source keys and handles are
//! fine, bridge logins are not.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use clients::herald::v1::{MetricEvent, MetricsSnapshot, Scalar};
use dashmap::DashMap;
use derive_more::Debug;
use time::OffsetDateTime;
use tracing::trace;

/// Maximum length, in characters, of a string event detail.
pub const MAX_DETAIL_LEN: usize = 180;

/// Default number of events kept.
pub const DEFAULT_EVENT_CAPACITY: usize = 200;

#[derive(Debug)]
struct Inner {
    started_at: OffsetDateTime,

    #[debug("{} counters", counters.len())]
    counters: DashMap<String, u64>,

    #[debug(skip)]
    events: Mutex<VecDeque<MetricEvent>>,

    capacity: usize,
}

/// Records counters and recent events for the observability endpoint.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone, Debug)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl Recorder {
    /// Create a recorder keeping at most `capacity` recent events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                started_at: OffsetDateTime::now_utc(),
                counters: DashMap::new(),
                events: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Increment the counter for `name` with the given labels.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        trace!(%key, "metrics.increment");
        *self.inner.counters.entry(key).or_default() += 1;
    }

    /// Append an event, dropping the oldest one if the buffer is full.
    pub fn record<'a>(&self, kind: &str, details: impl IntoIterator<Item = (&'a str, Scalar)>) {
        if self.inner.capacity == 0 {
            return;
        }
        let details = details
            .into_iter()
            .map(|(key, value)| (key.to_string(), clamp(value)))
            .collect::<BTreeMap<_, _>>();
        let event = MetricEvent::new(OffsetDateTime::now_utc(), kind, details);

        let mut events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.inner.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Current value of a counter.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.inner
            .counters
            .get(&metric_key(name, labels))
            .map(|count| *count)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .inner
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let recent_events = self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        MetricsSnapshot::new(
            self.inner.started_at,
            OffsetDateTime::now_utc(),
            counters,
            recent_events,
        )
    }
}

/// Render `name{k=v,...}` with labels sorted by name.
pub fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut labels = labels.to_vec();
    labels.sort_unstable();
    let labels = labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{labels}}}")
}

fn clamp(value: Scalar) -> Scalar {
    match value {
        Scalar::Str(text) if text.chars().count() > MAX_DETAIL_LEN => {
            Scalar::Str(text.chars().take(MAX_DETAIL_LEN).collect())
        }
        Scalar::Float(number) if !number.is_finite() => Scalar::Null,
        other => other,
    }
}
