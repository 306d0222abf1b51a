// SPDX-License-Identifier: Apache-2.0

//! Batching HTTP destination backing the `agent` and `check` destination
//! types. Both wrap the same embedded client configured with a different
//! submission URL and credentials.
//!
//! Metric operations fold into an in-memory aggregator: counters sum,
//! gauges and texts keep the last value, histograms and timings collect
//! samples, sets count distinct values. A flusher task drains the
//! aggregator every flush interval (and once more at stop) and submits one
//! JSON document per flush:
//!
//! ```text
//! {"errors": {"_type": "L", "_value": 3},
//!  "latency|ST[log_id:web]": {"_type": "h", "_value": [12.5, 9.1]}}
//! ```
//!
//! Tags are folded into the metric name as a `|ST[k:v,...]` stream-tag
//! suffix. A failed submission is logged and the drained batch dropped;
//! there is no disk buffering.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Error, GaugeValue, Result, Sink, valid_tags};

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Where flushed batches are submitted.
    pub submission_url: String,
    /// API token for authenticated (check) submission.
    pub token_key: Option<String>,
    /// Application name sent alongside the token.
    pub token_app: Option<String>,
    /// How often the aggregator is drained.
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
enum Accum {
    Counter(u64),
    Gauge(GaugeValue),
    Samples(Vec<f64>),
    Set(HashSet<String>),
    Text(String),
}

#[derive(Default)]
struct Aggregator {
    metrics: BTreeMap<String, Accum>,
}

impl Aggregator {
    fn add_counter(&mut self, name: String, value: u64) {
        match self.metrics.entry(name) {
            Entry::Occupied(mut e) => match e.get_mut() {
                Accum::Counter(c) => *c += value,
                other => *other = Accum::Counter(value),
            },
            Entry::Vacant(e) => {
                e.insert(Accum::Counter(value));
            }
        }
    }

    fn set_gauge(&mut self, name: String, value: GaugeValue) {
        self.metrics.insert(name, Accum::Gauge(value));
    }

    fn add_sample(&mut self, name: String, value: f64) {
        match self.metrics.entry(name) {
            Entry::Occupied(mut e) => match e.get_mut() {
                Accum::Samples(samples) => samples.push(value),
                other => *other = Accum::Samples(vec![value]),
            },
            Entry::Vacant(e) => {
                e.insert(Accum::Samples(vec![value]));
            }
        }
    }

    fn add_set_value(&mut self, name: String, value: &str) {
        match self.metrics.entry(name) {
            Entry::Occupied(mut e) => match e.get_mut() {
                Accum::Set(values) => {
                    values.insert(value.to_string());
                }
                other => *other = Accum::Set(HashSet::from([value.to_string()])),
            },
            Entry::Vacant(e) => {
                e.insert(Accum::Set(HashSet::from([value.to_string()])));
            }
        }
    }

    fn set_text(&mut self, name: String, value: &str) {
        self.metrics.insert(name, Accum::Text(value.to_string()));
    }

    fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    fn drain(&mut self) -> BTreeMap<String, Accum> {
        std::mem::take(&mut self.metrics)
    }
}

/// Serialize a drained batch into the submission document.
fn to_submission(metrics: &BTreeMap<String, Accum>) -> serde_json::Value {
    let mut doc = serde_json::Map::new();
    for (name, accum) in metrics {
        let (kind, value) = match accum {
            Accum::Counter(v) => ("L", serde_json::json!(v)),
            Accum::Gauge(GaugeValue::Int(v)) => ("n", serde_json::json!(v)),
            Accum::Gauge(GaugeValue::Uint(v)) => ("n", serde_json::json!(v)),
            Accum::Gauge(GaugeValue::Float(v)) => ("n", serde_json::json!(v)),
            Accum::Samples(samples) => ("h", serde_json::json!(samples)),
            Accum::Set(values) => ("n", serde_json::json!(values.len())),
            Accum::Text(v) => ("s", serde_json::json!(v)),
        };
        doc.insert(
            name.clone(),
            serde_json::json!({"_type": kind, "_value": value}),
        );
    }
    serde_json::Value::Object(doc)
}

/// Fold tags into the metric name as a stream-tag suffix.
fn tagged_name(name: &str, tags: &[String]) -> String {
    let tags = valid_tags(tags);
    if tags.is_empty() {
        name.to_string()
    } else {
        format!("{}|ST[{}]", name, tags.join(","))
    }
}

struct Inner {
    cfg: IntakeConfig,
    agg: Mutex<Aggregator>,
    http: reqwest::Client,
    flusher: Mutex<Option<JoinHandle<()>>>,
    flush_cancel: CancellationToken,
    stopped: AtomicBool,
}

pub struct Intake {
    inner: Arc<Inner>,
}

impl Intake {
    pub fn new(cfg: IntakeConfig) -> Result<Self> {
        if cfg.submission_url.is_empty() {
            return Err(Error::Config("invalid submission url (empty)".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("building http client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                agg: Mutex::new(Aggregator::default()),
                http,
                flusher: Mutex::new(None),
                flush_cancel: CancellationToken::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    fn with_agg(&self, f: impl FnOnce(&mut Aggregator)) -> Result<()> {
        let mut agg = self.inner.agg.lock().expect("aggregator lock poisoned");
        f(&mut agg);
        Ok(())
    }
}

async fn flush(inner: &Inner) -> Result<()> {
    let drained = {
        let mut agg = inner.agg.lock().expect("aggregator lock poisoned");
        if agg.is_empty() {
            return Ok(());
        }
        agg.drain()
    };

    let body = to_submission(&drained);

    let mut req = inner.http.put(&inner.cfg.submission_url).json(&body);
    if let Some(token) = &inner.cfg.token_key {
        req = req.header("X-Auth-Token", token);
        if let Some(app) = &inner.cfg.token_app {
            req = req.header("X-App-Name", app);
        }
    }

    let resp = req
        .send()
        .await
        .map_err(|e| Error::Submit(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Submit(format!(
            "submission returned {}",
            resp.status()
        )));
    }

    debug!(metrics = drained.len(), "flushed");
    Ok(())
}

#[async_trait]
impl Sink for Intake {
    /// Start the interval flusher. Must be called from within the runtime.
    async fn start(&self) -> Result<()> {
        let mut flusher = self.inner.flusher.lock().expect("flusher lock poisoned");
        if flusher.is_some() {
            return Ok(());
        }

        let inner = self.inner.clone();
        let cancel = self.inner.flush_cancel.clone();
        let interval = self.inner.cfg.flush_interval;

        *flusher = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await; // the first tick completes immediately

            loop {
                select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = flush(&inner).await {
                            // best effort: the drained batch is gone
                            warn!(error = %e, "flush failed, dropping batch");
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop the flusher and submit anything still buffered. Idempotent.
    async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.flush_cancel.cancel();
        let handle = {
            let mut flusher = self.inner.flusher.lock().expect("flusher lock poisoned");
            flusher.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        flush(&self.inner).await
    }

    fn increment_counter(&self, name: &str) -> Result<()> {
        self.with_agg(|agg| agg.add_counter(name.to_string(), 1))
    }

    fn increment_counter_with_tags(&self, name: &str, tags: &[String]) -> Result<()> {
        self.with_agg(|agg| agg.add_counter(tagged_name(name, tags), 1))
    }

    fn increment_counter_by(&self, name: &str, value: u64) -> Result<()> {
        self.with_agg(|agg| agg.add_counter(name.to_string(), value))
    }

    fn increment_counter_by_with_tags(
        &self,
        name: &str,
        tags: &[String],
        value: u64,
    ) -> Result<()> {
        self.with_agg(|agg| agg.add_counter(tagged_name(name, tags), value))
    }

    fn set_gauge(&self, name: &str, value: GaugeValue) -> Result<()> {
        self.with_agg(|agg| agg.set_gauge(name.to_string(), value))
    }

    fn set_gauge_with_tags(&self, name: &str, tags: &[String], value: GaugeValue) -> Result<()> {
        self.with_agg(|agg| agg.set_gauge(tagged_name(name, tags), value))
    }

    fn set_histogram(&self, name: &str, value: f64) -> Result<()> {
        self.with_agg(|agg| agg.add_sample(name.to_string(), value))
    }

    fn set_histogram_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.with_agg(|agg| agg.add_sample(tagged_name(name, tags), value))
    }

    fn set_timing(&self, name: &str, value: f64) -> Result<()> {
        self.set_histogram(name, value)
    }

    fn set_timing_with_tags(&self, name: &str, tags: &[String], value: f64) -> Result<()> {
        self.set_histogram_with_tags(name, tags, value)
    }

    fn add_set_value(&self, name: &str, value: &str) -> Result<()> {
        self.with_agg(|agg| agg.add_set_value(name.to_string(), value))
    }

    fn add_set_value_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.with_agg(|agg| agg.add_set_value(tagged_name(name, tags), value))
    }

    fn set_text(&self, name: &str, value: &str) -> Result<()> {
        self.with_agg(|agg| agg.set_text(name.to_string(), value))
    }

    fn set_text_with_tags(&self, name: &str, tags: &[String], value: &str) -> Result<()> {
        self.with_agg(|agg| agg.set_text(tagged_name(name, tags), value))
    }
}
