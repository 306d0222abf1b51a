// SPDX-License-Identifier: Apache-2.0

//! Per-log pipeline: tail a file, evaluate every metric rule against each
//! line, and dispatch typed metrics to the shared sink.
//!
//! Three cooperating tasks per watcher, joined by two bounded queues:
//!
//! ```text
//! file -> [tailer] -> lines -> [matcher+emitter] -> metrics -> [dispatcher] -> sink
//! ```
//!
//! Sends suspend when a queue is full, so a slow sink throttles line
//! ingestion instead of dropping data.

pub mod file_id;
pub mod tailer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, trace, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::configs::{LogConfig, MetricKind, Rule};
use crate::metrics::{GaugeValue, Sink};
use crate::telemetry;
use tailer::Tailer;

/// Queue capacity between pipeline stages, unless overridden.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Options shared by every watcher, derived from agent flags.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub queue_size: usize,
    pub tail_poll_interval: Duration,
    /// Per-line rule-evaluation trace logging (--debug-metric).
    pub trace_rules: bool,
    /// Tailer internal logging (--debug-tail).
    pub debug_tail: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            tail_poll_interval: Duration::from_millis(250),
            trace_rules: false,
            debug_tail: false,
        }
    }
}

/// A line that matched a rule, carrying the rule's named captures. Captures
/// are absent when the rule's regex has no named groups.
#[derive(Debug)]
struct MetricLine {
    rule_idx: usize,
    line: String,
    captures: Option<HashMap<String, String>>,
}

/// A fully rendered metric, ready for the sink. The value stays textual
/// until the dispatcher coerces it per metric kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub value: String,
    pub tags: Vec<String>,
}

/// A single log file's complete pipeline.
pub struct Watcher {
    cfg: Arc<LogConfig>,
    dest: Arc<dyn Sink>,
    opts: WatcherOptions,
    lines_total: Arc<AtomicU64>,
    lines_matched: Arc<AtomicU64>,
}

impl Watcher {
    /// Fails when the log id collides with an already-registered watcher.
    pub fn new(dest: Arc<dyn Sink>, cfg: LogConfig, opts: WatcherOptions) -> Result<Self, BoxError> {
        let lines_total = telemetry::registry()
            .register(format!("{}_lines_total", cfg.id))
            .ok_or_else(|| format!("duplicate log id ({})", cfg.id))?;
        let lines_matched = telemetry::registry()
            .register(format!("{}_lines_matched", cfg.id))
            .ok_or_else(|| format!("duplicate log id ({})", cfg.id))?;

        Ok(Self {
            cfg: Arc::new(cfg),
            dest,
            opts,
            lines_total,
            lines_matched,
        })
    }

    /// Run the pipeline until cancellation or a fatal tailer error. The
    /// first task to settle stops the others.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BoxError> {
        info!(log_id = %self.cfg.id, log_file = ?self.cfg.log_file, "starting watcher");

        let pipeline_cancel = cancel.child_token();
        let (line_tx, line_rx) = bounded_channel::bounded::<String>(self.opts.queue_size);
        let (metric_tx, metric_rx) = bounded_channel::bounded::<Metric>(self.opts.queue_size);

        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();

        let tailer = Tailer::new(
            self.cfg.log_file.clone(),
            self.opts.tail_poll_interval,
            self.opts.debug_tail,
        );
        {
            let cancel = pipeline_cancel.clone();
            tasks.spawn(async move { tailer.run(cancel, line_tx).await.map_err(Into::into) });
        }
        {
            let cancel = pipeline_cancel.clone();
            let cfg = self.cfg.clone();
            let lines_total = self.lines_total.clone();
            let lines_matched = self.lines_matched.clone();
            let trace_rules = self.opts.trace_rules;
            tasks.spawn(async move {
                match_lines(
                    cfg,
                    line_rx,
                    metric_tx,
                    lines_total,
                    lines_matched,
                    trace_rules,
                    cancel,
                )
                .await;
                Ok(())
            });
        }
        {
            let cancel = pipeline_cancel.clone();
            let dest = self.dest.clone();
            let id = self.cfg.id.clone();
            tasks.spawn(async move {
                dispatch(id, dest, metric_rx, cancel).await;
                Ok(())
            });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            // whoever settles first takes the rest of the pipeline with it
            pipeline_cancel.cancel();
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e.into());
                    }
                }
            }
        }

        info!(log_id = %self.cfg.id, "watcher stopped");
        result
    }
}

/// Matcher + emitter: evaluate every rule against each line (no
/// short-circuit; one line may produce many metrics) and enqueue the
/// rendered metrics in rule-declaration order.
async fn match_lines(
    cfg: Arc<LogConfig>,
    mut lines: BoundedReceiver<String>,
    metrics: BoundedSender<Metric>,
    lines_total: Arc<AtomicU64>,
    lines_matched: Arc<AtomicU64>,
    trace_rules: bool,
    cancel: CancellationToken,
) {
    loop {
        let line = select! {
            _ = cancel.cancelled() => return,
            l = lines.recv() => match l {
                Some(l) => l,
                None => return, // tailer end-of-stream
            },
        };
        lines_total.fetch_add(1, Ordering::Relaxed);

        for (rule_idx, rule) in cfg.rules.iter().enumerate() {
            if trace_rules {
                trace!(log_id = %cfg.id, rule_idx, rule_match = %rule.matcher.as_str(),
                    log_line = %line, "checking rule");
            }

            let Some(caps) = rule.matcher.captures(&line) else {
                continue;
            };
            lines_matched.fetch_add(1, Ordering::Relaxed);

            let ml = MetricLine {
                rule_idx,
                line: line.clone(),
                captures: build_captures(rule, &caps),
            };
            // NOTE: no 'break' on match, a single line may generate
            // multiple metrics.

            let Some(metric) = render(&cfg, rule, &ml, trace_rules) else {
                continue;
            };
            if metrics.send(metric).await.is_err() {
                return; // dispatcher is gone
            }
        }
    }
}

/// Map named capture groups to their matched text. Groups that did not
/// participate in the match map to the empty string.
fn build_captures(rule: &Rule, caps: &regex::Captures<'_>) -> Option<HashMap<String, String>> {
    if !rule.match_parts.iter().skip(1).any(|n| !n.is_empty()) {
        return None;
    }

    let mut matches = HashMap::new();
    for (i, name) in rule.match_parts.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        let value = caps.get(i).map(|g| g.as_str()).unwrap_or_default();
        matches.insert(name.clone(), value.to_string());
    }
    Some(matches)
}

/// Render a matched line into a metric: value from the value-key capture (or
/// the counter default), name from the name template or literal, tags from
/// the seed log_id tag plus the tags template or literal list.
fn render(cfg: &LogConfig, rule: &Rule, ml: &MetricLine, trace_rules: bool) -> Option<Metric> {
    if trace_rules {
        trace!(log_id = %cfg.id, rule_idx = ml.rule_idx, line = %ml.line,
            captures = ?ml.captures, "matched, rendering metric");
    }

    let mut value = String::new();
    if rule.kind == MetricKind::Counter {
        value.push('1'); // default to simple increment by 1
    }

    let mut name = rule.name.clone();
    let mut tags = vec![format!("log_id:{}", cfg.id)];

    if let Some(captures) = &ml.captures {
        if !rule.value_key.is_empty() {
            match captures.get(&rule.value_key) {
                Some(v) => value = v.clone(),
                None => {
                    warn!(log_id = %cfg.id, value_key = %rule.value_key, line = %ml.line,
                        "value key defined but not found in captures");
                    return None;
                }
            }
        }
        if let Some(namer) = &rule.namer {
            name = namer.render(captures);
        }
        if let Some(tagger) = &rule.tagger {
            extend_tags(&mut tags, &tagger.render(captures));
        } else {
            extend_tags(&mut tags, &rule.tags);
        }
    } else {
        extend_tags(&mut tags, &rule.tags);
    }

    Some(Metric {
        name,
        kind: rule.kind,
        value,
        tags,
    })
}

fn extend_tags(tags: &mut Vec<String>, source: &str) {
    if source.is_empty() {
        return;
    }
    tags.extend(
        source
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    );
}

/// Dispatcher: coerce each metric's textual value per its declared kind and
/// invoke the matching sink operation. Parse failures and sink errors are
/// logged and skipped; the pipeline keeps going.
async fn dispatch(
    id: String,
    dest: Arc<dyn Sink>,
    mut metrics: BoundedReceiver<Metric>,
    cancel: CancellationToken,
) {
    loop {
        let m = select! {
            // on cancellation the in-flight queue is intentionally not
            // drained; bounded shutdown latency wins over completeness
            _ = cancel.cancelled() => return,
            m = metrics.recv() => match m {
                Some(m) => m,
                None => return,
            },
        };

        debug!(log_id = %id, metric = ?m, "sending");

        let res = match m.kind {
            MetricKind::Counter => match m.value.parse::<u64>() {
                Ok(v) => {
                    if m.tags.is_empty() {
                        dest.increment_counter_by(&m.name, v)
                    } else {
                        dest.increment_counter_by_with_tags(&m.name, &m.tags, v)
                    }
                }
                Err(e) => {
                    warn!(log_id = %id, metric = %m.name, value = %m.value, error = %e,
                        "failed to parse counter value");
                    continue;
                }
            },
            MetricKind::Gauge => match m.value.parse::<GaugeValue>() {
                Ok(v) => {
                    if m.tags.is_empty() {
                        dest.set_gauge(&m.name, v)
                    } else {
                        dest.set_gauge_with_tags(&m.name, &m.tags, v)
                    }
                }
                Err(e) => {
                    warn!(log_id = %id, metric = %m.name, error = %e,
                        "failed to parse gauge value");
                    continue;
                }
            },
            MetricKind::Histogram => match m.value.parse::<f64>() {
                Ok(v) => {
                    if m.tags.is_empty() {
                        dest.set_histogram(&m.name, v)
                    } else {
                        dest.set_histogram_with_tags(&m.name, &m.tags, v)
                    }
                }
                Err(e) => {
                    warn!(log_id = %id, metric = %m.name, value = %m.value, error = %e,
                        "failed to parse histogram value");
                    continue;
                }
            },
            MetricKind::Timing => match parse_timing(&m.value) {
                Some(v) => {
                    if m.tags.is_empty() {
                        dest.set_timing(&m.name, v)
                    } else {
                        dest.set_timing_with_tags(&m.name, &m.tags, v)
                    }
                }
                None => {
                    warn!(log_id = %id, metric = %m.name, value = %m.value,
                        "failed to parse timing as float or duration");
                    continue;
                }
            },
            MetricKind::Set => {
                if m.tags.is_empty() {
                    dest.add_set_value(&m.name, &m.value)
                } else {
                    dest.add_set_value_with_tags(&m.name, &m.tags, &m.value)
                }
            }
            MetricKind::Text => {
                if m.tags.is_empty() {
                    dest.set_text(&m.name, &m.value)
                } else {
                    dest.set_text_with_tags(&m.name, &m.tags, &m.value)
                }
            }
        };

        if let Err(e) = res {
            warn!(log_id = %id, metric = %m.name, error = %e, "sink error");
        }
    }
}

/// Timing values are either a float (already milliseconds) or a human
/// duration such as `60ms`, `1m`, `3s`, converted to fractional
/// milliseconds.
fn parse_timing(value: &str) -> Option<f64> {
    if let Ok(v) = value.parse::<f64>() {
        return Some(v);
    }
    humantime::parse_duration(value)
        .ok()
        .map(|d| d.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs;

    fn compile(yaml: &str) -> LogConfig {
        // route through the loader so tests exercise the same compilation
        // path as production configs
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("unit.log");
        std::fs::File::create(&log).unwrap();

        let body = format!("log_file: {}\n{}", log.display(), yaml);
        std::fs::write(dir.path().join("cfg.yaml"), body).unwrap();

        configs::load(dir.path()).unwrap().remove(0)
    }

    fn first_metric(cfg: &LogConfig, line: &str) -> Option<Metric> {
        let rule = &cfg.rules[0];
        let caps = rule.matcher.captures(line)?;
        let ml = MetricLine {
            rule_idx: 0,
            line: line.to_string(),
            captures: build_captures(rule, &caps),
        };
        render(cfg, rule, &ml, false)
    }

    #[test]
    fn test_render_counter_defaults_to_one() {
        let cfg = compile(
            "id: unit1\nmetrics:\n  - match: error\n    name: errors\n    type: c\n",
        );
        let m = first_metric(&cfg, "an error happened").unwrap();

        assert_eq!(m.name, "errors");
        assert_eq!(m.kind, MetricKind::Counter);
        assert_eq!(m.value, "1");
        assert_eq!(m.tags, vec!["log_id:unit1".to_string()]);
    }

    #[test]
    fn test_render_template_name_and_value() {
        let cfg = compile(
            "id: unit2\nmetrics:\n  - match: 'user=(?P<User>\\w+) latency=(?P<Value>[0-9.]+)'\n    name: 'latency.{{.User}}'\n    type: ms\n",
        );
        let m = first_metric(&cfg, "user=alice latency=12.5").unwrap();

        assert_eq!(m.name, "latency.alice");
        assert_eq!(m.kind, MetricKind::Timing);
        assert_eq!(m.value, "12.5");
    }

    #[test]
    fn test_render_tags_template_preserves_order() {
        let cfg = compile(
            "id: unit3\nmetrics:\n  - match: 'user=(?P<User>\\w+)'\n    name: logins\n    type: c\n    tags: 'user:{{.User}},source:web'\n",
        );
        let m = first_metric(&cfg, "user=bob").unwrap();

        assert_eq!(
            m.tags,
            vec![
                "log_id:unit3".to_string(),
                "user:bob".to_string(),
                "source:web".to_string()
            ]
        );
    }

    #[test]
    fn test_render_literal_tags_without_captures() {
        let cfg = compile(
            "id: unit4\nmetrics:\n  - match: error\n    name: errors\n    type: c\n    tags: 'env:prod'\n",
        );
        let m = first_metric(&cfg, "error").unwrap();

        assert_eq!(
            m.tags,
            vec!["log_id:unit4".to_string(), "env:prod".to_string()]
        );
    }

    #[test]
    fn test_render_missing_template_field_is_empty() {
        // Path is an optional group: a line without it still matches and
        // the template renders the field empty
        let cfg = compile(
            "id: unit5\nmetrics:\n  - match: 'req (?P<Method>\\w+)(?: (?P<Path>\\S+))?'\n    name: 'req.{{.Method}}.{{.Path}}'\n    type: c\n",
        );
        let m = first_metric(&cfg, "req OPTIONS").unwrap();

        assert_eq!(m.name, "req.OPTIONS.");
    }

    #[test]
    fn test_parse_timing_float_and_duration_agree() {
        assert_eq!(parse_timing("250"), Some(250.0));
        assert_eq!(parse_timing("250ms"), Some(250.0));
        assert_eq!(parse_timing("12.5"), Some(12.5));
        assert_eq!(parse_timing("3s"), Some(3000.0));
        assert_eq!(parse_timing("1m"), Some(60000.0));
        assert_eq!(parse_timing("fast"), None);
    }

    #[test]
    fn test_build_captures_absent_without_named_groups() {
        let cfg = compile(
            "id: unit6\nmetrics:\n  - match: '(\\w+) error'\n    name: errors\n    type: c\n",
        );
        let rule = &cfg.rules[0];
        let caps = rule.matcher.captures("disk error").unwrap();

        assert!(build_captures(rule, &caps).is_none());
    }

    #[test]
    fn test_watcher_new_rejects_duplicate_id() {
        let cfg = compile("id: unit_dup\nmetrics: []\n");
        let dest: Arc<dyn Sink> = Arc::new(crate::metrics::logonly::LogOnly::new());

        assert!(Watcher::new(dest.clone(), cfg.clone(), WatcherOptions::default()).is_ok());
        assert!(Watcher::new(dest, cfg, WatcherOptions::default()).is_err());
    }
}
