// SPDX-License-Identifier: Apache-2.0

//! Log-watch configuration: discovery, decoding, and rule compilation.
//!
//! Each file in the log-config directory describes one log file to tail and
//! the ordered metric rules evaluated against its lines. YAML, JSON, and
//! TOML files are accepted. A file that fails to decode or validate is
//! skipped with a warning so the remaining logs keep working; an empty
//! result set is an error surfaced to the caller.

pub mod template;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use template::{Template, has_interpolation};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log config directory (empty)")]
    EmptyConfDir,

    #[error("no log configurations found in {0:?}")]
    NoConfigs(PathBuf),

    #[error("no valid log configurations found in {0:?}")]
    NoValidConfigs(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Metric kinds, by wire code:
///   c  - counter
///   g  - gauge
///   h  - histogram
///   ms - timing
///   s  - set (counts unique values)
///   t  - text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timing,
    Set,
    Text,
}

impl MetricKind {
    pub fn code(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "h",
            MetricKind::Timing => "ms",
            MetricKind::Set => "s",
            MetricKind::Text => "t",
        }
    }
}

impl FromStr for MetricKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "c" => Ok(MetricKind::Counter),
            "g" => Ok(MetricKind::Gauge),
            "h" => Ok(MetricKind::Histogram),
            "ms" => Ok(MetricKind::Timing),
            "s" => Ok(MetricKind::Set),
            "t" => Ok(MetricKind::Text),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A compiled metric rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: Regex,
    /// Capture group names in index order; index 0 is the whole match,
    /// unnamed groups are empty strings.
    pub match_parts: Vec<String>,
    pub name: String,
    pub namer: Option<Template>,
    pub tags: String,
    pub tagger: Option<Template>,
    pub kind: MetricKind,
    /// Capture group whose text supplies the metric value. Empty when the
    /// rule was normalized to a plain counter.
    pub value_key: String,
}

/// One log file to tail plus its ordered rules. Immutable after load.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub id: String,
    pub log_file: PathBuf,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRule {
    #[serde(default)]
    r#match: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    tags: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    id: String,
    log_file: PathBuf,
    #[serde(default)]
    metrics: Vec<RawRule>,
}

/// Load every valid log configuration from `dir`.
pub fn load(dir: &Path) -> Result<Vec<LogConfig>> {
    if dir.as_os_str().is_empty() {
        return Err(Error::EmptyConfDir);
    }

    debug!(dir = ?dir, "loading log configs");

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    if entries.is_empty() {
        return Err(Error::NoConfigs(dir.to_path_buf()));
    }

    let mut cfgs = Vec::new();
    for path in entries {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !matches!(ext.as_str(), "yaml" | "json" | "toml") {
            warn!(file = ?path, ext = %ext, "unsupported config type, ignoring");
            continue;
        }

        debug!(file = ?path, ext = %ext, "loading");
        let raw = match parse_file(&ext, &path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = ?path, error = %e, "parsing config, skipping");
                continue;
            }
        };

        if let Some(cfg) = compile(raw) {
            cfgs.push(cfg);
        }
    }

    if cfgs.is_empty() {
        return Err(Error::NoValidConfigs(dir.to_path_buf()));
    }

    Ok(cfgs)
}

fn parse_file(
    ext: &str,
    path: &Path,
) -> std::result::Result<RawConfig, Box<dyn std::error::Error + Send + Sync>> {
    let data = fs::read_to_string(path)?;
    let cfg = match ext {
        "json" => serde_json::from_str(&data)?,
        "yaml" => serde_yaml::from_str(&data)?,
        "toml" => toml::from_str(&data)?,
        other => return Err(format!("unknown config type ({})", other).into()),
    };
    Ok(cfg)
}

/// Validate and compile a decoded config. Any rule failure drops the whole
/// config (None), logged with enough context to fix the file.
fn compile(raw: RawConfig) -> Option<LogConfig> {
    // the log must be readable now, not at first tail
    if let Err(e) = fs::File::open(&raw.log_file) {
        warn!(log = ?raw.log_file, error = %e, "log file access");
        return None;
    }

    // an explicit id wins; otherwise the log file's basename minus extension
    let id = if raw.id.is_empty() {
        raw.log_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        raw.id
    };

    let mut rules = Vec::with_capacity(raw.metrics.len());
    for (rule_idx, rule) in raw.metrics.into_iter().enumerate() {
        match compile_rule(&id, rule_idx, rule) {
            Some(rule) => rules.push(rule),
            None => return None,
        }
    }

    Some(LogConfig {
        id,
        log_file: raw.log_file,
        rules,
    })
}

fn compile_rule(log_id: &str, rule_idx: usize, raw: RawRule) -> Option<Rule> {
    if raw.r#match.is_empty() {
        warn!(log_id, rule_idx, "invalid metric rule, empty 'match', skipping config");
        return None;
    }
    if raw.name.is_empty() {
        warn!(log_id, rule_idx, "invalid metric rule, empty 'name', skipping config");
        return None;
    }

    let matcher = match Regex::new(&raw.r#match) {
        Ok(m) => m,
        Err(e) => {
            warn!(log_id, rule_idx, pattern = %raw.r#match, error = %e,
                "rule match compile failed, skipping config");
            return None;
        }
    };

    let match_parts: Vec<String> = matcher
        .capture_names()
        .map(|n| n.unwrap_or_default().to_string())
        .collect();
    let has_named = match_parts.iter().skip(1).any(|n| !n.is_empty());

    let mut kind = if raw.r#type.is_empty() {
        MetricKind::Counter
    } else {
        match raw.r#type.parse::<MetricKind>() {
            Ok(kind) => kind,
            Err(()) => {
                warn!(log_id, rule_idx, metric_type = %raw.r#type,
                    "unknown metric type, skipping config");
                return None;
            }
        }
    };

    // Resolve the value source: the capture group named 'value' (any case)
    // supplies the metric value. A rule without one becomes a plain counter.
    let mut value_key = String::new();
    if match_parts.len() < 2 {
        if kind != MetricKind::Counter {
            warn!(log_id, rule_idx, "forcing type to counter, no capture groups found");
            kind = MetricKind::Counter;
        }
    } else {
        // there can be only one
        match match_parts
            .iter()
            .skip(1)
            .find(|n| n.eq_ignore_ascii_case("value"))
        {
            Some(name) => value_key = name.clone(),
            None => {
                if kind != MetricKind::Counter {
                    warn!(log_id, rule_idx,
                        "forcing type to counter, no capture group named 'value'");
                    kind = MetricKind::Counter;
                }
            }
        }
    }

    let namer = match compile_template(log_id, rule_idx, "name", &raw.name, has_named)? {
        CompiledTemplate::Template(t) => Some(t),
        CompiledTemplate::Literal => None,
    };

    let tagger = match compile_template(log_id, rule_idx, "tags", &raw.tags, has_named)? {
        CompiledTemplate::Template(t) => Some(t),
        CompiledTemplate::Literal => None,
    };

    Some(Rule {
        matcher,
        match_parts,
        name: raw.name,
        namer,
        tags: raw.tags,
        tagger,
        kind,
        value_key,
    })
}

enum CompiledTemplate {
    Template(Template),
    Literal,
}

fn compile_template(
    log_id: &str,
    rule_idx: usize,
    field: &'static str,
    value: &str,
    has_named: bool,
) -> Option<CompiledTemplate> {
    if !has_interpolation(value) {
        return Some(CompiledTemplate::Literal);
    }
    if !has_named {
        warn!(log_id, rule_idx, field, value,
            "template expects captures, match has no named capture groups, skipping config");
        return None;
    }
    match Template::parse(value) {
        Ok(t) => Some(CompiledTemplate::Template(t)),
        Err(e) => {
            warn!(log_id, rule_idx, field, value, error = %e,
                "template parse failed, skipping config");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn raw_rule(m: &str, name: &str, kind: &str) -> RawRule {
        RawRule {
            r#match: m.to_string(),
            name: name.to_string(),
            r#type: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_rule_simple_counter() {
        let rule = compile_rule("web", 0, raw_rule("error", "errors", "c")).unwrap();
        assert_eq!(rule.kind, MetricKind::Counter);
        assert_eq!(rule.value_key, "");
        assert!(rule.namer.is_none());
        assert_eq!(rule.match_parts, vec![""]);
    }

    #[test]
    fn test_compile_rule_value_key_derived_case_insensitive() {
        let rule = compile_rule(
            "web",
            0,
            raw_rule(r"latency=(?P<VALUE>[0-9.]+)", "latency", "ms"),
        )
        .unwrap();
        assert_eq!(rule.kind, MetricKind::Timing);
        assert_eq!(rule.value_key, "VALUE");
    }

    #[test]
    fn test_compile_rule_set_value_from_value_group() {
        let rule = compile_rule("web", 0, raw_rule(r"user=(?P<Value>\w+)", "users", "s")).unwrap();
        assert_eq!(rule.kind, MetricKind::Set);
        assert_eq!(rule.value_key, "Value");
    }

    #[test]
    fn test_compile_rule_gauge_without_captures_forces_counter() {
        let rule = compile_rule("web", 0, raw_rule("ready", "ready", "g")).unwrap();
        assert_eq!(rule.kind, MetricKind::Counter);
    }

    #[test]
    fn test_compile_rule_no_value_group_forces_counter() {
        let rule = compile_rule(
            "web",
            0,
            raw_rule(r"user=(?P<User>\w+)", "user_gauge", "g"),
        )
        .unwrap();
        assert_eq!(rule.kind, MetricKind::Counter);
        assert_eq!(rule.value_key, "");
    }

    #[test]
    fn test_compile_rule_empty_match_rejected() {
        assert!(compile_rule("web", 0, raw_rule("", "x", "c")).is_none());
    }

    #[test]
    fn test_compile_rule_empty_name_rejected() {
        assert!(compile_rule("web", 0, raw_rule("x", "", "c")).is_none());
    }

    #[test]
    fn test_compile_rule_bad_regex_rejected() {
        assert!(compile_rule("web", 0, raw_rule("(unclosed", "x", "c")).is_none());
    }

    #[test]
    fn test_compile_rule_unknown_type_rejected() {
        assert!(compile_rule("web", 0, raw_rule("x", "x", "q")).is_none());
    }

    #[test]
    fn test_compile_rule_default_type_is_counter() {
        let rule = compile_rule("web", 0, raw_rule("x", "x", "")).unwrap();
        assert_eq!(rule.kind, MetricKind::Counter);
    }

    #[test]
    fn test_compile_rule_template_requires_named_captures() {
        // unnamed group only: a templated name cannot be satisfied
        assert!(compile_rule("web", 0, raw_rule(r"(\w+)", "x.{{.User}}", "c")).is_none());
    }

    #[test]
    fn test_compile_rule_template_parses() {
        let rule = compile_rule(
            "web",
            0,
            raw_rule(r"user=(?P<User>\w+)", "login.{{.User}}", "c"),
        )
        .unwrap();
        assert!(rule.namer.is_some());
    }

    #[test]
    fn test_compile_rule_bad_template_rejected() {
        assert!(
            compile_rule(
                "web",
                0,
                raw_rule(r"user=(?P<User>\w+)", "login.{{.User", "c"),
            )
            .is_none()
        );
    }

    #[test]
    fn test_compile_rule_tags_template() {
        let mut raw = raw_rule(r"user=(?P<User>\w+)", "logins", "c");
        raw.tags = "user:{{.User}},source:web".to_string();
        let rule = compile_rule("web", 0, raw).unwrap();
        assert!(rule.tagger.is_some());
    }

    fn write_config(dir: &TempDir, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn temp_log(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("app.log");
        std::fs::File::create(&path).unwrap();
        path
    }

    #[test]
    fn test_load_yaml_json_toml() {
        let dir = TempDir::new().unwrap();
        let log = temp_log(&dir);
        let log_str = log.display();

        write_config(
            &dir,
            "a.yaml",
            &format!(
                "id: one\nlog_file: {log_str}\nmetrics:\n  - match: error\n    name: errors\n    type: c\n"
            ),
        );
        write_config(
            &dir,
            "b.json",
            &format!(
                r#"{{"id": "two", "log_file": "{log_str}", "metrics": [{{"match": "warn", "name": "warns", "type": "c"}}]}}"#
            ),
        );
        write_config(
            &dir,
            "c.toml",
            &format!(
                "id = \"three\"\nlog_file = \"{log_str}\"\n\n[[metrics]]\nmatch = \"info\"\nname = \"infos\"\ntype = \"c\"\n"
            ),
        );

        let cfgs = load(dir.path()).unwrap();
        assert_eq!(cfgs.len(), 3);
        let ids: Vec<_> = cfgs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_load_defaults_id_from_log_file() {
        let dir = TempDir::new().unwrap();
        let log = temp_log(&dir);

        write_config(
            &dir,
            "a.yaml",
            &format!("log_file: {}\nmetrics: []\n", log.display()),
        );

        let cfgs = load(dir.path()).unwrap();
        assert_eq!(cfgs[0].id, "app");
    }

    #[test]
    fn test_load_skips_unsupported_and_broken_files() {
        let dir = TempDir::new().unwrap();
        let log = temp_log(&dir);

        write_config(&dir, "notes.txt", "not a config");
        write_config(&dir, "bad.yaml", ":\n  - definitely: [not, valid");
        write_config(
            &dir,
            "good.yaml",
            &format!("log_file: {}\nmetrics: []\n", log.display()),
        );

        let cfgs = load(dir.path()).unwrap();
        assert_eq!(cfgs.len(), 1);
    }

    #[test]
    fn test_load_skips_missing_log_file() {
        let dir = TempDir::new().unwrap();
        let log = temp_log(&dir);

        write_config(&dir, "a.yaml", "log_file: /nonexistent/missing.log\nmetrics: []\n");
        write_config(
            &dir,
            "b.yaml",
            &format!("log_file: {}\nmetrics: []\n", log.display()),
        );

        let cfgs = load(dir.path()).unwrap();
        assert_eq!(cfgs.len(), 1);
        assert_eq!(cfgs[0].id, "app");
    }

    #[test]
    fn test_load_errors_when_nothing_valid() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a.yaml", "log_file: /nonexistent/missing.log\n");

        assert!(matches!(
            load(dir.path()),
            Err(Error::NoValidConfigs(_))
        ));
    }

    #[test]
    fn test_load_errors_on_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(load(dir.path()), Err(Error::NoConfigs(_))));
    }

    #[test]
    fn test_invalid_rule_drops_whole_config() {
        let dir = TempDir::new().unwrap();
        let log = temp_log(&dir);

        write_config(
            &dir,
            "a.yaml",
            &format!(
                "log_file: {}\nmetrics:\n  - match: ok\n    name: oks\n  - match: ''\n    name: bad\n",
                log.display()
            ),
        );

        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn test_metric_kind_codes() {
        for code in ["c", "g", "h", "ms", "s", "t"] {
            assert_eq!(code.parse::<MetricKind>().unwrap().code(), code);
        }
        assert!("x".parse::<MetricKind>().is_err());
    }
}
