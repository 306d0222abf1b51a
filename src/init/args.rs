// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// Which sink implementation the agent instantiates.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum Destination {
    /// Log every metric to the process logger
    Log,

    /// One UDP datagram per metric, statsd line protocol
    Statsd,

    /// Batch and submit to a local agent over HTTP
    Agent,

    /// Batch and submit to a remote check endpoint over HTTP
    Check,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Log => "log",
            Destination::Statsd => "statsd",
            Destination::Agent => "agent",
            Destination::Check => "check",
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Metric destination
    #[arg(value_enum, long, env = "LOGMET_DESTINATION", default_value = "log")]
    pub destination: Destination,

    /// Directory scanned for per-log config files (yaml, json, toml)
    #[arg(
        long,
        env = "LOGMET_LOG_CONF_DIR",
        default_value = "/opt/logmet/etc/log.d"
    )]
    pub log_conf_dir: PathBuf,

    /// Per-stage queue capacity for each watcher pipeline
    #[arg(long, env = "LOGMET_QUEUE_SIZE", default_value = "1000")]
    pub queue_size: usize,

    /// Tailer poll interval when waiting on new data or a missing file
    #[arg(long, env = "LOGMET_TAIL_POLL_INTERVAL", default_value = "250ms")]
    pub tail_poll_interval: humantime::Duration,

    /// Enable per-line rule-evaluation trace logging
    #[arg(long, env = "LOGMET_DEBUG_METRIC", default_value = "false")]
    pub debug_metric: bool,

    /// Enable tailer internal logging
    #[arg(long, env = "LOGMET_DEBUG_TAIL", default_value = "false")]
    pub debug_tail: bool,

    /// TCP port on localhost exposing the /stats endpoint
    #[arg(long, env = "LOGMET_STATS_PORT", default_value = "33284")]
    pub stats_port: u16,

    /// Statsd destination id, prepended (with the prefix) to every metric;
    /// defaults to the hostname
    #[arg(long, env = "LOGMET_STATSD_ID")]
    pub statsd_id: Option<String>,

    /// Statsd destination UDP port
    #[arg(long, env = "LOGMET_STATSD_PORT", default_value = "8125")]
    pub statsd_port: u16,

    /// Statsd metric name prefix
    #[arg(long, env = "LOGMET_STATSD_PREFIX", default_value = "host.")]
    pub statsd_prefix: String,

    /// Agent destination submission URL
    #[arg(
        long,
        env = "LOGMET_AGENT_URL",
        default_value = "http://127.0.0.1:2609/"
    )]
    pub agent_url: String,

    /// Check destination submission URL
    #[arg(long, env = "LOGMET_CHECK_SUBMISSION_URL")]
    pub check_submission_url: Option<String>,

    /// API token key for the check destination
    #[arg(long, env = "LOGMET_API_TOKEN_KEY")]
    pub api_token_key: Option<String>,

    /// API token application name for the check destination
    #[arg(long, env = "LOGMET_API_TOKEN_APP", default_value = "logmet")]
    pub api_token_app: String,

    /// Flush interval for the batching destinations (agent, check)
    #[arg(long, env = "LOGMET_FLUSH_INTERVAL", default_value = "60s")]
    pub flush_interval: humantime::Duration,
}

impl AgentRun {
    /// Serializable snapshot of the running configuration for the stats
    /// endpoint. Secrets are redacted, never echoed.
    pub fn running_config(&self) -> serde_json::Value {
        serde_json::json!({
            "destination": self.destination.as_str(),
            "log_conf_dir": self.log_conf_dir.display().to_string(),
            "queue_size": self.queue_size,
            "tail_poll_interval": self.tail_poll_interval.to_string(),
            "debug_metric": self.debug_metric,
            "debug_tail": self.debug_tail,
            "stats_port": self.stats_port,
            "statsd_id": self.statsd_id,
            "statsd_port": self.statsd_port,
            "statsd_prefix": self.statsd_prefix,
            "agent_url": self.agent_url,
            "check_submission_url": self.check_submission_url,
            "api_token_key": self.api_token_key.as_ref().map(|_| "<redacted>"),
            "api_token_app": self.api_token_app,
            "flush_interval": self.flush_interval.to_string(),
        })
    }
}
