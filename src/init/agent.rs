// SPDX-License-Identifier: Apache-2.0

//! Agent supervisor: builds the sink, loads log configs, runs one watcher
//! per valid config plus the stats server, and translates cancellation into
//! an ordered shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, warn};

use crate::configs;
use crate::init::args::{AgentRun, Destination};
use crate::metrics::Sink;
use crate::metrics::intake::{Intake, IntakeConfig};
use crate::metrics::logonly::LogOnly;
use crate::metrics::statsd::{Statsd, StatsdConfig};
use crate::telemetry::stats_server::{StatsListener, StatsServer};
use crate::watcher::{Watcher, WatcherOptions};

/// Hard bound on sink stop at shutdown. Anything still buffered past this
/// is lost; unbounded shutdown latency would be worse.
const SINK_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Agent {
    config: Box<AgentRun>,
    stats_listener: StatsListener,
}

impl Agent {
    /// The stats listener is bound by the caller before the runtime starts
    /// so that port problems fail the process immediately.
    pub fn new(config: Box<AgentRun>, stats_listener: StatsListener) -> Self {
        Self {
            config,
            stats_listener,
        }
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let config = self.config;

        // the sink fails fast; watchers are best-effort per log
        let dest = build_sink(&config)?;
        dest.start()
            .await
            .map_err(|e| format!("starting sink: {}", e))?;

        let cfgs = configs::load(&config.log_conf_dir)?;

        let opts = WatcherOptions {
            queue_size: config.queue_size,
            tail_poll_interval: config.tail_poll_interval.into(),
            trace_rules: config.debug_metric,
            debug_tail: config.debug_tail,
        };

        let mut watchers = Vec::new();
        for cfg in cfgs {
            let id = cfg.id.clone();
            match Watcher::new(dest.clone(), cfg, opts.clone()) {
                Ok(w) => watchers.push(w),
                Err(e) => {
                    error!(log_id = %id, error = %e, "adding watcher, log will NOT be processed")
                }
            }
        }
        if watchers.is_empty() {
            return Err("no watchers could be started".into());
        }

        let watchers_cancel = CancellationToken::new();
        let server_cancel = CancellationToken::new();

        let mut watcher_tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        for watcher in watchers {
            let cancel = watchers_cancel.clone();
            watcher_tasks.spawn(async move { watcher.run(cancel).await });
        }

        let mut server_tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        {
            let server = StatsServer::new(config.running_config());
            let listener = self.stats_listener;
            let cancel = server_cancel.clone();
            server_tasks.spawn(async move { server.serve(listener, cancel).await });
        }

        info!(pid = std::process::id(), "Started");

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                info!("Agent cancellation signaled.");
            },
            e = first_exit(&mut watcher_tasks) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of watcher."),
                    Err(e) => result = Err(e),
                }
            },
            e = first_exit(&mut server_tasks) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of stats server."),
                    Err(e) => result = Err(e),
                }
            },
        }

        // Watchers first: a failed one has already cancelled nothing but
        // itself, so trip the shared token and wait for the rest to settle.
        watchers_cancel.cancel();
        drain_tasks("watcher", &mut watcher_tasks, Duration::from_secs(5)).await;

        server_cancel.cancel();
        drain_tasks("stats server", &mut server_tasks, Duration::from_secs(1)).await;

        // All pipelines have returned; stop the sink exactly once, bounded.
        match timeout(SINK_STOP_TIMEOUT, dest.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "sink stop failed"),
            Err(_elapsed) => warn!("timed out stopping sink"),
        }

        info!("Stopped");
        result
    }
}

/// Resolve with the first settled task in the group. While the agent runs,
/// any watcher or server task settling at all is news: Ok means an
/// unexpected exit, Err a failure that takes the agent down.
async fn first_exit(tasks: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    match tasks.join_next().await {
        Some(Ok(res)) => res,
        Some(Err(e)) => Err(e.into()),
        None => Ok(()), // empty group; should not happen
    }
}

/// Give a cancelled task group up to `grace` to settle. Shutdown is already
/// underway, so stragglers and late errors are logged rather than returned.
async fn drain_tasks(group: &str, tasks: &mut JoinSet<Result<(), BoxError>>, grace: Duration) {
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(group, error = %e, "task failed during shutdown"),
                Err(e) => warn!(group, error = %e, "failed to join task"),
            }
        }
    };

    if timeout(grace, drain).await.is_err() {
        warn!(group, "timed out waiting for exit");
    }
}

fn build_sink(config: &AgentRun) -> Result<Arc<dyn Sink>, BoxError> {
    match config.destination {
        Destination::Log => Ok(Arc::new(LogOnly::new())),

        Destination::Statsd => {
            let id = match &config.statsd_id {
                Some(id) => id.clone(),
                None => default_statsd_id()?,
            };
            let sink = Statsd::new(StatsdConfig {
                id,
                port: config.statsd_port,
                prefix: config.statsd_prefix.clone(),
            })?;
            Ok(Arc::new(sink))
        }

        Destination::Agent => {
            let sink = Intake::new(IntakeConfig {
                submission_url: config.agent_url.clone(),
                token_key: None,
                token_app: None,
                flush_interval: config.flush_interval.into(),
            })?;
            Ok(Arc::new(sink))
        }

        Destination::Check => {
            let url = config
                .check_submission_url
                .clone()
                .ok_or("check destination requires --check-submission-url")?;
            let sink = Intake::new(IntakeConfig {
                submission_url: url,
                token_key: config.api_token_key.clone(),
                token_app: Some(config.api_token_app.clone()),
                flush_interval: config.flush_interval.into(),
            })?;
            Ok(Arc::new(sink))
        }
    }
}

fn default_statsd_id() -> Result<String, BoxError> {
    gethostname::gethostname()
        .into_string()
        .map_err(|e| format!("unable to determine hostname for statsd id: {:?}", e).into())
}
