// SPDX-License-Identifier: Apache-2.0

//! Supervisor lifecycle tests: startup validation and graceful shutdown.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use logmet::init::agent::Agent;
use logmet::init::args::{AgentRun, Destination};
use logmet::telemetry::stats_server::StatsListener;

fn agent_run(conf_dir: &Path) -> Box<AgentRun> {
    Box::new(AgentRun {
        destination: Destination::Log,
        log_conf_dir: conf_dir.to_path_buf(),
        queue_size: 100,
        tail_poll_interval: Duration::from_millis(20).into(),
        debug_metric: false,
        debug_tail: false,
        stats_port: 0, // unused: the listener is bound on an ephemeral port
        statsd_id: None,
        statsd_port: 8125,
        statsd_prefix: "host.".to_string(),
        agent_url: "http://127.0.0.1:2609/".to_string(),
        check_submission_url: None,
        api_token_key: None,
        api_token_app: "logmet".to_string(),
        flush_interval: Duration::from_secs(60).into(),
    })
}

fn ephemeral_listener() -> StatsListener {
    StatsListener::bind(0).unwrap()
}

#[tokio::test]
async fn test_agent_graceful_shutdown() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("svc.log");
    std::fs::File::create(&log).unwrap();
    std::fs::write(
        dir.path().join("svc.yaml"),
        format!(
            "id: agent_e2e\nlog_file: {}\nmetrics:\n  - match: error\n    name: errors\n    type: c\n",
            log.display()
        ),
    )
    .unwrap();

    let agent = Agent::new(agent_run(dir.path()), ephemeral_listener());
    let cancel = CancellationToken::new();

    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let res = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("agent did not stop in time")
        .unwrap();
    assert!(res.is_ok());
}

#[tokio::test]
async fn test_agent_fails_without_valid_configs() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("broken.yaml"),
        "log_file: /nonexistent/missing.log\n",
    )
    .unwrap();

    let agent = Agent::new(agent_run(dir.path()), ephemeral_listener());
    let res = agent.run(CancellationToken::new()).await;

    assert!(res.is_err());
}
