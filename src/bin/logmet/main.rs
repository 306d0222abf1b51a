// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::process::ExitCode;
use tokio::select;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logmet::init::agent::Agent;
use logmet::init::args::AgentRun;
use logmet::telemetry;
use logmet::telemetry::stats_server::StatsListener;

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run agent
    Start(Box<AgentRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logmet")]
#[command(bin_name = "logmet")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(long, global = true, env = "LOGMET_LOG_LEVEL", default_value = "info")]
    /// Log level
    log_level: String,

    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGMET_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", env!("CARGO_PKG_VERSION"))
        }
        Some(Commands::Start(agent)) => {
            // Claim the stats endpoint before the runtime starts so an
            // invalid or busy port fails the process immediately.
            let stats_listener = match StatsListener::bind(agent.stats_port) {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!("ERROR: {}", e);
                    return ExitCode::from(1);
                }
            };

            let _logger = setup_logging(&opt.log_level, &opt.log_format);

            match run_agent(agent, stats_listener) {
                Ok(()) => {}
                Err(e) => {
                    error!(error = ?e, "Failed to run agent.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a
            // subcommand as required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(
    config: Box<AgentRun>,
    stats_listener: StatsListener,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!(
        destination = config.destination.as_str(),
        log_conf_dir = %config.log_conf_dir.display(),
        "Starting logmet.",
    );

    let agent_cancel = CancellationToken::new();
    let agent = Agent::new(config, stats_listener);

    let run_cancel = agent_cancel.clone();
    let mut agent_task = tokio::spawn(async move { agent.run(run_cancel).await });

    select! {
        _ = signal_wait() => {
            info!("Shutdown signal received.");
            agent_cancel.cancel();
            match (&mut agent_task).await {
                Ok(res) => res,
                Err(e) => Err(e.into()),
            }
        },
        res = &mut agent_task => {
            match res {
                Ok(res) => res,
                Err(e) => Err(e.into()),
            }
        },
    }
}

/// Resolve on a shutdown signal. SIGHUP and SIGPIPE are ignored; SIGUSR1
/// dumps a snapshot of the internal counters to stdout and keeps running.
async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());
    let mut sig_hup = sig(SignalKind::hangup());
    let mut sig_pipe = sig(SignalKind::pipe());
    let mut sig_usr1 = sig(SignalKind::user_defined1());

    loop {
        select! {
            _ = sig_term.recv() => {
                info!(signal = "SIGTERM", "Received signal");
                return;
            },
            _ = sig_int.recv() => {
                info!(signal = "SIGINT", "Received signal");
                return;
            },
            _ = sig_hup.recv() => {
                info!(signal = "SIGHUP", "Received signal, ignoring");
            },
            _ = sig_pipe.recv() => {},
            _ = sig_usr1.recv() => dump_stats(),
        }
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).unwrap()
}

/// Print the counter registry to stdout without disturbing the pipeline.
fn dump_stats() {
    match serde_json::to_string_pretty(&telemetry::registry().snapshot()) {
        Ok(snapshot) => println!("=== received SIGUSR1 ===\n{}\n=== end ===", snapshot),
        Err(e) => error!(error = %e, "serializing stats snapshot"),
    }
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_level: &str, log_format: &LogFormatArg) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("Unable to setup log tracer!");

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(EnvFilter::new(log_level))
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .compact();

        let subscriber = Registry::default()
            .with(EnvFilter::new(log_level))
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
    Ok(guard)
}
