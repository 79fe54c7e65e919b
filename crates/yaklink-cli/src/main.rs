//! `yaklink`: supervise an engine link from a terminal.
//!
//! Runs the supervisor and exposes its user actions as a small line-based
//! command language on stdin, mirroring status changes and engine output to
//! the terminal.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use yaklink_config::{EnginePaths, LinkConfig, DEFAULT_LOCAL_PORT};
use yaklink_core::{EventBus, LinkEvent};
use yaklink_supervisor::{grpc_rpc_factory, Supervisor, SupervisorHandle, UserAction};

#[derive(Parser, Debug)]
#[command(name = "yaklink", version, about = "Supervise a local or remote yak engine link")]
struct Cli {
    /// Private data directory (defaults to the platform data dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Engine binary to probe and launch.
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Local gRPC port.
    #[arg(long)]
    port: Option<u16>,

    /// Frontend identifier reported to the engine.
    #[arg(long, default_value = "yakit")]
    frontend: String,

    /// Alternate profile database handed to the engine.
    #[arg(long, requires = "project_db")]
    profile_db: Option<PathBuf>,

    /// Alternate project database handed to the engine.
    #[arg(long, requires = "profile_db")]
    project_db: Option<PathBuf>,

    /// Ask the engine to suppress its own console output.
    #[arg(long)]
    disable_output: bool,

    /// Print engine log lines as they arrive.
    #[arg(long)]
    show_engine_log: bool,

    /// Verbose supervisor logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "yaklink={level},yaklink_supervisor={level},yaklink_config={level},yaklink_rpc={level}"
            ))
        }))
        .init();

    let mut paths = EnginePaths::resolve();
    if let Some(data_dir) = cli.data_dir {
        paths.data_dir = data_dir;
    }
    if let Some(engine) = cli.engine {
        paths.engine_binary = engine;
    }

    let config = LinkConfig {
        frontend: cli.frontend,
        database_pair: cli.profile_db.zip(cli.project_db),
        disable_output: cli.disable_output,
        ..LinkConfig::default()
    };

    let bus = EventBus::new();
    let events = bus.subscribe();
    let (supervisor, handle) = Supervisor::new(paths, config, bus, grpc_rpc_factory());
    let supervisor = match cli.port {
        Some(port) => supervisor.with_port(port),
        None => supervisor,
    };

    let printer = tokio::spawn(print_events(events, cli.show_engine_log));
    let supervisor_task = tokio::spawn(supervisor.run());

    println!("yaklink ready; type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(&handle, line.trim()) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    handle.shutdown();
    supervisor_task.await??;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<LinkEvent>, show_engine_log: bool) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::StatusChanged(status)) => println!("status: {status}"),
            Ok(LinkEvent::EngineLog(line)) => {
                if show_engine_log {
                    println!("engine | {line}");
                }
            }
            Ok(LinkEvent::LaunchError(text)) => println!("launch failed:\n{text}"),
            Ok(LinkEvent::RemoteDisconnected) => println!("remote engine disconnected"),
            Ok(LinkEvent::LinkEstablished(credential)) => {
                println!("linked to {} ({})", credential.addr(), credential.mode);
            }
            Ok(LinkEvent::WatchdogStopped { failures }) => {
                println!("watchdog gave up after {failures} consecutive failures");
            }
            Ok(LinkEvent::LegacyLinkRequested) => {
                println!("legacy engine kept; connect with an older client");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Apply one command line. Returns `false` to quit.
fn dispatch(handle: &SupervisorHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("retry") => send(handle, UserAction::Retry),
        Some("local") => send(handle, UserAction::SelectLocal),
        Some("remote") => send(handle, UserAction::SelectRemote),
        Some("connect") => match parse_connect(words.collect()) {
            Ok(action) => send(handle, action),
            Err(e) => println!("{e}"),
        },
        Some("port") => match words.next().map(str::parse) {
            Some(Ok(port)) => send(handle, UserAction::ChangePort(port)),
            _ => println!("usage: port <1-65535>"),
        },
        Some("keep") => send(handle, UserAction::KeepCurrentVersion),
        Some("reset") => send(handle, UserAction::ResetToBundled),
        Some("break") => send(handle, UserAction::Break),
        Some("control") => send(handle, UserAction::EnterControlRemote),
        Some("release") => send(handle, UserAction::ExitControlRemote),
        Some("help") => print_help(),
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("unknown command '{other}'; type 'help'"),
    }
    true
}

fn parse_connect(args: Vec<&str>) -> Result<UserAction, String> {
    let mut host = None;
    let mut secret = String::new();
    let mut tls = false;
    let mut ca_pem = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg {
            "--tls" => tls = true,
            "--ca" => {
                let path = iter
                    .next()
                    .ok_or_else(|| "--ca needs a file path".to_string())?;
                let pem = std::fs::read(path).map_err(|e| format!("cannot read {path}: {e}"))?;
                ca_pem = Some(pem);
            }
            value if host.is_none() => host = Some(value.to_string()),
            value => secret = value.to_string(),
        }
    }

    let host = host.ok_or_else(|| {
        "usage: connect <host[:port]> [secret] [--tls] [--ca <pem>]".to_string()
    })?;
    Ok(UserAction::ConnectRemote {
        host,
        port: DEFAULT_LOCAL_PORT,
        secret,
        tls,
        ca_pem,
    })
}

fn send(handle: &SupervisorHandle, action: UserAction) {
    if !handle.action(action) {
        println!("supervisor is no longer running");
    }
}

fn print_help() {
    println!(
        "\
commands:
  retry                 restart the local pipeline
  local                 switch to the local engine path
  remote                open the remote form
  connect <host[:port]> [secret] [--tls] [--ca <pem>]
                        link to a remote engine
  port <n>              resolve a port conflict with a new port
  keep                  keep an old engine, hand off to the legacy flow
  reset                 replace an old engine with the bundled copy
  break                 disconnect
  control / release     enter / leave external control
  quit                  exit"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn connect_parses_host_secret_and_tls() {
        let action = parse_connect(vec!["10.0.0.5:8443", "pw", "--tls"]).unwrap();
        match action {
            UserAction::ConnectRemote {
                host,
                secret,
                tls,
                ca_pem,
                ..
            } => {
                assert_eq!(host, "10.0.0.5:8443");
                assert_eq!(secret, "pw");
                assert!(tls);
                assert!(ca_pem.is_none());
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn connect_without_host_is_an_error() {
        assert!(parse_connect(vec![]).is_err());
    }
}
