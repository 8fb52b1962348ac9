use crate::channel::conduit::Channel;
use crate::channel::server::ChannelServer;
use crate::client::executor::QueryExecutor;
use crate::client::loader::SnapshotLoader;
use crate::client::proxy::{Endpoint, SocketEndpoint, SyscallProxy};
use crate::collector::procfs::ProcfsSource;
use crate::config::settings::KqueryConfig;
use crate::config::types::{KqueryError, QueryOutcome};
use crate::signal::{DaemonEvent, DaemonSignals};
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use rusqlite::Connection;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    Client,
    Daemon,
}

/// Query the running processes of this host with SQL
#[derive(Parser, Debug)]
#[command(name = "kquery", author, version, about, long_about = None)]
struct ClientArgs {
    /// Collector socket to connect to
    #[arg(long, conflicts_with = "local")]
    socket: Option<PathBuf>,
    /// Run the collector in-process instead of connecting to kqueryd
    #[arg(long)]
    local: bool,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run a single statement and exit
    #[arg(long)]
    query: Option<String>,
    /// Back the staging store with a database file instead of memory
    #[arg(long)]
    db: Option<PathBuf>,
}

/// Privileged process collector serving kquery clients
#[derive(Parser, Debug)]
#[command(name = "kqueryd", author, version, about, long_about = None)]
struct DaemonArgs {
    /// Socket path to listen on
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Process filesystem root
    #[arg(long)]
    proc_root: Option<PathBuf>,
}

pub fn run(mode: CliMode) -> Result<()> {
    match mode {
        CliMode::Daemon => {
            let args = DaemonArgs::parse();
            env_logger::init();
            run_daemon(args)
        }
        CliMode::Client => {
            let args = ClientArgs::parse();
            env_logger::init();
            run_client(args)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<KqueryConfig> {
    let config = KqueryConfig::load(path.map(|p| p.as_path()))?;
    Ok(config)
}

fn run_daemon(args: DaemonArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(root) = args.proc_root {
        config.proc_root = root;
    }
    config.validate()?;

    if !nix::unistd::geteuid().is_root() {
        warn!("kqueryd is not running as root; memory maps of other users' processes will read as empty");
    }

    // Handlers go in before the accept and connection threads exist
    let signals = DaemonSignals::install()?;

    let source = Arc::new(ProcfsSource::new(&config.proc_root));
    let channel = Channel::from_config(source, &config);
    let server = ChannelServer::bind(channel.clone(), &config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    let handle = server.spawn()?;

    info!(
        "kqueryd serving {} from {} (max_call {}, max_resp {})",
        handle.path().display(),
        config.proc_root.display(),
        channel.max_call(),
        channel.max_resp()
    );

    loop {
        match signals.next_event(&handle, Duration::from_millis(200)) {
            DaemonEvent::DumpMetrics => {
                info!("Channel metrics:\n{}", channel.metrics().export_prometheus());
            }
            DaemonEvent::Shutdown(sig) => {
                info!("Received {}, shutting down", sig.as_str());
                break;
            }
            DaemonEvent::ServerStopped => {
                error!("Channel accept loop exited unexpectedly");
                break;
            }
        }
    }

    handle.shutdown();
    info!("Final channel metrics:\n{}", channel.metrics().export_prometheus());
    Ok(())
}

fn run_client(args: ClientArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(db) = args.db {
        config.db_path = Some(db);
    }
    config.validate()?;

    let endpoint: Box<dyn Endpoint> = if args.local {
        let source = Arc::new(ProcfsSource::new(&config.proc_root));
        Box::new(Channel::from_config(source, &config).open())
    } else {
        match SocketEndpoint::connect(&config.socket_path) {
            Ok(endpoint) => Box::new(endpoint),
            Err(e) => {
                eprintln!("kquery: {}", e);
                std::process::exit(1);
            }
        }
    };

    let conn = match &config.db_path {
        Some(path) => {
            Connection::open(path).with_context(|| format!("opening {}", path.display()))?
        }
        None => Connection::open_in_memory()?,
    };

    let proxy = SyscallProxy::new(endpoint, config.max_call, config.max_resp);
    let mut loader = SnapshotLoader::new(proxy, conn);
    let executor = QueryExecutor::new(config.column_separator.clone());

    if let Some(sql) = args.query {
        if !run_statement(&mut loader, &executor, &sql) {
            std::process::exit(1);
        }
        return Ok(());
    }

    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    let mut statement = String::new();
    let mut lines = stdin.lock().lines();

    loop {
        if interactive {
            let prompt = if statement.is_empty() { "kquery> " } else { "   ...> " };
            print!("{}", prompt);
            io::stdout().flush()?;
        }

        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };

        if statement.is_empty() && line.trim() == ".quit" {
            break;
        }

        statement.push_str(&line);
        statement.push('\n');
        if !line.trim_end().ends_with(';') {
            continue;
        }

        run_statement(&mut loader, &executor, &statement);
        statement.clear();
    }

    if !statement.trim().is_empty() {
        run_statement(&mut loader, &executor, &statement);
    }
    Ok(())
}

/// Run one cycle for `sql`; a fatal channel error ends the process.
///
/// Returns false when the cycle or the statement failed.
fn run_statement<E: Endpoint>(loader: &mut SnapshotLoader<E>, executor: &QueryExecutor, sql: &str) -> bool {
    let result = loader.run_cycle(|conn| {
        let stdout = io::stdout();
        let stderr = io::stderr();
        executor.execute_reported(conn, sql, &mut stdout.lock(), &mut stderr.lock())
    });

    match result {
        Ok(report) => match report.query {
            QueryOutcome::Rows(n) => {
                log::debug!("{} rows from {} staged processes", n, report.staged);
                true
            }
            QueryOutcome::Failed(_) => false,
        },
        Err(e) if e.is_fatal() => {
            eprintln!("kquery: {}", e);
            std::process::exit(1);
        }
        Err(KqueryError::CommandTooLong { len, limit }) => {
            eprintln!("kquery: request of {} bytes exceeds channel limit {}", len, limit);
            false
        }
        Err(e) => {
            eprintln!("kquery: {}", e);
            false
        }
    }
}
