use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cnet_link::{BrokerLink, ConnectionState, ConnectivityStatus, LinkConfig, LinkError, LinkEvent};
use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
    time::timeout,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "cnet-console", about = "Console client for the ComputeNet task broker")]
struct Args {
    /// Full websocket URL of the broker, e.g. ws://localhost:8080/ws.
    #[arg(long, default_value = "")]
    broker_url: String,
    /// host:port of the broker; expanded to ws://{addr}/ws.
    #[arg(long, default_value = "")]
    broker_addr: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print connectivity, task notifications and dashboard counters until Ctrl-C.
    Watch,
    /// Submit one task and wait for the broker to accept it.
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        data: String,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Submit one task per line read from stdin.
    Interactive {
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Request a status update and print the resulting counters.
    Status {
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = init_logging(&args.log_dir);
    if let Err(err) = run(args).await {
        error!(event = "console_failed", error = %format!("{err:#}"));
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let endpoint = resolve_broker_url(&args.broker_url, &args.broker_addr)?;
    info!(event = "console_start", endpoint = %endpoint);
    let link = BrokerLink::connect(LinkConfig::new(endpoint));
    let result = match args.command {
        Command::Watch => watch(&link).await,
        Command::Submit { name, data, wait_secs } => {
            submit(&link, &name, &data, Duration::from_secs(wait_secs)).await
        }
        Command::Interactive { wait_secs } => interactive(&link, Duration::from_secs(wait_secs)).await,
        Command::Status { wait_secs } => status(&link, Duration::from_secs(wait_secs)).await,
    };
    link.shutdown().await;
    result
}

async fn watch(link: &BrokerLink) -> Result<()> {
    let mut events = link.subscribe();
    let _observer = link.observe_dashboard();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!(event = "interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "events_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// The broker does not echo task names, so the first acceptance seen after
/// the write is reported as ours.
async fn submit(link: &BrokerLink, name: &str, data: &str, wait: Duration) -> Result<()> {
    let mut events = link.subscribe();
    wait_connected(link, wait).await?;
    submit_one(link, name, data).await?;
    match wait_for_acceptance(&mut events, wait).await {
        Some(task_id) => {
            println!("Task submitted successfully with ID: {task_id}");
            Ok(())
        }
        None => bail!("broker did not accept the task within {}s", wait.as_secs()),
    }
}

async fn interactive(link: &BrokerLink, wait: Duration) -> Result<()> {
    let mut events = link.subscribe();
    println!("=== ComputeNet console - interactive mode ===");
    println!("Enter task data (or 'exit' to quit):");
    if wait_connected(link, wait).await.is_err() {
        warn!(event = "interactive_offline", wait_secs = wait.as_secs());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                let data = line.trim();
                if data.eq_ignore_ascii_case("exit") {
                    break;
                }
                if data.is_empty() {
                    continue;
                }
                let name = format!("task-{}", submitted + 1);
                match link.submit_task(name, data).await {
                    Ok(()) => {
                        submitted += 1;
                        println!("Submitting task...");
                    }
                    Err(LinkError::NotConnected) => eprintln!("Not connected to broker"),
                    Err(err) => return Err(err).context("task submission failed"),
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    println!("Exiting...");
    Ok(())
}

async fn status(link: &BrokerLink, wait: Duration) -> Result<()> {
    let mut observer = link.observe_dashboard();
    wait_connected(link, wait).await?;
    link.request_status().await.context("status request failed")?;
    match timeout(wait, observer.changed()).await {
        Ok(Some(snapshot)) => {
            println!("{snapshot}");
            Ok(())
        }
        Ok(None) => bail!("broker link closed before a status update arrived"),
        Err(_) => bail!("no status update from broker within {}s", wait.as_secs()),
    }
}

async fn wait_connected(link: &BrokerLink, wait: Duration) -> Result<()> {
    match timeout(wait, link.wait_for_state(ConnectionState::Connected)).await {
        Ok(result) => result.context("broker link stopped"),
        Err(_) => bail!("Not connected to broker after {}s", wait.as_secs()),
    }
}

async fn submit_one(link: &BrokerLink, name: &str, data: &str) -> Result<()> {
    match link.submit_task(name, data).await {
        Ok(()) => {
            println!("Submitting task...");
            Ok(())
        }
        Err(LinkError::NotConnected) => bail!("Not connected to broker"),
        Err(err) => Err(err).context("task submission failed"),
    }
}

async fn wait_for_acceptance(events: &mut broadcast::Receiver<LinkEvent>, wait: Duration) -> Option<String> {
    let accepted = async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::TaskAccepted { task_id }) => return Some(task_id),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    timeout(wait, accepted).await.ok().flatten()
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::Connectivity(ConnectivityStatus::Connected) => println!("Connected to broker"),
        LinkEvent::Connectivity(ConnectivityStatus::Disconnected) => println!("Disconnected from broker"),
        LinkEvent::Connectivity(ConnectivityStatus::Error) => println!("Connection error"),
        LinkEvent::TaskAccepted { task_id } => println!("Task accepted: {task_id}"),
        LinkEvent::TaskCompleted { task_id } => println!("Task completed: {task_id}"),
        LinkEvent::Dashboard(snapshot) => println!("Dashboard: {snapshot}"),
    }
}

fn resolve_broker_url(flag_url: &str, flag_addr: &str) -> Result<Url> {
    let url = non_empty(flag_url).or_else(|| env_value("CNET_BROKER_URL"));
    let addr = non_empty(flag_addr).or_else(|| env_value("CNET_BROKER_ADDR"));
    broker_url_from(url, addr)
}

fn broker_url_from(url: Option<String>, addr: Option<String>) -> Result<Url> {
    let url = if let Some(value) = url {
        Url::parse(&value).with_context(|| format!("invalid broker url: {value}"))?
    } else if let Some(addr) = addr {
        Url::parse(&format!("ws://{addr}/ws")).with_context(|| format!("invalid broker addr: {addr}"))?
    } else {
        LinkConfig::default_endpoint().context("invalid default broker url")?
    };
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("broker url must use ws:// or wss://, got {url}");
    }
    Ok(url)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| non_empty(&value))
}

fn init_logging(log_dir: &str) -> Option<LogGuard> {
    let level = env_value("CNET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter { file: file.clone() });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("cnet-console-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn explicit_url_wins_over_addr() {
        let url = broker_url_from(some("wss://broker.example:9443/ws"), some("10.0.0.1:8080")).expect("url");
        assert_eq!(url.as_str(), "wss://broker.example:9443/ws");
    }

    #[test]
    fn addr_expands_to_ws_path() {
        let url = broker_url_from(None, some("10.0.0.1:8080")).expect("url");
        assert_eq!(url.as_str(), "ws://10.0.0.1:8080/ws");
    }

    #[test]
    fn falls_back_to_local_broker() {
        let url = broker_url_from(None, None).expect("url");
        assert_eq!(url.as_str(), "ws://localhost:8080/ws");
    }

    #[test]
    fn rejects_invalid_or_non_websocket_urls() {
        assert!(broker_url_from(some("not a url"), None).is_err());
        assert!(broker_url_from(some("http://localhost:8080/ws"), None).is_err());
        assert!(broker_url_from(None, some("bad host:port")).is_err());
    }

    #[test]
    fn args_parse_submit_subcommand() {
        let args = Args::try_parse_from([
            "cnet-console",
            "--broker-addr",
            "127.0.0.1:8080",
            "submit",
            "--name",
            "render",
            "--data",
            "frame-1",
        ])
        .expect("parse");
        assert_eq!(args.broker_addr, "127.0.0.1:8080");
        match args.command {
            Command::Submit { name, data, wait_secs } => {
                assert_eq!(name, "render");
                assert_eq!(data, "frame-1");
                assert_eq!(wait_secs, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
