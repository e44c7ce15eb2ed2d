mod cli;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, error::ErrorKind};
use serde::Serialize;

use browserforce::error::{AppError, ExitCode};
use browserforce::relay::Broker;
use browserforce::{auth, config, relay};

use cli::{Cli, Command, CompletionsArgs, ConfigCommand, ManArgs, ServeArgs, StatusArgs};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are informational, not errors — print as-is
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print().expect("failed to write to stdout");
                std::process::exit(0);
            }
            // All other clap errors → JSON on stderr with exit code 1
            let msg = e.kind().to_string();
            let full = e.to_string();
            let clean = full
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty()
                        && !trimmed.starts_with("For more information")
                        && !trimmed.starts_with("Usage:")
                })
                .map(|line| line.strip_prefix("error: ").unwrap_or(line).trim())
                .collect::<Vec<_>>()
                .join(", ");
            let clean = if clean.is_empty() { msg } else { clean };
            let app_err = AppError {
                message: clean,
                code: ExitCode::GeneralError,
            };
            app_err.print_json_stderr();
            std::process::exit(app_err.code as i32);
        }
    };

    if let Err(e) = run(&cli).await {
        e.print_json_stderr();
        std::process::exit(e.code as i32);
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    match &cli.command {
        Command::Serve(args) => execute_serve(cli, args).await,
        Command::Status(args) => execute_status(cli, args).await,
        Command::Config(args) => execute_config(cli, &args.command),
        Command::Completions(args) => execute_completions(args),
        Command::Man(args) => execute_man(args),
    }
}

/// Config dir override for tests and embedded callers, else the platform dir.
fn resolve_config_dir() -> Result<PathBuf, AppError> {
    if let Ok(dir) = std::env::var("BROWSERFORCE_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(auth::default_config_dir()?)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("browserforce=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Serialize)]
struct ServeInfo {
    status: &'static str,
    host: String,
    port: u16,
    #[serde(rename = "cdpUrl")]
    cdp_url: String,
}

async fn execute_serve(cli: &Cli, args: &ServeArgs) -> Result<(), AppError> {
    init_tracing();

    let (_, file) = config::load_config(cli.global.config.as_deref());
    let config_dir = resolve_config_dir()?;
    let resolved = config::resolve(args.port, &file, config_dir);

    let token = auth::load_or_create_token(&resolved.config_dir)?;
    let broker = Broker::start(resolved, token);

    let (listener, cdp_url) = relay::bind(&broker).await?;
    print_json(&ServeInfo {
        status: "listening",
        host: broker.config.host.clone(),
        port: broker.config.port,
        cdp_url,
    })?;

    relay::run(broker, listener).await
}

async fn execute_status(cli: &Cli, args: &StatusArgs) -> Result<(), AppError> {
    let (_, file) = config::load_config(cli.global.config.as_deref());
    let config_dir = resolve_config_dir()?;
    let resolved = config::resolve(args.port, &file, config_dir);

    let body = fetch_status(&resolved.host, resolved.port).await?;
    let mut status: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| AppError::general(format!("malformed status response: {e}")))?;

    if let Ok(Some(url)) = auth::read_cdp_url(&resolved.config_dir) {
        status["cdpUrl"] = serde_json::Value::String(url);
    }

    if args.json {
        println!("{status}");
    } else {
        print!("{}", format_plain_status(&status));
    }
    Ok(())
}

fn format_plain_status(status: &serde_json::Value) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "status:    {}",
        status["status"].as_str().unwrap_or("unknown")
    );
    let _ = writeln!(out, "extension: {}", status["extension"]);
    let _ = writeln!(out, "targets:   {}", status["targets"]);
    let _ = writeln!(out, "clients:   {}", status["clients"]);
    match status["cdpUrl"].as_str() {
        Some(url) => {
            let _ = writeln!(out, "cdp_url:   {url}");
        }
        None => {
            let _ = writeln!(out, "cdp_url:   -");
        }
    }
    out
}

/// Perform a simple HTTP GET of `/` using blocking I/O in a
/// `spawn_blocking` context.
async fn fetch_status(host: &str, port: u16) -> Result<String, AppError> {
    let host = host.to_owned();
    tokio::task::spawn_blocking(move || {
        let addr = format!("{host}:{port}");
        let sock_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| AppError::general(format!("invalid address {addr}: {e}")))?;
        let mut stream = TcpStream::connect_timeout(&sock_addr, Duration::from_secs(2))
            .map_err(|_| AppError::not_running(&host, port))?;
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

        let request = format!("GET / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .map_err(|e| AppError::general(format!("write failed: {e}")))?;

        let mut buf = Vec::with_capacity(1024);
        stream
            .read_to_end(&mut buf)
            .map_err(|e| AppError::general(format!("read failed: {e}")))?;

        let text = String::from_utf8_lossy(&buf);
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.trim().to_owned())
            .unwrap_or_default();
        if body.is_empty() {
            return Err(AppError::general("empty status response"));
        }
        Ok(body)
    })
    .await
    .map_err(|e| AppError::general(format!("status query failed: {e}")))?
}

#[derive(Serialize)]
struct ConfigInitOutput {
    created: String,
}

#[derive(Serialize)]
struct ConfigPathOutput {
    config_path: Option<String>,
}

#[derive(Serialize)]
struct ResolvedView {
    config_path: Option<String>,
    relay: RelayView,
}

#[derive(Serialize)]
struct RelayView {
    host: String,
    port: u16,
    log_capacity: usize,
    keepalive_secs: u64,
    missed_pong_limit: u32,
    command_timeout_ms: u64,
    client_queue: usize,
}

fn execute_config(cli: &Cli, cmd: &ConfigCommand) -> Result<(), AppError> {
    match cmd {
        ConfigCommand::Show => {
            let (path, file) = config::load_config(cli.global.config.as_deref());
            let config_dir = resolve_config_dir()?;
            let resolved = config::resolve(None, &file, config_dir);
            print_json(&ResolvedView {
                config_path: path.map(|p| p.display().to_string()),
                relay: RelayView {
                    host: resolved.host,
                    port: resolved.port,
                    log_capacity: resolved.log_capacity,
                    keepalive_secs: resolved.keepalive.as_secs(),
                    missed_pong_limit: resolved.missed_pong_limit,
                    command_timeout_ms: u64::try_from(resolved.command_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    client_queue: resolved.client_queue_capacity,
                },
            })
        }
        ConfigCommand::Init(args) => {
            let path = config::init_config(args.path.as_deref())?;
            print_json(&ConfigInitOutput {
                created: path.display().to_string(),
            })
        }
        ConfigCommand::Path => {
            let (path, _) = config::load_config(cli.global.config.as_deref());
            print_json(&ConfigPathOutput {
                config_path: path.map(|p| p.display().to_string()),
            })
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn execute_completions(args: &CompletionsArgs) -> Result<(), AppError> {
    let mut cmd = Cli::command();
    clap_complete::generate(args.shell, &mut cmd, "browserforce", &mut std::io::stdout());
    Ok(())
}

fn execute_man(args: &ManArgs) -> Result<(), AppError> {
    let cmd = Cli::command();

    let target = match &args.command {
        None => cmd,
        Some(name) => find_subcommand(&cmd, name)
            .ok_or_else(|| AppError::general(format!("unknown command: {name}")))?,
    };

    let man = clap_mangen::Man::new(target);
    man.render(&mut std::io::stdout())
        .map_err(|e| AppError::general(format!("failed to render man page: {e}")))?;
    Ok(())
}

fn find_subcommand(cmd: &clap::Command, name: &str) -> Option<clap::Command> {
    let parent_name = cmd.get_name().to_string();
    for sub in cmd.get_subcommands() {
        if sub.get_name() == name {
            let full_name = format!("{parent_name}-{name}");
            let leaked: &'static str = Box::leak(full_name.into_boxed_str());
            return Some(sub.clone().name(leaked));
        }
    }
    None
}

fn print_json(value: &impl Serialize) -> Result<(), AppError> {
    let json = serde_json::to_string(value)
        .map_err(|e| AppError::general(format!("serialization error: {e}")))?;
    println!("{json}");
    Ok(())
}
