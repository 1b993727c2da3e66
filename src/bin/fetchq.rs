use std::env;
use std::path::PathBuf;

use env_logger::Env;
use fetchq::fetch::process::check_tool;
use fetchq::{AppConfig, EngineBuilder, api};

fn print_usage() {
    eprintln!("Usage: fetchq [OPTIONS]");
    eprintln!();
    eprintln!("Runs the download queue headless and serves the HTTP API.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>  Config file (default: {})", AppConfig::default_path().display());
    eprintln!("  --host <HOST>        API bind address (overrides [api].host)");
    eprintln!("  --port <PORT>        API port (overrides [api].port)");
    eprintln!("  -h, --help           Show this help");
}

struct Args {
    config: PathBuf,
    host: Option<String>,
    port: Option<u16>,
}

fn value_for(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut parsed = Args {
        config: AppConfig::default_path(),
        host: None,
        port: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                parsed.config = PathBuf::from(value_for(&args, i, "--config"));
            }
            "--host" => {
                i += 1;
                parsed.host = Some(value_for(&args, i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = value_for(&args, i, "--port");
                match raw.parse() {
                    Ok(port) => parsed.port = Some(port),
                    Err(_) => {
                        eprintln!("Error: invalid port '{raw}'");
                        std::process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("Error: unknown argument '{other}'");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

/// Resolves on SIGINT, or SIGTERM where available (systemd sends SIGTERM).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                log::warn!("Cannot register SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Received SIGINT");
    }
}

#[tokio::main]
async fn main() -> fetchq::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let config = AppConfig::load_or_create(&args.config)?;
    log::info!("Loaded config from {}", args.config.display());

    for tool in [&config.engine.tools.ytdlp, &config.engine.tools.aria2c] {
        match check_tool(tool).await {
            Ok(version) => log::info!("Found {tool}: {version}"),
            Err(e) => log::warn!("{e}; jobs that need it will fail"),
        }
    }

    let host = args.host.unwrap_or(config.api.host);
    let port = args.port.unwrap_or(config.api.port);
    log::info!("Download directory: {}", config.engine.download_dir.display());

    let engine = EngineBuilder::new(config.engine)
        .with_state_file(config.paths.state_file)
        .spawn()?;

    let listener = api::bind(&host, port).await?;
    let served = api::serve(listener, engine.clone(), shutdown_signal()).await;
    if let Err(e) = &served {
        log::error!("API server error: {e}");
    }

    log::info!("Shutting down");
    engine.shutdown().await?;
    served
}
