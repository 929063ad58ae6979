//! Sandkasten daemon entry point.
//!
//! Usage:
//!   sandkasten serve [--config PATH]   # start the HTTP API and reaper
//!   sandkasten doctor                  # run the Driver's preflight checks and report
//!
//! Before any of that runs, `main` checks for the nsinit sentinel env var:
//! every sandbox's init process is this same binary, re-exec'd into fresh
//! namespaces by `driver::nsinit::spawn`. That second entry never touches
//! clap, tokio or tracing — it goes straight to `driver::nsinit::run` and
//! then execs into the in-sandbox runner.

#[cfg(not(target_os = "linux"))]
compile_error!("sandkasten only runs on Linux");

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};

use sandkasten::config::Config;
use sandkasten::driver::{self, Driver};
use sandkasten::http;
use sandkasten::manager::Manager;
use sandkasten::reaper::Reaper;
use sandkasten::store::Store;

#[derive(Parser, Debug)]
#[command(name = "sandkasten")]
#[command(about = "Short-lived, strongly-isolated Linux sandboxes over HTTP")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API, the session pool warmer and the reaper.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the Driver's preflight checks (cgroup v2, overlayfs, mount
    /// propagation) and report whether this host can run sandboxes.
    Doctor {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    // This must happen before clap, tracing or tokio touch the process: the
    // init process of every sandbox is this binary, re-exec'd by
    // driver::nsinit::spawn with this env var set. Entering async/threaded
    // machinery first would defeat the whole point of the trampoline.
    if std::env::var(driver::NSINIT_SENTINEL_ENV).is_ok() {
        if let Err(e) = driver::nsinit::run() {
            eprintln!("sandkasten: nsinit failed: {e}");
            exit(1);
        }
        return;
    }

    if !nix::unistd::geteuid().is_root() {
        eprintln!("sandkasten: must run as root (needs CAP_SYS_ADMIN for namespaces)");
        exit(1);
    }

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match args.command {
        Commands::Serve { config } => run_serve(config),
        Commands::Doctor { config } => run_doctor(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    match Config::load(path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sandkasten: config error: {e}");
            exit(1);
        }
    }
}

fn run_doctor(config: Option<PathBuf>) {
    let config = load_config(config);
    match Driver::new(config) {
        Ok(driver) => match driver.ping() {
            Ok(()) => {
                println!("ok: cgroup v2, overlayfs and mount propagation all look sane");
            }
            Err(e) => {
                println!("fail: {e}");
                exit(1);
            }
        },
        Err(e) => {
            println!("fail: {e}");
            exit(1);
        }
    }
}

#[tokio::main]
async fn run_serve(config: Option<PathBuf>) {
    let config = load_config(config);

    for dir in [
        config.images_dir(),
        config.layers_dir(),
        config.workspaces_dir(),
        config.sessions_dir(),
    ] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create data directory");
            exit(1);
        }
    }

    let store = match Store::open(std::path::Path::new(&config.db_path)) {
        Ok(s) => std::sync::Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "failed to open session store");
            exit(1);
        }
    };

    let driver = match Driver::new(config.clone()) {
        Ok(d) => std::sync::Arc::new(d),
        Err(e) => {
            tracing::error!(error = %e, "driver preflight failed");
            exit(1);
        }
    };

    let listen = config.listen.clone();
    let api_key = config.api_key.clone();
    let session_ttl_seconds = config.session_ttl_seconds;

    let manager = Manager::new(config, store, driver);
    manager.warm_pool();

    let reaper = Reaper::new(manager.clone(), std::time::Duration::from_secs(10));
    tokio::spawn(reaper.run());

    tracing::info!(%listen, default_ttl_seconds = session_ttl_seconds, "sandkasten listening");

    let app = http::router(manager, api_key);
    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%listen, error = %e, "failed to bind listener");
            exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server exited with error");
        exit(1);
    }
}
