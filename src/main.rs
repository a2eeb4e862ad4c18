use std::fs::File;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use nbfcd::{
    application::Application,
    cli::Cli,
    config::{BusKind, ConfigManager},
};

const DAEMON_OUTPUT: &str = "/var/tmp/nbfcd.log";

fn init_syslog(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "nbfcd".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn init_console(level: LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .context("Failed to install logger")
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_OUTPUT)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

async fn run(cli: Cli) -> Result<()> {
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    let config_manager = ConfigManager::load(cli.config)
        .await
        .context("Failed to load configuration")?;

    let mut builder = Application::builder().with_config_manager(config_manager);
    if cli.session_bus {
        builder = builder.with_bus_kind(BusKind::Session);
    }

    info!("nbfcd {} starting", env!("CARGO_PKG_VERSION"));
    builder.build()?.run().await
}

// The runtime is built by hand so that its worker threads are spawned after
// the fork. Syslog is opened after it as well, to log the daemon's pid.
fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.daemonize {
        into_daemon()?;
        init_syslog(cli.log_level)?;
    } else {
        init_console(cli.log_level)?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(cli))
}
