//! Command-line client for nbfcd.

use std::{fmt::Write as _, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use log::{LevelFilter, debug};
use tokio::time::Instant;

use nbfcd::{
    client::FanControlClient,
    config::BusKind,
    fan_controller::FanSpeed,
    status::ServiceStatus,
};

const WATCH_PERIOD: Duration = Duration::from_secs(3);

/// Command-line client for the nbfcd fan control service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Talk to a service on the session bus
    #[arg(long = "session-bus", global = true, default_value = "false")]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the service status
    Status {
        /// Follow status changes until interrupted
        #[arg(short, long)]
        watch: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Start fan control with the selected configuration
    Start,
    /// Stop fan control and hand the fans back to the firmware
    Stop,
    /// Manage fan configurations
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Override one fan: a percentage or "auto"
    Set { fan: usize, speed: FanSpeed },
    /// Show client and service versions
    Version,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// List available configurations
    List,
    /// Select the configuration used by fan control
    Select { name: String },
}

fn render(status: &ServiceStatus) -> String {
    let mut out = String::new();
    if !status.service_available {
        out.push_str("Service:        unavailable\n");
        return out;
    }

    let _ = writeln!(out, "State:          {}", status.state);
    let _ = writeln!(
        out,
        "Configuration:  {}",
        status.config_name.as_deref().unwrap_or("-")
    );
    if let Some(t) = status.cpu_temperature {
        let _ = writeln!(out, "Temperature:    {t:.1} °C");
    }

    for (i, fan) in status.fans.iter().enumerate() {
        let _ = writeln!(out, "\nFan {i}: {}", fan.name);
        let _ = writeln!(out, "  Mode:         {}", fan.mode);
        if let Some(t) = fan.temperature {
            let _ = writeln!(out, "  Temperature:  {t:.1} °C");
        }
        if let Some(target) = fan.target {
            let _ = writeln!(out, "  Target:       {target:.1} %");
        }
        if let Some(applied) = fan.applied {
            let _ = writeln!(out, "  Applied:      {applied:.1} %");
        }
        if let Some(rpm) = fan.rpm {
            let _ = writeln!(out, "  Speed:        {rpm} rpm");
        }
        if fan.stale {
            let _ = writeln!(out, "  Stale:        {} failed ticks", fan.consecutive_failures);
        }
    }
    out
}

fn print_status(status: &ServiceStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
    } else {
        print!("{}", render(status));
    }
    Ok(())
}

fn print_update(status: &ServiceStatus, json: bool) -> Result<()> {
    if !json {
        println!(
            "--- {}",
            status.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S")
        );
    }
    print_status(status, json)
}

/// Prints every `StatusChanged` signal. When none arrives for
/// `WATCH_PERIOD`, the status is polled instead, which also reports a
/// service that went away.
async fn watch(client: &FanControlClient, json: bool) -> Result<()> {
    let updates = client.status_updates().await?;
    tokio::pin!(updates);
    let mut subscribed = true;

    let quiet = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(quiet);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.context("Failed to listen for Ctrl+C"),
            update = updates.next(), if subscribed => match update {
                Some(status) => {
                    print_update(&status, json)?;
                    quiet.as_mut().reset(Instant::now() + WATCH_PERIOD);
                }
                None => {
                    debug!("Status signal stream ended, polling only");
                    subscribed = false;
                }
            },
            () = &mut quiet => {
                print_update(&client.status_or_unavailable().await?, json)?;
                quiet.as_mut().reset(Instant::now() + WATCH_PERIOD);
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let bus = if args.session_bus {
        BusKind::Session
    } else {
        BusKind::System
    };
    let client = FanControlClient::connect(bus).await?;

    match args.command {
        Command::Status { watch: true, json } => watch(&client, json).await?,
        Command::Status { watch: false, json } => {
            print_status(&client.status_or_unavailable().await?, json)?;
        }
        Command::Start => client.start().await?,
        Command::Stop => client.stop().await?,
        Command::Config(ConfigCommand::List) => {
            for name in client.list_configurations().await? {
                println!("{name}");
            }
        }
        Command::Config(ConfigCommand::Select { name }) => {
            client.select_configuration(&name).await?;
        }
        Command::Set { fan, speed } => client.set_fan_speed(fan, speed).await?,
        Command::Version => {
            println!("nbfc  {}", env!("CARGO_PKG_VERSION"));
            println!("nbfcd {}", client.version().await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("{}: {}", record.level(), message))
        })
        .level(LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()
        .context("Failed to install logger")?;

    run(Args::parse()).await
}
