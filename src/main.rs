use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use desk_motion::config::Config;
use desk_motion::desk::{
    Arrival, BtleTransport, ConnectionState, DeskController, DeskObserver, MoveOutcome,
    TelemetrySample, Transport,
};
use desk_motion::error::MotionError;

#[derive(Parser, Debug)]
#[command(name = "desk-motion", version, about = "Control a Linak standing desk over Bluetooth")]
struct Cli {
    /// Stop a move that has not arrived after this many seconds
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List nearby desks
    Scan,
    /// Remember a desk; scans and takes the first one when no address is given
    Configure { address: Option<String> },
    /// Print the current height and speed
    Status,
    /// Move to a height in millimeters
    Move { height_mm: f64 },
    /// Move to a named preset from the config file
    Preset { name: String },
    /// Move to a percentage of the travel range
    Percent { percentage: f64 },
    /// Stop the desk
    Stop,
    /// Print height changes as they happen
    Monitor {
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Forget the cached desk so the next connect scans
    Forget,
}

/// Prints what the desk reports
struct ConsoleObserver;

impl DeskObserver for ConsoleObserver {
    fn on_telemetry(&self, sample: &TelemetrySample) {
        println!(
            "Height: {:.1}cm  Speed: {:.1}mm/s",
            sample.position_mm / 10.0,
            sample.speed_mm_s
        );
    }

    fn on_connectivity(&self, state: ConnectionState) {
        log::info!("Desk connection: {:?}", state);
    }

    fn on_motion_aborted(&self, error: &MotionError) {
        eprintln!("Error: move aborted: {}", error);
    }
}

async fn build_desk(config: &Config) -> Result<DeskController> {
    let transport = BtleTransport::new()
        .await
        .context("Failed to initialize Bluetooth")?;
    let motion = config.motion_settings(transport.capabilities());
    Ok(DeskController::new(
        Arc::new(transport),
        config.identity_cache()?,
        config.connection_settings(),
        motion,
    ))
}

/// Scan for desks and store the chosen address
async fn configure_desk(config: &mut Config, address: Option<String>) -> Result<()> {
    let address = match address {
        Some(address) => address,
        None => {
            let desk = build_desk(config).await?;
            let desks = desk.scan_desks().await?;
            // No picker here, take the first desk found
            let (name, address) = desks
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("No desks found"))?;
            log::info!("Using {} ({})", name, address);
            address
        }
    };

    config.desk_address = Some(address.clone());
    config.save()?;
    log::info!("Configured desk: {}", address);
    Ok(())
}

async fn move_and_wait(
    desk: &DeskController,
    outcome: MoveOutcome,
    deadline: Duration,
) -> Result<()> {
    match outcome {
        MoveOutcome::AlreadyThere(sample) => {
            println!("Already at {:.1}cm", sample.position_mm / 10.0);
        }
        MoveOutcome::Cancelled => println!("Move cancelled"),
        MoveOutcome::Started { direction, .. } => {
            log::info!("Moving {:?}", direction);
            match desk.wait_for_arrival(deadline).await? {
                Arrival::Settled(sample) => {
                    println!("Arrived at {:.1}cm", sample.position_mm / 10.0)
                }
                Arrival::TimedOut => anyhow::bail!(
                    "Desk did not arrive within {} seconds and was stopped",
                    deadline.as_secs()
                ),
            }
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    log::info!("Configuration loaded");
    let deadline = Duration::from_secs(cli.timeout);

    let cmd = match cli.cmd {
        Commands::Configure { address } => return configure_desk(&mut config, address).await,
        Commands::Forget => {
            config.identity_cache()?.invalidate();
            println!("Cached desk forgotten");
            return Ok(());
        }
        cmd => cmd,
    };

    let desk = build_desk(&config).await?;

    let result: Result<()> = async {
        match cmd {
            Commands::Scan => {
                let desks = desk.scan_desks().await?;
                if desks.is_empty() {
                    println!("No desks found");
                }
                for (name, address) in desks {
                    println!("{}  {}", address, name);
                }
                Ok(())
            }
            Commands::Status => {
                let sample = desk.read_state().await?;
                println!(
                    "Height: {:.1}cm ({:.0}%)  Speed: {:.1}mm/s",
                    sample.position_mm / 10.0,
                    desk.height_percentage().unwrap_or_default(),
                    sample.speed_mm_s
                );
                Ok(())
            }
            Commands::Move { height_mm } => {
                let outcome = desk.move_to(height_mm).await?;
                move_and_wait(&desk, outcome, deadline).await
            }
            Commands::Preset { name } => {
                let height_mm = config
                    .get_preset(&name)
                    .with_context(|| format!("No preset named {:?}", name))?;
                log::info!("Target height: {}mm ({:.1}cm)", height_mm, height_mm / 10.0);
                let outcome = desk.move_to(height_mm).await?;
                move_and_wait(&desk, outcome, deadline).await
            }
            Commands::Percent { percentage } => {
                let outcome = desk.move_to_percentage(percentage).await?;
                move_and_wait(&desk, outcome, deadline).await
            }
            Commands::Stop => {
                // A fresh process has no move of its own to cancel
                desk.force_stop().await?;
                println!("Stopped");
                Ok(())
            }
            Commands::Monitor { seconds } => {
                desk.register_observer(Arc::new(ConsoleObserver));
                desk.start_monitoring().await?;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                    _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
                }
                desk.stop_monitoring();
                Ok(())
            }
            Commands::Configure { .. } | Commands::Forget => Ok(()),
        }
    }
    .await;

    if let Err(e) = desk.disconnect().await {
        log::warn!("Disconnect failed: {}", e);
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    run(Cli::parse()).await
}
