//! CLI entry point for calcium-daq
//!
//! Provides a command-line interface for:
//! - Running a burst or fixed-interval experiment
//! - Merging batch files left behind by an interrupted fixed-interval run
//! - Sending a test TTL pulse
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Run the configured experiment against the simulated camera and stimulator:
//! ```bash
//! calcium-daq run --mock --subject mouse42
//! ```
//!
//! Merge leftover batches:
//! ```bash
//! calcium-daq merge data/exp/mouse42_101500_191026 --stem mouse42
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use calcium_daq::acquisition::{CameraSource, FrameProducer, PreviewSink};
use calcium_daq::clock::{HardwareClock, SystemClock};
use calcium_daq::config::{AppConfig, PlanMode, DEFAULT_CONFIG_PATH};
use calcium_daq::events::EventSink;
use calcium_daq::experiment::BurstScheduler;
use calcium_daq::hardware::{DeviceHandle, LinkOpener, MockCamera, MockStimulatorOpener};
use calcium_daq::logging;
use calcium_daq::stimulus::PulseController;
use calcium_daq::storage::{merge_batches, FrameSink, OutputLayout, TiffStackWriter};

#[derive(Parser)]
#[command(name = "calcium-daq")]
#[command(about = "Calcium-imaging acquisition with TTL-triggered stimulation", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured experiment
    Run {
        /// Use the simulated stimulator instead of the serial port
        #[arg(long)]
        mock: bool,

        /// Override the subject name
        #[arg(long)]
        subject: Option<String>,

        /// Override the experiment name
        #[arg(long)]
        experiment: Option<String>,

        /// Use fixed-interval mode regardless of the configured mode
        #[arg(long)]
        fixed_interval: bool,

        /// Disable stimulation for this run
        #[arg(long)]
        no_pulse: bool,
    },

    /// Merge batch files in a session directory into one stack
    Merge {
        /// Session directory
        dir: PathBuf,

        /// Batch file stem (the subject name)
        #[arg(long)]
        stem: String,
    },

    /// Send a single TTL pulse
    TestPulse {
        /// Use the simulated stimulator instead of the serial port
        #[arg(long)]
        mock: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            mock,
            subject,
            experiment,
            fixed_interval,
            no_pulse,
        } => {
            let mut config = config;
            if let Some(subject) = subject {
                config.storage.subject = subject;
            }
            if let Some(experiment) = experiment {
                config.storage.experiment = experiment;
            }
            if fixed_interval {
                config.plan.mode = PlanMode::FixedInterval;
            }
            if no_pulse {
                config.plan.pulse.enabled = false;
            }
            run_experiment(config, mock).await
        }
        Commands::Merge { dir, stem } => merge(dir, stem).await,
        Commands::TestPulse { mock } => test_pulse(config, mock).await,
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn stimulator_opener(config: &AppConfig, mock: bool) -> Result<Arc<dyn LinkOpener>> {
    if mock {
        let (opener, _recorder) = MockStimulatorOpener::new();
        return Ok(Arc::new(opener));
    }
    #[cfg(feature = "instrument_serial")]
    {
        Ok(Arc::new(calcium_daq::hardware::SerialOpener::new(
            config.stimulator.port.clone(),
            config.stimulator.baud_rate,
        )))
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = config;
        anyhow::bail!("Serial stimulator support not built; rebuild with --features instrument_serial or pass --mock")
    }
}

async fn run_experiment(config: AppConfig, mock: bool) -> Result<()> {
    config.validate()?;
    let plan = config.plan.to_plan()?;
    let events = EventSink::new();
    let clock: Arc<dyn HardwareClock> = Arc::new(SystemClock::new());

    let pulses = if config.stimulator.enabled && plan.pulse().is_some() {
        let controller =
            PulseController::new(stimulator_opener(&config, mock)?, clock.clone(), events.clone());
        if let Err(e) = controller.open() {
            warn!("Continuing without stimulator: {}", e);
        }
        Some(controller)
    } else {
        None
    };

    let camera = MockCamera::default().with_frame_rate(plan.target_fps());
    let source = Arc::new(CameraSource::new(
        DeviceHandle::new(camera),
        clock.clone(),
        events.clone(),
    ));
    source.configure(&config.camera).await?;
    source.start().await?;
    let preview = PreviewSink::spawn(source.subscribe("preview", 4), config.preview.rate()?);

    let layout = OutputLayout::for_session(
        &config.storage.base_dir,
        &config.storage.experiment,
        &config.storage.subject,
        Local::now(),
    );
    info!("Saving to {}", layout.dir().display());
    let sink = FrameSink::spawn(
        Arc::new(TiffStackWriter),
        config.storage.queue_depth,
        events.clone(),
    );

    let mut scheduler = BurstScheduler::new(
        source.clone(),
        sink.clone(),
        layout,
        clock.clone(),
        events.clone(),
    );
    if let Some(pulses) = pulses.clone() {
        scheduler = scheduler.with_pulses(pulses);
    }

    source.apply_properties(&config.camera.run_properties).await?;
    let handle = scheduler.start(plan);
    let mut state = handle.watch_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping run");
            handle.stop();
        }
        _ = state.wait_for(|s| s.is_terminal()) => {}
    }
    let run = handle.join().await;

    source.apply_properties(&config.camera.idle_properties).await?;
    source.stop().await?;
    let previewed = preview.shutdown().await;
    let storage = sink.shutdown().await?;
    if let Some(pulses) = pulses {
        pulses.close();
    }

    let run = run?;
    let report = serde_json::json!({
        "run": run,
        "storage": storage,
        "frames_acquired": source.frames_acquired(),
        "preview_frames": previewed,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn merge(dir: PathBuf, stem: String) -> Result<()> {
    let layout = OutputLayout::new(dir, stem);
    match tokio::task::spawn_blocking(move || merge_batches(&layout)).await?? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("No batch files found"),
    }
    Ok(())
}

async fn test_pulse(config: AppConfig, mock: bool) -> Result<()> {
    let events = EventSink::new();
    let controller = PulseController::new(
        stimulator_opener(&config, mock)?,
        Arc::new(SystemClock::new()),
        events,
    );
    let outcome = controller.test_pulse().await?;
    controller.close();
    println!("{:?}", outcome);
    if !outcome.is_sent() {
        anyhow::bail!("Test pulse not sent");
    }
    Ok(())
}
