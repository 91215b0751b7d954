//! Command-line entry point for training.
//!
//! Resolves the experiment folder and restore point, installs the interrupt
//! handler and runs one trainer per rank on the selected backend.

#![recursion_limit = "256"]

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use cadence::config::{load_config, DistributedBackend};
use cadence::perf;
use cadence::train::checkpoint::CheckpointManager;
use cadence::train::experiment::{
    copy_config, create_experiment_folder, remove_experiment_folder, CONFIG_FILE,
};
use cadence::train::{run, DistributedCoordinator, LocalCollective, RunOptions};
use cadence::TrainError;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Supported compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// Use the WGPU backend (GPU acceleration when available).
    Wgpu,
    /// Use the ndarray backend (CPU).
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

/// Top-level CLI options.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Train Tacotron and Glow-TTS acoustic models", long_about = None)]
struct Cli {
    /// Training configuration (YAML or JSON).
    #[arg(long = "config_path")]
    config_path: Option<PathBuf>,
    /// Continue training in an existing experiment folder from its latest checkpoint.
    #[arg(long = "continue_path")]
    continue_path: Option<PathBuf>,
    /// Start a new experiment from the weights of this checkpoint.
    #[arg(long = "restore_path")]
    restore_path: Option<PathBuf>,
    /// Rank of this process in a TCP distributed run.
    #[arg(long, default_value_t = 0)]
    rank: usize,
    /// Tag shared by every process of one distributed run.
    #[arg(long = "group_id", default_value = "")]
    group_id: String,
    /// Log at debug level.
    #[arg(long)]
    debug: bool,
    /// Print performance summary at the end of the run.
    #[arg(long, short)]
    verbose: bool,
    /// Compute backend to use.
    #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND)]
    backend: BackendChoice,
}

fn init_logging(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Work out config, output folder and restore point for this process.
fn prepare(cli: &Cli) -> Result<RunOptions> {
    if let Some(continue_path) = &cli.continue_path {
        let config = load_config(continue_path.join(CONFIG_FILE))?;
        let restore_path = CheckpointManager::latest_in(continue_path)?;
        if restore_path.is_none() {
            anyhow::bail!("{} holds no checkpoint to continue from", continue_path.display());
        }
        let best_loss = CheckpointManager::best_loss_in(continue_path)?.unwrap_or(f32::INFINITY);
        return Ok(RunOptions {
            config,
            out_path: (cli.rank == 0).then(|| continue_path.clone()),
            restore_path,
            best_loss,
        });
    }

    let config_path = cli
        .config_path
        .as_ref()
        .context("either --config_path or --continue_path is required")?;
    let config = load_config(config_path)?;
    let restore_path = cli
        .restore_path
        .clone()
        .or_else(|| config.restore_path.as_ref().map(PathBuf::from));
    let out_path = if cli.rank == 0 {
        let out = create_experiment_folder(Path::new(&config.output_path), &config.run_name)?;
        copy_config(&config, &out, restore_path.as_deref())?;
        Some(out)
    } else {
        None
    };
    Ok(RunOptions {
        config,
        out_path,
        restore_path,
        best_loss: f32::INFINITY,
    })
}

/// Run every rank this process hosts; the first real failure wins over interrupts.
fn train<B: AutodiffBackend>(
    cli: &Cli,
    options: &RunOptions,
    device: B::Device,
    interrupted: &Arc<AtomicBool>,
) -> Result<(), TrainError>
where
    B::Device: Send + 'static,
{
    let distributed = &options.config.distributed;
    if distributed.world_size <= 1 || distributed.backend == DistributedBackend::Tcp {
        let coordinator = DistributedCoordinator::from_config(distributed, cli.rank, &cli.group_id)?;
        return run::<B>(options, coordinator, device, interrupted);
    }

    tracing::info!("Starting {} in-process workers", distributed.world_size);
    let handles: Vec<_> = LocalCollective::group(distributed.world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, collective)| {
            let mut options = options.clone();
            if rank != 0 {
                options.out_path = None;
            }
            let device = device.clone();
            let interrupted = Arc::clone(interrupted);
            std::thread::spawn(move || {
                let coordinator = DistributedCoordinator::new(Box::new(collective));
                run::<B>(&options, coordinator, device, &interrupted)
            })
        })
        .collect();

    let mut outcome = Ok(());
    for handle in handles {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(TrainError::Distributed("worker thread panicked".to_string())));
        match (&outcome, result) {
            (_, Ok(())) => {}
            (Ok(()), Err(err)) => outcome = Err(err),
            (Err(current), Err(err)) if current.is_interrupt() && !err.is_interrupt() => {
                outcome = Err(err)
            }
            (Err(_), Err(_)) => {}
        }
    }
    outcome
}

fn dispatch(cli: &Cli, options: &RunOptions, interrupted: &Arc<AtomicBool>) -> Result<(), TrainError> {
    match cli.backend {
        BackendChoice::Wgpu => {
            #[cfg(feature = "backend-wgpu")]
            {
                let device = WgpuDevice::default();
                init_setup::<AutoGraphicsApi>(&device, Default::default());
                train::<Autodiff<Wgpu>>(cli, options, device, interrupted)
            }
            #[cfg(not(feature = "backend-wgpu"))]
            {
                let _ = (options, interrupted);
                Err(TrainError::Config(
                    "WGPU backend not enabled; build with --features backend-wgpu".to_string(),
                ))
            }
        }
        BackendChoice::Ndarray => {
            train::<Autodiff<NdArray<f32>>>(cli, options, NdArrayDevice::default(), interrupted)
        }
    }
}

/// Entry point for the CLI.
fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupt_flag = Arc::clone(&interrupted);
    if let Err(err) = ctrlc::set_handler(move || {
        interrupt_flag.store(true, Ordering::SeqCst);
        tracing::warn!("Interrupt received, stopping before the next epoch");
    }) {
        tracing::error!("Could not install the interrupt handler: {err}");
        return ExitCode::FAILURE;
    }

    let options = match prepare(&cli) {
        Ok(options) => options,
        Err(err) => {
            tracing::error!("{err:?}");
            return ExitCode::FAILURE;
        }
    };

    let result = dispatch(&cli, &options, &interrupted);
    if cli.verbose {
        eprintln!("{}", perf::report());
    }

    let Err(err) = result else {
        tracing::info!("Training finished");
        return ExitCode::SUCCESS;
    };
    if let Some(out_path) = &options.out_path {
        if let Err(cleanup) = remove_experiment_folder(out_path) {
            tracing::warn!("Could not clean up {}: {cleanup}", out_path.display());
        }
    }
    if err.is_interrupt() {
        tracing::info!("Training interrupted");
        ExitCode::SUCCESS
    } else {
        tracing::error!("{:?}", anyhow::Error::from(err));
        ExitCode::FAILURE
    }
}
