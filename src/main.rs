use std::path::PathBuf;

use candle_core::Device;
use clap::{Parser, Subcommand};
use stampnet::{GzCsvSource, StampGeometry, StdoutSink, TrainConfig, TrainingSession};
use tracing_subscriber::EnvFilter;

/// stampnet: convolutional classifier for postage-stamp artifacts.
#[derive(Parser)]
#[command(name = "stampnet", version, about)]
struct Cli {
    /// Run on the CPU even when a CUDA device is available.
    #[arg(long, global = true)]
    cpu: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the network on stamps read from gzip CSV files.
    Train {
        /// Directory holding `<run>/<expid>.csv.gz` stamp files.
        #[arg(long)]
        data: PathBuf,
        /// Run numbers, paired positionally with the exposure ids.
        #[arg(long, required = true, value_delimiter = ',')]
        runs: Vec<u32>,
        /// Exposure ids, paired positionally with the runs.
        #[arg(long, required = true, value_delimiter = ',')]
        expids: Vec<u32>,
        /// Artifact labels to keep; all labels are used when omitted.
        #[arg(long, value_delimiter = ',')]
        artifacts: Vec<String>,
        /// Number of optimisation steps.
        #[arg(long)]
        steps: usize,
        /// Postage-stamp side in pixels; must divide 2048.
        #[arg(long, default_value_t = 128)]
        gridsize: usize,
        /// Coarse-graining factor; gridsize / cgfactor must be a multiple of 4.
        #[arg(long, default_value_t = 8)]
        cgfactor: usize,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Steps between training-accuracy reports.
        #[arg(long, default_value_t = 1000)]
        report_interval: usize,
        #[arg(long, default_value_t = 1e-4)]
        learning_rate: f64,
        /// Dropout keep probability during optimisation steps.
        #[arg(long, default_value_t = 0.5)]
        keep_prob: f32,
        /// Seed for parameter initialisation.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Evaluate a trained model (not supported yet).
    Test {
        /// Test stamps to evaluate on.
        #[arg(long)]
        data: PathBuf,
    },
    /// Save a model checkpoint (not supported yet).
    Save {
        #[arg(long)]
        output: PathBuf,
    },
    /// Resume training from a checkpoint (not supported yet).
    Resume {
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let mut session = TrainingSession::new(device);

    match cli.command {
        Command::Train {
            data,
            runs,
            expids,
            artifacts,
            steps,
            gridsize,
            cgfactor,
            batch_size,
            report_interval,
            learning_rate,
            keep_prob,
            seed,
        } => {
            let cfg = TrainConfig {
                steps,
                report_interval,
                batch_size,
                learning_rate,
                dropout_keep_prob: keep_prob,
                geometry: StampGeometry::new(gridsize, cgfactor),
                seed,
                ..Default::default()
            };
            let source = GzCsvSource::new(data);
            session.train_from_source(&source, &runs, &expids, &artifacts, &cfg, &mut StdoutSink)?;
        }
        Command::Test { data } => {
            session.test(data.as_path())?;
        }
        Command::Save { output } => session.save_model(&output)?,
        Command::Resume { checkpoint } => session.resume_from(&checkpoint)?,
    }
    Ok(())
}
