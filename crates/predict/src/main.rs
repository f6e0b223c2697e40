use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use predict::{run_prediction, PredictConfig};

/// Predict a learner's responses from an interaction history CSV.
#[derive(Debug, Parser)]
#[command(name = "predict", version)]
struct Args {
    /// Pipeline configuration (JSON or TOML).
    #[arg(long)]
    config: PathBuf,
    /// Interaction history CSV with uid/questions/concepts/responses
    /// columns.
    #[arg(long)]
    input: PathBuf,
    /// Learner id selecting the row to predict.
    #[arg(long)]
    uid: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match PredictConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("loaded configuration: {config}");

    match run_prediction(&config, &args.input, &args.uid) {
        Ok(path) => {
            println!("{}", path.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
