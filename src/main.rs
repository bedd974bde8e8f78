use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use ephys_pipeline::{ExternalSorter, PipelineError, RunSummary, Settings};

/// Unattended preprocessing and spike sorting for neural recording sessions.
#[derive(Parser, Debug)]
#[command(name = "ephys-pipeline", version, about)]
struct Args {
    /// Settings document
    #[arg(long, default_value = "settings.json")]
    config: PathBuf,

    /// Override the data root from the settings document
    #[arg(long)]
    data_folder: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(summary) if summary.errors.is_empty() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<RunSummary, PipelineError> {
    let mut settings = Settings::load(&args.config)?;
    if let Some(folder) = args.data_folder {
        settings.data_folder = folder;
    }

    let command = settings
        .sorter_command
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.spike_sorter));
    let sorter = ExternalSorter::new(settings.spike_sorter.clone(), command);

    let summary = ephys_pipeline::run(&settings, &sorter)?;
    info!(
        "Run finished: {}/{} sessions completed, {} probes done, {} failed",
        summary.sessions_completed,
        summary.sessions_seen,
        summary.probes_done,
        summary.probes_failed
    );
    for err in &summary.errors {
        error!("Unfinished session: {}", err);
    }
    Ok(summary)
}
