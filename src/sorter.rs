//! External spike-sorter invocation.
//!
//! The sorting algorithm itself is an external collaborator; this module
//! owns the seam. [`SpikeSorter`] is the trait boundary, [`ExternalSorter`]
//! the shipped implementation that shells out to a sorter executable, and
//! [`run_sorter_isolated`] the failure-isolation wrapper: a sorter error is
//! logged to disk, the incomplete output removed, and the probe marked
//! failed without disturbing its siblings.

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Local;
use log::{error, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::SorterParams;
use crate::types::{PipelineError, Recording};

/// Name of the subdirectory the sorter writes its results into.
pub const SORTER_OUTPUT_DIR: &str = "sorter_output";

/// Name of the per-probe error log written on sorter failure.
pub const ERROR_LOG_FILE: &str = "error_log.txt";

/// Temporary working copy of the conditioned signal handed to the sorter.
pub const RECORDING_DAT_FILE: &str = "recording.dat";

/// The external spike-sorting routine, seen from the pipeline.
pub trait SpikeSorter {
    /// Sorter name, used for directories and reporting.
    fn name(&self) -> &str;

    /// The sorter's published default parameter set.
    fn default_params(&self) -> SorterParams;

    /// Runs the sorter on a conditioned recording.
    ///
    /// On success the sorter must have populated
    /// `<output_dir>/sorter_output/` with its results.
    fn run(
        &self,
        recording: &Recording,
        params: &SorterParams,
        output_dir: &Path,
    ) -> Result<(), PipelineError>;
}

/// Outcome of one isolated sorter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortingOutcome {
    /// Sorter finished; its output directory is in place
    Completed,
    /// Sorter raised; error logged, output removed, probe marked failed
    Failed,
}

/// A sorter invoked as an external command.
///
/// The conditioned signal is materialized as `sorter_output/recording.dat`
/// (little-endian f32, sample-major frames) with a JSON description beside
/// it, the resolved parameters are written to `params.json`, and the
/// command is invoked with the output directory as its single argument.
#[derive(Debug, Clone)]
pub struct ExternalSorter {
    name: String,
    command: PathBuf,
}

impl ExternalSorter {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> ExternalSorter {
        ExternalSorter {
            name: name.into(),
            command: command.into(),
        }
    }

    fn write_recording(&self, recording: &Recording, dir: &Path) -> Result<(), PipelineError> {
        let dat_path = dir.join(RECORDING_DAT_FILE);
        let mut writer = BufWriter::new(File::create(&dat_path)?);
        let n_channels = recording.num_channels();
        for t in 0..recording.num_samples() {
            for ch in 0..n_channels {
                writer.write_f32::<LittleEndian>(recording.data[[ch, t]])?;
            }
        }
        writer.flush()?;

        let description = serde_json::json!({
            "n_channels": n_channels,
            "sample_rate": recording.sample_rate,
            "dtype": "float32",
        });
        std::fs::write(
            dir.join("recording.json"),
            serde_json::to_string_pretty(&description)?,
        )?;
        Ok(())
    }
}

impl SpikeSorter for ExternalSorter {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_params(&self) -> SorterParams {
        SorterParams::new()
    }

    fn run(
        &self,
        recording: &Recording,
        params: &SorterParams,
        output_dir: &Path,
    ) -> Result<(), PipelineError> {
        let sorter_out = output_dir.join(SORTER_OUTPUT_DIR);
        std::fs::create_dir_all(&sorter_out)?;
        self.write_recording(recording, &sorter_out)?;
        std::fs::write(
            output_dir.join("params.json"),
            serde_json::to_string_pretty(params)?,
        )?;

        let output = Command::new(&self.command)
            .arg(output_dir)
            .output()
            .map_err(|e| PipelineError::SorterFailed {
                probe: output_dir.display().to_string(),
                message: format!("could not launch {}: {}", self.command.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::SorterFailed {
                probe: output_dir.display().to_string(),
                message: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Runs the sorter with per-probe failure isolation.
///
/// Any error raised by the sorter is captured to `error_log.txt` in the
/// probe's raw directory, the (necessarily incomplete) sorter directory is
/// deleted, and `Failed` is returned so the caller can mark the probe and
/// continue. Errors from the isolation bookkeeping itself propagate.
pub fn run_sorter_isolated(
    sorter: &dyn SpikeSorter,
    recording: &Recording,
    params: &SorterParams,
    probe_dir: &Path,
    sorter_dir_name: &str,
    probe_name: &str,
) -> Result<SortingOutcome, PipelineError> {
    info!(
        "Starting {} spike sorting at {}",
        probe_name,
        Local::now().format("%H:%M")
    );
    let output_dir = probe_dir.join(sorter_dir_name);

    match sorter.run(recording, params, &output_dir) {
        Ok(()) => Ok(SortingOutcome::Completed),
        Err(err) => {
            error!("{}", err);
            let mut log_file = File::create(probe_dir.join(ERROR_LOG_FILE))?;
            write!(log_file, "{}", err)?;

            if output_dir.is_dir() {
                std::fs::remove_dir_all(&output_dir)?;
            }
            Ok(SortingOutcome::Failed)
        }
    }
}
