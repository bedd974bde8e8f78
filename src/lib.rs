//! Preprocessing and spike-sorting orchestration for multi-probe neural
//! recording sessions.
//!
//! The pipeline discovers sessions marked for processing, conditions each
//! probe's raw voltage traces (high-pass filtering, phase-shift correction,
//! common-average referencing, bad-channel interpolation, shank-aware
//! destriping, optional notch filtering), hands the conditioned signal to
//! an external spike sorter with per-probe failure isolation, and
//! reconciles the sorter's output with quality metrics and experiment-wide
//! timing. Finished probes are skipped on re-runs, so the pipeline can run
//! unattended and be re-invoked safely.
//!
//! # Examples
//!
//! ```no_run
//! use ephys_pipeline::{ExternalSorter, Settings};
//!
//! let settings = Settings::load("settings.json").unwrap();
//! let sorter = ExternalSorter::new("kilosort4", "/opt/sorters/kilosort4");
//! let summary = ephys_pipeline::run(&settings, &sorter).unwrap();
//! println!(
//!     "{} probes sorted, {} failed",
//!     summary.probes_done, summary.probes_failed
//! );
//! ```

pub mod bad_channels;
pub mod conditioning;
pub mod config;
pub mod destripe;
pub mod diagnostics;
pub mod filters;
pub mod npy;
pub mod quality;
pub mod queue;
pub mod reconcile;
pub mod recording;
pub mod sorter;
pub mod sync;
pub mod types;

// Re-export the types a pipeline embedder needs.
pub use config::Settings;
pub use queue::{Pipeline, RunSummary};
pub use sorter::{ExternalSorter, SpikeSorter};
pub use types::*;

/// Runs the work queue once over every session marked for processing.
pub fn run(settings: &Settings, sorter: &dyn SpikeSorter) -> Result<RunSummary, PipelineError> {
    Pipeline::new(settings, sorter).run()
}
