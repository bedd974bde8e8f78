//! Quality metrics and the external cluster-quality engine seam.
//!
//! Three independent sources of quality information meet in the export
//! directory: raw-signal QC arrays computed once per probe and cached on
//! disk, per-cluster labels from an optional external engine, and
//! spike-train-derived labels computed here.

use chrono::Utc;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::diagnostics;
use crate::npy;
use crate::recording;
use crate::types::PipelineError;

/// Cached per-channel RMS of the raw signal.
pub const RAW_QC_RMS_FILE: &str = "_qc.ap_rms.npy";
/// Cached per-channel mean spectral power of the raw signal (dB).
pub const RAW_QC_POWER_FILE: &str = "_qc.spectral_power.npy";

/// Spike-train label table written into the export directory.
pub const CLUSTER_LABELS_FILE: &str = "clusters.labels.tsv";

// Refractory period for violation counting (seconds).
const REFRACTORY_PERIOD_S: f64 = 0.0015;
// Label thresholds: a cluster is "good" below this violation rate with at
// least this many spikes.
const MAX_GOOD_VIOLATION_RATE: f64 = 0.1;
const MIN_GOOD_SPIKES: usize = 50;

/// Computes raw-signal QC arrays for a probe, unless already cached.
///
/// The computation loads the raw recording, so the cache check matters:
/// re-runs and the reconciler both call this and only the first invocation
/// pays for it.
pub fn ensure_raw_qc(probe_dir: &Path) -> Result<(), PipelineError> {
    if probe_dir.join(RAW_QC_RMS_FILE).is_file() {
        debug!("Raw QC already computed for {}", probe_dir.display());
        return Ok(());
    }
    info!("Computing raw ephys QC metrics");
    let rec = recording::load_probe_recording(probe_dir)?;

    let n_samples = rec.num_samples().max(1);
    let rms: Vec<f64> = (0..rec.num_channels())
        .map(|ch| {
            let sum: f64 = (0..rec.num_samples())
                .map(|t| {
                    let v = rec.data[[ch, t]] as f64;
                    v * v
                })
                .sum();
            (sum / n_samples as f64).sqrt()
        })
        .collect();
    npy::save_f64(probe_dir.join(RAW_QC_RMS_FILE), &rms)?;

    let psd = diagnostics::spectral_density(&rec, diagnostics::PSD_SEED);
    let mean_power: Vec<f64> = psd
        .power_db
        .iter()
        .map(|channel| {
            if channel.is_empty() {
                0.0
            } else {
                channel.iter().sum::<f64>() / channel.len() as f64
            }
        })
        .collect();
    npy::save_f64(probe_dir.join(RAW_QC_POWER_FILE), &mean_power)?;
    Ok(())
}

/// QC artifact files currently present in a probe directory.
pub fn qc_artifacts(probe_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(probe_dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with("_qc.") {
                artifacts.push(path);
            }
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// The optional external cluster-quality engine.
///
/// Modeled as an injected capability with an explicit lifecycle: acquired
/// once at pipeline start, shared sequentially across probes (never
/// invoked concurrently), and released on every exit path.
pub trait ClusterQualityEngine {
    /// Engine name for reporting.
    fn name(&self) -> &str;

    /// Evaluates one probe's sorter output, writing per-cluster tables
    /// (`cluster_*.tsv`) into the sorter output directory.
    fn evaluate(
        &mut self,
        sorter_output: &Path,
        raw_bin: &Path,
        qc_dir: &Path,
    ) -> Result<(), PipelineError>;

    /// Releases the engine.
    fn shutdown(self: Box<Self>);
}

/// Cluster-quality engine invoked as an external command.
#[derive(Debug)]
pub struct ExternalQualityEngine {
    command: PathBuf,
    started: chrono::DateTime<Utc>,
}

impl ExternalQualityEngine {
    /// Acquires the engine, verifying the executable exists up front so a
    /// misconfiguration surfaces before any probe has been processed.
    pub fn start(command: impl Into<PathBuf>) -> Result<ExternalQualityEngine, PipelineError> {
        let command = command.into();
        if !command.is_file() {
            return Err(PipelineError::MissingArtifact {
                stage: "cluster-quality-engine",
                path: command,
            });
        }
        info!("Starting cluster quality engine {}", command.display());
        Ok(ExternalQualityEngine {
            command,
            started: Utc::now(),
        })
    }
}

impl ClusterQualityEngine for ExternalQualityEngine {
    fn name(&self) -> &str {
        "external"
    }

    fn evaluate(
        &mut self,
        sorter_output: &Path,
        raw_bin: &Path,
        qc_dir: &Path,
    ) -> Result<(), PipelineError> {
        let output = Command::new(&self.command)
            .arg(sorter_output)
            .arg(raw_bin)
            .arg(qc_dir)
            .output()
            .map_err(|e| PipelineError::QualityEngine(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::QualityEngine(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn shutdown(self: Box<Self>) {
        info!(
            "Releasing cluster quality engine after {}s",
            (Utc::now() - self.started).num_seconds()
        );
    }
}

/// A spike-train-derived quality label for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterLabel {
    pub cluster_id: u32,
    pub n_spikes: usize,
    /// Fraction of inter-spike intervals below the refractory period
    pub violation_rate: f64,
    pub label: &'static str,
}

/// Computes per-cluster labels from spike times and cluster assignments.
///
/// A cluster is labeled `good` when its refractory-period violation rate is
/// low and it has enough spikes for the rate to mean anything; everything
/// else is `mua`.
pub fn spike_train_labels(times: &[f64], clusters: &[u32]) -> Vec<ClusterLabel> {
    let mut by_cluster: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (&t, &c) in times.iter().zip(clusters) {
        by_cluster.entry(c).or_default().push(t);
    }

    by_cluster
        .into_iter()
        .map(|(cluster_id, mut spike_times)| {
            spike_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n_spikes = spike_times.len();
            let n_intervals = n_spikes.saturating_sub(1);
            let violations = spike_times
                .windows(2)
                .filter(|w| w[1] - w[0] < REFRACTORY_PERIOD_S)
                .count();
            let violation_rate = if n_intervals == 0 {
                0.0
            } else {
                violations as f64 / n_intervals as f64
            };
            let label = if violation_rate < MAX_GOOD_VIOLATION_RATE && n_spikes >= MIN_GOOD_SPIKES
            {
                "good"
            } else {
                "mua"
            };
            ClusterLabel {
                cluster_id,
                n_spikes,
                violation_rate,
                label,
            }
        })
        .collect()
}

/// Writes the cluster label table as TSV.
pub fn write_cluster_labels(path: &Path, labels: &[ClusterLabel]) -> Result<(), PipelineError> {
    let mut file = File::create(path)?;
    writeln!(file, "cluster_id\tn_spikes\tviolation_rate\tlabel")?;
    for label in labels {
        writeln!(
            file,
            "{}\t{}\t{:.4}\t{}",
            label.cluster_id, label.n_spikes, label.violation_rate, label.label
        )?;
    }
    Ok(())
}
