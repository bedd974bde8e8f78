use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Metadata for a single recording channel.
///
/// Channels carry a stable identifier, the shank (sub-array) they sit on,
/// their electrode position on the probe, and the fraction of one sampling
/// period at which the acquisition hardware samples them relative to the
/// start of the cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Stable channel identifier (e.g. "AP12")
    pub id: String,
    /// Shank label; channels sharing a label are destriped together
    pub shank: u32,
    /// Horizontal electrode position (μm)
    pub x: f32,
    /// Distance from the probe tip along the shank (μm)
    pub y: f32,
    /// Intra-cycle sampling offset as a fraction of one sample period
    pub adc_phase: f32,
}

/// A multi-channel voltage recording at a fixed sampling rate.
///
/// `data` is laid out `[channels, samples]`. Channel order in `data` matches
/// `channels`, and every conditioning transform returns a new `Recording`
/// with the same channel identifiers in the same order.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Per-channel metadata, in data row order
    pub channels: Vec<ChannelInfo>,
    /// Signal samples, shape `[num_channels, num_samples]`
    pub data: Array2<f32>,
    /// Sampling rate (Hz)
    pub sample_rate: f32,
}

impl Recording {
    /// Number of channels in the recording.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel.
    pub fn num_samples(&self) -> usize {
        self.data.shape()[1]
    }

    /// Duration of the recording in seconds.
    pub fn duration(&self) -> f32 {
        self.num_samples() as f32 / self.sample_rate
    }

    /// Channel identifiers in data row order.
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id.clone()).collect()
    }

    /// Row index of the channel with the given identifier.
    pub fn channel_index(&self, id: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.id == id)
    }

    /// Distinct shank labels present, in ascending order.
    pub fn shank_labels(&self) -> Vec<u32> {
        let labels: BTreeSet<u32> = self.channels.iter().map(|c| c.shank).collect();
        labels.into_iter().collect()
    }
}

/// Channel classification produced by the two detection passes.
///
/// The sets are tagged per category and a channel may be a member of more
/// than one when the passes disagree; the interpolation target set is always
/// the exact union of the three.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadChannels {
    /// Channels with no usable signal (pass A, filtered signal)
    pub dead: BTreeSet<String>,
    /// Channels dominated by noise (pass B, referenced signal, 3x MAD)
    pub noisy: BTreeSet<String>,
    /// Channels above the brain surface (pass A, filtered signal)
    pub outside_brain: BTreeSet<String>,
}

impl BadChannels {
    /// The exact union of dead, noisy, and outside-brain identifiers.
    ///
    /// Interpolation replaces exactly these channels and no others.
    pub fn interpolation_targets(&self) -> BTreeSet<String> {
        let mut all = self.dead.clone();
        all.extend(self.noisy.iter().cloned());
        all.extend(self.outside_brain.iter().cloned());
        all
    }

    /// True when no channel was flagged by either pass.
    pub fn is_empty(&self) -> bool {
        self.dead.is_empty() && self.noisy.is_empty() && self.outside_brain.is_empty()
    }

    /// Fraction of `total` channels in each class: (dead, noisy, outside).
    pub fn fractions(&self, total: usize) -> (f64, f64, f64) {
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let n = total as f64;
        (
            self.dead.len() as f64 / n,
            self.noisy.len() as f64 / n,
            self.outside_brain.len() as f64 / n,
        )
    }
}

/// Processing state of one probe within a session.
///
/// Advances monotonically; `Done` and `SortingFailed` are terminal. The
/// state is persisted per session so a restarted run resumes from the last
/// completed stage instead of redoing earlier work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeState {
    /// Discovered but untouched
    NotStarted,
    /// Sync pulse times extracted for this probe
    Synced,
    /// Sorter invocation underway (or interrupted mid-run)
    SortingInProgress,
    /// Sorter raised an error; probe is skipped but siblings proceed
    SortingFailed,
    /// Sorter output present, not yet reconciled
    Sorted,
    /// Sorter output exported into the analysis layout
    Exported,
    /// All downstream artifacts present, intermediates cleaned up
    Done,
}

impl ProbeState {
    /// Terminal states count as handled when deciding whether the session
    /// marker may be removed.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProbeState::Done | ProbeState::SortingFailed)
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeState::NotStarted => "not-started",
            ProbeState::Synced => "synced",
            ProbeState::SortingInProgress => "sorting-in-progress",
            ProbeState::SortingFailed => "sorting-failed",
            ProbeState::Sorted => "sorted",
            ProbeState::Exported => "exported",
            ProbeState::Done => "done",
        };
        f.write_str(s)
    }
}

/// One edge on a digital synchronization line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncEvent {
    /// Digital line number the edge occurred on
    pub channel: u32,
    /// Edge time in seconds on the stream's local clock
    pub time: f64,
    /// +1 for a rising edge, -1 for a falling edge
    pub polarity: i8,
}

/// A stage of the signal-conditioning chain, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditioningStage {
    HighPass,
    PhaseShift,
    CommonReference,
    Classification,
    Interpolation,
    Destripe,
    Notch,
}

impl ConditioningStage {
    /// Stage label used in logs and error context.
    pub fn label(self) -> &'static str {
        match self {
            ConditioningStage::HighPass => "high-pass",
            ConditioningStage::PhaseShift => "phase-shift",
            ConditioningStage::CommonReference => "common-reference",
            ConditioningStage::Classification => "bad-channel-classification",
            ConditioningStage::Interpolation => "interpolation",
            ConditioningStage::Destripe => "destripe",
            ConditioningStage::Notch => "notch",
        }
    }
}

impl fmt::Display for ConditioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error taxonomy for the pipeline.
///
/// Variants are either recoverable at probe scope (logged, probe marked
/// failed, siblings continue) or fatal (propagated, halting the current
/// session). The split is encoded by [`PipelineError::is_probe_recoverable`]
/// rather than left implicit in catch sites.
#[derive(Debug)]
pub enum PipelineError {
    /// An I/O error occurred
    Io(io::Error),
    /// A configuration or state document failed to parse
    Json(serde_json::Error),
    /// A metadata file was present but malformed
    MalformedMeta {
        /// File that failed to parse
        path: PathBuf,
        /// What was wrong with it
        detail: String,
    },
    /// A binary file's size does not match its metadata
    FileSize {
        /// File whose size was checked
        path: PathBuf,
        /// Size implied by the metadata (bytes)
        expected: u64,
        /// Size found on disk (bytes)
        actual: u64,
    },
    /// A session contained no raw acquisition run
    NoAcquisitionRun(PathBuf),
    /// A session contained more than one raw acquisition run
    MultipleAcquisitionRuns {
        /// Session that was rejected
        session: PathBuf,
        /// Number of run directories found
        found: usize,
    },
    /// An expected upstream artifact is missing
    MissingArtifact {
        /// Pipeline stage that needed the artifact
        stage: &'static str,
        /// Path that was expected to exist
        path: PathBuf,
    },
    /// A transform failed to preserve channel identity or order
    ChannelIdentityViolation {
        /// Stage where the violation was detected
        stage: &'static str,
        /// Description of the mismatch
        detail: String,
    },
    /// Interpolation found no good channels to draw from
    NoGoodChannels,
    /// The external sorter raised an error (recoverable at probe scope)
    SorterFailed {
        /// Probe whose sorting failed
        probe: String,
        /// Failure text captured from the sorter
        message: String,
    },
    /// A cleanup step could not remove an intermediate (recoverable)
    CleanupFailed {
        /// Path that could not be removed
        path: PathBuf,
        /// Underlying failure text
        message: String,
    },
    /// The external cluster-quality engine reported a failure
    QualityEngine(String),
    /// Spike times could not be mapped onto the reference clock
    SyncFailure(String),
    /// A diagnostic plot could not be written
    Plot(String),
}

impl PipelineError {
    /// Whether this failure is recovered at probe scope.
    ///
    /// Recoverable failures are logged, the probe is marked failed or the
    /// step abandoned, and sibling probes still run. Everything else
    /// propagates and halts the current session.
    pub fn is_probe_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::SorterFailed { .. } | PipelineError::CleanupFailed { .. }
        )
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Io(e) => write!(f, "IO error: {}", e),
            PipelineError::Json(e) => write!(f, "JSON error: {}", e),
            PipelineError::MalformedMeta { path, detail } => {
                write!(f, "Malformed metadata in {}: {}", path.display(), detail)
            }
            PipelineError::FileSize {
                path,
                expected,
                actual,
            } => write!(
                f,
                "File size mismatch for {}: expected {} bytes, found {}",
                path.display(),
                expected,
                actual
            ),
            PipelineError::NoAcquisitionRun(session) => {
                write!(f, "No ephys data found in {}", session.display())
            }
            PipelineError::MultipleAcquisitionRuns { session, found } => write!(
                f,
                "More than one run found in {} ({}), not supported",
                session.display(),
                found
            ),
            PipelineError::MissingArtifact { stage, path } => {
                write!(f, "Missing file for {} stage: {}", stage, path.display())
            }
            PipelineError::ChannelIdentityViolation { stage, detail } => {
                write!(f, "Channel identity violated in {} stage: {}", stage, detail)
            }
            PipelineError::NoGoodChannels => {
                write!(f, "No good channels available for interpolation")
            }
            PipelineError::SorterFailed { probe, message } => {
                write!(f, "Spike sorter failed on {}: {}", probe, message)
            }
            PipelineError::CleanupFailed { path, message } => {
                write!(f, "Could not remove {}: {}", path.display(), message)
            }
            PipelineError::QualityEngine(msg) => {
                write!(f, "Cluster quality engine error: {}", msg)
            }
            PipelineError::SyncFailure(msg) => {
                write!(f, "Clock synchronization error: {}", msg)
            }
            PipelineError::Plot(msg) => write!(f, "Diagnostic plot error: {}", msg),
        }
    }
}

impl Error for PipelineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PipelineError::Io(e) => Some(e),
            PipelineError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipelineError {
    fn from(error: io::Error) -> Self {
        PipelineError::Io(error)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::Json(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn recording_with_shanks(shanks: &[u32]) -> Recording {
        let channels = shanks
            .iter()
            .enumerate()
            .map(|(i, &shank)| ChannelInfo {
                id: format!("AP{}", i),
                shank,
                x: 0.0,
                y: i as f32 * 20.0,
                adc_phase: 0.0,
            })
            .collect::<Vec<_>>();
        let data = Array2::zeros((shanks.len(), 10));
        Recording {
            channels,
            data,
            sample_rate: 30_000.0,
        }
    }

    #[test]
    fn interpolation_targets_are_the_union() {
        let mut bad = BadChannels::default();
        bad.dead.insert("AP0".to_string());
        bad.noisy.insert("AP1".to_string());
        bad.noisy.insert("AP0".to_string()); // double-classified
        bad.outside_brain.insert("AP2".to_string());

        let targets = bad.interpolation_targets();
        assert_eq!(targets.len(), 3);
        assert!(targets.contains("AP0"));
        assert!(targets.contains("AP1"));
        assert!(targets.contains("AP2"));
    }

    #[test]
    fn terminal_states() {
        assert!(ProbeState::Done.is_terminal());
        assert!(ProbeState::SortingFailed.is_terminal());
        assert!(!ProbeState::Sorted.is_terminal());
        assert!(!ProbeState::NotStarted.is_terminal());
    }

    #[test]
    fn shank_labels_are_sorted_and_distinct() {
        let rec = recording_with_shanks(&[1, 0, 1, 0, 2]);
        assert_eq!(rec.shank_labels(), vec![0, 1, 2]);
    }

    #[test]
    fn recoverable_split() {
        let sorter = PipelineError::SorterFailed {
            probe: "probe00".to_string(),
            message: "oom".to_string(),
        };
        assert!(sorter.is_probe_recoverable());
        assert!(!PipelineError::NoGoodChannels.is_probe_recoverable());
    }
}
