//! Post-sort reconciliation.
//!
//! Walks one probe's sorter output through the reconciliation stages:
//! raw-data pointer rewrite, export into the per-probe analysis layout,
//! quality-metric merge, and spike-time synchronization onto the reference
//! clock, finishing with cleanup of the sorter's temporary working copy.
//!
//! Export is atomic: everything is assembled in a `.tmp` sibling and
//! renamed into place only once every stage has succeeded, so a crash
//! mid-reconciliation can never leave a canonical output directory that a
//! later run would mistake for finished work. Failures here (other than
//! cleanup) propagate and halt the session; only the sorter invocation
//! upstream is probe-recoverable.

use log::{error, info, warn};
use std::path::{Path, PathBuf};

use crate::config::{Settings, WiringConfig, RAW_DATA_DIR};
use crate::npy;
use crate::quality::{self, ClusterQualityEngine};
use crate::recording;
use crate::sorter::{RECORDING_DAT_FILE, SORTER_OUTPUT_DIR};
use crate::sync;
use crate::types::{PipelineError, ProbeState};

// Files the sorter leaves in its output directory.
const SORTER_SPIKE_TIMES: &str = "spike_times.npy";
const SORTER_SPIKE_CLUSTERS: &str = "spike_clusters.npy";
const SORTER_AMPLITUDES: &str = "amplitudes.npy";
const SORTER_SPIKE_DEPTHS: &str = "spike_depths.npy";
const SORTER_PARAMS_PY: &str = "params.py";

/// Reconciles one probe's sorter output into the analysis layout.
///
/// `on_state` is invoked as reconciliation stages complete so the caller
/// can checkpoint progress. The canonical output directory for the probe
/// appears only on full success.
pub fn reconcile(
    settings: &Settings,
    session_dir: &Path,
    probe_name: &str,
    nidq_wiring: &WiringConfig,
    engine: Option<&mut dyn ClusterQualityEngine>,
    on_state: &mut dyn FnMut(ProbeState) -> Result<(), PipelineError>,
) -> Result<(), PipelineError> {
    let raw_dir = session_dir.join(RAW_DATA_DIR);
    let probe_raw = raw_dir.join(probe_name);
    let bin_path = recording::find_ap_bin(&probe_raw)?;
    let sample_rate = recording::probe_sample_rate(&probe_raw)?;

    // Raw QC is computed once and cached beside the raw data.
    quality::ensure_raw_qc(&probe_raw)?;

    let sorter_dir = probe_raw.join(settings.sorter_dir_name());
    let sorter_out = sorter_dir.join(SORTER_OUTPUT_DIR);
    if !sorter_out.is_dir() {
        return Err(PipelineError::MissingArtifact {
            stage: "reconcile",
            path: sorter_out,
        });
    }

    if let Some(engine) = engine {
        info!("Running cluster quality engine ({})", engine.name());
        let qc_dir = sorter_dir.join("cluster_qc");
        std::fs::create_dir_all(&qc_dir)?;
        engine.evaluate(&sorter_out, &bin_path, &qc_dir)?;
    }

    // Point the sorter's parameter file at the canonical raw binary
    // instead of its temporary working copy.
    rewrite_raw_data_pointer(&sorter_out.join(SORTER_PARAMS_PY), &bin_path)?;

    let alf_dir = session_dir.join(format!("{}{}", probe_name, settings.id_suffix()));
    let tmp_dir = session_dir.join(format!("{}{}.tmp", probe_name, settings.id_suffix()));
    if tmp_dir.exists() {
        warn!("Removing stale export directory {}", tmp_dir.display());
        std::fs::remove_dir_all(&tmp_dir)?;
    }
    std::fs::create_dir_all(&tmp_dir)?;

    let assembled = (|| -> Result<(), PipelineError> {
        let (times_s, clusters) = export_spikes(&sorter_out, &tmp_dir, sample_rate)?;
        copy_cluster_tables(&sorter_out, &tmp_dir)?;
        on_state(ProbeState::Exported)?;

        // Merge quality information: cached raw QC arrays move in, and the
        // spike-train labels are computed from the export itself.
        for artifact in quality::qc_artifacts(&probe_raw)? {
            let file_name = artifact
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            std::fs::rename(&artifact, tmp_dir.join(file_name))?;
        }
        info!("Calculating neuron-level quality metrics..");
        let labels = quality::spike_train_labels(&times_s, &clusters);
        quality::write_cluster_labels(&tmp_dir.join(quality::CLUSTER_LABELS_FILE), &labels)?;

        // Synchronize spike times onto the reference clock.
        let pulses_path = probe_raw.join(sync::PROBE_PULSES_FILE);
        if !pulses_path.is_file() {
            return Err(PipelineError::MissingArtifact {
                stage: "synchronize",
                path: pulses_path,
            });
        }
        let probe_pulses = npy::load_f64(&pulses_path)?;
        let events = sync::load_sync_arrays(&raw_dir)?;
        let ref_pulses = sync::reference_pulses(nidq_wiring, &events)?;
        let synced = sync::map_to_reference_clock(&times_s, &probe_pulses, &ref_pulses)?;
        npy::save_f64(tmp_dir.join("spikes.times.npy"), &synced)?;
        Ok(())
    })();
    if let Err(e) = assembled {
        // Withhold the half-built export so a later run cannot mistake it
        // for finished work.
        let _ = std::fs::remove_dir_all(&tmp_dir);
        return Err(e);
    }

    // Publish: the canonical directory appears in one rename.
    std::fs::rename(&tmp_dir, &alf_dir)?;
    info!("Exported sorting results to {}", alf_dir.display());

    // Reclaim the sorter's working copy of the signal. Failure here is
    // reported and abandoned; the completed stages stand.
    let dat_path = sorter_out.join(RECORDING_DAT_FILE);
    if dat_path.is_file() {
        if let Err(e) = std::fs::remove_file(&dat_path) {
            let err = PipelineError::CleanupFailed {
                path: dat_path,
                message: e.to_string(),
            };
            error!("{}", err);
        }
    }
    Ok(())
}

// Patches the `dat_path` entry of the sorter's parameter file.
fn rewrite_raw_data_pointer(params_path: &Path, raw_bin: &Path) -> Result<(), PipelineError> {
    if !params_path.is_file() {
        return Err(PipelineError::MissingArtifact {
            stage: "path-rewrite",
            path: params_path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(params_path)?;
    let mut rewritten = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("dat_path") {
                rewritten = true;
                format!("dat_path = r'{}'", raw_bin.display())
            } else {
                line.to_string()
            }
        })
        .collect();
    if !rewritten {
        lines.push(format!("dat_path = r'{}'", raw_bin.display()));
    }
    std::fs::write(params_path, lines.join("\n") + "\n")?;
    Ok(())
}

// Converts the sorter's spike arrays into the analysis layout; returns the
// spike times (seconds, probe clock) and cluster assignments for the
// quality and synchronization stages.
fn export_spikes(
    sorter_out: &Path,
    dest: &Path,
    sample_rate: f64,
) -> Result<(Vec<f64>, Vec<u32>), PipelineError> {
    let times_path = sorter_out.join(SORTER_SPIKE_TIMES);
    if !times_path.is_file() {
        return Err(PipelineError::MissingArtifact {
            stage: "export",
            path: times_path,
        });
    }
    let spike_samples = npy::load_i64(&times_path)?;
    let clusters = npy::load_u32(sorter_out.join(SORTER_SPIKE_CLUSTERS))?;
    let amps = npy::load_f64(sorter_out.join(SORTER_AMPLITUDES))?;
    if clusters.len() != spike_samples.len() || amps.len() != spike_samples.len() {
        return Err(PipelineError::MalformedMeta {
            path: sorter_out.to_path_buf(),
            detail: format!(
                "spike arrays disagree on length ({} times, {} clusters, {} amplitudes)",
                spike_samples.len(),
                clusters.len(),
                amps.len()
            ),
        });
    }

    let times_s: Vec<f64> = spike_samples
        .iter()
        .map(|&s| s as f64 / sample_rate)
        .collect();
    npy::save_f64(dest.join("spikes.times.npy"), &times_s)?;
    npy::save_u32(dest.join("spikes.clusters.npy"), &clusters)?;
    npy::save_f64(dest.join("spikes.amps.npy"), &amps)?;

    let depths_path = sorter_out.join(SORTER_SPIKE_DEPTHS);
    if depths_path.is_file() {
        let depths = npy::load_f64(&depths_path)?;
        npy::save_f64(dest.join("spikes.depths.npy"), &depths)?;
    }
    Ok((times_s, clusters))
}

// Copies per-cluster tables (including any the quality engine produced)
// into the export directory.
fn copy_cluster_tables(sorter_out: &Path, dest: &Path) -> Result<(), PipelineError> {
    for entry in std::fs::read_dir(sorter_out)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with("cluster_") && name.ends_with(".tsv") {
                std::fs::copy(&path, dest.join(name))?;
            }
        }
    }
    Ok(())
}

/// The canonical output directory for a probe under a session.
pub fn canonical_output_dir(settings: &Settings, session_dir: &Path, probe_name: &str) -> PathBuf {
    session_dir.join(format!("{}{}", probe_name, settings.id_suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REFERENCE_LINE;
    use crate::types::SyncEvent;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::collections::BTreeMap;
    use std::io::Write;
    use tempfile::tempdir;

    fn test_settings(base: &Path) -> Settings {
        Settings {
            data_folder: base.to_path_buf(),
            spike_sorter: "stub".to_string(),
            identifier: String::new(),
            sorter_command: None,
            run_cluster_qc: false,
            cluster_qc_command: None,
            base_dir: base.to_path_buf(),
        }
    }

    fn test_wiring() -> WiringConfig {
        let mut map = BTreeMap::new();
        map.insert("D0".to_string(), REFERENCE_LINE.to_string());
        map.insert("D1".to_string(), "camera".to_string());
        WiringConfig {
            system: "nidq".to_string(),
            sync_wiring_digital: map,
        }
    }

    fn write_probe_raw(probe_raw: &Path) {
        std::fs::create_dir_all(probe_raw).unwrap();
        let meta = "n_channels=2\nsample_rate=30000\nuv_per_bit=1.0\nhas_sync_line=1\n\
                    channel0=AP0 0 16.0 20.0 0.0\n";
        std::fs::write(probe_raw.join("run1_g0_t0.ap.meta"), meta).unwrap();
        let mut bin = Vec::new();
        for t in 0..100i16 {
            bin.write_i16::<LittleEndian>(t).unwrap();
            bin.write_i16::<LittleEndian>(0).unwrap();
        }
        let mut f = std::fs::File::create(probe_raw.join("run1_g0_t0.ap.bin")).unwrap();
        f.write_all(&bin).unwrap();
    }

    /// Builds a complete sorted-but-unreconciled probe inside a session.
    fn build_session(session: &Path) -> (Settings, WiringConfig) {
        let settings = test_settings(session);
        let wiring = test_wiring();

        let raw_dir = session.join(RAW_DATA_DIR);
        let probe_raw = raw_dir.join("probe00");
        write_probe_raw(&probe_raw);

        // Cached raw QC so reconciliation does not recompute it.
        npy::save_f64(probe_raw.join(quality::RAW_QC_RMS_FILE), &[1.0]).unwrap();

        // Probe pulses at 1 s and 2 s; reference pulses ten seconds later.
        npy::save_f64(probe_raw.join(sync::PROBE_PULSES_FILE), &[1.0, 2.0]).unwrap();
        let events = vec![
            SyncEvent {
                channel: 0,
                time: 11.0,
                polarity: 1,
            },
            SyncEvent {
                channel: 0,
                time: 12.0,
                polarity: 1,
            },
        ];
        sync::write_sync_arrays(&raw_dir, &events).unwrap();

        // Sorter output: three spikes, two clusters.
        let sorter_out = probe_raw.join("stub").join(SORTER_OUTPUT_DIR);
        std::fs::create_dir_all(&sorter_out).unwrap();
        npy::save_i64(sorter_out.join(SORTER_SPIKE_TIMES), &[30_000, 45_000, 60_000]).unwrap();
        npy::save_u32(sorter_out.join(SORTER_SPIKE_CLUSTERS), &[0, 1, 0]).unwrap();
        npy::save_f64(sorter_out.join(SORTER_AMPLITUDES), &[80.0, 95.0, 82.0]).unwrap();
        std::fs::write(
            sorter_out.join(SORTER_PARAMS_PY),
            "dat_path = r'/tmp/recording.dat'\nn_channels_dat = 1\ndtype = 'int16'\n",
        )
        .unwrap();
        std::fs::write(sorter_out.join(RECORDING_DAT_FILE), vec![0u8; 64]).unwrap();
        std::fs::write(sorter_out.join("cluster_info.tsv"), "cluster_id\tch\n0\t0\n").unwrap();

        (settings, wiring)
    }

    #[test]
    fn reconciles_a_sorted_probe() {
        let dir = tempdir().unwrap();
        let session = dir.path();
        let (settings, wiring) = build_session(session);

        let mut states = Vec::new();
        reconcile(&settings, session, "probe00", &wiring, None, &mut |s| {
            states.push(s);
            Ok(())
        })
        .unwrap();

        assert_eq!(states, vec![ProbeState::Exported]);

        let alf = session.join("probe00");
        assert!(alf.is_dir());
        assert!(!session.join("probe00.tmp").exists());

        // Spike times synced onto the reference clock (+10 s).
        let times = npy::load_f64(alf.join("spikes.times.npy")).unwrap();
        assert_eq!(times.len(), 3);
        assert!((times[0] - 11.0).abs() < 1e-9);
        assert!((times[1] - 11.5).abs() < 1e-9);
        assert!((times[2] - 12.0).abs() < 1e-9);

        // Clusters, amplitudes, labels, tables, merged QC.
        assert_eq!(
            npy::load_u32(alf.join("spikes.clusters.npy")).unwrap(),
            vec![0, 1, 0]
        );
        assert!(alf.join("spikes.amps.npy").is_file());
        assert!(alf.join(quality::CLUSTER_LABELS_FILE).is_file());
        assert!(alf.join("cluster_info.tsv").is_file());
        assert!(alf.join(quality::RAW_QC_RMS_FILE).is_file());
        let probe_raw = session.join(RAW_DATA_DIR).join("probe00");
        assert!(!probe_raw.join(quality::RAW_QC_RMS_FILE).exists());

        // Pointer rewritten to the canonical binary, working copy deleted.
        let sorter_out = probe_raw.join("stub").join(SORTER_OUTPUT_DIR);
        let params = std::fs::read_to_string(sorter_out.join(SORTER_PARAMS_PY)).unwrap();
        assert!(params.contains("run1_g0_t0.ap.bin"));
        assert!(!params.contains("/tmp/recording.dat"));
        assert!(params.contains("n_channels_dat = 1"));
        assert!(!sorter_out.join(RECORDING_DAT_FILE).exists());
    }

    #[test]
    fn missing_sorter_output_is_fatal() {
        let dir = tempdir().unwrap();
        let session = dir.path();
        let (settings, wiring) = build_session(session);
        std::fs::remove_dir_all(
            session
                .join(RAW_DATA_DIR)
                .join("probe00")
                .join("stub"),
        )
        .unwrap();

        let result = reconcile(&settings, session, "probe00", &wiring, None, &mut |_| Ok(()));
        match result {
            Err(PipelineError::MissingArtifact { stage, .. }) => assert_eq!(stage, "reconcile"),
            other => panic!("expected MissingArtifact, got {:?}", other),
        }
        // Nothing was published.
        assert!(!session.join("probe00").exists());
    }

    #[test]
    fn failed_sync_leaves_no_canonical_directory() {
        let dir = tempdir().unwrap();
        let session = dir.path();
        let (settings, wiring) = build_session(session);
        // Remove the probe pulse train so synchronization cannot run.
        std::fs::remove_file(
            session
                .join(RAW_DATA_DIR)
                .join("probe00")
                .join(sync::PROBE_PULSES_FILE),
        )
        .unwrap();

        let result = reconcile(&settings, session, "probe00", &wiring, None, &mut |_| Ok(()));
        assert!(result.is_err());
        // The atomic export held back the canonical directory.
        assert!(!session.join("probe00").exists());
    }
}
