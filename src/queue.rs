//! Session/probe work queue.
//!
//! Scans the data root for session work markers, normalizes each session's
//! raw directory layout, and drives every probe through conditioning,
//! sorting, and reconciliation. Resumability rests on an explicit per-
//! session state file (probe name -> state + timestamp, replaced atomically
//! on every transition); a pre-existing canonical output directory is also
//! honored as done, so sessions processed before the state file existed
//! resume correctly. The work marker is deleted only when every enumerated
//! probe has reached a terminal state.
//!
//! Failure scope: a sorter error is isolated to its probe; layout errors
//! skip the whole session without mutating it; anything else halts the
//! current session (the marker stays, so a re-run retries) and the queue
//! moves on to the next session.

use chrono::{Local, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::conditioning;
use crate::config::{
    self, load_notch_config, Settings, WiringConfig, RAW_DATA_DIR, WORK_MARKER,
};
use crate::diagnostics;
use crate::quality::{ClusterQualityEngine, ExternalQualityEngine};
use crate::reconcile;
use crate::recording;
use crate::sorter::{self, SpikeSorter, SortingOutcome};
use crate::sync;
use crate::types::{PipelineError, ProbeState};
use crate::bad_channels::CLASSIFIER_SEED;

/// Per-session probe state file.
pub const STATE_FILE: &str = "pipeline_state.json";

// Diagnostic plot names, written into the probe's raw directory.
const PSD_PLOT: &str = "power_spectral_density.png";
const PSD_PLOT_AFTER_NOTCH: &str = "power_spectral_density_after_notch.png";

/// One persisted probe state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Last state the probe reached
    pub state: ProbeState,
    /// RFC 3339 timestamp of the transition
    pub updated: String,
}

/// The explicit per-session state store.
///
/// Replaces the directory-existence convention as the primary resume
/// record. Every transition rewrites the file atomically (temp sibling +
/// rename) so a crash can never leave it half-written.
#[derive(Debug)]
pub struct SessionStateStore {
    path: PathBuf,
    records: BTreeMap<String, ProbeRecord>,
}

impl SessionStateStore {
    /// Loads the store for a session; a missing file is an empty store.
    pub fn load(session_dir: &Path) -> Result<SessionStateStore, PipelineError> {
        let path = session_dir.join(STATE_FILE);
        let records = if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        Ok(SessionStateStore { path, records })
    }

    /// Last recorded state of a probe.
    pub fn get(&self, probe: &str) -> Option<ProbeState> {
        self.records.get(probe).map(|r| r.state)
    }

    /// Records a transition and persists the store.
    pub fn set(&mut self, probe: &str, state: ProbeState) -> Result<(), PipelineError> {
        self.records.insert(
            probe.to_string(),
            ProbeRecord {
                state,
                updated: Utc::now().to_rfc3339(),
            },
        );
        self.persist()
    }

    fn persist(&self) -> Result<(), PipelineError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Finds every session below `root` that carries the work marker.
pub fn discover_sessions(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut sessions = Vec::new();
    walk_for_marker(root, &mut sessions)?;
    sessions.sort();
    Ok(sessions)
}

fn walk_for_marker(dir: &Path, sessions: &mut Vec<PathBuf>) -> Result<(), PipelineError> {
    if !dir.is_dir() {
        return Ok(());
    }
    if dir.join(WORK_MARKER).is_file() {
        sessions.push(dir.to_path_buf());
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_for_marker(&path, sessions)?;
        }
    }
    Ok(())
}

/// Normalizes a session's raw directory layout.
///
/// Acquisition software nests everything inside a single run directory and
/// names probe folders after the acquisition device; this hoists the run's
/// contents up one level and renames `*imec<N>` directories to the
/// canonical `probe0<N>`. Sessions with zero or more than one run are
/// rejected without mutating anything.
pub fn normalize_session_layout(session: &Path) -> Result<(), PipelineError> {
    let raw = session.join(RAW_DATA_DIR);
    if !raw.is_dir() {
        return Err(PipelineError::NoAcquisitionRun(session.to_path_buf()));
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(&raw)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();

    // Already normalized.
    if entries.iter().any(|p| {
        p.is_dir()
            && p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("probe"))
    }) {
        return Ok(());
    }

    let run_dirs: Vec<&PathBuf> = entries.iter().filter(|p| p.is_dir()).collect();
    if run_dirs.is_empty() {
        return Err(PipelineError::NoAcquisitionRun(session.to_path_buf()));
    }
    if run_dirs.len() > 1 {
        return Err(PipelineError::MultipleAcquisitionRuns {
            session: session.to_path_buf(),
            found: run_dirs.len(),
        });
    }

    // Hoist the single run's contents up into the raw directory.
    let run_dir = run_dirs[0];
    for entry in std::fs::read_dir(run_dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        std::fs::rename(&path, raw.join(name))?;
    }
    std::fs::remove_dir(run_dir)?;

    // Canonical probe names.
    for entry in std::fs::read_dir(&raw)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.contains("imec") {
            if let Some(digit) = name.chars().last().filter(|c| c.is_ascii_digit()) {
                std::fs::rename(&path, raw.join(format!("probe0{}", digit)))?;
            }
        }
    }
    Ok(())
}

/// Probe directory names under a session's raw data directory, sorted.
pub fn enumerate_probes(session: &Path) -> Result<Vec<String>, PipelineError> {
    let raw = session.join(RAW_DATA_DIR);
    let mut probes = Vec::new();
    for entry in std::fs::read_dir(&raw)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("probe") {
                    probes.push(name.to_string());
                }
            }
        }
    }
    probes.sort();
    Ok(probes)
}

/// Counters and failure reports for one queue run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub sessions_seen: usize,
    pub sessions_completed: usize,
    pub probes_done: usize,
    pub probes_failed: usize,
    /// Fatal session errors, with enough context to diagnose and re-run
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct SessionOutcome {
    probes_done: usize,
    probes_failed: usize,
    completed: bool,
}

/// The orchestration loop over sessions and probes.
pub struct Pipeline<'a> {
    settings: &'a Settings,
    sorter: &'a dyn SpikeSorter,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings, sorter: &'a dyn SpikeSorter) -> Pipeline<'a> {
        Pipeline { settings, sorter }
    }

    /// Runs the queue once over every discovered session.
    ///
    /// The cluster-quality engine, when enabled, is acquired before the
    /// first session and released on every exit path.
    pub fn run(&self) -> Result<RunSummary, PipelineError> {
        let mut engine: Option<Box<dyn ClusterQualityEngine>> = if self.settings.run_cluster_qc {
            let command = self.settings.cluster_qc_command.as_ref().ok_or(
                PipelineError::MissingArtifact {
                    stage: "cluster-quality-engine",
                    path: PathBuf::from("CLUSTER_QC_COMMAND"),
                },
            )?;
            Some(Box::new(ExternalQualityEngine::start(command)?))
        } else {
            None
        };

        let result = self.run_sessions(&mut engine);
        if let Some(engine) = engine {
            engine.shutdown();
        }
        result
    }

    fn run_sessions(
        &self,
        engine: &mut Option<Box<dyn ClusterQualityEngine>>,
    ) -> Result<RunSummary, PipelineError> {
        info!("Looking for {}..", WORK_MARKER);
        let sessions = discover_sessions(&self.settings.data_folder)?;
        let mut summary = RunSummary::default();

        for session in sessions {
            summary.sessions_seen += 1;
            match self.process_session(&session, engine) {
                Ok(outcome) => {
                    summary.probes_done += outcome.probes_done;
                    summary.probes_failed += outcome.probes_failed;
                    if outcome.completed {
                        summary.sessions_completed += 1;
                    }
                }
                Err(
                    e @ (PipelineError::NoAcquisitionRun(_)
                    | PipelineError::MultipleAcquisitionRuns { .. }),
                ) => {
                    // Layout errors: report and skip, nothing was mutated.
                    warn!("{}", e);
                }
                Err(e) => {
                    // Fatal for this session; the marker stays so a re-run
                    // picks it back up.
                    error!("Session {} halted: {}", session.display(), e);
                    summary.errors.push(format!("{}: {}", session.display(), e));
                }
            }
        }
        Ok(summary)
    }

    fn process_session(
        &self,
        session: &Path,
        engine: &mut Option<Box<dyn ClusterQualityEngine>>,
    ) -> Result<SessionOutcome, PipelineError> {
        info!(
            "Starting pipeline in {} at {}",
            session.display(),
            Local::now().format("%H:%M")
        );

        normalize_session_layout(session)?;
        let raw_dir = session.join(RAW_DATA_DIR);

        // Wiring documents are written verbatim beside each raw stream.
        let nidq_wiring = WiringConfig::load(self.settings.wiring_path("nidq"))?;
        let probe_wiring = WiringConfig::load(self.settings.wiring_path(&nidq_wiring.system))?;
        let nidq_bin = recording::find_nidq_bin(&raw_dir)?;
        nidq_wiring.write(wiring_sibling(&nidq_bin))?;

        let probes = enumerate_probes(session)?;
        for probe_name in &probes {
            let ap_bin = recording::find_ap_bin(&raw_dir.join(probe_name))?;
            probe_wiring.write(wiring_sibling(&ap_bin))?;
        }

        // Session sync events and per-line rising-edge files.
        let events = sync::extract_session_sync(&raw_dir)?;
        sync::write_line_event_files(session, &nidq_wiring, &events)?;

        let mut store = SessionStateStore::load(session)?;
        let mut outcome = SessionOutcome::default();

        for probe_name in &probes {
            info!("\nStarting preprocessing of {}", probe_name);

            // Resume: the state record is primary, a pre-existing canonical
            // output directory is honored the same way.
            if store.get(probe_name) == Some(ProbeState::Done) {
                info!("Probe already processed, moving on");
                outcome.probes_done += 1;
                continue;
            }
            if reconcile::canonical_output_dir(self.settings, session, probe_name).is_dir() {
                info!("Probe already processed, moving on");
                store.set(probe_name, ProbeState::Done)?;
                outcome.probes_done += 1;
                continue;
            }

            match self.process_probe(session, probe_name, &nidq_wiring, engine, &mut store)? {
                SortingOutcome::Completed => outcome.probes_done += 1,
                SortingOutcome::Failed => outcome.probes_failed += 1,
            }
        }

        // The marker goes away only when every probe is terminal.
        let all_terminal = probes
            .iter()
            .all(|p| store.get(p).is_some_and(ProbeState::is_terminal));
        if all_terminal && !probes.is_empty() {
            std::fs::remove_file(session.join(WORK_MARKER))?;
            info!("All probes terminal, removed {}", WORK_MARKER);
            outcome.completed = true;
        } else if probes.is_empty() {
            warn!("No probes found in {}", session.display());
        } else {
            info!("Probes remain unfinished; marker kept for a re-run");
        }

        Ok(outcome)
    }

    fn process_probe(
        &self,
        session: &Path,
        probe_name: &str,
        nidq_wiring: &WiringConfig,
        engine: &mut Option<Box<dyn ClusterQualityEngine>>,
        store: &mut SessionStateStore,
    ) -> Result<SortingOutcome, PipelineError> {
        let probe_dir = session.join(RAW_DATA_DIR).join(probe_name);

        // Probe pulse train, persisted for the reconciler.
        sync::extract_probe_pulses(&probe_dir)?;
        store.set(probe_name, ProbeState::Synced)?;

        // Signal conditioning.
        let raw = recording::load_probe_recording(&probe_dir)?;
        let conditioned = conditioning::condition(&raw, CLASSIFIER_SEED)?;
        diagnostics::report_spectral_density(&conditioned.recording, &probe_dir, PSD_PLOT)?;

        let final_rec = match load_notch_config(&probe_dir)? {
            Some(notch) => {
                let notched = conditioning::apply_notch(&conditioned.recording, &notch)?;
                diagnostics::report_spectral_density(&notched, &probe_dir, PSD_PLOT_AFTER_NOTCH)?;
                notched
            }
            None => conditioned.recording,
        };

        // Sorting, isolated to this probe.
        store.set(probe_name, ProbeState::SortingInProgress)?;
        let params = config::resolve_sorter_params(self.settings, self.sorter.default_params())?;
        let outcome = sorter::run_sorter_isolated(
            self.sorter,
            &final_rec,
            &params,
            &probe_dir,
            &self.settings.sorter_dir_name(),
            probe_name,
        )?;
        if outcome == SortingOutcome::Failed {
            store.set(probe_name, ProbeState::SortingFailed)?;
            return Ok(SortingOutcome::Failed);
        }
        store.set(probe_name, ProbeState::Sorted)?;

        // Reconciliation; failures propagate and halt the session.
        let engine_ref: Option<&mut dyn ClusterQualityEngine> =
            engine.as_mut().map(|b| b.as_mut() as &mut dyn ClusterQualityEngine);
        reconcile::reconcile(
            self.settings,
            session,
            probe_name,
            nidq_wiring,
            engine_ref,
            &mut |state| store.set(probe_name, state),
        )?;

        store.set(probe_name, ProbeState::Done)?;
        info!("Done! At {}", Local::now().format("%H:%M"));
        Ok(SortingOutcome::Completed)
    }
}

// `<stem>.nidq.bin` -> `<stem>.nidq.wiring.json`, beside the stream.
fn wiring_sibling(bin_path: &Path) -> PathBuf {
    let name = bin_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.strip_suffix(".bin").unwrap_or(name);
    bin_path.with_file_name(format!("{}.wiring.json", stem))
}
