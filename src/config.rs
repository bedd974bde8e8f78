//! Configuration documents for the pipeline.
//!
//! Everything is loaded once at startup into an explicit [`Settings`] value
//! and passed by reference into the work queue and the components; no
//! component performs ambient configuration lookups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::types::PipelineError;

/// File name of the optional per-probe notch configuration.
pub const NOTCH_CONFIG_FILE: &str = "notch_filter.json";

/// Zero-byte sentinel that marks a session as ready for processing.
pub const WORK_MARKER: &str = "process_me.flag";

/// Name of the raw data directory inside a session.
pub const RAW_DATA_DIR: &str = "raw_ephys_data";

/// Logical name of the digital line used as the cross-probe reference.
///
/// The line carrying this name in the wiring document is the shared clock;
/// no per-line event-time file is emitted for it.
pub const REFERENCE_LINE: &str = "imec_sync";

/// Operator settings for a pipeline run.
///
/// Loaded from a JSON document; the directory containing the document also
/// anchors the wiring and sorter-parameter files.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root directory scanned for sessions carrying a work marker
    #[serde(rename = "DATA_FOLDER")]
    pub data_folder: PathBuf,
    /// Name of the spike sorter to run
    #[serde(rename = "SPIKE_SORTER")]
    pub spike_sorter: String,
    /// Optional run identifier appended to output directory names
    #[serde(rename = "IDENTIFIER", default)]
    pub identifier: String,
    /// Executable invoked by the external sorter wrapper
    #[serde(rename = "SORTER_COMMAND", default)]
    pub sorter_command: Option<PathBuf>,
    /// Whether the external cluster-quality engine runs after sorting
    #[serde(rename = "RUN_CLUSTER_QC", default)]
    pub run_cluster_qc: bool,
    /// Executable of the cluster-quality engine
    #[serde(rename = "CLUSTER_QC_COMMAND", default)]
    pub cluster_qc_command: Option<PathBuf>,

    /// Directory the settings document was loaded from (not serialized)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Settings {
    /// Loads settings from a JSON document.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings, PipelineError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut settings: Settings = serde_json::from_reader(reader)?;
        settings.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(settings)
    }

    /// Suffix appended to per-run output names ("_<identifier>" or empty).
    pub fn id_suffix(&self) -> String {
        if self.identifier.is_empty() {
            String::new()
        } else {
            format!("_{}", self.identifier)
        }
    }

    /// Name of the sorter output directory inside a probe's raw directory.
    pub fn sorter_dir_name(&self) -> String {
        format!("{}{}", self.spike_sorter, self.id_suffix())
    }

    /// Path of the wiring document for the given stream system.
    pub fn wiring_path(&self, system: &str) -> PathBuf {
        self.base_dir
            .join("wiring_files")
            .join(format!("{}.wiring.json", system))
    }

    /// Path of the operator parameter document for the configured sorter.
    pub fn sorter_params_path(&self) -> PathBuf {
        self.base_dir
            .join("spikesorter_param_files")
            .join(format!("{}_params.json", self.spike_sorter))
    }
}

/// Mapping of synchronization lines to logical channel names.
///
/// Written verbatim beside each raw stream before processing begins, so the
/// recorded data stays interpretable without this repository's checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiringConfig {
    /// Acquisition system the wiring applies to (e.g. "nidq", "3B")
    #[serde(rename = "SYSTEM")]
    pub system: String,
    /// Digital line name -> logical channel name
    #[serde(rename = "SYNC_WIRING_DIGITAL")]
    pub sync_wiring_digital: BTreeMap<String, String>,
}

impl WiringConfig {
    /// Loads a wiring document.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<WiringConfig, PipelineError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes this wiring document beside a raw stream file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Digital line number encoded in a wiring key (trailing digits).
    pub fn line_number(line_name: &str) -> Option<u32> {
        let digits: String = line_name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

/// Optional per-probe notch filter configuration.
///
/// `freq` and `q` are paired positionally; filters are applied strictly in
/// document order, each operating on the previous filter's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotchConfig {
    /// Center frequencies (Hz)
    #[serde(rename = "FREQ")]
    pub freq: Vec<f64>,
    /// Quality factor for each frequency
    #[serde(rename = "Q")]
    pub q: Vec<f64>,
}

impl NotchConfig {
    /// (frequency, quality-factor) pairs in application order.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.freq.iter().copied().zip(self.q.iter().copied())
    }
}

/// Loads the notch configuration for a probe, if one exists.
///
/// Absence is not an error; it means the notch stage is a no-op.
pub fn load_notch_config(probe_dir: &Path) -> Result<Option<NotchConfig>, PipelineError> {
    let path = probe_dir.join(NOTCH_CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(&path)?);
    Ok(Some(serde_json::from_reader(reader)?))
}

/// Sorter-specific tunables passed through to the sorter invocation.
pub type SorterParams = serde_json::Map<String, serde_json::Value>;

/// Resolves the sorter parameter set: the operator document if present,
/// otherwise the sorter's published defaults.
pub fn resolve_sorter_params(
    settings: &Settings,
    defaults: SorterParams,
) -> Result<SorterParams, PipelineError> {
    let path = settings.sorter_params_path();
    if path.is_file() {
        let reader = BufReader::new(File::open(&path)?);
        Ok(serde_json::from_reader(reader)?)
    } else {
        Ok(defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn settings_load_and_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"DATA_FOLDER": "/data", "SPIKE_SORTER": "kilosort4", "IDENTIFIER": "run2"}"#,
        )
        .unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.id_suffix(), "_run2");
        assert_eq!(settings.sorter_dir_name(), "kilosort4_run2");
        assert_eq!(settings.base_dir, dir.path());
        assert!(!settings.run_cluster_qc);
    }

    #[test]
    fn empty_identifier_has_no_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"DATA_FOLDER": "/data", "SPIKE_SORTER": "ks"}"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.id_suffix(), "");
        assert_eq!(settings.sorter_dir_name(), "ks");
    }

    #[test]
    fn notch_config_absent_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_notch_config(dir.path()).unwrap().is_none());
    }

    #[test]
    fn notch_pairs_zip_positionally() {
        let notch = NotchConfig {
            freq: vec![50.0, 150.0],
            q: vec![30.0, 20.0],
        };
        let pairs: Vec<_> = notch.pairs().collect();
        assert_eq!(pairs, vec![(50.0, 30.0), (150.0, 20.0)]);
    }

    #[test]
    fn wiring_line_numbers() {
        assert_eq!(WiringConfig::line_number("D3"), Some(3));
        assert_eq!(WiringConfig::line_number("XD12"), Some(12));
        assert_eq!(WiringConfig::line_number("none"), None);
    }
}
