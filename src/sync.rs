//! Digital synchronization events and clock alignment.
//!
//! The session's sync stream carries a digital word whose bits are the
//! wired synchronization lines. Edges on every line are extracted once per
//! session and persisted as three parallel NPY arrays; rising edges are the
//! canonical pulse times and are additionally written out per line under
//! the logical names from the wiring document (the reference line excepted).
//!
//! Each probe stream carries its own copy of the reference pulse train; the
//! reconciler pairs the two trains to map spike times from the probe's
//! local sample clock onto the shared reference clock.

use log::{info, warn};
use std::path::Path;

use crate::config::{WiringConfig, REFERENCE_LINE};
use crate::npy;
use crate::recording;
use crate::types::{PipelineError, SyncEvent};

/// Persisted event times (seconds) for the session's sync stream.
pub const SYNC_TIMES_FILE: &str = "_sync.times.npy";
/// Persisted line numbers, parallel to the times array.
pub const SYNC_CHANNELS_FILE: &str = "_sync.channels.npy";
/// Persisted polarities (+1 rising, -1 falling), parallel to the times.
pub const SYNC_POLARITIES_FILE: &str = "_sync.polarities.npy";
/// Per-probe pulse times extracted from the probe's own sync line.
pub const PROBE_PULSES_FILE: &str = "_sync.pulses.npy";

/// Extracts every edge on every bit of a digital word sequence.
///
/// Events are returned in time order; lines idle at the first sample's
/// level, so the first sample itself never produces an event.
pub fn extract_sync_events(word: &[u16], sample_rate: f64) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    if word.is_empty() {
        return events;
    }
    let mut previous = word[0];
    for (t, &current) in word.iter().enumerate().skip(1) {
        let changed = previous ^ current;
        if changed != 0 {
            for line in 0..16u32 {
                let mask = 1u16 << line;
                if changed & mask != 0 {
                    events.push(SyncEvent {
                        channel: line,
                        time: t as f64 / sample_rate,
                        polarity: if current & mask != 0 { 1 } else { -1 },
                    });
                }
            }
        }
        previous = current;
    }
    events
}

/// Rising-edge times for one line, in seconds.
pub fn rising_edges(events: &[SyncEvent], channel: u32) -> Vec<f64> {
    events
        .iter()
        .filter(|e| e.channel == channel && e.polarity == 1)
        .map(|e| e.time)
        .collect()
}

/// Writes the three parallel sync arrays into the raw data directory.
pub fn write_sync_arrays(raw_dir: &Path, events: &[SyncEvent]) -> Result<(), PipelineError> {
    let times: Vec<f64> = events.iter().map(|e| e.time).collect();
    let channels: Vec<i64> = events.iter().map(|e| e.channel as i64).collect();
    let polarities: Vec<i64> = events.iter().map(|e| e.polarity as i64).collect();
    npy::save_f64(raw_dir.join(SYNC_TIMES_FILE), &times)?;
    npy::save_i64(raw_dir.join(SYNC_CHANNELS_FILE), &channels)?;
    npy::save_i64(raw_dir.join(SYNC_POLARITIES_FILE), &polarities)?;
    Ok(())
}

/// Loads the persisted sync arrays back into events.
pub fn load_sync_arrays(raw_dir: &Path) -> Result<Vec<SyncEvent>, PipelineError> {
    let times_path = raw_dir.join(SYNC_TIMES_FILE);
    if !times_path.is_file() {
        return Err(PipelineError::MissingArtifact {
            stage: "synchronize",
            path: times_path,
        });
    }
    let times = npy::load_f64(&times_path)?;
    let channels = npy::load_i64(raw_dir.join(SYNC_CHANNELS_FILE))?;
    let polarities = npy::load_i64(raw_dir.join(SYNC_POLARITIES_FILE))?;
    if times.len() != channels.len() || times.len() != polarities.len() {
        return Err(PipelineError::SyncFailure(
            "sync arrays have mismatched lengths".to_string(),
        ));
    }
    Ok(times
        .into_iter()
        .zip(channels)
        .zip(polarities)
        .map(|((time, channel), polarity)| SyncEvent {
            channel: channel as u32,
            time,
            polarity: polarity as i8,
        })
        .collect())
}

/// Extracts the session sync stream and persists its event arrays.
pub fn extract_session_sync(raw_dir: &Path) -> Result<Vec<SyncEvent>, PipelineError> {
    let stream = recording::load_sync_stream(raw_dir)?;
    let events = extract_sync_events(&stream.digital_word, stream.sample_rate);
    info!("Extracted {} sync events", events.len());
    write_sync_arrays(raw_dir, &events)?;
    Ok(events)
}

/// Writes one rising-edge time file per wired line into the session root.
///
/// Lines are keyed by their logical name from the wiring document; the
/// reference line is excluded because its pulses exist only to align
/// clocks, not as experimental events.
pub fn write_line_event_files(
    session_dir: &Path,
    wiring: &WiringConfig,
    events: &[SyncEvent],
) -> Result<usize, PipelineError> {
    let mut written = 0usize;
    for (line_name, logical_name) in &wiring.sync_wiring_digital {
        if logical_name == REFERENCE_LINE {
            continue;
        }
        let Some(line) = WiringConfig::line_number(line_name) else {
            warn!("Cannot parse line number from wiring key '{}'", line_name);
            continue;
        };
        let pulses = rising_edges(events, line);
        npy::save_f64(
            session_dir.join(format!("{}.times.npy", logical_name)),
            &pulses,
        )?;
        written += 1;
    }
    Ok(written)
}

/// Reference pulse times of the session stream (rising edges of the line
/// whose logical name is the reference).
pub fn reference_pulses(
    wiring: &WiringConfig,
    events: &[SyncEvent],
) -> Result<Vec<f64>, PipelineError> {
    let line = wiring
        .sync_wiring_digital
        .iter()
        .find(|(_, logical)| logical.as_str() == REFERENCE_LINE)
        .and_then(|(name, _)| WiringConfig::line_number(name))
        .ok_or_else(|| {
            PipelineError::SyncFailure(format!(
                "wiring document has no '{}' line",
                REFERENCE_LINE
            ))
        })?;
    Ok(rising_edges(events, line))
}

/// Extracts the probe's own pulse train and persists it beside the raw data.
pub fn extract_probe_pulses(probe_dir: &Path) -> Result<Vec<f64>, PipelineError> {
    let word = recording::load_probe_sync_line(probe_dir)?;
    let sample_rate = recording::probe_sample_rate(probe_dir)?;
    let events = extract_sync_events(&word, sample_rate);
    let pulses = rising_edges(&events, 0);
    npy::save_f64(probe_dir.join(PROBE_PULSES_FILE), &pulses)?;
    Ok(pulses)
}

/// Maps times from the probe clock onto the reference clock.
///
/// Pulse trains are paired one to one and times are interpolated piecewise
/// linearly between pairs; times outside the pulse range extrapolate along
/// the nearest segment. A count mismatch is tolerated by truncating to the
/// shorter train (the tail pulses of a longer recording have no partner).
pub fn map_to_reference_clock(
    times: &[f64],
    probe_pulses: &[f64],
    ref_pulses: &[f64],
) -> Result<Vec<f64>, PipelineError> {
    let n = probe_pulses.len().min(ref_pulses.len());
    if n < 2 {
        return Err(PipelineError::SyncFailure(format!(
            "need at least two paired pulses, have {}",
            n
        )));
    }
    if probe_pulses.len() != ref_pulses.len() {
        warn!(
            "Pulse count mismatch (probe {}, reference {}); truncating",
            probe_pulses.len(),
            ref_pulses.len()
        );
    }
    let probe = &probe_pulses[..n];
    let reference = &ref_pulses[..n];

    let mapped = times
        .iter()
        .map(|&t| {
            // Index of the segment [i, i+1] containing t.
            let i = match probe.binary_search_by(|p| {
                p.partial_cmp(&t).unwrap_or(std::cmp::Ordering::Less)
            }) {
                Ok(exact) => exact.min(n - 2),
                Err(0) => 0,
                Err(after) => (after - 1).min(n - 2),
            };
            let span = probe[i + 1] - probe[i];
            if span <= 0.0 {
                return Err(PipelineError::SyncFailure(
                    "probe pulses are not strictly increasing".to_string(),
                ));
            }
            let fraction = (t - probe[i]) / span;
            Ok(reference[i] + fraction * (reference[i + 1] - reference[i]))
        })
        .collect::<Result<Vec<f64>, PipelineError>>()?;
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn word_from_bits(bits: &[(usize, u32)], len: usize) -> Vec<u16> {
        // bits: (sample index, line) pairs at which the line toggles.
        let mut word = vec![0u16; len];
        let mut state = 0u16;
        let mut toggles: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        for &(t, line) in bits {
            toggles.entry(t).or_default().push(line);
        }
        for (t, value) in word.iter_mut().enumerate() {
            if let Some(lines) = toggles.get(&t) {
                for &line in lines {
                    state ^= 1 << line;
                }
            }
            *value = state;
        }
        word
    }

    #[test]
    fn extracts_edges_with_polarity() {
        // Line 2 rises at sample 10, falls at 20; line 0 rises at 15.
        let word = word_from_bits(&[(10, 2), (20, 2), (15, 0)], 30);
        let events = extract_sync_events(&word, 1_000.0);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].channel, 2);
        assert_eq!(events[0].polarity, 1);
        assert!((events[0].time - 0.010).abs() < 1e-12);
        assert_eq!(events[1].channel, 0);
        assert_eq!(events[1].polarity, 1);
        assert_eq!(events[2].channel, 2);
        assert_eq!(events[2].polarity, -1);
    }

    #[test]
    fn only_rising_edges_reach_line_files() {
        let word = word_from_bits(&[(5, 1), (10, 1), (15, 1), (20, 1)], 30);
        let events = extract_sync_events(&word, 1_000.0);

        let mut wiring_map = BTreeMap::new();
        wiring_map.insert("D1".to_string(), "lick_detector".to_string());
        wiring_map.insert("D0".to_string(), REFERENCE_LINE.to_string());
        let wiring = WiringConfig {
            system: "nidq".to_string(),
            sync_wiring_digital: wiring_map,
        };

        let dir = tempdir().unwrap();
        let written = write_line_event_files(dir.path(), &wiring, &events).unwrap();
        assert_eq!(written, 1);

        let times = npy::load_f64(dir.path().join("lick_detector.times.npy")).unwrap();
        // Two rising edges at samples 5 and 15.
        assert_eq!(times.len(), 2);
        assert!((times[0] - 0.005).abs() < 1e-12);
        assert!((times[1] - 0.015).abs() < 1e-12);

        // No file for the reference line.
        assert!(!dir.path().join(format!("{}.times.npy", REFERENCE_LINE)).exists());
    }

    #[test]
    fn sync_arrays_roundtrip() {
        let word = word_from_bits(&[(3, 0), (7, 0), (9, 4)], 20);
        let events = extract_sync_events(&word, 500.0);
        let dir = tempdir().unwrap();
        write_sync_arrays(dir.path(), &events).unwrap();
        let loaded = load_sync_arrays(dir.path()).unwrap();
        assert_eq!(loaded, events);
    }

    #[test]
    fn clock_mapping_is_linear_between_pulses() {
        let probe = vec![1.0, 2.0, 3.0];
        let reference = vec![11.0, 12.1, 13.2];
        let mapped = map_to_reference_clock(&[1.5, 2.5], &probe, &reference).unwrap();
        assert!((mapped[0] - 11.55).abs() < 1e-12);
        assert!((mapped[1] - 12.65).abs() < 1e-12);
    }

    #[test]
    fn clock_mapping_extrapolates_at_the_ends() {
        let probe = vec![1.0, 2.0];
        let reference = vec![10.0, 12.0];
        let mapped = map_to_reference_clock(&[0.5, 2.5], &probe, &reference).unwrap();
        assert!((mapped[0] - 9.0).abs() < 1e-12);
        assert!((mapped[1] - 13.0).abs() < 1e-12);
    }

    #[test]
    fn clock_mapping_needs_two_pulses() {
        assert!(map_to_reference_clock(&[1.0], &[1.0], &[2.0]).is_err());
    }
}
