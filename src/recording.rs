//! Raw recording adapter.
//!
//! Loads a probe's raw binary stream (`<stem>.ap.bin` + `<stem>.ap.meta`)
//! into a [`Recording`], and the session's synchronization stream
//! (`<stem>.nidq.bin` + meta) into a [`SyncStream`]. This is a narrow,
//! replaceable boundary: the rest of the pipeline only ever sees the
//! in-memory types.
//!
//! The binary format is little-endian `i16`, sample-major interleave (one
//! frame = one sample from every saved channel). The metadata file is plain
//! `key=value` text with one `channelN=` line per saved channel.

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::types::{ChannelInfo, PipelineError, Recording};

// Scaling constant applied to raw integer samples (μV per bit).
const DEFAULT_UV_PER_BIT: f32 = 0.195;

// 64 KiB buffered reads; raw streams run to many gigabytes.
const READ_BUFFER_SIZE: usize = 65536;

/// Parsed contents of a stream metadata file.
#[derive(Debug, Clone)]
struct StreamMeta {
    n_channels: usize,
    sample_rate: f32,
    uv_per_bit: f32,
    /// Whether the last saved channel is the probe's sync line rather than
    /// an electrode channel.
    has_sync_line: bool,
    channels: Vec<ChannelInfo>,
}

/// The session-wide synchronization stream.
///
/// Only the digital word channel is retained; analog channels in the stream
/// are not used by the pipeline.
#[derive(Debug, Clone)]
pub struct SyncStream {
    /// Sampling rate of the sync stream (Hz)
    pub sample_rate: f64,
    /// Digital word per sample; bit `n` is digital line `n`
    pub digital_word: Vec<u16>,
}

/// Finds the single `.ap.bin` file in a probe directory.
pub fn find_ap_bin(probe_dir: &Path) -> Result<PathBuf, PipelineError> {
    find_single_with_suffix(probe_dir, ".ap.bin", "recording-load")
}

/// Finds the single `.ap.meta` file in a probe directory.
pub fn find_ap_meta(probe_dir: &Path) -> Result<PathBuf, PipelineError> {
    find_single_with_suffix(probe_dir, ".ap.meta", "recording-load")
}

fn find_single_with_suffix(
    dir: &Path,
    suffix: &str,
    stage: &'static str,
) -> Result<PathBuf, PipelineError> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.ends_with(suffix) {
                matches.push(path);
            }
        }
    }
    matches.sort();
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(PipelineError::MissingArtifact {
            stage,
            path: dir.join(format!("*{}", suffix)),
        }),
        n => Err(PipelineError::MalformedMeta {
            path: dir.to_path_buf(),
            detail: format!("expected one *{} file, found {}", suffix, n),
        }),
    }
}

/// Loads the probe recording from a directory.
///
/// The returned [`Recording`] contains only electrode channels; if the
/// stream carries a trailing sync line it is excluded here and read
/// separately by [`load_probe_sync_line`].
pub fn load_probe_recording(probe_dir: &Path) -> Result<Recording, PipelineError> {
    let bin_path = find_ap_bin(probe_dir)?;
    let meta_path = find_ap_meta(probe_dir)?;
    let meta = parse_meta(&meta_path)?;

    info!(
        "Loading {} ({} channels at {} Hz)",
        bin_path.display(),
        meta.channels.len(),
        meta.sample_rate
    );

    let n_samples = validated_sample_count(&bin_path, meta.n_channels)?;
    let n_electrodes = meta.channels.len();

    let file = File::open(&bin_path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let mut data = Array2::<f32>::zeros((n_electrodes, n_samples));
    let mut frame = vec![0i16; meta.n_channels];
    for t in 0..n_samples {
        reader.read_i16_into::<LittleEndian>(&mut frame)?;
        for ch in 0..n_electrodes {
            data[[ch, t]] = frame[ch] as f32 * meta.uv_per_bit;
        }
    }

    debug!("Loaded {} samples per channel", n_samples);
    Ok(Recording {
        channels: meta.channels,
        data,
        sample_rate: meta.sample_rate,
    })
}

/// Reads the probe's sync line (last saved channel) as a digital word.
///
/// Returns an error if the stream metadata does not declare a sync line.
pub fn load_probe_sync_line(probe_dir: &Path) -> Result<Vec<u16>, PipelineError> {
    let bin_path = find_ap_bin(probe_dir)?;
    let meta_path = find_ap_meta(probe_dir)?;
    let meta = parse_meta(&meta_path)?;
    if !meta.has_sync_line {
        return Err(PipelineError::MalformedMeta {
            path: meta_path,
            detail: "stream has no sync line".to_string(),
        });
    }

    let n_samples = validated_sample_count(&bin_path, meta.n_channels)?;
    let file = File::open(&bin_path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let mut word = Vec::with_capacity(n_samples);
    let mut frame = vec![0i16; meta.n_channels];
    for _ in 0..n_samples {
        reader.read_i16_into::<LittleEndian>(&mut frame)?;
        word.push(frame[meta.n_channels - 1] as u16);
    }
    Ok(word)
}

/// Sampling rate of the probe stream, from its metadata alone.
pub fn probe_sample_rate(probe_dir: &Path) -> Result<f64, PipelineError> {
    let meta_path = find_ap_meta(probe_dir)?;
    let meta = parse_meta(&meta_path)?;
    Ok(meta.sample_rate as f64)
}

/// Loads the session synchronization stream from the raw data directory.
pub fn load_sync_stream(raw_dir: &Path) -> Result<SyncStream, PipelineError> {
    let bin_path = find_single_with_suffix(raw_dir, ".nidq.bin", "sync-extraction")?;
    let meta_path = find_single_with_suffix(raw_dir, ".nidq.meta", "sync-extraction")?;
    let meta = parse_meta(&meta_path)?;

    info!("Loading sync stream {}", bin_path.display());
    let n_samples = validated_sample_count(&bin_path, meta.n_channels)?;

    let file = File::open(&bin_path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    // The digital word is the last saved channel of the stream.
    let mut digital_word = Vec::with_capacity(n_samples);
    let mut frame = vec![0i16; meta.n_channels];
    for _ in 0..n_samples {
        reader.read_i16_into::<LittleEndian>(&mut frame)?;
        digital_word.push(frame[meta.n_channels - 1] as u16);
    }

    Ok(SyncStream {
        sample_rate: meta.sample_rate as f64,
        digital_word,
    })
}

/// Finds the `.nidq.bin` file of a session's raw data directory.
pub fn find_nidq_bin(raw_dir: &Path) -> Result<PathBuf, PipelineError> {
    find_single_with_suffix(raw_dir, ".nidq.bin", "sync-extraction")
}

// Checks that the binary's size is an exact multiple of the frame size and
// returns the sample count.
fn validated_sample_count(bin_path: &Path, n_channels: usize) -> Result<usize, PipelineError> {
    let actual = std::fs::metadata(bin_path)?.len();
    let frame_bytes = (n_channels as u64) * 2;
    if frame_bytes == 0 || actual % frame_bytes != 0 {
        let frame = frame_bytes.max(1);
        return Err(PipelineError::FileSize {
            path: bin_path.to_path_buf(),
            expected: (actual / frame) * frame,
            actual,
        });
    }
    Ok((actual / frame_bytes) as usize)
}

fn parse_meta(meta_path: &Path) -> Result<StreamMeta, PipelineError> {
    let mut contents = String::new();
    BufReader::new(File::open(meta_path)?).read_to_string(&mut contents)?;

    let malformed = |detail: String| PipelineError::MalformedMeta {
        path: meta_path.to_path_buf(),
        detail,
    };

    let mut n_channels: Option<usize> = None;
    let mut sample_rate: Option<f32> = None;
    let mut uv_per_bit = DEFAULT_UV_PER_BIT;
    let mut has_sync_line = false;
    let mut channels: Vec<(usize, ChannelInfo)> = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| malformed(format!("line without '=': {}", line)))?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "n_channels" => {
                n_channels = Some(
                    value
                        .parse()
                        .map_err(|_| malformed(format!("bad n_channels: {}", value)))?,
                );
            }
            "sample_rate" => {
                sample_rate = Some(
                    value
                        .parse()
                        .map_err(|_| malformed(format!("bad sample_rate: {}", value)))?,
                );
            }
            "uv_per_bit" => {
                uv_per_bit = value
                    .parse()
                    .map_err(|_| malformed(format!("bad uv_per_bit: {}", value)))?;
            }
            "has_sync_line" => {
                has_sync_line = value == "1" || value.eq_ignore_ascii_case("true");
            }
            _ if key.starts_with("channel") => {
                let index: usize = key["channel".len()..]
                    .parse()
                    .map_err(|_| malformed(format!("bad channel key: {}", key)))?;
                channels.push((index, parse_channel_line(value).map_err(malformed)?));
            }
            // Unknown keys are ignored so acquisition software may add its own.
            _ => {}
        }
    }

    let n_channels = n_channels.ok_or_else(|| malformed("missing n_channels".to_string()))?;
    let sample_rate = sample_rate.ok_or_else(|| malformed("missing sample_rate".to_string()))?;

    channels.sort_by_key(|(index, _)| *index);
    for (expected, (index, _)) in channels.iter().enumerate() {
        if *index != expected {
            return Err(malformed(format!(
                "channel indices not contiguous at {}",
                index
            )));
        }
    }
    let channels: Vec<ChannelInfo> = channels.into_iter().map(|(_, info)| info).collect();

    // Electrode channel lines plus an optional trailing sync line must
    // account for every saved channel.
    let expected = channels.len() + usize::from(has_sync_line);
    if !channels.is_empty() && expected != n_channels {
        return Err(malformed(format!(
            "n_channels={} but {} channel lines (sync line: {})",
            n_channels,
            channels.len(),
            has_sync_line
        )));
    }

    Ok(StreamMeta {
        n_channels,
        sample_rate,
        uv_per_bit,
        has_sync_line,
        channels,
    })
}

// A channel line is "id shank x y adc_phase", whitespace separated.
fn parse_channel_line(value: &str) -> Result<ChannelInfo, String> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 channel fields, got {}", fields.len()));
    }
    Ok(ChannelInfo {
        id: fields[0].to_string(),
        shank: fields[1].parse().map_err(|_| "bad shank label".to_string())?,
        x: fields[2].parse().map_err(|_| "bad x position".to_string())?,
        y: fields[3].parse().map_err(|_| "bad y position".to_string())?,
        adc_phase: fields[4].parse().map_err(|_| "bad adc phase".to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;
    use tempfile::tempdir;

    /// Writes a little probe directory: `n_electrodes` channels plus a sync
    /// line, `n_samples` frames. Channel `ch` sample `t` is `ch * 100 + t`;
    /// the sync word flips to 1 halfway through.
    fn write_probe_dir(dir: &Path, n_electrodes: usize, n_samples: usize, shanks: &[u32]) {
        let n_channels = n_electrodes + 1;
        let mut meta = String::new();
        meta.push_str(&format!("n_channels={}\n", n_channels));
        meta.push_str("sample_rate=30000\n");
        meta.push_str("uv_per_bit=1.0\n");
        meta.push_str("has_sync_line=1\n");
        for ch in 0..n_electrodes {
            meta.push_str(&format!(
                "channel{}=AP{} {} 16.0 {} 0.0\n",
                ch,
                ch,
                shanks[ch % shanks.len()],
                ch as f32 * 20.0
            ));
        }
        std::fs::write(dir.join("run1_g0_t0.ap.meta"), meta).unwrap();

        let mut bin = Vec::new();
        for t in 0..n_samples {
            for ch in 0..n_electrodes {
                bin.write_i16::<LittleEndian>((ch * 100 + t) as i16).unwrap();
            }
            let sync = if t >= n_samples / 2 { 1 } else { 0 };
            bin.write_i16::<LittleEndian>(sync).unwrap();
        }
        let mut f = File::create(dir.join("run1_g0_t0.ap.bin")).unwrap();
        f.write_all(&bin).unwrap();
    }

    #[test]
    fn loads_probe_recording() {
        let dir = tempdir().unwrap();
        write_probe_dir(dir.path(), 3, 10, &[0]);

        let rec = load_probe_recording(dir.path()).unwrap();
        assert_eq!(rec.num_channels(), 3);
        assert_eq!(rec.num_samples(), 10);
        assert_eq!(rec.sample_rate, 30_000.0);
        assert_eq!(rec.channels[1].id, "AP1");
        assert_eq!(rec.data[[2, 4]], 204.0);
    }

    #[test]
    fn loads_probe_sync_line() {
        let dir = tempdir().unwrap();
        write_probe_dir(dir.path(), 2, 8, &[0]);

        let word = load_probe_sync_line(dir.path()).unwrap();
        assert_eq!(word.len(), 8);
        assert_eq!(&word[..4], &[0, 0, 0, 0]);
        assert_eq!(&word[4..], &[1, 1, 1, 1]);
    }

    #[test]
    fn rejects_truncated_binary() {
        let dir = tempdir().unwrap();
        write_probe_dir(dir.path(), 2, 8, &[0]);
        // Chop one byte off the binary.
        let bin = dir.path().join("run1_g0_t0.ap.bin");
        let bytes = std::fs::read(&bin).unwrap();
        std::fs::write(&bin, &bytes[..bytes.len() - 1]).unwrap();

        match load_probe_recording(dir.path()) {
            Err(PipelineError::FileSize { .. }) => {}
            other => panic!("expected FileSize error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_meta() {
        let dir = tempdir().unwrap();
        write_probe_dir(dir.path(), 2, 4, &[0]);
        std::fs::remove_file(dir.path().join("run1_g0_t0.ap.meta")).unwrap();
        assert!(load_probe_recording(dir.path()).is_err());
    }
}
