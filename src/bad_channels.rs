//! Two-pass statistical bad-channel detection.
//!
//! Pass A runs over the high-pass-filtered signal and labels channels dead
//! or outside the brain; pass B runs over the common-referenced signal and
//! labels channels noisy with a robust MAD criterion. Both passes sample the
//! same seeded chunk so repeated runs classify identically.
//!
//! Classification never discards a channel; the union of the three sets is
//! handed to interpolation and the channel count is preserved downstream.

use log::info;
use ndarray::{Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{BadChannels, PipelineError, Recording};

/// Fixed seed for the chunk sampler, constant across runs.
pub const CLASSIFIER_SEED: u64 = 42;

/// Samples examined per detection pass.
pub const CHUNK_SIZE: usize = 30_000;

// Pass A thresholds.
const DEAD_RMS_RATIO: f64 = 0.2;
const DEAD_SIMILARITY: f64 = 0.3;
const OUTSIDE_SIMILARITY: f64 = 0.4;

// Pass B: a channel is noisy when its sample MAD exceeds the channel-median
// MAD by more than this multiple of the (scaled) MAD of the MADs.
const NOISE_MAD_MULTIPLIER: f64 = 3.0;
const MAD_SCALE: f64 = 1.4826;

/// Extracts one seeded contiguous chunk of samples from a recording.
///
/// The start offset is drawn uniformly with the given seed; recordings
/// shorter than `chunk_size` are returned whole.
pub fn random_data_chunk(rec: &Recording, chunk_size: usize, seed: u64) -> Array2<f32> {
    let n_samples = rec.num_samples();
    if n_samples <= chunk_size {
        return rec.data.clone();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let start = rng.gen_range(0..=n_samples - chunk_size);
    rec.data.slice(s![.., start..start + chunk_size]).to_owned()
}

/// Runs both detection passes and reports the per-class fractions.
///
/// `filtered` feeds pass A (dead / outside-brain), `referenced` feeds
/// pass B (noisy). The two recordings must describe the same channels.
pub fn classify(
    filtered: &Recording,
    referenced: &Recording,
    seed: u64,
) -> Result<BadChannels, PipelineError> {
    if filtered.channel_ids() != referenced.channel_ids() {
        return Err(PipelineError::ChannelIdentityViolation {
            stage: "bad-channel-classification",
            detail: "filtered and referenced recordings disagree on channels".to_string(),
        });
    }

    let mut bad = BadChannels::default();
    detect_dead_and_outside(filtered, seed, &mut bad);
    detect_noisy(referenced, seed, &mut bad);

    let total = filtered.num_channels();
    let (dead_frac, noisy_frac, out_frac) = bad.fractions(total);
    info!(
        "{} ({:.0}%) dead channels",
        bad.dead.len(),
        dead_frac * 100.0
    );
    info!(
        "{} ({:.0}%) channels outside of the brain",
        bad.outside_brain.len(),
        out_frac * 100.0
    );
    info!(
        "{} ({:.0}%) noise channels",
        bad.noisy.len(),
        noisy_frac * 100.0
    );

    Ok(bad)
}

/// Pass A: dead and outside-brain channels from the filtered signal.
fn detect_dead_and_outside(rec: &Recording, seed: u64, bad: &mut BadChannels) {
    let chunk = random_data_chunk(rec, CHUNK_SIZE, seed);
    let n_channels = chunk.shape()[0];
    let n_samples = chunk.shape()[1];
    if n_channels == 0 || n_samples == 0 {
        return;
    }

    // Reference trace: per-sample median over channels.
    let mut reference = Vec::with_capacity(n_samples);
    let mut column = vec![0.0f64; n_channels];
    for t in 0..n_samples {
        for ch in 0..n_channels {
            column[ch] = chunk[[ch, t]] as f64;
        }
        reference.push(median(&mut column));
    }

    let rms: Vec<f64> = (0..n_channels)
        .map(|ch| {
            let row = chunk.slice(s![ch, ..]);
            (row.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / n_samples as f64).sqrt()
        })
        .collect();
    let similarity: Vec<f64> = (0..n_channels)
        .map(|ch| {
            let row: Vec<f64> = chunk.slice(s![ch, ..]).iter().map(|&v| v as f64).collect();
            pearson(&row, &reference)
        })
        .collect();

    let mut rms_sorted = rms.clone();
    let median_rms = median(&mut rms_sorted);

    // Outside-brain: contiguous run of dissimilar channels starting at the
    // top of the probe (largest distance from the tip).
    let mut by_height: Vec<usize> = (0..n_channels).collect();
    by_height.sort_by(|&a, &b| {
        rec.channels[b]
            .y
            .partial_cmp(&rec.channels[a].y)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for &ch in &by_height {
        if similarity[ch] < OUTSIDE_SIMILARITY {
            bad.outside_brain.insert(rec.channels[ch].id.clone());
        } else {
            break;
        }
    }

    for ch in 0..n_channels {
        if bad.outside_brain.contains(&rec.channels[ch].id) {
            continue;
        }
        let low_amplitude = rms[ch] < DEAD_RMS_RATIO * median_rms;
        let decoupled = similarity[ch] < DEAD_SIMILARITY && rms[ch] < median_rms;
        if low_amplitude || decoupled {
            bad.dead.insert(rec.channels[ch].id.clone());
        }
    }
}

/// Pass B: noisy channels from the referenced signal, 3x MAD criterion.
fn detect_noisy(rec: &Recording, seed: u64, bad: &mut BadChannels) {
    let chunk = random_data_chunk(rec, CHUNK_SIZE, seed);
    let n_channels = chunk.shape()[0];
    if n_channels == 0 || chunk.shape()[1] == 0 {
        return;
    }

    let channel_mads: Vec<f64> = (0..n_channels)
        .map(|ch| {
            let mut row: Vec<f64> = chunk.slice(s![ch, ..]).iter().map(|&v| v as f64).collect();
            let med = median(&mut row);
            let mut deviations: Vec<f64> = row.iter().map(|&v| (v - med).abs()).collect();
            median(&mut deviations)
        })
        .collect();

    let mut sorted = channel_mads.clone();
    let med = median(&mut sorted);
    let mut spread_values: Vec<f64> = channel_mads.iter().map(|&v| (v - med).abs()).collect();
    let spread = MAD_SCALE * median(&mut spread_values);

    for ch in 0..n_channels {
        if channel_mads[ch] - med > NOISE_MAD_MULTIPLIER * spread {
            bad.noisy.insert(rec.channels[ch].id.clone());
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
