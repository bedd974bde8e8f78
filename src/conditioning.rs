//! The ordered signal-conditioning chain.
//!
//! Stages run in a fixed, order-dependent sequence: high-pass filter,
//! phase-shift correction (on the filtered signal), common-average
//! referencing (independently on the filtered signal), bad-channel
//! classification over both derivations, interpolation of the flagged
//! channels (on the phase-shifted signal), shank-aware destriping, and
//! finally optional notch filtering. Referencing and phase-shift correction
//! deliberately branch from the same filtered signal instead of chaining,
//! because the classifier needs both variants.
//!
//! Every stage is pure (returns a new [`Recording`]) and preserves channel
//! count, identifiers, order, and sampling rate. Interpolation is the only
//! stage that may alter samples based on cross-channel classification.

use log::info;
use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;

use crate::bad_channels;
use crate::config::NotchConfig;
use crate::destripe;
use crate::filters;
use crate::types::{BadChannels, ConditioningStage, PipelineError, Recording};

/// High-pass cutoff for drift removal (Hz).
pub const HIGHPASS_CUTOFF_HZ: f64 = 300.0;

// Gaussian kernel width for bad-channel interpolation (μm).
const INTERP_SIGMA_UM: f64 = 40.0;

/// Output of the conditioning chain up to and including destriping.
#[derive(Debug, Clone)]
pub struct ConditionedRecording {
    /// The conditioned signal, ready for the optional notch stage / sorting
    pub recording: Recording,
    /// Classification that fed the interpolation stage
    pub bad_channels: BadChannels,
}

/// Runs stages 1-6 of the chain (everything except notch filtering).
pub fn condition(raw: &Recording, seed: u64) -> Result<ConditionedRecording, PipelineError> {
    info!("Applying high-pass filter..");
    let filtered = highpass_filter(raw);
    check_channels(ConditioningStage::HighPass, raw, &filtered)?;

    info!("Correcting for phase shift..");
    let shifted = phase_shift(&filtered);
    check_channels(ConditioningStage::PhaseShift, &filtered, &shifted)?;

    info!("Performing common average referencing..");
    let referenced = common_reference(&filtered);
    check_channels(ConditioningStage::CommonReference, &filtered, &referenced)?;

    info!("Detecting and interpolating over bad channels..");
    let bad = bad_channels::classify(&filtered, &referenced, seed)?;
    let interpolated = interpolate_bad_channels(&shifted, &bad)?;
    check_channels(ConditioningStage::Interpolation, &shifted, &interpolated)?;

    info!("Destriping..");
    let destriped = destripe::destripe(&interpolated)?;
    check_channels(ConditioningStage::Destripe, &interpolated, &destriped)?;

    Ok(ConditionedRecording {
        recording: destriped,
        bad_channels: bad,
    })
}

/// Applies the configured notch filters sequentially (stage 7).
///
/// Each filter operates on the previous filter's output; this is the one
/// intentionally cumulative stage in the chain.
pub fn apply_notch(rec: &Recording, notch: &NotchConfig) -> Result<Recording, PipelineError> {
    let mut current = rec.clone();
    for (freq, q) in notch.pairs() {
        info!("Applying notch filter at {} Hz..", freq);
        let next = notch_filter(&current, freq, q);
        check_channels(ConditioningStage::Notch, &current, &next)?;
        current = next;
    }
    Ok(current)
}

/// High-pass filters every channel (order-4 Butterworth cascade).
pub fn highpass_filter(rec: &Recording) -> Recording {
    let sections = filters::highpass_sections(HIGHPASS_CUTOFF_HZ, rec.sample_rate as f64);
    map_channels(rec, |row| filters::apply_cascade(&sections, row))
}

/// Notch filters every channel at one (frequency, Q) pair.
pub fn notch_filter(rec: &Recording, freq_hz: f64, q: f64) -> Recording {
    let section = filters::notch_section(freq_hz, q, rec.sample_rate as f64);
    map_channels(rec, |row| section.apply(row))
}

/// Aligns channels sampled at different offsets within one acquisition
/// cycle by applying a per-channel fractional delay in the frequency
/// domain.
pub fn phase_shift(rec: &Recording) -> Recording {
    let n = rec.num_samples();
    if n == 0 {
        return rec.clone();
    }
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut out = rec.clone();
    let mut buffer: Vec<Complex<f64>> = Vec::with_capacity(n);
    for (ch, info) in rec.channels.iter().enumerate() {
        let tau = info.adc_phase as f64;
        if tau == 0.0 {
            continue;
        }

        buffer.clear();
        buffer.extend(
            (0..n).map(|t| Complex::new(rec.data[[ch, t]] as f64, 0.0)),
        );
        fft.process(&mut buffer);

        for (k, value) in buffer.iter_mut().enumerate() {
            // Signed frequency index; the Nyquist bin keeps only the real
            // rotation so the output stays real.
            let signed_k = if k <= n / 2 { k as f64 } else { k as f64 - n as f64 };
            let phase = -2.0 * PI * signed_k * tau / n as f64;
            if n % 2 == 0 && k == n / 2 {
                *value *= phase.cos();
            } else {
                *value *= Complex::from_polar(1.0, phase);
            }
        }

        ifft.process(&mut buffer);
        let scale = 1.0 / n as f64;
        for t in 0..n {
            out.data[[ch, t]] = (buffer[t].re * scale) as f32;
        }
    }
    out
}

/// Subtracts the cross-channel average from every sample.
pub fn common_reference(rec: &Recording) -> Recording {
    let n_channels = rec.num_channels();
    let n_samples = rec.num_samples();
    if n_channels == 0 {
        return rec.clone();
    }

    let mut out = rec.clone();
    for t in 0..n_samples {
        let mut average = 0.0f64;
        for ch in 0..n_channels {
            average += rec.data[[ch, t]] as f64;
        }
        average /= n_channels as f64;
        for ch in 0..n_channels {
            out.data[[ch, t]] = (rec.data[[ch, t]] as f64 - average) as f32;
        }
    }
    out
}

/// Replaces every channel in the classification union by a distance-weighted
/// mean of good channels; all other channels pass through untouched.
pub fn interpolate_bad_channels(
    rec: &Recording,
    bad: &BadChannels,
) -> Result<Recording, PipelineError> {
    let targets = bad.interpolation_targets();
    if targets.is_empty() {
        return Ok(rec.clone());
    }

    let good: Vec<usize> = (0..rec.num_channels())
        .filter(|&ch| !targets.contains(&rec.channels[ch].id))
        .collect();
    if good.is_empty() {
        return Err(PipelineError::NoGoodChannels);
    }

    let mut out = rec.clone();
    for target_id in &targets {
        let Some(target) = rec.channel_index(target_id) else {
            // Classified on a recording with the same ids, so this cannot
            // happen unless a transform broke identity upstream.
            return Err(PipelineError::ChannelIdentityViolation {
                stage: "interpolation",
                detail: format!("unknown channel {}", target_id),
            });
        };

        let tx = rec.channels[target].x as f64;
        let ty = rec.channels[target].y as f64;
        let same_shank: Vec<usize> = good
            .iter()
            .copied()
            .filter(|&ch| rec.channels[ch].shank == rec.channels[target].shank)
            .collect();
        let donors = if same_shank.is_empty() { &good } else { &same_shank };

        let mut weights: Vec<(usize, f64)> = donors
            .iter()
            .map(|&ch| {
                let dx = rec.channels[ch].x as f64 - tx;
                let dy = rec.channels[ch].y as f64 - ty;
                let d2 = dx * dx + dy * dy;
                (ch, (-d2 / (2.0 * INTERP_SIGMA_UM * INTERP_SIGMA_UM)).exp())
            })
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if total <= f64::EPSILON {
            // Every donor is too distant for the kernel; fall back to the
            // nearest one.
            let nearest = donors
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let da = distance2(rec, a, target);
                    let db = distance2(rec, b, target);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(donors[0]);
            weights = vec![(nearest, 1.0)];
        }
        let total: f64 = weights.iter().map(|(_, w)| w).sum();

        for t in 0..rec.num_samples() {
            let mut value = 0.0f64;
            for &(ch, w) in &weights {
                value += w * rec.data[[ch, t]] as f64;
            }
            out.data[[target, t]] = (value / total) as f32;
        }
    }
    Ok(out)
}

fn distance2(rec: &Recording, a: usize, b: usize) -> f64 {
    let dx = (rec.channels[a].x - rec.channels[b].x) as f64;
    let dy = (rec.channels[a].y - rec.channels[b].y) as f64;
    dx * dx + dy * dy
}

// Applies a per-channel transform, keeping metadata and sampling rate.
fn map_channels<F>(rec: &Recording, mut f: F) -> Recording
where
    F: FnMut(&[f32]) -> Vec<f32>,
{
    let n_channels = rec.num_channels();
    let n_samples = rec.num_samples();
    let mut data = Array2::<f32>::zeros((n_channels, n_samples));
    let mut row_buf = vec![0.0f32; n_samples];
    for ch in 0..n_channels {
        for t in 0..n_samples {
            row_buf[t] = rec.data[[ch, t]];
        }
        let filtered = f(&row_buf);
        for t in 0..n_samples {
            data[[ch, t]] = filtered[t];
        }
    }
    Recording {
        channels: rec.channels.clone(),
        data,
        sample_rate: rec.sample_rate,
    }
}

// Fails loudly when a stage breaks the channel-identity invariant.
fn check_channels(
    stage: ConditioningStage,
    input: &Recording,
    output: &Recording,
) -> Result<(), PipelineError> {
    if input.channel_ids() != output.channel_ids() {
        return Err(PipelineError::ChannelIdentityViolation {
            stage: stage.label(),
            detail: format!(
                "{} channels in, {} out",
                input.num_channels(),
                output.num_channels()
            ),
        });
    }
    if input.sample_rate != output.sample_rate {
        return Err(PipelineError::ChannelIdentityViolation {
            stage: stage.label(),
            detail: "sampling rate changed".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelInfo;
    use std::collections::BTreeSet;

    fn make_recording(n_channels: usize, n_samples: usize) -> Recording {
        let mut data = Array2::zeros((n_channels, n_samples));
        for ch in 0..n_channels {
            for t in 0..n_samples {
                let phase = 2.0 * PI * 300.0 * t as f64 / 30_000.0;
                data[[ch, t]] = (30.0 * (phase + ch as f64 * 0.02).sin()) as f32;
            }
        }
        Recording {
            channels: (0..n_channels)
                .map(|ch| ChannelInfo {
                    id: format!("AP{}", ch),
                    shank: 0,
                    x: (ch % 2) as f32 * 16.0,
                    y: ch as f32 * 20.0,
                    adc_phase: 0.0,
                })
                .collect(),
            data,
            sample_rate: 30_000.0,
        }
    }

    #[test]
    fn stages_preserve_channel_count_and_rate() {
        let rec = make_recording(6, 2_000);
        for out in [
            highpass_filter(&rec),
            phase_shift(&rec),
            common_reference(&rec),
            notch_filter(&rec, 50.0, 30.0),
        ] {
            assert_eq!(out.channel_ids(), rec.channel_ids());
            assert_eq!(out.num_samples(), rec.num_samples());
            assert_eq!(out.sample_rate, rec.sample_rate);
        }
    }

    #[test]
    fn common_reference_zeroes_the_channel_mean() {
        let rec = make_recording(8, 500);
        let referenced = common_reference(&rec);
        for t in 0..rec.num_samples() {
            let mean: f64 = (0..8).map(|ch| referenced.data[[ch, t]] as f64).sum::<f64>() / 8.0;
            assert!(mean.abs() < 1e-4, "mean at t={} is {}", t, mean);
        }
    }

    #[test]
    fn phase_shift_realigns_a_delayed_channel() {
        // Channel 1 is sampled a quarter cycle late; after correction it
        // should line up with the reference channel.
        let n = 3_000;
        let fs = 30_000.0f64;
        let freq = 300.0f64;
        let tau = 0.25f64;

        let mut rec = make_recording(2, n);
        rec.channels[1].adc_phase = tau as f32;
        for t in 0..n {
            let ideal = (2.0 * PI * freq * t as f64 / fs).sin();
            let late = (2.0 * PI * freq * (t as f64 + tau) / fs).sin();
            rec.data[[0, t]] = ideal as f32;
            rec.data[[1, t]] = late as f32;
        }

        let shifted = phase_shift(&rec);
        let mut max_err = 0.0f64;
        for t in 0..n {
            let err = (shifted.data[[1, t]] as f64 - rec.data[[0, t]] as f64).abs();
            max_err = max_err.max(err);
        }
        assert!(max_err < 1e-3, "max error {}", max_err);
        // The untouched channel is bit-identical.
        for t in 0..n {
            assert_eq!(shifted.data[[0, t]], rec.data[[0, t]]);
        }
    }

    #[test]
    fn interpolation_touches_exactly_the_union() {
        let rec = make_recording(6, 400);
        let mut bad = BadChannels::default();
        bad.dead.insert("AP1".to_string());
        bad.noisy.insert("AP4".to_string());
        bad.noisy.insert("AP1".to_string());

        let out = interpolate_bad_channels(&rec, &bad).unwrap();
        let targets: BTreeSet<String> = bad.interpolation_targets();
        for ch in 0..6 {
            let id = &rec.channels[ch].id;
            let changed = (0..400).any(|t| out.data[[ch, t]] != rec.data[[ch, t]]);
            if targets.contains(id) {
                assert!(changed, "{} should have been interpolated", id);
            } else {
                assert!(!changed, "{} should be untouched", id);
            }
        }
    }

    #[test]
    fn interpolation_with_no_targets_is_identity() {
        let rec = make_recording(4, 100);
        let out = interpolate_bad_channels(&rec, &BadChannels::default()).unwrap();
        assert_eq!(out.data, rec.data);
    }

    #[test]
    fn interpolation_requires_a_good_channel() {
        let rec = make_recording(2, 50);
        let mut bad = BadChannels::default();
        bad.dead.insert("AP0".to_string());
        bad.dead.insert("AP1".to_string());
        match interpolate_bad_channels(&rec, &bad) {
            Err(PipelineError::NoGoodChannels) => {}
            other => panic!("expected NoGoodChannels, got {:?}", other),
        }
    }

    #[test]
    fn notch_config_applies_sequentially() {
        let rec = make_recording(2, 2_000);
        let notch = NotchConfig {
            freq: vec![50.0, 150.0],
            q: vec![30.0, 30.0],
        };
        let chained = apply_notch(&rec, &notch).unwrap();
        let manual = notch_filter(&notch_filter(&rec, 50.0, 30.0), 150.0, 30.0);
        assert_eq!(chained.data, manual.data);
    }

    #[test]
    fn full_chain_preserves_identity() {
        let rec = make_recording(6, 2_000);
        let conditioned = condition(&rec, crate::bad_channels::CLASSIFIER_SEED).unwrap();
        assert_eq!(conditioned.recording.channel_ids(), rec.channel_ids());
        assert_eq!(conditioned.recording.num_samples(), rec.num_samples());
    }
}
