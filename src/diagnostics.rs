//! Spectral-density diagnostics.
//!
//! Computes a Welch power spectral density over a seeded chunk of the
//! conditioned signal and writes a per-probe line plot for operator review.
//! The plots are purely observational; nothing downstream reads them back.

use log::info;
use plotters::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::PI;
use std::path::Path;

use crate::bad_channels::random_data_chunk;
use crate::types::{PipelineError, Recording};

/// Chunk length used for density estimation, in samples.
pub const PSD_CHUNK_SIZE: usize = 30_000;

/// Seed for the diagnostic chunk sampler.
pub const PSD_SEED: u64 = 42;

// Welch segmentation: segment length and 50% overlap.
const SEGMENT_LEN: usize = 1024;

/// A per-channel power spectral density estimate.
#[derive(Debug, Clone)]
pub struct SpectralDensity {
    /// Frequency axis (Hz), `segment_len / 2 + 1` points
    pub freqs: Vec<f64>,
    /// Power per channel, same length as `freqs`, in dB
    pub power_db: Vec<Vec<f64>>,
}

/// Estimates the power spectral density of every channel.
///
/// Uses Welch's method (Hann window, 50% overlap) over one seeded chunk of
/// the recording, so repeated runs of the same data produce the same plot.
pub fn spectral_density(rec: &Recording, seed: u64) -> SpectralDensity {
    let chunk = random_data_chunk(rec, PSD_CHUNK_SIZE, seed);
    let n_channels = chunk.shape()[0];
    let n_samples = chunk.shape()[1];
    let seg_len = SEGMENT_LEN.min(n_samples.max(2));
    let hop = (seg_len / 2).max(1);
    let n_bins = seg_len / 2 + 1;

    let window: Vec<f64> = (0..seg_len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / seg_len as f64).cos())
        .collect();
    let window_power: f64 = window.iter().map(|w| w * w).sum();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(seg_len);

    let sample_rate = rec.sample_rate as f64;
    let freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate / seg_len as f64)
        .collect();

    let mut power_db = Vec::with_capacity(n_channels);
    let mut buffer: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); seg_len];
    for ch in 0..n_channels {
        let mut accum = vec![0.0f64; n_bins];
        let mut n_segments = 0usize;
        let mut start = 0usize;
        while start + seg_len <= n_samples {
            for i in 0..seg_len {
                buffer[i] = Complex::new(chunk[[ch, start + i]] as f64 * window[i], 0.0);
            }
            fft.process(&mut buffer);
            for k in 0..n_bins {
                // One-sided density; interior bins count both halves.
                let factor = if k == 0 || (seg_len % 2 == 0 && k == seg_len / 2) {
                    1.0
                } else {
                    2.0
                };
                accum[k] += factor * buffer[k].norm_sqr() / (window_power * sample_rate);
            }
            n_segments += 1;
            start += hop;
        }
        if n_segments == 0 {
            power_db.push(vec![0.0; n_bins]);
            continue;
        }
        let db: Vec<f64> = accum
            .iter()
            .map(|&p| 10.0 * (p / n_segments as f64).max(1e-20).log10())
            .collect();
        power_db.push(db);
    }

    SpectralDensity { freqs, power_db }
}

/// Writes a spectral-density line plot (one trace per channel) as a PNG.
pub fn write_psd_plot(path: &Path, psd: &SpectralDensity) -> Result<(), PipelineError> {
    let plot_err = |e: String| PipelineError::Plot(e);

    let root = BitMapBackend::new(path, (1000, 700)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_err(e.to_string()))?;

    let x_max = psd.freqs.last().copied().unwrap_or(1.0);
    let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
    for channel in &psd.power_db {
        for &v in channel {
            y_min = y_min.min(v);
            y_max = y_max.max(v);
        }
    }
    if !y_min.is_finite() || !y_max.is_finite() {
        y_min = -1.0;
        y_max = 1.0;
    }
    if y_min == y_max {
        y_max = y_min + 1.0;
    }

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .build_cartesian_2d(0.0..x_max, y_min..y_max)
        .map_err(|e| plot_err(e.to_string()))?;

    for channel in &psd.power_db {
        chart
            .draw_series(LineSeries::new(
                psd.freqs.iter().copied().zip(channel.iter().copied()),
                &BLUE.mix(0.3),
            ))
            .map_err(|e| plot_err(e.to_string()))?;
    }

    root.present().map_err(|e| plot_err(e.to_string()))?;
    Ok(())
}

/// Computes and writes the density plot for a probe.
pub fn report_spectral_density(
    rec: &Recording,
    probe_dir: &Path,
    file_name: &str,
) -> Result<(), PipelineError> {
    info!("Calculating power spectral density");
    let psd = spectral_density(rec, PSD_SEED);
    write_psd_plot(&probe_dir.join(file_name), &psd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelInfo;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn sine_recording(freq: f64, n_channels: usize, n_samples: usize) -> Recording {
        let mut data = Array2::zeros((n_channels, n_samples));
        for ch in 0..n_channels {
            for t in 0..n_samples {
                data[[ch, t]] = (2.0 * PI * freq * t as f64 / 30_000.0).sin() as f32;
            }
        }
        Recording {
            channels: (0..n_channels)
                .map(|ch| ChannelInfo {
                    id: format!("AP{}", ch),
                    shank: 0,
                    x: 0.0,
                    y: ch as f32 * 20.0,
                    adc_phase: 0.0,
                })
                .collect(),
            data,
            sample_rate: 30_000.0,
        }
    }

    #[test]
    fn sine_peaks_at_its_frequency() {
        let freq = 1_500.0;
        let rec = sine_recording(freq, 1, 20_000);
        let psd = spectral_density(&rec, PSD_SEED);

        let peak_bin = psd.power_db[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let bin_width = 30_000.0 / SEGMENT_LEN as f64;
        assert!(
            (psd.freqs[peak_bin] - freq).abs() <= bin_width,
            "peak at {} Hz",
            psd.freqs[peak_bin]
        );
    }

    #[test]
    fn writes_a_plot_file() {
        let rec = sine_recording(500.0, 3, 8_000);
        let dir = tempdir().unwrap();
        report_spectral_density(&rec, dir.path(), "power_spectral_density.png").unwrap();
        let meta = std::fs::metadata(dir.path().join("power_spectral_density.png")).unwrap();
        assert!(meta.len() > 0);
    }
}
