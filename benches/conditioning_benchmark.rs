use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use ephys_pipeline::bad_channels::CLASSIFIER_SEED;
use ephys_pipeline::conditioning;
use ephys_pipeline::destripe;
use ephys_pipeline::{ChannelInfo, Recording};

fn synthetic_recording(n_channels: usize, n_samples: usize) -> Recording {
    let mut data = Array2::zeros((n_channels, n_samples));
    for ch in 0..n_channels {
        for t in 0..n_samples {
            let phase = 2.0 * std::f64::consts::PI * 300.0 * t as f64 / 30_000.0;
            data[[ch, t]] = (40.0 * (phase + ch as f64 * 0.01).sin()) as f32;
        }
    }
    Recording {
        channels: (0..n_channels)
            .map(|ch| ChannelInfo {
                id: format!("AP{}", ch),
                shank: (ch / (n_channels / 2).max(1)) as u32,
                x: (ch % 2) as f32 * 16.0,
                y: ch as f32 * 20.0,
                adc_phase: (ch % 12) as f32 / 12.0,
            })
            .collect(),
        data,
        sample_rate: 30_000.0,
    }
}

pub fn bench_highpass(c: &mut Criterion) {
    let rec = synthetic_recording(32, 30_000);
    c.bench_function("highpass_filter", |b| {
        b.iter(|| black_box(conditioning::highpass_filter(black_box(&rec))))
    });
}

pub fn bench_destripe(c: &mut Criterion) {
    let rec = synthetic_recording(32, 10_000);
    c.bench_function("destripe_two_shanks", |b| {
        b.iter(|| black_box(destripe::destripe(black_box(&rec)).unwrap()))
    });
}

pub fn bench_full_chain(c: &mut Criterion) {
    let rec = synthetic_recording(16, 10_000);
    c.bench_function("condition_chain", |b| {
        b.iter(|| black_box(conditioning::condition(black_box(&rec), CLASSIFIER_SEED).unwrap()))
    });
}

criterion_group!(benches, bench_highpass, bench_destripe, bench_full_chain);
criterion_main!(benches);
