//! Shank-aware spatial destriping.
//!
//! Correlated striping artifacts appear as the same deflection on many
//! channels at the same sample. The destriper removes them with a spatial
//! high-pass: at every time sample, each channel's value is reduced by the
//! median of a sliding window of its depth-ordered neighbors.
//!
//! Recordings spanning several shanks are split into one sub-recording per
//! shank label, filtered independently (in parallel), and merged back into
//! the exact channel order of the input. A merge that fails to restore
//! channel identity is a correctness violation and fails loudly.

use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::types::{PipelineError, Recording};

// Sliding window height of the spatial filter, in channels (odd).
const SPATIAL_WINDOW: usize = 11;

/// Destripes a recording, per shank when more than one label is present.
pub fn destripe(rec: &Recording) -> Result<Recording, PipelineError> {
    let labels = rec.shank_labels();
    if labels.len() <= 1 {
        return Ok(spatial_highpass(rec));
    }

    debug!("Destriping {} shanks independently", labels.len());
    let groups = split_by_shank(rec);
    let destriped: Vec<(u32, Recording)> = groups
        .into_par_iter()
        .map(|(label, sub)| {
            let filtered = spatial_highpass(&sub);
            (label, filtered)
        })
        .collect();
    merge_groups(rec, &destriped)
}

/// Splits a recording into one sub-recording per shank label.
///
/// The split is a total disjoint cover: every channel lands in exactly one
/// group, and channels keep their relative order within each group.
pub fn split_by_shank(rec: &Recording) -> Vec<(u32, Recording)> {
    let mut by_label: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, channel) in rec.channels.iter().enumerate() {
        by_label.entry(channel.shank).or_default().push(index);
    }

    by_label
        .into_iter()
        .map(|(label, indices)| {
            let mut data = Array2::<f32>::zeros((indices.len(), rec.num_samples()));
            for (row, &src) in indices.iter().enumerate() {
                for t in 0..rec.num_samples() {
                    data[[row, t]] = rec.data[[src, t]];
                }
            }
            let channels = indices.iter().map(|&i| rec.channels[i].clone()).collect();
            (
                label,
                Recording {
                    channels,
                    data,
                    sample_rate: rec.sample_rate,
                },
            )
        })
        .collect()
}

// Reassembles per-shank recordings into the original channel order.
fn merge_groups(
    original: &Recording,
    groups: &[(u32, Recording)],
) -> Result<Recording, PipelineError> {
    let mut out = original.clone();
    let mut seen = vec![false; original.num_channels()];

    for (_, sub) in groups {
        for (row, channel) in sub.channels.iter().enumerate() {
            let Some(dest) = original.channel_index(&channel.id) else {
                return Err(PipelineError::ChannelIdentityViolation {
                    stage: "destripe",
                    detail: format!("merge produced unknown channel {}", channel.id),
                });
            };
            if seen[dest] {
                return Err(PipelineError::ChannelIdentityViolation {
                    stage: "destripe",
                    detail: format!("channel {} appears in two groups", channel.id),
                });
            }
            seen[dest] = true;
            for t in 0..original.num_samples() {
                out.data[[dest, t]] = sub.data[[row, t]];
            }
        }
    }

    if let Some(missing) = seen.iter().position(|&s| !s) {
        return Err(PipelineError::ChannelIdentityViolation {
            stage: "destripe",
            detail: format!(
                "channel {} missing after merge",
                original.channels[missing].id
            ),
        });
    }
    Ok(out)
}

/// Spatial high-pass over depth-ordered channels of one recording.
pub fn spatial_highpass(rec: &Recording) -> Recording {
    let n_channels = rec.num_channels();
    let n_samples = rec.num_samples();
    if n_channels == 0 {
        return rec.clone();
    }

    // Depth order along the shank; ties broken by x, then input order.
    let mut order: Vec<usize> = (0..n_channels).collect();
    order.sort_by(|&a, &b| {
        let ca = &rec.channels[a];
        let cb = &rec.channels[b];
        ca.y.partial_cmp(&cb.y)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ca.x.partial_cmp(&cb.x).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.cmp(&b))
    });

    let half = SPATIAL_WINDOW / 2;
    let mut out = rec.clone();
    let mut column = vec![0.0f64; n_channels];
    let mut window = Vec::with_capacity(SPATIAL_WINDOW);
    for t in 0..n_samples {
        for (pos, &ch) in order.iter().enumerate() {
            column[pos] = rec.data[[ch, t]] as f64;
        }
        for pos in 0..n_channels {
            let lo = pos.saturating_sub(half);
            let hi = (pos + half + 1).min(n_channels);
            window.clear();
            window.extend_from_slice(&column[lo..hi]);
            window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = window.len() / 2;
            let median = if window.len() % 2 == 0 {
                (window[mid - 1] + window[mid]) / 2.0
            } else {
                window[mid]
            };
            out.data[[order[pos], t]] = (column[pos] - median) as f32;
        }
    }
    out
}
