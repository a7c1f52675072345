//! # Resampler
//!
//! Converts capture frames from the device's native rate to the peer's target rate.
//!
//! ## Method:
//! Box-filter decimation: every output sample is the mean of the input samples that
//! fall into its window. Averaging removes most of the energy that would otherwise
//! alias into the speech band, is O(n), and allocates nothing beyond the output
//! buffer, which keeps it usable inside the real-time capture callback.

use std::borrow::Cow;

/// Number of samples `resample` produces for `input_len` samples.
///
/// ## Length Law:
/// `round(input_len × target_rate / source_rate)`, zero when either rate is zero.
pub fn output_len(input_len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == 0 || target_rate == 0 {
        return 0;
    }
    (input_len as f64 * target_rate as f64 / source_rate as f64).round() as usize
}

/// Resample a block of mono samples from `source_rate` to `target_rate`.
///
/// ## Behaviour:
/// - Equal rates return the input borrowed, without copying
/// - Otherwise output `i` averages input indices in `[round(i·r), round((i+1)·r))`
///   with `r = source_rate / target_rate`, clipped to the input length
/// - An empty window produces 0.0
///
/// ## Rust Concepts:
/// - **Cow**: "clone on write", either a borrowed slice or an owned Vec, so the
///   identity case costs nothing
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Cow<'_, [f32]> {
    if source_rate == target_rate {
        return Cow::Borrowed(samples);
    }

    let out_len = output_len(samples.len(), source_rate, target_rate);
    let mut output = Vec::with_capacity(out_len);
    if out_len == 0 {
        return Cow::Owned(output);
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let mut window_start = 0usize;

    for i in 0..out_len {
        let window_end = ((i + 1) as f64 * ratio).round() as usize;
        let end = window_end.min(samples.len());

        let value = if window_start < end {
            let window = &samples[window_start..end];
            window.iter().sum::<f32>() / window.len() as f32
        } else {
            0.0
        };

        output.push(value);
        window_start = window_end;
    }

    Cow::Owned(output)
}
