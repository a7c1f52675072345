//! # Analysis Buffer
//!
//! A sliding window over the most recent samples rendered by the output mixer. It is
//! the "tap" the visualizer's analyser reads from.
//!
//! ## Key Features:
//! - **Sliding window**: Keeps exactly the last `capacity` samples, oldest dropped first
//! - **Non-blocking writer**: The audio callback only `try_lock`s; a contended write is
//!   skipped, which the visualizer tolerates
//! - **Shared handle**: Cloning shares the same window between mixer and analyser

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Circular window of recently played samples.
///
/// ## Thread Safety:
/// Uses Arc<Mutex<VecDeque<f32>>> so the output callback (writer) and the
/// presentation loop (reader) can share it. Only the reader ever blocks.
#[derive(Debug, Clone)]
pub struct AnalysisBuffer {
    samples: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl AnalysisBuffer {
    /// Create a window holding `capacity` samples, initially silent.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::from(vec![0.0; capacity]))),
            capacity,
        }
    }

    /// Append rendered samples without blocking.
    ///
    /// ## Returns:
    /// `false` if the reader held the lock and this block was skipped.
    pub fn try_push(&self, block: &[f32]) -> bool {
        let mut window = match self.samples.try_lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        // Only the tail of an oversized block can survive in the window.
        let tail = &block[block.len().saturating_sub(self.capacity)..];
        let overflow = (window.len() + tail.len()).saturating_sub(self.capacity);
        let cut = overflow.min(window.len());
        window.drain(..cut);
        window.extend(tail.iter().copied());
        true
    }

    /// Copy the most recent `out.len()` samples, oldest first, into `out`.
    ///
    /// ## Usage:
    /// Called by the analyser once per presentation frame, with a reused buffer.
    pub fn copy_window(&self, out: &mut [f32]) {
        let window = self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = window.len().saturating_sub(out.len());
        for (dst, src) in out.iter_mut().zip(window.iter().skip(skip)) {
            *dst = *src;
        }
    }

    /// Reset the window to silence (used when a session ends).
    pub fn clear(&self) {
        let mut window = self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.clear();
        window.extend(std::iter::repeat(0.0).take(self.capacity));
    }

    /// Number of samples the window holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_latest_samples() {
        let buffer = AnalysisBuffer::new(4);
        assert!(buffer.try_push(&[1.0, 2.0, 3.0]));
        assert!(buffer.try_push(&[4.0, 5.0]));

        let mut out = [0.0; 4];
        buffer.copy_window(&mut out);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_oversized_block_keeps_tail() {
        let buffer = AnalysisBuffer::new(3);
        buffer.try_push(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = [0.0; 3];
        buffer.copy_window(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_short_output_gets_latest() {
        let buffer = AnalysisBuffer::new(4);
        buffer.try_push(&[1.0, 2.0, 3.0, 4.0]);

        let mut out = [0.0; 2];
        buffer.copy_window(&mut out);
        assert_eq!(out, [3.0, 4.0]);
    }

    #[test]
    fn test_clear_restores_silence() {
        let buffer = AnalysisBuffer::new(2);
        buffer.try_push(&[0.7, 0.8]);
        buffer.clear();

        let mut out = [1.0; 2];
        buffer.copy_window(&mut out);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_contended_push_is_skipped() {
        let buffer = AnalysisBuffer::new(2);
        let guard = buffer.samples.lock().unwrap();
        assert!(!buffer.try_push(&[1.0]));
        drop(guard);
        assert!(buffer.try_push(&[1.0]));
    }
}
