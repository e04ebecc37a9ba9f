//! Bounded ring of parsed capture lines.

use std::collections::VecDeque;

use rfmux_core::CaptureLine;

/// Fixed-capacity FIFO. Pushing at capacity evicts the oldest line.
#[derive(Debug)]
pub struct CaptureBuffer {
    lines: VecDeque<CaptureLine>,
    capacity: usize,
    dropped: u64,
}

impl CaptureBuffer {
    /// Creates a buffer; a zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: CaptureLine) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    /// Removes and returns up to `limit` lines, oldest first.
    pub fn drain(&mut self, limit: Option<usize>) -> Vec<CaptureLine> {
        let n = limit.unwrap_or(self.lines.len()).min(self.lines.len());
        self.lines.drain(..n).collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.dropped = 0;
    }

    pub fn latest(&self) -> Option<&CaptureLine> {
        self.lines.back()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines evicted since the last clear.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
