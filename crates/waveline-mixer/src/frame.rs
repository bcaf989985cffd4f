//! Frame alignment and summing.
//!
//! A frame is the positional slot where one buffer from each open input
//! lines up. The queue keeps pending frames oldest-first, with a base
//! counter translating the absolute stream position of an input into an
//! index. `expected` counts the contributions that complete a frame: it
//! starts at the number of inputs open when the frame was created and drops
//! by one for every input that closes before contributing.

use std::collections::VecDeque;
use std::sync::Arc;

use waveline_core::Buffer;

pub(crate) struct Frame {
    pub(crate) buffers: Vec<Arc<Buffer>>,
    pub(crate) expected: usize,
}

impl Frame {
    fn new(expected: usize) -> Self {
        Self {
            buffers: Vec::new(),
            expected,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.expected > 0 && self.buffers.len() == self.expected
    }

    /// Mix the contributed buffers into one.
    ///
    /// Each output sample is the mean of the contributors that actually hold
    /// a sample at that position, so a short end-of-stream buffer drops out
    /// of the divisor instead of being zero-padded. The output channel is as
    /// long as the longest contributor, capped at `buffer_size`.
    pub(crate) fn sum(&self, num_channels: usize, buffer_size: usize) -> Buffer {
        let mut channels = Vec::with_capacity(num_channels);
        for c in 0..num_channels {
            let len = self
                .buffers
                .iter()
                .map(|b| b.channel(c).map_or(0, <[f32]>::len))
                .max()
                .unwrap_or(0)
                .min(buffer_size);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                let mut sum = 0f64;
                let mut signals = 0f64;
                for buffer in &self.buffers {
                    if let Some(samples) = buffer.channel(c) {
                        if samples.len() > i {
                            sum += f64::from(samples[i]);
                            signals += 1.0;
                        }
                    }
                }
                out.push((sum / signals) as f32);
            }
            channels.push(out);
        }
        Buffer::new(channels)
    }
}

pub(crate) struct FrameQueue {
    frames: VecDeque<Frame>,
    /// Absolute stream position of `frames[0]`.
    base: u64,
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        let mut frames = VecDeque::new();
        frames.push_back(Frame::new(0));
        Self { frames, base: 0 }
    }

    /// Seat a new input at the oldest pending frame and return its starting
    /// position. Every queued frame will receive one contribution more,
    /// since the input walks the queue from the front.
    pub(crate) fn register(&mut self) -> u64 {
        for frame in self.frames.iter_mut() {
            frame.expected += 1;
        }
        self.base
    }

    /// Record one input's buffer at `pos` and lazily create the successor
    /// frame, expecting a contribution from each of the `open_inputs`.
    pub(crate) fn contribute(&mut self, pos: u64, buffer: Arc<Buffer>, open_inputs: usize) {
        let idx = (pos - self.base) as usize;
        debug_assert!(idx < self.frames.len(), "contribution past the tail frame");
        self.frames[idx].buffers.push(buffer);
        if idx + 1 == self.frames.len() {
            self.frames.push_back(Frame::new(open_inputs));
        }
    }

    /// An input at `pos` closed without contributing further: every frame
    /// from `pos` onward expects one buffer less.
    pub(crate) fn close_from(&mut self, pos: u64) {
        let start = (pos - self.base) as usize;
        for frame in self.frames.iter_mut().skip(start) {
            frame.expected = frame.expected.saturating_sub(1);
        }
    }

    /// Pop every frame that became emittable, oldest-first. Frames whose
    /// expectation dropped to zero are discarded silently — no signal exists
    /// at that position.
    pub(crate) fn drain_ready(&mut self) -> Vec<Frame> {
        let mut ready = Vec::new();
        while let Some(front) = self.frames.front() {
            if front.expected == 0 {
                self.frames.pop_front();
                self.base += 1;
            } else if front.is_ready() {
                ready.push(self.frames.pop_front().expect("front frame present"));
                self.base += 1;
            } else {
                break;
            }
        }
        // Keep a tail frame so later registrations always have a seat.
        if self.frames.is_empty() {
            self.frames.push_back(Frame::new(0));
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use waveline_core::Buffer;

    use super::{Frame, FrameQueue};

    fn buffer(values: &[f32]) -> Arc<Buffer> {
        Arc::new(Buffer::new(vec![values.to_vec()]))
    }

    #[test]
    fn sum_is_the_mean_of_contributors() {
        let frame = Frame {
            buffers: vec![buffer(&[0.5, 0.5]), buffer(&[0.7, 0.7])],
            expected: 2,
        };
        let mixed = frame.sum(1, 2);
        let samples = mixed.channel(0).expect("channel 0");
        assert!((samples[0] - 0.6).abs() < 1e-6);
        assert!((samples[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn short_contributor_drops_out_of_the_divisor() {
        let frame = Frame {
            buffers: vec![buffer(&[1.0, 1.0, 1.0, 1.0]), buffer(&[0.0, 0.0])],
            expected: 2,
        };
        let mixed = frame.sum(1, 4);
        let samples = mixed.channel(0).expect("channel 0");
        assert_eq!(samples.len(), 4);
        assert!((samples[0] - 0.5).abs() < 1e-6);
        assert!((samples[1] - 0.5).abs() < 1e-6);
        assert!((samples[2] - 1.0).abs() < 1e-6);
        assert!((samples[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_contributor_passes_through() {
        let frame = Frame {
            buffers: vec![buffer(&[0.25, -0.25])],
            expected: 1,
        };
        let mixed = frame.sum(1, 2);
        assert_eq!(mixed.channel(0), Some(&[0.25, -0.25][..]));
    }

    #[test]
    fn frames_become_ready_in_order() {
        let mut queue = FrameQueue::new();
        let a = queue.register();
        let b = queue.register();
        assert_eq!(a, 0);
        assert_eq!(b, 0);

        queue.contribute(0, buffer(&[1.0]), 2);
        assert!(queue.drain_ready().is_empty());

        queue.contribute(0, buffer(&[0.0]), 2);
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].buffers.len(), 2);
    }

    #[test]
    fn closing_input_releases_waiting_frames() {
        let mut queue = FrameQueue::new();
        queue.register();
        queue.register();

        // Input one runs three frames ahead; input two contributes once.
        queue.contribute(0, buffer(&[1.0]), 2);
        queue.contribute(1, buffer(&[1.0]), 2);
        queue.contribute(2, buffer(&[1.0]), 2);
        queue.contribute(0, buffer(&[0.0]), 2);
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 1);

        // Input two closes at position 1: frames 1 and 2 now only expect
        // input one, which already contributed.
        queue.close_from(1);
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].buffers.len(), 1);
        assert_eq!(ready[1].buffers.len(), 1);
    }

    #[test]
    fn frame_with_no_contributions_is_dropped() {
        let mut queue = FrameQueue::new();
        queue.register();
        queue.contribute(0, buffer(&[1.0]), 1);
        assert_eq!(queue.drain_ready().len(), 1);

        // The tail frame expects the one open input; when it closes without
        // contributing, the frame vanishes without being emitted.
        queue.close_from(1);
        assert!(queue.drain_ready().is_empty());
    }

    #[test]
    fn late_registration_lands_on_the_oldest_pending_frame() {
        let mut queue = FrameQueue::new();
        queue.register();
        queue.contribute(0, buffer(&[1.0]), 1);
        queue.contribute(1, buffer(&[1.0]), 1);
        assert_eq!(queue.drain_ready().len(), 2);

        // The new input is seated at position 2, the oldest pending frame.
        let pos = queue.register();
        assert_eq!(pos, 2);
        queue.contribute(2, buffer(&[0.0]), 2);
        assert!(queue.drain_ready().is_empty());
        queue.contribute(2, buffer(&[1.0]), 2);
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].buffers.len(), 2);
    }
}
