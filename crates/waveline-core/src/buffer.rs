/// A block of audio samples, sliced per channel.
///
/// Every channel vector carries the same number of samples while a stream is
/// running; the final block of a stream may be shorter than the configured
/// buffer size. A buffer is never mutated after it has been emitted
/// downstream — stages that transform audio build a new buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buffer {
    channels: Vec<Vec<f32>>,
}

impl Buffer {
    /// Create a buffer from per-channel sample vectors.
    pub fn new(channels: Vec<Vec<f32>>) -> Self {
        Self { channels }
    }

    /// A buffer with every sample set to `value`.
    pub fn constant(num_channels: usize, size: usize, value: f32) -> Self {
        Self {
            channels: vec![vec![value; size]; num_channels],
        }
    }

    /// A buffer of silence.
    pub fn silence(num_channels: usize, size: usize) -> Self {
        Self::constant(num_channels, size, 0.0)
    }

    /// Returns the number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Returns the number of samples in a single channel.
    pub fn size(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the samples of one channel, if it exists.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Iterates over the channels in order.
    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    /// Append another buffer's samples channel by channel.
    ///
    /// An empty buffer takes the source's channel shape.
    pub fn append(&mut self, source: &Buffer) {
        if self.is_empty() {
            self.channels = source.channels.clone();
            return;
        }
        for (channel, samples) in self.channels.iter_mut().zip(&source.channels) {
            channel.extend_from_slice(samples);
        }
    }

    /// Copy out a segment of `len` samples starting at `start`.
    ///
    /// If the buffer does not hold enough samples, a shorter block is
    /// returned.
    pub fn slice(&self, start: usize, len: usize) -> Buffer {
        let end = (start + len).min(self.size());
        let start = start.min(end);
        Buffer {
            channels: self
                .channels
                .iter()
                .map(|channel| channel[start..end].to_vec())
                .collect(),
        }
    }
}
