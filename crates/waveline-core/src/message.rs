use std::sync::Arc;

use crate::buffer::Buffer;
use crate::params::ParamSet;

/// The unit travelling between pipeline stages.
///
/// A message without a buffer is a bare control message: either a parameter
/// carrier with no payload, or — inside the mixer — the marker that an input
/// stream has closed. Buffers are shared behind an [`Arc`]; once emitted they
/// are read-only for every downstream stage.
#[derive(Debug)]
pub struct Message {
    /// Sample payload, if any.
    pub buffer: Option<Arc<Buffer>>,
    /// Parameters to apply, keyed by component id.
    pub params: ParamSet,
    /// Id of the pipe this message originated from.
    pub source_id: String,
}

impl Message {
    /// A buffer-less message originating from `source_id`.
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            buffer: None,
            params: ParamSet::new(),
            source_id: source_id.into(),
        }
    }

    /// Attach a sample payload.
    pub fn with_buffer(mut self, buffer: Buffer) -> Self {
        self.buffer = Some(Arc::new(buffer));
        self
    }
}
