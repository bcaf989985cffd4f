//! Capability traits implemented by pipeline components.
//!
//! The three capabilities — [`Source`], [`Processor`], [`Sink`] — are
//! independent: a component may implement any combination of them (the mixer
//! implements both `Source` and `Sink`). All methods take `&self`; components
//! that mutate per-call state use interior mutability, which is what allows a
//! single component value to participate in several pipes at once.

use async_trait::async_trait;

use waveline_core::Message;

use crate::error::PipeError;

/// Identity carried by every component.
///
/// Ids are opaque, non-empty and unique within a pipe. The pipe builder
/// assigns a generated id to any component whose id is still empty.
pub trait Component: Send + Sync {
    fn id(&self) -> String;
    fn set_id(&self, id: String);
}

/// The origin of a signal.
///
/// `pump` fills the message it was handed with the next buffer, or returns
/// [`PipeError::Eof`] once the stream is exhausted.
#[async_trait]
pub trait Source: Component {
    /// Runs before the stage loop starts. An error aborts the run event.
    async fn prepare(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }

    async fn pump(&self, msg: Message) -> Result<Message, PipeError>;

    /// Runs when the stage loop exits; its error is surfaced.
    async fn flush(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }
}

/// A transformation applied between the source and the sinks.
#[async_trait]
pub trait Processor: Component {
    async fn prepare(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }

    async fn process(&self, msg: Message) -> Result<Message, PipeError>;

    async fn flush(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }
}

/// The destination of a signal.
#[async_trait]
pub trait Sink: Component {
    async fn prepare(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }

    async fn write(&self, msg: Message) -> Result<(), PipeError>;

    async fn flush(&self, pipe_id: &str) -> Result<(), PipeError> {
        let _ = pipe_id;
        Ok(())
    }
}
