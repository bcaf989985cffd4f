//! Build and execute DSP pipelines.
//!
//! A pipe is an ordered flow of signal-processing components: one source
//! producing blocks of samples, zero or more processors transforming them in
//! sequence, and one or more sinks consuming the result. Every stage runs as
//! its own task, connected by bounded queues, under a controller that owns
//! the Ready / Running / Pausing / Paused state machine.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use waveline_pipeline::{Pipe, Processor, Signal, Sink, Source};
//! # async fn example(
//! #     source: Arc<dyn Source>,
//! #     gain: Arc<dyn Processor>,
//! #     speaker: Arc<dyn Sink>,
//! # ) -> Result<(), waveline_pipeline::PipeError> {
//! let pipe = Pipe::builder()
//!     .name("playback")
//!     .source(source)
//!     .processor(gain)
//!     .sink(speaker)
//!     .build()
//!     .await?;
//!
//! pipe.run().await?;
//! pipe.wait(Signal::Ready).await?; // blocks until the stream drains
//! pipe.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Parameters pushed with [`Pipe::push`] travel in-band: they are attached
//! to the next generated message and applied by each stage no later than
//! that stage's processing of that message. Pausing is acknowledged by every
//! sink, so [`Pipe::exec`] with [`Action::Pause`] returns only once all
//! in-flight buffers have been drained.

pub mod component;
pub mod error;

mod pipe;
mod runner;
mod state;

pub use component::{Component, Processor, Sink, Source};
pub use error::PipeError;
pub use pipe::{Pipe, PipeBuilder};
pub use runner::SingleUse;
pub use state::{Action, Signal};

pub use waveline_core::{Buffer, Message, ParamFn, ParamSet, Uid};
