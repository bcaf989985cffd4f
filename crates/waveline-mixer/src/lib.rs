//! Frame-aligned mixing for waveline pipelines.
//!
//! A [`Mixer`] sums several independently-paced streams into one. It acts as
//! a sink for each upstream pipe and as the source of its downstream pipe:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     track_a: Arc<dyn waveline_pipeline::Source>,
//! #     track_b: Arc<dyn waveline_pipeline::Source>,
//! #     speaker: Arc<dyn waveline_pipeline::Sink>,
//! # ) -> Result<(), waveline_pipeline::PipeError> {
//! use waveline_mixer::Mixer;
//! use waveline_pipeline::Pipe;
//!
//! let mixer = Arc::new(Mixer::new(512, 2));
//!
//! let one = Pipe::builder().source(track_a).sink(mixer.clone()).build().await?;
//! let two = Pipe::builder().source(track_b).sink(mixer.clone()).build().await?;
//! let out = Pipe::builder().source(mixer).sink(speaker).build().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Buffers are aligned positionally: the Nth output buffer is the mean of
//! the Nth buffer of every input, with inputs that close early or deliver a
//! short final buffer simply dropping out of the divisor where they have no
//! samples.

mod frame;
mod mixer;

pub use mixer::Mixer;
