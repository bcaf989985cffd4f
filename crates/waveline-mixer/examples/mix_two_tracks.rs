//! Mix two synthetic tracks into one stream.
//!
//! Two pipes each pump a constant tone into a shared mixer; a third pipe
//! pumps the mixed stream into a sink that reports what it received.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example mix_two_tracks
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use waveline_mixer::Mixer;
use waveline_pipeline::{Buffer, Component, Message, Pipe, PipeError, Signal, Sink, Source, Uid};

const BUFFER_SIZE: usize = 512;
const NUM_CHANNELS: usize = 2;

/// Pumps `limit` constant buffers, then signals end of stream.
struct Tone {
    uid: Uid,
    value: f32,
    remaining: AtomicUsize,
}

impl Tone {
    fn new(value: f32, buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            value,
            remaining: AtomicUsize::new(buffers),
        })
    }
}

impl Component for Tone {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Source for Tone {
    async fn pump(&self, msg: Message) -> Result<Message, PipeError> {
        let taken = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_err() {
            return Err(PipeError::Eof);
        }
        Ok(msg.with_buffer(Buffer::constant(NUM_CHANNELS, BUFFER_SIZE, self.value)))
    }
}

/// Counts what arrives and remembers the last sample value.
struct Meter {
    uid: Uid,
    samples: AtomicUsize,
    last: Mutex<Option<f32>>,
}

impl Meter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            samples: AtomicUsize::new(0),
            last: Mutex::new(None),
        })
    }
}

impl Component for Meter {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Sink for Meter {
    async fn write(&self, msg: Message) -> Result<(), PipeError> {
        if let Some(buffer) = msg.buffer {
            self.samples
                .fetch_add(buffer.size() * buffer.num_channels(), Ordering::SeqCst);
            if let Some(channel) = buffer.channel(0) {
                *self.last.lock().expect("last sample lock") = channel.last().copied();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mixer = Arc::new(Mixer::new(BUFFER_SIZE, NUM_CHANNELS));
    let meter = Meter::new();

    let track_one = Pipe::builder()
        .name("track 1")
        .source(Tone::new(0.5, 100))
        .sink(mixer.clone())
        .build()
        .await?;
    let track_two = Pipe::builder()
        .name("track 2")
        .source(Tone::new(0.7, 100))
        .sink(mixer.clone())
        .build()
        .await?;
    let out = Pipe::builder()
        .name("out")
        .source(mixer)
        .sink(meter.clone())
        .build()
        .await?;

    track_one.run().await?;
    track_two.run().await?;
    out.run().await?;

    track_one.wait(Signal::Ready).await?;
    track_two.wait(Signal::Ready).await?;
    out.wait(Signal::Ready).await?;

    println!(
        "mixed {} samples, last value {:?}",
        meter.samples.load(Ordering::SeqCst),
        meter.last.lock().expect("last sample lock").take(),
    );

    track_one.close().await;
    track_two.close().await;
    out.close().await;
    Ok(())
}
