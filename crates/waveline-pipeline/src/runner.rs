//! Stage runner tasks.
//!
//! Each stage of a running pipe is one tokio task: the source pulls fresh
//! messages from the controller through an ask/give rendezvous, processors
//! consume their upstream queue, sinks terminate the chain, and a fan-out
//! task copies the chain output to every sink queue. Runners report failures
//! on a shared error channel and hold a clone of its sender for as long as
//! they live, so the controller observes clean completion as the channel
//! closing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waveline_core::Message;

use crate::component::{Processor, Sink, Source};
use crate::error::PipeError;

/// Capacity of the bounded queues between stages.
pub(crate) const QUEUE_CAPACITY: usize = 256;

/// Guards a callback that must run at most once.
///
/// Components that cannot be re-run claim the guard in their `prepare` hook;
/// the second claim reports [`PipeError::SingleUseReused`].
#[derive(Debug, Default)]
pub struct SingleUse {
    used: AtomicBool,
}

impl SingleUse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self) -> Result<(), PipeError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(PipeError::SingleUseReused);
        }
        Ok(())
    }
}

/// Spawn the source stage. Returns the head of the message chain.
pub(crate) fn run_source(
    source: Arc<dyn Source>,
    pipe_id: String,
    token: CancellationToken,
    ask_tx: mpsc::Sender<()>,
    mut give_rx: mpsc::Receiver<Message>,
    err_tx: mpsc::Sender<PipeError>,
) -> mpsc::Receiver<Message> {
    let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
    tokio::spawn(async move {
        loop {
            // Ask the controller for a fresh message. The controller only
            // answers in the running and pausing states, so this is also
            // where a paused pipe holds its source.
            let asked = tokio::select! {
                _ = token.cancelled() => false,
                sent = ask_tx.send(()) => sent.is_ok(),
            };
            if !asked {
                break;
            }
            let given = tokio::select! {
                _ = token.cancelled() => None,
                msg = give_rx.recv() => msg,
            };
            let Some(mut msg) = given else { break };

            msg.params.apply(&source.id());
            match source.pump(msg).await {
                Ok(msg) => {
                    let sent = tokio::select! {
                        _ = token.cancelled() => false,
                        sent = out_tx.send(msg) => sent.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
                Err(PipeError::Eof) => break,
                Err(err) => {
                    let _ = err_tx.send(err).await;
                    break;
                }
            }
        }
        if let Err(err) = source.flush(&pipe_id).await {
            let _ = err_tx.send(err).await;
        }
        debug!(stage = %source.id(), pipe = %pipe_id, "source runner finished");
    });
    out_rx
}

/// Spawn one processor stage. Returns its output queue.
pub(crate) fn run_processor(
    processor: Arc<dyn Processor>,
    pipe_id: String,
    token: CancellationToken,
    mut in_rx: mpsc::Receiver<Message>,
    err_tx: mpsc::Sender<PipeError>,
) -> mpsc::Receiver<Message> {
    let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(mut msg) = in_rx.recv().await {
            msg.params.apply(&processor.id());
            match processor.process(msg).await {
                Ok(msg) => {
                    let sent = tokio::select! {
                        _ = token.cancelled() => false,
                        sent = out_tx.send(msg) => sent.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                }
                Err(err) => {
                    let _ = err_tx.send(err).await;
                    break;
                }
            }
        }
        if let Err(err) = processor.flush(&pipe_id).await {
            let _ = err_tx.send(err).await;
        }
        debug!(stage = %processor.id(), pipe = %pipe_id, "processor runner finished");
    });
    out_rx
}

/// Spawn one sink stage reading from its dedicated queue.
pub(crate) fn run_sink(
    sink: Arc<dyn Sink>,
    pipe_id: String,
    mut in_rx: mpsc::Receiver<Message>,
    err_tx: mpsc::Sender<PipeError>,
) {
    tokio::spawn(async move {
        while let Some(mut msg) = in_rx.recv().await {
            // Parameter application is also where pause acknowledgements run.
            msg.params.apply(&sink.id());
            if let Err(err) = sink.write(msg).await {
                let _ = err_tx.send(err).await;
                break;
            }
        }
        if let Err(err) = sink.flush(&pipe_id).await {
            let _ = err_tx.send(err).await;
        }
        debug!(stage = %sink.id(), pipe = %pipe_id, "sink runner finished");
    });
}

/// Spawn the fan-out task: one message in, one message out per sink.
///
/// Sends block per sink, so the slowest sink throttles the whole pipe and
/// every sink observes the same ordered sequence of buffers. The parameter
/// set is partitioned by sink id so each sink receives exactly its own
/// thunks.
pub(crate) fn run_fan_out(mut in_rx: mpsc::Receiver<Message>, sinks: Vec<(String, mpsc::Sender<Message>)>) {
    tokio::spawn(async move {
        while let Some(mut msg) = in_rx.recv().await {
            for (sink_id, sink_tx) in &sinks {
                let fanned = Message {
                    buffer: msg.buffer.clone(),
                    params: msg.params.split(sink_id),
                    source_id: msg.source_id.clone(),
                };
                let _ = sink_tx.send(fanned).await;
            }
        }
        // Dropping the senders closes every sink queue.
    });
}
