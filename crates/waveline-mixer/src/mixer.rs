//! The mixing synchronizer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waveline_core::{Message, Uid};
use waveline_pipeline::{Component, PipeError, Sink, Source};

use crate::frame::{Frame, FrameQueue};

/// Capacity of the input and ready queues.
const QUEUE_CAPACITY: usize = 256;

/// Upper bound on concurrent registrations; past it, a registering pipe's
/// prepare hook blocks until the scheduler catches up.
const MAX_INPUTS: usize = 1024;

/// Sums synchronized frames from several pipes into one output stream.
///
/// The mixer is a sink for each upstream pipe and the source of its
/// downstream pipe. Upstream pipes register through their sink `prepare`
/// hook, forward every buffer, and mark end of stream with a buffer-less
/// message from their `flush` hook. A scheduler task — one per pump
/// session — aligns the contributions into frames and emits each frame once
/// every open input has contributed to it.
///
/// All frame state is owned by the scheduler task; the mixer value itself
/// only holds channel endpoints, so it can be shared freely behind an
/// [`Arc`].
///
/// Buffer size and channel count must match every connected pipe; the mixer
/// performs no conversion.
pub struct Mixer {
    uid: Uid,
    buffer_size: usize,
    num_channels: usize,
    open_tx: mpsc::Sender<String>,
    in_tx: mpsc::Sender<Message>,
    // The scheduler holds these receivers for the length of a session; the
    // next session's scheduler waits its turn on the locks.
    open_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    in_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    ready_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    /// Inputs that finished the previous session, re-admitted on restart.
    done: Arc<StdMutex<Vec<String>>>,
    session: StdMutex<Option<CancellationToken>>,
}

impl Mixer {
    pub fn new(buffer_size: usize, num_channels: usize) -> Self {
        let (open_tx, open_rx) = mpsc::channel(MAX_INPUTS);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            uid: Uid::default(),
            buffer_size,
            num_channels,
            open_tx,
            in_tx,
            open_rx: Arc::new(Mutex::new(open_rx)),
            in_rx: Arc::new(Mutex::new(in_rx)),
            ready_rx: Mutex::new(None),
            done: Arc::new(StdMutex::new(Vec::new())),
            session: StdMutex::new(None),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn begin_session(&self, token: CancellationToken) {
        let previous = self
            .session
            .lock()
            .expect("mixer session lock poisoned")
            .replace(token);
        // A previous session that never observed its end of stream (the
        // downstream pipe was cancelled) is told to let go of the queues.
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn end_session(&self) {
        if let Some(token) = self
            .session
            .lock()
            .expect("mixer session lock poisoned")
            .take()
        {
            token.cancel();
        }
    }
}

impl Component for Mixer {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

/// Upstream side: every registered pipe feeds the shared input queue.
#[async_trait]
impl Sink for Mixer {
    /// Announce the upstream pipe before its first buffer.
    async fn prepare(&self, pipe_id: &str) -> Result<(), PipeError> {
        self.open_tx
            .send(pipe_id.to_string())
            .await
            .map_err(|_| PipeError::failure("mixer registration channel closed"))
    }

    async fn write(&self, msg: Message) -> Result<(), PipeError> {
        self.in_tx
            .send(msg)
            .await
            .map_err(|_| PipeError::failure("mixer input channel closed"))
    }

    /// Mark the upstream stream closed with a buffer-less message.
    async fn flush(&self, pipe_id: &str) -> Result<(), PipeError> {
        self.in_tx
            .send(Message::new(pipe_id))
            .await
            .map_err(|_| PipeError::failure("mixer input channel closed"))
    }
}

/// Downstream side: the pump session draining mixed frames.
#[async_trait]
impl Source for Mixer {
    /// Start a pump session: re-admit inputs that finished the previous
    /// session, open a fresh ready queue and spawn the scheduler.
    async fn prepare(&self, pipe_id: &str) -> Result<(), PipeError> {
        let (ready_tx, ready_rx) = mpsc::channel(QUEUE_CAPACITY);
        *self.ready_rx.lock().await = Some(ready_rx);

        let token = CancellationToken::new();
        self.begin_session(token.clone());

        let readmitted: Vec<String> = self
            .done
            .lock()
            .expect("mixer done lock poisoned")
            .drain(..)
            .collect();
        for source_id in readmitted {
            self.open_tx
                .send(source_id)
                .await
                .map_err(|_| PipeError::failure("mixer registration channel closed"))?;
        }

        tokio::spawn(schedule(
            self.open_rx.clone(),
            self.in_rx.clone(),
            ready_tx,
            self.done.clone(),
            token,
        ));
        debug!(pipe = %pipe_id, "mixer pump session started");
        Ok(())
    }

    async fn pump(&self, mut msg: Message) -> Result<Message, PipeError> {
        let mut guard = self.ready_rx.lock().await;
        let Some(ready_rx) = guard.as_mut() else {
            return Err(PipeError::InvalidState);
        };
        match ready_rx.recv().await {
            Some(frame) => {
                msg.buffer = Some(Arc::new(frame.sum(self.num_channels, self.buffer_size)));
                Ok(msg)
            }
            None => Err(PipeError::Eof),
        }
    }

    /// End the pump session, releasing the queues for the next one.
    async fn flush(&self, pipe_id: &str) -> Result<(), PipeError> {
        self.end_session();
        debug!(pipe = %pipe_id, "mixer pump session finished");
        Ok(())
    }
}

/// The per-session scheduler: owns the frame queue and the per-input
/// positions, so no lock guards any of the mixing state.
///
/// Registrations are drained before input messages (the biased select), so
/// an input is always seated before its first buffer is examined.
async fn schedule(
    open_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    in_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    ready_tx: mpsc::Sender<Frame>,
    done: Arc<StdMutex<Vec<String>>>,
    token: CancellationToken,
) {
    let mut open_rx = open_rx.lock().await;
    let mut in_rx = in_rx.lock().await;
    let mut inputs: HashMap<String, u64> = HashMap::new();
    let mut queue = FrameQueue::new();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            registration = open_rx.recv() => {
                let Some(source_id) = registration else { break };
                // A restart re-admits finished inputs while their pipes
                // also re-register; seat each input once.
                if !inputs.contains_key(&source_id) {
                    let pos = queue.register();
                    debug!(input = %source_id, position = pos, "mixer input open");
                    inputs.insert(source_id, pos);
                }
            }
            incoming = in_rx.recv() => {
                let Some(msg) = incoming else { break };
                let input_closed = handle_message(msg, &mut inputs, &mut queue, &done);
                for frame in queue.drain_ready() {
                    sent += 1;
                    if ready_tx.send(frame).await.is_err() {
                        debug!(sent, "mixer output abandoned");
                        return;
                    }
                }
                if input_closed && inputs.is_empty() {
                    debug!(sent, "mixer inputs drained");
                    // Dropping ready_tx signals end of stream downstream.
                    break;
                }
            }
        }
    }
}

/// Apply one input message to the frame queue. Returns true if the message
/// closed an input.
fn handle_message(
    msg: Message,
    inputs: &mut HashMap<String, u64>,
    queue: &mut FrameQueue,
    done: &Arc<StdMutex<Vec<String>>>,
) -> bool {
    match msg.buffer {
        Some(buffer) => {
            let open = inputs.len();
            // Messages from inputs of a finished session have no seat and
            // are dropped.
            if let Some(pos) = inputs.get_mut(&msg.source_id) {
                queue.contribute(*pos, buffer, open);
                *pos += 1;
            }
            false
        }
        None => match inputs.remove(&msg.source_id) {
            Some(pos) => {
                queue.close_from(pos);
                debug!(input = %msg.source_id, position = pos, "mixer input closed");
                done.lock()
                    .expect("mixer done lock poisoned")
                    .push(msg.source_id);
                true
            }
            None => false,
        },
    }
}
