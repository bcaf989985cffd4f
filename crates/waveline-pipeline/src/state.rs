//! The pipe controller and its state machine.
//!
//! The controller runs as a dedicated task and owns everything a running
//! pipe shares: the event channel, the signal broadcast, the cached
//! parameter set and the per-run session (cancellation token, ask/give
//! rendezvous with the source, merged stage error channel). Each state is
//! one async function returning the next state, which keeps the transition
//! table exhaustive by construction.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use waveline_core::{Message, ParamSet};

use crate::component::{Processor, Sink, Source};
use crate::error::PipeError;
use crate::runner;

/// Capacity of the signal broadcast channel.
pub(crate) const SIGNAL_CAPACITY: usize = 100;

/// Capacity of the control event channel.
pub(crate) const EVENT_CAPACITY: usize = 16;

/// A state-change notification emitted by a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ready,
    Running,
    Pausing,
    Paused,
}

/// A control action accepted by [`crate::Pipe::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Pause,
    Resume,
}

#[derive(Debug, Clone)]
pub(crate) struct SignalMessage {
    pub(crate) signal: Signal,
    pub(crate) error: Option<PipeError>,
}

pub(crate) enum Event {
    Action {
        action: Action,
        done: oneshot::Sender<Result<(), PipeError>>,
    },
    Push(ParamSet),
}

enum State {
    Ready,
    Running,
    Pausing,
    Paused,
    Closed,
}

/// Everything that exists only while the pipe is running.
struct Session {
    token: CancellationToken,
    ask_rx: mpsc::Receiver<()>,
    ask_open: bool,
    give_tx: mpsc::Sender<Message>,
    err_rx: mpsc::Receiver<PipeError>,
}

/// One step of an active (running or pausing) state.
enum Step {
    /// The source requested a fresh message.
    Ask,
    /// The source exited; stop polling the rendezvous.
    AskClosed,
    /// A stage error, or clean completion (`None`).
    Err(Option<PipeError>),
    /// A control event, or event channel closed (`None`).
    Event(Option<Event>),
}

pub(crate) struct Controller {
    id: String,
    name: String,
    source: Arc<dyn Source>,
    processors: Vec<Arc<dyn Processor>>,
    sinks: Vec<Arc<dyn Sink>>,
    event_rx: mpsc::Receiver<Event>,
    signal_tx: broadcast::Sender<SignalMessage>,
    cached: ParamSet,
    session: Option<Session>,
}

impl Controller {
    pub(crate) fn new(
        id: String,
        name: String,
        source: Arc<dyn Source>,
        processors: Vec<Arc<dyn Processor>>,
        sinks: Vec<Arc<dyn Sink>>,
        event_rx: mpsc::Receiver<Event>,
        signal_tx: broadcast::Sender<SignalMessage>,
    ) -> Self {
        Self {
            id,
            name,
            source,
            processors,
            sinks,
            event_rx,
            signal_tx,
            cached: ParamSet::new(),
            session: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state = State::Ready;
        loop {
            state = match state {
                State::Ready => self.ready().await,
                State::Running => self.running().await,
                State::Pausing => self.pausing().await,
                State::Paused => self.paused().await,
                State::Closed => break,
            };
        }
        self.shutdown().await;
        debug!(pipe = %self.id, "controller finished");
    }

    /// Ready: waiting for a run event.
    async fn ready(&mut self) -> State {
        debug!(pipe = %self.id, name = %self.name, "ready");
        self.signal(Signal::Ready, None);
        loop {
            let Some(event) = self.event_rx.recv().await else {
                return State::Closed;
            };
            match event {
                Event::Push(params) => self.push(params),
                Event::Action {
                    action: Action::Run,
                    done,
                } => match self.start().await {
                    Ok(session) => {
                        self.session = Some(session);
                        let _ = done.send(Ok(()));
                        return State::Running;
                    }
                    Err(err) => {
                        warn!(pipe = %self.id, error = %err, "failed to start");
                        let _ = done.send(Err(err));
                    }
                },
                Event::Action { done, .. } => {
                    let _ = done.send(Err(PipeError::InvalidState));
                }
            }
        }
    }

    /// Running: generating messages and watching for errors.
    async fn running(&mut self) -> State {
        debug!(pipe = %self.id, "running");
        self.signal(Signal::Running, None);
        loop {
            match self.step().await {
                Step::Ask => {
                    let msg = self.next_message();
                    self.give(msg).await;
                }
                Step::AskClosed => {}
                Step::Err(Some(err)) => return self.fail(Signal::Running, err).await,
                Step::Err(None) => {
                    // Source hit end of stream and the whole chain drained.
                    self.session = None;
                    return State::Ready;
                }
                Step::Event(None) => return State::Closed,
                Step::Event(Some(Event::Push(params))) => self.push(params),
                Step::Event(Some(Event::Action {
                    action: Action::Pause,
                    done,
                })) => {
                    let _ = done.send(Ok(()));
                    return State::Pausing;
                }
                Step::Event(Some(Event::Action { done, .. })) => {
                    let _ = done.send(Err(PipeError::InvalidState));
                }
            }
        }
    }

    /// Pausing: the pause was accepted; the next generated message carries
    /// one acknowledgement thunk per sink.
    async fn pausing(&mut self) -> State {
        debug!(pipe = %self.id, "pausing");
        self.signal(Signal::Pausing, None);
        loop {
            match self.step().await {
                Step::Ask => return self.pause_round().await,
                Step::AskClosed => {}
                Step::Err(Some(err)) => return self.fail(Signal::Pausing, err).await,
                Step::Err(None) => return self.finished_while_pausing(),
                Step::Event(None) => return State::Closed,
                Step::Event(Some(Event::Push(params))) => self.push(params),
                Step::Event(Some(Event::Action { done, .. })) => {
                    let _ = done.send(Err(PipeError::InvalidState));
                }
            }
        }
    }

    /// Paused: only resume, push and close are meaningful. The source sits
    /// blocked on the rendezvous, so no messages flow.
    async fn paused(&mut self) -> State {
        debug!(pipe = %self.id, "paused");
        self.signal(Signal::Paused, None);
        loop {
            let Some(event) = self.event_rx.recv().await else {
                return State::Closed;
            };
            match event {
                Event::Push(params) => self.push(params),
                Event::Action {
                    action: Action::Resume,
                    done,
                } => {
                    let _ = done.send(Ok(()));
                    return State::Running;
                }
                Event::Action { done, .. } => {
                    let _ = done.send(Err(PipeError::InvalidState));
                }
            }
        }
    }

    /// Send the acknowledgement-carrying message and wait until every sink
    /// has drained up to it, while still honoring stage errors.
    async fn pause_round(&mut self) -> State {
        let mut msg = self.next_message();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        for sink in &self.sinks {
            let ack = ack_tx.clone();
            msg.params.add(sink.id(), move || {
                let _ = ack.send(());
            });
        }
        drop(ack_tx);
        self.give(msg).await;

        enum AckStep {
            Ack(Option<()>),
            Err(Option<PipeError>),
        }

        let mut pending = self.sinks.len();
        let mut acks_open = true;
        loop {
            if pending == 0 {
                return State::Paused;
            }
            let step = {
                let session = self.session.as_mut().expect("pausing requires a session");
                tokio::select! {
                    ack = ack_rx.recv(), if acks_open => AckStep::Ack(ack),
                    err = session.err_rx.recv() => AckStep::Err(err),
                }
            };
            match step {
                AckStep::Ack(Some(())) => pending -= 1,
                // The message died before reaching every sink; the outcome
                // will arrive on the error channel.
                AckStep::Ack(None) => acks_open = false,
                AckStep::Err(Some(err)) => return self.fail(Signal::Pausing, err).await,
                AckStep::Err(None) => return self.finished_while_pausing(),
            }
        }
    }

    /// The stream completed before the pause did: unblock waiters expecting
    /// `Paused`, then settle back to ready.
    fn finished_while_pausing(&mut self) -> State {
        self.session = None;
        self.signal(Signal::Paused, None);
        State::Ready
    }

    /// One select step of an active state.
    async fn step(&mut self) -> Step {
        let session = self
            .session
            .as_mut()
            .expect("active state requires a session");
        tokio::select! {
            ask = session.ask_rx.recv(), if session.ask_open => match ask {
                Some(()) => Step::Ask,
                None => {
                    session.ask_open = false;
                    Step::AskClosed
                }
            },
            err = session.err_rx.recv() => Step::Err(err),
            event = self.event_rx.recv() => Step::Event(event),
        }
    }

    /// Run every `prepare` hook, then wire and spawn the stage tasks.
    async fn start(&mut self) -> Result<Session, PipeError> {
        let token = CancellationToken::new();

        self.source.prepare(&self.id).await?;
        for processor in &self.processors {
            processor.prepare(&self.id).await?;
        }
        for sink in &self.sinks {
            sink.prepare(&self.id).await?;
        }

        let stage_count = 1 + self.processors.len() + self.sinks.len();
        let (err_tx, err_rx) = mpsc::channel(stage_count);
        let (ask_tx, ask_rx) = mpsc::channel(1);
        let (give_tx, give_rx) = mpsc::channel(1);

        let mut out = runner::run_source(
            self.source.clone(),
            self.id.clone(),
            token.clone(),
            ask_tx,
            give_rx,
            err_tx.clone(),
        );
        for processor in &self.processors {
            out = runner::run_processor(
                processor.clone(),
                self.id.clone(),
                token.clone(),
                out,
                err_tx.clone(),
            );
        }
        let mut sink_queues = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (sink_tx, sink_rx) = mpsc::channel(runner::QUEUE_CAPACITY);
            runner::run_sink(sink.clone(), self.id.clone(), sink_rx, err_tx.clone());
            sink_queues.push((sink.id(), sink_tx));
        }
        runner::run_fan_out(out, sink_queues);

        Ok(Session {
            token,
            ask_rx,
            ask_open: true,
            give_tx,
            err_rx,
        })
    }

    /// First stage error: cancel the session, let the chain drain, discard
    /// errors reported during the drain, then surface the first one.
    async fn fail(&mut self, at: Signal, err: PipeError) -> State {
        warn!(pipe = %self.id, error = %err, "stage failed");
        if let Some(mut session) = self.session.take() {
            session.token.cancel();
            drop(session.give_tx);
            while session.err_rx.recv().await.is_some() {}
        }
        self.signal(at, Some(err));
        State::Ready
    }

    async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.token.cancel();
            drop(session.give_tx);
            while session.err_rx.recv().await.is_some() {}
        }
    }

    /// Reply to a source ask with a fresh message.
    async fn give(&mut self, msg: Message) {
        if let Some(session) = self.session.as_mut() {
            let _ = session.give_tx.send(msg).await;
        }
    }

    /// A fresh message carrying whatever parameters accumulated since the
    /// previous one.
    fn next_message(&mut self) -> Message {
        let mut msg = Message::new(self.id.clone());
        if !self.cached.is_empty() {
            msg.params = std::mem::take(&mut self.cached);
        }
        msg
    }

    fn push(&mut self, mut params: ParamSet) {
        // Thunks addressed to the pipe itself run on receipt.
        params.apply(&self.id);
        self.cached.merge(params);
    }

    fn signal(&self, signal: Signal, error: Option<PipeError>) {
        let _ = self.signal_tx.send(SignalMessage { signal, error });
    }
}
