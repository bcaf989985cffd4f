//! Pipe construction and control.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use waveline_core::ParamSet;

use crate::component::{Component, Processor, Sink, Source};
use crate::error::PipeError;
use crate::state::{
    Action, Controller, EVENT_CAPACITY, Event, SIGNAL_CAPACITY, Signal, SignalMessage,
};

/// A pipeline with a fully defined processing sequence: one source, zero or
/// more processors, one or more sinks.
///
/// The pipe is a cheap handle; the state machine runs in its own task. All
/// control methods are safe to call from any task. See [`Pipe::begin`],
/// [`Pipe::exec`] and [`Pipe::wait`] for the control protocol.
#[derive(Debug)]
pub struct Pipe {
    id: String,
    name: String,
    event_tx: Mutex<Option<mpsc::Sender<Event>>>,
    signal_rx: tokio::sync::Mutex<broadcast::Receiver<SignalMessage>>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

/// Configures and builds a [`Pipe`].
#[derive(Default)]
pub struct PipeBuilder {
    name: Option<String>,
    source: Option<Arc<dyn Source>>,
    processors: Vec<Arc<dyn Processor>>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl PipeBuilder {
    /// Attach a human-readable label, for diagnostics only.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Register the source component. Required.
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Append one processor to the chain.
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Append processors in chain order.
    pub fn processors(mut self, processors: impl IntoIterator<Item = Arc<dyn Processor>>) -> Self {
        self.processors.extend(processors);
        self
    }

    /// Register one sink. At least one is required.
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register sinks.
    pub fn sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn Sink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    /// Validate the routing, start the controller task and return the pipe
    /// in the ready state.
    pub async fn build(self) -> Result<Pipe, PipeError> {
        let source = self
            .source
            .ok_or_else(|| PipeError::InvalidRouting("a pipe requires a source".into()))?;
        if self.sinks.is_empty() {
            return Err(PipeError::InvalidRouting(
                "a pipe requires at least one sink".into(),
            ));
        }

        ensure_id(source.as_ref());
        for processor in &self.processors {
            ensure_id(processor.as_ref());
        }
        for sink in &self.sinks {
            ensure_id(sink.as_ref());
        }

        let mut seen = HashSet::new();
        let ids = std::iter::once(source.id())
            .chain(self.processors.iter().map(|p| p.id()))
            .chain(self.sinks.iter().map(|s| s.id()));
        for id in ids {
            if !seen.insert(id.clone()) {
                return Err(PipeError::InvalidRouting(format!(
                    "duplicate component id: {id}"
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let name = self.name.unwrap_or_default();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (signal_tx, signal_rx) = broadcast::channel(SIGNAL_CAPACITY);
        let controller = Controller::new(
            id.clone(),
            name.clone(),
            source,
            self.processors,
            self.sinks,
            event_rx,
            signal_tx,
        );
        let handle = tokio::spawn(controller.run());

        let pipe = Pipe {
            id,
            name,
            event_tx: Mutex::new(Some(event_tx)),
            signal_rx: tokio::sync::Mutex::new(signal_rx),
            controller: Mutex::new(Some(handle)),
        };
        // Consume the construction-time ready signal so the next `Ready` a
        // caller waits for marks the completion of a run.
        pipe.wait(Signal::Ready).await?;
        Ok(pipe)
    }
}

impl Pipe {
    pub fn builder() -> PipeBuilder {
        PipeBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a state transition. Resolves once the transition has been
    /// initiated and returns the signal that marks its completion:
    /// `Run` and `Resume` complete at `Ready` (the stream has drained),
    /// `Pause` completes at `Paused`.
    pub async fn begin(&self, action: Action) -> Result<Signal, PipeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Event::Action {
            action,
            done: done_tx,
        })
        .await?;
        match done_rx.await {
            Ok(result) => result.map(|()| follow_up(action)),
            Err(_) => Err(PipeError::InvalidState),
        }
    }

    /// Request a transition and wait for it to complete.
    pub async fn exec(&self, action: Action) -> Result<(), PipeError> {
        let signal = self.begin(action).await?;
        self.wait(signal).await
    }

    /// Start processing. Returns the completion signal (`Ready`).
    pub async fn run(&self) -> Result<Signal, PipeError> {
        self.begin(Action::Run).await
    }

    /// Pause processing. Returns the completion signal (`Paused`).
    pub async fn pause(&self) -> Result<Signal, PipeError> {
        self.begin(Action::Pause).await
    }

    /// Resume a paused pipe. Returns the completion signal (`Ready`).
    pub async fn resume(&self) -> Result<Signal, PipeError> {
        self.begin(Action::Resume).await
    }

    /// Queue parameters for in-band delivery with the next message.
    pub async fn push(&self, params: ParamSet) -> Result<(), PipeError> {
        self.send(Event::Push(params)).await
    }

    /// Block until `signal` is next emitted, or return the first error the
    /// pipe reports. Returns `Ok` if the pipe has been closed.
    pub async fn wait(&self, signal: Signal) -> Result<(), PipeError> {
        let mut rx = self.signal_rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(SignalMessage {
                    error: Some(err), ..
                }) => return Err(err),
                Ok(msg) if msg.signal == signal => return Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(pipe = %self.id, skipped, "signal receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Shut the pipe down and release its resources.
    ///
    /// Cancels any active run, waits for every stage task to finish and
    /// always returns. Control calls made afterwards report
    /// [`PipeError::InvalidState`].
    pub async fn close(&self) {
        let sender = self
            .event_tx
            .lock()
            .expect("event sender lock poisoned")
            .take();
        drop(sender);
        let handle = self
            .controller
            .lock()
            .expect("controller handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn send(&self, event: Event) -> Result<(), PipeError> {
        let sender = self
            .event_tx
            .lock()
            .expect("event sender lock poisoned")
            .clone()
            .ok_or(PipeError::InvalidState)?;
        sender
            .send(event)
            .await
            .map_err(|_| PipeError::InvalidState)
    }
}

fn follow_up(action: Action) -> Signal {
    match action {
        Action::Run | Action::Resume => Signal::Ready,
        Action::Pause => Signal::Paused,
    }
}

fn ensure_id<C: Component + ?Sized>(component: &C) {
    if component.id().is_empty() {
        component.set_id(Uuid::new_v4().to_string());
    }
}
