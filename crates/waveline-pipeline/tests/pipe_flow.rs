//! End-to-end pipe behavior, exercised with mock components.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use waveline_pipeline::{
    Action, Buffer, Component, Message, ParamSet, Pipe, PipeError, Processor, Signal, SingleUse,
    Sink, Source, Uid,
};

/// Emits `limit` buffers filled with a fixed value; both knobs are
/// adjustable through pushed parameters.
struct MockPump {
    uid: Uid,
    limit: Arc<AtomicUsize>,
    value: Arc<AtomicU32>,
    buffer_size: usize,
    num_channels: usize,
}

impl MockPump {
    fn new(limit: usize, value: f32, buffer_size: usize, num_channels: usize) -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            limit: Arc::new(AtomicUsize::new(limit)),
            value: Arc::new(AtomicU32::new(value.to_bits())),
            buffer_size,
            num_channels,
        })
    }

    fn limit_param(&self, limit: usize) -> impl FnOnce() + Send + 'static {
        let cell = self.limit.clone();
        move || cell.store(limit, Ordering::SeqCst)
    }

    fn value_param(&self, value: f32) -> impl FnOnce() + Send + 'static {
        let cell = self.value.clone();
        move || cell.store(value.to_bits(), Ordering::SeqCst)
    }
}

impl Component for MockPump {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Source for MockPump {
    async fn pump(&self, msg: Message) -> Result<Message, PipeError> {
        let taken = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_err() {
            return Err(PipeError::Eof);
        }
        let value = f32::from_bits(self.value.load(Ordering::SeqCst));
        Ok(msg.with_buffer(Buffer::constant(
            self.num_channels,
            self.buffer_size,
            value,
        )))
    }
}

/// Emits `limit` buffers where the Nth buffer holds the value N, so a sink
/// can verify ordering and completeness of the delivered stream.
struct RampPump {
    uid: Uid,
    next: AtomicUsize,
    limit: usize,
    buffer_size: usize,
}

impl RampPump {
    fn new(limit: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            next: AtomicUsize::new(0),
            limit,
            buffer_size,
        })
    }
}

impl Component for RampPump {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Source for RampPump {
    async fn pump(&self, msg: Message) -> Result<Message, PipeError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if n >= self.limit {
            return Err(PipeError::Eof);
        }
        Ok(msg.with_buffer(Buffer::constant(1, self.buffer_size, n as f32)))
    }
}

/// Applies a pure function to every sample.
struct MapProcessor {
    uid: Uid,
    map: fn(f32) -> f32,
}

impl MapProcessor {
    fn new(map: fn(f32) -> f32) -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            map,
        })
    }
}

impl Component for MapProcessor {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Processor for MapProcessor {
    async fn process(&self, mut msg: Message) -> Result<Message, PipeError> {
        if let Some(buffer) = msg.buffer.take() {
            let mapped = buffer
                .channels()
                .map(|channel| channel.iter().map(|s| (self.map)(*s)).collect())
                .collect();
            msg.buffer = Some(Arc::new(Buffer::new(mapped)));
        }
        Ok(msg)
    }
}

/// Passes messages through until its Nth invocation, which fails.
struct FailingProcessor {
    uid: Uid,
    calls: AtomicUsize,
    fail_at: usize,
}

impl FailingProcessor {
    fn new(fail_at: usize) -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            calls: AtomicUsize::new(0),
            fail_at,
        })
    }
}

impl Component for FailingProcessor {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, msg: Message) -> Result<Message, PipeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(PipeError::failure("processor exploded"));
        }
        Ok(msg)
    }
}

/// Records every buffer it receives. Cleared when a run starts.
struct MockSink {
    uid: Uid,
    received: Mutex<Vec<Arc<Buffer>>>,
}

impl MockSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            uid: Uid::default(),
            received: Mutex::new(Vec::new()),
        })
    }

    fn message_count(&self) -> usize {
        self.received.lock().expect("received lock").len()
    }

    fn sample_count(&self) -> usize {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .map(|b| b.size())
            .sum()
    }

    /// Channel zero of every received buffer, concatenated.
    fn samples(&self) -> Vec<f32> {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .filter_map(|b| b.channel(0))
            .flatten()
            .copied()
            .collect()
    }
}

impl Component for MockSink {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn prepare(&self, _pipe_id: &str) -> Result<(), PipeError> {
        self.received.lock().expect("received lock").clear();
        Ok(())
    }

    async fn write(&self, msg: Message) -> Result<(), PipeError> {
        if let Some(buffer) = msg.buffer {
            self.received.lock().expect("received lock").push(buffer);
        }
        Ok(())
    }
}

/// A source whose prepare hook only tolerates a single run.
struct OncePump {
    uid: Uid,
    guard: SingleUse,
}

impl Component for OncePump {
    fn id(&self) -> String {
        self.uid.get()
    }

    fn set_id(&self, id: String) {
        self.uid.set(id)
    }
}

#[async_trait]
impl Source for OncePump {
    async fn prepare(&self, _pipe_id: &str) -> Result<(), PipeError> {
        self.guard.claim()
    }

    async fn pump(&self, _msg: Message) -> Result<Message, PipeError> {
        Err(PipeError::Eof)
    }
}

fn ramp(limit: usize, buffer_size: usize) -> Vec<f32> {
    (0..limit)
        .flat_map(|n| vec![n as f32; buffer_size])
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn run_delivers_every_buffer_in_order_to_every_sink() {
    let pump = RampPump::new(20, 4);
    let first = MockSink::new();
    let second = MockSink::new();
    let pipe = Pipe::builder()
        .name("fan-out")
        .source(pump)
        .sink(first.clone())
        .sink(second.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.exec(Action::Run).await.expect("run to completion");

    let expected = ramp(20, 4);
    assert_eq!(first.samples(), expected);
    assert_eq!(second.samples(), expected);
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn processors_apply_in_chain_order() {
    let pump = RampPump::new(10, 2);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .processor(MapProcessor::new(|s| s + 1.0))
        .processor(MapProcessor::new(|s| s * 2.0))
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.exec(Action::Run).await.expect("run to completion");

    let expected: Vec<f32> = ramp(10, 2).into_iter().map(|s| (s + 1.0) * 2.0).collect();
    assert_eq!(sink.samples(), expected);
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_eof_terminates_cleanly() {
    let pump = MockPump::new(0, 0.5, 8, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.exec(Action::Run).await.expect("run to completion");

    assert_eq!(sink.message_count(), 0);
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_resume_preserves_the_stream() {
    let pump = RampPump::new(5000, 2);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.run().await.expect("start");
    pipe.exec(Action::Pause).await.expect("pause acknowledged");

    let delivered_at_pause = sink.message_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        sink.message_count(),
        delivered_at_pause,
        "a paused pipe must not deliver further buffers"
    );

    pipe.resume().await.expect("resume");
    pipe.wait(Signal::Ready).await.expect("run to completion");

    assert_eq!(sink.samples(), ramp(5000, 2));
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn params_pushed_before_run_arrive_with_the_first_buffer() {
    let pump = MockPump::new(1, 0.0, 10, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump.clone())
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    let mut params = ParamSet::new();
    params.add(pump.id(), pump.limit_param(5));
    params.add(pump.id(), pump.value_param(0.25));
    pipe.push(params).await.expect("push");

    pipe.exec(Action::Run).await.expect("run to completion");

    assert_eq!(sink.message_count(), 5);
    assert_eq!(sink.sample_count(), 50);
    assert!(
        sink.samples().iter().all(|s| (*s - 0.25).abs() < 1e-6),
        "every buffer must reflect the pushed value"
    );
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn params_pushed_while_paused_switch_the_stream_exactly_once() {
    let pump = MockPump::new(2000, 0.25, 4, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump.clone())
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.run().await.expect("start");
    pipe.exec(Action::Pause).await.expect("pause acknowledged");

    let mut params = ParamSet::new();
    params.add(pump.id(), pump.value_param(0.75));
    pipe.push(params).await.expect("push");

    pipe.resume().await.expect("resume");
    pipe.wait(Signal::Ready).await.expect("run to completion");

    let samples = sink.samples();
    let switch = samples
        .iter()
        .position(|s| (*s - 0.75).abs() < 1e-6)
        .expect("the new value must appear");
    assert!(samples[..switch].iter().all(|s| (*s - 0.25).abs() < 1e-6));
    assert!(samples[switch..].iter().all(|s| (*s - 0.75).abs() < 1e-6));
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn params_addressed_to_the_pipe_apply_on_push() {
    let pump = MockPump::new(0, 0.0, 4, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink)
        .build()
        .await
        .expect("build pipe");

    let applied = Arc::new(AtomicUsize::new(0));
    let cell = applied.clone();
    let mut params = ParamSet::new();
    params.add(pipe.id(), move || {
        cell.store(1, Ordering::SeqCst);
    });
    pipe.push(params).await.expect("push");

    // Pipe-targeted thunks run when the push is received, without any
    // message flowing.
    for _ in 0..100 {
        if applied.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(applied.load(Ordering::SeqCst), 1);
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_error_cancels_the_run_and_is_surfaced_once() {
    let pump = RampPump::new(1000, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .processor(FailingProcessor::new(4))
        .sink(sink.clone())
        .build()
        .await
        .expect("build pipe");

    pipe.run().await.expect("start");
    let err = pipe
        .wait(Signal::Ready)
        .await
        .expect_err("the processor failure must surface");
    assert_eq!(err, PipeError::failure("processor exploded"));
    assert_eq!(
        sink.message_count(),
        3,
        "the sink sees exactly the buffers that preceded the failure"
    );

    // The pipe settled back to ready and accepts another run.
    pipe.run().await.expect("ready again after the failure");
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn control_events_in_the_wrong_state_are_rejected() {
    let pump = MockPump::new(usize::MAX, 0.5, 4, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink)
        .build()
        .await
        .expect("build pipe");

    assert_eq!(pipe.resume().await, Err(PipeError::InvalidState));
    assert_eq!(pipe.pause().await, Err(PipeError::InvalidState));

    pipe.run().await.expect("start");
    assert_eq!(pipe.run().await, Err(PipeError::InvalidState));

    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_terminates_a_running_pipe() {
    let pump = MockPump::new(usize::MAX, 0.5, 4, 1);
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink)
        .build()
        .await
        .expect("build pipe");

    pipe.run().await.expect("start");
    tokio::time::timeout(Duration::from_secs(5), pipe.close())
        .await
        .expect("close must terminate every stage task");

    assert_eq!(pipe.push(ParamSet::new()).await, Err(PipeError::InvalidState));
    assert_eq!(pipe.run().await, Err(PipeError::InvalidState));
    assert!(pipe.wait(Signal::Ready).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_use_source_rejects_a_second_run() {
    let pump = Arc::new(OncePump {
        uid: Uid::default(),
        guard: SingleUse::new(),
    });
    let sink = MockSink::new();
    let pipe = Pipe::builder()
        .source(pump)
        .sink(sink)
        .build()
        .await
        .expect("build pipe");

    pipe.exec(Action::Run).await.expect("first run");
    assert_eq!(pipe.run().await, Err(PipeError::SingleUseReused));
    pipe.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn builder_rejects_incomplete_routing() {
    let err = Pipe::builder()
        .sink(MockSink::new())
        .build()
        .await
        .expect_err("source is required");
    assert!(matches!(err, PipeError::InvalidRouting(_)));

    let err = Pipe::builder()
        .source(MockPump::new(1, 0.0, 4, 1))
        .build()
        .await
        .expect_err("at least one sink is required");
    assert!(matches!(err, PipeError::InvalidRouting(_)));

    let shared = MockSink::new();
    shared.set_id("duplicate".into());
    let twin = MockSink::new();
    twin.set_id("duplicate".into());
    let err = Pipe::builder()
        .source(MockPump::new(1, 0.0, 4, 1))
        .sink(shared)
        .sink(twin)
        .build()
        .await
        .expect_err("component ids must be unique within a pipe");
    assert!(matches!(err, PipeError::InvalidRouting(_)));
}
