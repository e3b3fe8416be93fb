use super::{
    CountQueuingStrategy, Locked, QueuingStrategy, StreamResult, Unlocked,
    error::{Reason, StreamError},
    queue::{QueueWithSizes, is_valid_size},
    shared::{StreamFlags, WakerSet, wait_closed},
    validate_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use futures::{
    StreamExt,
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, Either, poll_fn},
};
use parking_lot::Mutex;
use std::{
    future::Future,
    marker::PhantomData,
    pin::pin,
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Writable,
    Closing,
    Closed,
    Errored,
}

// ----------- Sink Trait -----------

/// Underlying sink of a [`WritableStream`].
///
/// Calls are strictly serialized: no `write` or `close` starts while another
/// sink call is outstanding, and none starts before `start` settles.
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Write a chunk to the sink
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = (chunk, controller);
        future::ready(Ok(()))
    }

    /// Close the sink once every queued write has completed
    fn close(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Abort the sink. Sinks without their own abort are closed instead.
    fn abort(
        &mut self,
        reason: Option<Reason>,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        self.close(controller)
    }
}

// ----------- Commands -----------
enum StreamCommand<T> {
    // The writer sizes the chunk and has already counted a valid size into
    // the shared queue total.
    Write {
        chunk: T,
        size: StreamResult<f64>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<Reason>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
}

enum ControllerMsg {
    Error,
}

// A queued write, or the marker telling the task to close the sink once
// everything before it has been written. The chunk is taken out while its
// write is in flight; the record stays at the head until the write succeeds.
enum WriteRecord<T> {
    Chunk {
        chunk: Option<T>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close,
}

// ----------- Controller -----------

/// Handle given to a [`WritableSink`].
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    flags: SharedPtr<StreamFlags>,
    closed_wakers: WakerSet,
}

impl WritableStreamDefaultController {
    /// Error the stream. Queued writes and a pending close are rejected with
    /// `error`, as are the writer's `ready()` and `closed()`.
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        if self.flags.is_errored() {
            return Err(self.flags.stored_error());
        }
        if self.flags.is_closed() {
            return Err(StreamError::Closed);
        }
        if !self.flags.try_error(error) {
            return Err(self.flags.stored_error());
        }
        let _ = self.tx.unbounded_send(ControllerMsg::Error);
        Ok(())
    }

    /// Returns `true` once the stream has errored, including by abort.
    ///
    /// This is a synchronous check, for sinks polling during long writes.
    pub fn is_errored(&self) -> bool {
        self.flags.is_errored()
    }

    /// Resolves with the stored error once the stream errors or is aborted.
    pub fn errored(&self) -> impl Future<Output = StreamError> + use<> {
        let flags = SharedPtr::clone(&self.flags);
        let wakers = self.closed_wakers.clone();
        poll_fn(move |cx| {
            if flags.is_errored() {
                return Poll::Ready(flags.stored_error());
            }
            wakers.register(cx.waker());
            if flags.is_errored() {
                Poll::Ready(flags.stored_error())
            } else {
                Poll::Pending
            }
        })
    }

    /// Races `fut` against the stream erroring.
    ///
    /// If the stream errors (or is aborted) first, returns the stored error
    /// and drops `fut`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use stream_engine::{StreamResult, WritableSink, WritableStreamDefaultController};
    ///
    /// struct SlowSink;
    ///
    /// impl WritableSink<Vec<u8>> for SlowSink {
    ///     async fn write(
    ///         &mut self,
    ///         _chunk: Vec<u8>,
    ///         controller: &mut WritableStreamDefaultController,
    ///     ) -> StreamResult<()> {
    ///         controller
    ///             .with_abort(futures::future::ready(()))
    ///             .await
    ///     }
    /// }
    /// ```
    pub async fn with_abort<F: Future>(&self, fut: F) -> StreamResult<F::Output> {
        match future::select(pin!(fut), pin!(self.errored())).await {
            Either::Left((value, _)) => Ok(value),
            Either::Right((error, _)) => Err(error),
        }
    }
}

// ----------- Stream Inner State -----------

enum InFlight<Sink> {
    Start(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Write(PlatformBoxFutureStatic<(Sink, StreamResult<()>)>),
    Close(PlatformBoxFutureStatic<StreamResult<()>>),
    Abort(PlatformBoxFutureStatic<StreamResult<()>>),
}

enum Settled<Sink> {
    Start(Sink, StreamResult<()>),
    Write(Sink, StreamResult<()>),
    Close(StreamResult<()>),
    Abort(StreamResult<()>),
}

impl<Sink> InFlight<Sink> {
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<Settled<Sink>> {
        match self {
            InFlight::Start(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Start(sink, result)),
            InFlight::Write(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(sink, result)| Settled::Write(sink, result)),
            InFlight::Close(fut) => fut.as_mut().poll(cx).map(Settled::Close),
            InFlight::Abort(fut) => fut.as_mut().poll(cx).map(Settled::Abort),
        }
    }
}

struct WritableStreamInner<T: MaybeSend + 'static, Sink> {
    state: StreamState,
    queue: QueueWithSizes<WriteRecord<T>>,
    sink: Option<Sink>,
    controller: WritableStreamDefaultController,
    in_flight: Option<InFlight<Sink>>,
    started: bool,
    close_completion: Option<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<Option<Reason>>,
    abort_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    flags: SharedPtr<StreamFlags>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn begin_start(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let mut controller = self.controller.clone();
            self.in_flight = Some(InFlight::Start(Box::pin(async move {
                let result = sink.start(&mut controller).await;
                (sink, result)
            })));
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Errored) || self.flags.is_errored()
    }

    /// Take back a size the writer counted for a write that never made it
    /// into the queue.
    fn uncount(&self, size: &StreamResult<f64>) {
        if let Ok(size) = size {
            if is_valid_size(*size) {
                self.flags.add_queue_total_size(-size);
            }
        }
    }

    fn dequeue_record(&mut self) -> Option<WriteRecord<T>> {
        let before = self.queue.total_size();
        let record = self.queue.dequeue();
        self.flags.add_queue_total_size(self.queue.total_size() - before);
        record
    }

    /// Recompute backpressure from the queue; only meaningful while writable,
    /// since requesting close clears it for good.
    fn update_backpressure(&mut self) {
        if self.state != StreamState::Writable {
            return;
        }
        let backpressure = self.flags.high_water_mark() - self.flags.queue_total_size() <= 0.0;
        if backpressure != self.flags.has_backpressure() {
            trace!(backpressure, "writable backpressure changed");
            self.flags.set_backpressure(backpressure);
            if !backpressure {
                self.ready_wakers.wake_all();
            }
        }
    }

    fn advance_queue_if_needed(&mut self) {
        if !self.started || self.in_flight.is_some() || self.is_terminal() {
            return;
        }
        let mut controller = self.controller.clone();
        match self.queue.peek_mut() {
            None => {}
            Some(WriteRecord::Close) => {
                let Some(mut sink) = self.sink.take() else {
                    return;
                };
                trace!("closing sink");
                self.in_flight = Some(InFlight::Close(Box::pin(async move {
                    sink.close(&mut controller).await
                })));
            }
            Some(WriteRecord::Chunk { chunk, .. }) => {
                let Some(chunk) = chunk.take() else {
                    return;
                };
                let Some(mut sink) = self.sink.take() else {
                    return;
                };
                trace!(queued = self.queue.len(), "writing chunk to sink");
                self.in_flight = Some(InFlight::Write(Box::pin(async move {
                    let result = sink.write(chunk, &mut controller).await;
                    (sink, result)
                })));
            }
        }
    }

    fn finalize_close(&mut self) {
        if !self.flags.try_close() {
            return;
        }
        self.state = StreamState::Closed;
        self.queue.clear();
        self.flags.set_queue_total_size(0.0);
        self.flags.set_backpressure(false);
        if let Some(completion) = self.close_completion.take() {
            let _ = completion.send(Ok(()));
        }
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        debug!("writable stream closed");
    }

    /// Cleanup once the flags report errored: every queued write and a
    /// pending close reject with the stored error.
    fn on_errored(&mut self) {
        self.state = StreamState::Errored;
        let error = self.flags.stored_error();
        for record in self.queue.drain() {
            if let WriteRecord::Chunk { completion, .. } = record {
                let _ = completion.send(Err(error.clone()));
            }
        }
        self.flags.set_queue_total_size(0.0);
        if let Some(completion) = self.close_completion.take() {
            let _ = completion.send(Err(error.clone()));
        }
        self.flags.set_backpressure(false);
        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        debug!(%error, "writable stream errored");
    }

    fn error_stream(&mut self, error: StreamError) {
        if !matches!(self.state, StreamState::Writable | StreamState::Closing) {
            return;
        }
        if self.flags.try_error(error) {
            self.on_errored();
        }
    }

    fn handle_controller_msg(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Error => {
                if matches!(self.state, StreamState::Writable | StreamState::Closing) {
                    self.on_errored();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: StreamCommand<T>) {
        match cmd {
            StreamCommand::Write {
                chunk,
                size,
                completion,
            } => {
                let rejection = if self.flags.is_errored() {
                    Some(self.flags.stored_error())
                } else {
                    match self.state {
                        StreamState::Closed => Some(StreamError::Closed),
                        StreamState::Closing => Some(StreamError::Closing),
                        _ => None,
                    }
                };
                if let Some(err) = rejection {
                    self.uncount(&size);
                    let _ = completion.send(Err(err));
                    return;
                }

                let size = match size {
                    Ok(size) => size,
                    Err(err) => {
                        self.error_stream(err);
                        let _ = completion.send(Err(self.flags.stored_error()));
                        return;
                    }
                };
                let record = WriteRecord::Chunk {
                    chunk: Some(chunk),
                    completion,
                };
                if let Err((err, record)) = self.queue.enqueue(record, size) {
                    self.error_stream(err);
                    if let WriteRecord::Chunk { completion, .. } = record {
                        let _ = completion.send(Err(self.flags.stored_error()));
                    }
                    return;
                }
                self.update_backpressure();
                self.advance_queue_if_needed();
            }
            StreamCommand::Close { completion } => {
                if self.flags.is_errored() {
                    let _ = completion.send(Err(self.flags.stored_error()));
                    return;
                }
                match self.state {
                    StreamState::Closed => {
                        let _ = completion.send(Err(StreamError::Closed));
                        return;
                    }
                    StreamState::Closing => {
                        let _ = completion.send(Err(StreamError::Closing));
                        return;
                    }
                    _ => {}
                }

                debug!(queued = self.queue.len(), "writable stream closing");
                self.state = StreamState::Closing;
                self.close_completion = Some(completion);
                // Zero is always a valid size.
                let _ = self.queue.enqueue(WriteRecord::Close, 0.0);
                self.flags.set_backpressure(false);
                self.ready_wakers.wake_all();
                self.advance_queue_if_needed();
            }
            StreamCommand::Abort { reason, completion } => {
                if self.state == StreamState::Closed {
                    let _ = completion.send(Ok(()));
                    return;
                }
                if !self.abort_completions.is_empty() {
                    // An abort is already underway; share its outcome.
                    self.abort_completions.push(completion);
                    return;
                }
                if self.flags.is_errored() {
                    let _ = completion.send(Err(self.flags.stored_error()));
                    return;
                }

                debug!(reason = ?reason, "writable stream aborted");
                self.error_stream(StreamError::Aborted(reason.clone()));
                self.abort_completions.push(completion);
                self.pending_abort = Some(reason);
                if self.in_flight.is_none() {
                    self.begin_abort();
                }
            }
        }
    }

    fn begin_abort(&mut self) {
        let Some(reason) = self.pending_abort.take() else {
            return;
        };
        match self.sink.take() {
            Some(mut sink) => {
                let mut controller = self.controller.clone();
                self.in_flight = Some(InFlight::Abort(Box::pin(async move {
                    sink.abort(reason, &mut controller).await
                })));
            }
            None => self.finish_abort(Ok(())),
        }
    }

    fn finish_abort(&mut self, result: StreamResult<()>) {
        for completion in self.abort_completions.drain(..) {
            let _ = completion.send(result.clone());
        }
    }

    fn settle(&mut self, settled: Settled<Sink>) {
        match settled {
            Settled::Start(sink, result) => {
                self.sink = Some(sink);
                self.started = true;
                if self.pending_abort.is_some() {
                    self.begin_abort();
                    return;
                }
                match result {
                    Ok(()) => self.advance_queue_if_needed(),
                    Err(err) => {
                        debug!(error = %err, "writable sink start failed");
                        self.error_stream(err);
                    }
                }
            }
            Settled::Write(sink, result) => {
                self.sink = Some(sink);
                if self.pending_abort.is_some() {
                    self.begin_abort();
                    return;
                }
                match result {
                    Ok(()) => {
                        if self.is_terminal() {
                            return;
                        }
                        if let Some(WriteRecord::Chunk { completion, .. }) =
                            self.dequeue_record()
                        {
                            let _ = completion.send(Ok(()));
                        }
                        self.update_backpressure();
                        self.advance_queue_if_needed();
                    }
                    Err(err) => {
                        debug!(error = %err, "writable sink write failed");
                        self.error_stream(err);
                    }
                }
            }
            Settled::Close(result) => {
                let abort_result = result.clone();
                match result {
                    Ok(()) => self.finalize_close(),
                    Err(err) => {
                        debug!(error = %err, "writable sink close failed");
                        self.error_stream(err);
                    }
                }
                // The sink is gone, so an abort that arrived meanwhile just
                // reports how the close went.
                if self.pending_abort.take().is_some() {
                    self.finish_abort(abort_result);
                }
            }
            Settled::Abort(result) => {
                if let Err(err) = &result {
                    debug!(error = %err, "writable sink abort failed");
                }
                self.finish_abort(result);
            }
        }
    }
}

// ----------- Stream Task -----------
async fn writable_stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut inner: WritableStreamInner<T, Sink>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    inner.begin_start();
    let mut commands_closed = false;

    poll_fn(|cx| {
        loop {
            while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
                inner.handle_controller_msg(msg);
            }

            while !commands_closed {
                match command_rx.poll_next_unpin(cx) {
                    Poll::Ready(Some(cmd)) => inner.handle_command(cmd),
                    Poll::Ready(None) => commands_closed = true,
                    Poll::Pending => break,
                }
            }

            if let Some(op) = inner.in_flight.as_mut() {
                if let Poll::Ready(settled) = op.poll_settled(cx) {
                    inner.in_flight = None;
                    inner.settle(settled);
                    continue;
                }
            }

            if commands_closed && inner.in_flight.is_none() {
                return Poll::Ready(());
            }
            return Poll::Pending;
        }
    })
    .await;
}

// ----------- Main WritableStream with Typestate -----------

/// A writable stream. `LockState` is [`Unlocked`] for the handle returned by
/// the builder and [`Locked`] for the view handed out with a writer.
pub struct WritableStream<T: MaybeSend + 'static, Sink, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    strategy: SharedPtr<Mutex<BoxedStrategy<T>>>,
    flags: SharedPtr<StreamFlags>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    _phantom: PhantomData<fn() -> (T, Sink, LockState)>,
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new_inner(
        sink: Sink,
        strategy: BoxedStrategy<T>,
    ) -> StreamResult<(Self, impl Future<Output = ()> + MaybeSend + use<T, Sink>)> {
        let high_water_mark = validate_high_water_mark(strategy.high_water_mark())?;
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let flags = SharedPtr::new(StreamFlags::new(high_water_mark));
        // Published before any writer can exist.
        flags.set_backpressure(high_water_mark <= 0.0);
        let ready_wakers = WakerSet::new();
        let closed_wakers = WakerSet::new();

        let controller = WritableStreamDefaultController {
            tx: ctrl_tx,
            flags: SharedPtr::clone(&flags),
            closed_wakers: closed_wakers.clone(),
        };

        let inner = WritableStreamInner {
            state: StreamState::Writable,
            queue: QueueWithSizes::new(),
            sink: Some(sink),
            controller,
            in_flight: None,
            started: false,
            close_completion: None,
            pending_abort: None,
            abort_completions: Vec::new(),
            flags: SharedPtr::clone(&flags),
            ready_wakers: ready_wakers.clone(),
            closed_wakers: closed_wakers.clone(),
        };

        let stream = Self {
            command_tx,
            strategy: SharedPtr::new(Mutex::new(strategy)),
            flags,
            ready_wakers,
            closed_wakers,
            _phantom: PhantomData,
        };

        Ok((stream, writable_stream_task(command_rx, ctrl_rx, inner)))
    }

    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }
}

impl<T: MaybeSend + 'static, Sink, LockState> WritableStream<T, Sink, LockState> {
    fn relabel<L>(&self) -> WritableStream<T, Sink, L> {
        WritableStream {
            command_tx: self.command_tx.clone(),
            strategy: SharedPtr::clone(&self.strategy),
            flags: SharedPtr::clone(&self.flags),
            ready_wakers: self.ready_wakers.clone(),
            closed_wakers: self.closed_wakers.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.flags.is_locked()
    }

    /// Abort the stream, rejecting queued writes and forwarding `reason` to
    /// the sink. Rejects with [`StreamError::Locked`] while a writer holds the
    /// lock; use [`WritableStreamDefaultWriter::abort`] instead.
    pub fn abort(&self, reason: Option<Reason>) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.flags.is_locked() {
            Err(StreamError::Locked)
        } else {
            send_abort(&self.command_tx, reason)
        };
        async move { sent?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }
}

fn send_abort<T>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<Reason>,
) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Abort {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    Ok(rx)
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink, Unlocked> {
    /// Lock the stream to a new writer.
    pub fn get_writer(
        &self,
    ) -> StreamResult<(
        WritableStream<T, Sink, Locked>,
        WritableStreamDefaultWriter<T, Sink>,
    )> {
        if !self.flags.try_lock() {
            return Err(StreamError::Locked);
        }
        Ok((
            self.relabel(),
            WritableStreamDefaultWriter(self.relabel()),
        ))
    }
}

// ----------- Default Writer -----------

/// Exclusive writer of a [`WritableStream`]. Dropping it releases the lock.
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink>(
    WritableStream<T, Sink, Locked>,
);

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    fn check_writable(&self) -> StreamResult<()> {
        let flags = &self.0.flags;
        if flags.is_errored() {
            return Err(flags.stored_error());
        }
        if flags.is_closed() {
            return Err(StreamError::Closed);
        }
        if flags.is_closing() {
            return Err(StreamError::Closing);
        }
        Ok(())
    }

    /// Queue `chunk` for the sink. The returned future resolves once the sink
    /// has written it.
    ///
    /// The chunk is queued when this is called, whether or not the future is
    /// awaited. Writing without awaiting [`ready()`](Self::ready) ignores
    /// backpressure and lets the queue grow without bound.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let sent = self.send_write(chunk);
        async move { sent?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    /// Size `chunk` and count it against the high water mark before the task
    /// sees it, so `ready()` and `desired_size()` reflect the write at once.
    fn send_write(&self, chunk: T) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
        self.check_writable()?;
        let flags = &self.0.flags;
        let size = self.0.strategy.lock().size(&chunk);
        let counted = match size {
            Ok(size) if is_valid_size(size) => Some(size),
            _ => None,
        };
        if let Some(size) = counted {
            flags.add_queue_total_size(size);
            if flags.high_water_mark() - flags.queue_total_size() <= 0.0 {
                flags.set_backpressure(true);
            }
        }

        let (tx, rx) = oneshot::channel();
        let sent = self.0.command_tx.unbounded_send(StreamCommand::Write {
            chunk,
            size,
            completion: tx,
        });
        if sent.is_err() {
            if let Some(size) = counted {
                flags.add_queue_total_size(-size);
            }
            return Err(StreamError::TaskDropped);
        }
        Ok(rx)
    }

    /// Wait for [`ready()`](Self::ready), then queue `chunk` without waiting
    /// for the sink to write it.
    pub async fn enqueue_when_ready(&self, chunk: T) -> StreamResult<()> {
        self.ready().await?;
        self.send_write(chunk).map(drop)
    }

    /// Close the stream once every queued write has been written. Resolves
    /// when the sink's `close` succeeds.
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let (tx, rx) = oneshot::channel();
        let sent = self.request_close(tx);
        async move {
            sent?;
            rx.await.unwrap_or(Err(StreamError::TaskDropped))
        }
    }

    fn request_close(&self, completion: oneshot::Sender<StreamResult<()>>) -> StreamResult<()> {
        let flags = &self.0.flags;
        if flags.is_errored() {
            return Err(flags.stored_error());
        }
        if flags.is_closed() {
            return Err(StreamError::Closed);
        }
        if flags.request_close() {
            return Err(StreamError::Closing);
        }
        self.0
            .command_tx
            .unbounded_send(StreamCommand::Close { completion })
            .map_err(|_| StreamError::TaskDropped)
    }

    pub fn abort(&self, reason: Option<Reason>) -> impl Future<Output = StreamResult<()>> {
        let sent = send_abort(&self.0.command_tx, reason);
        async move { sent?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    /// `None` once errored, `0` once closed, otherwise the high water mark
    /// minus the queued size.
    pub fn desired_size(&self) -> Option<f64> {
        self.0.flags.desired_size()
    }

    /// Resolves while there is no backpressure, or once close was requested.
    /// Rejects with the stored error once the stream errors.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let flags = SharedPtr::clone(&self.0.flags);
        let wakers = self.0.ready_wakers.clone();
        poll_fn(move |cx| {
            if let Some(result) = ready_state(&flags) {
                return Poll::Ready(result);
            }
            wakers.register(cx.waker());
            match ready_state(&flags) {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            }
        })
    }

    /// Resolves when the stream closes, rejects with the stored error when it
    /// errors.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        wait_closed(SharedPtr::clone(&self.0.flags), self.0.closed_wakers.clone())
    }

    /// Release the lock and get the unlocked stream back.
    pub fn release_lock(self) -> WritableStream<T, Sink, Unlocked> {
        // The lock itself is released by `Drop`.
        self.0.relabel()
    }
}

fn ready_state(flags: &StreamFlags) -> Option<StreamResult<()>> {
    if flags.is_errored() {
        Some(Err(flags.stored_error()))
    } else if flags.is_closed() || flags.is_closing() || !flags.has_backpressure() {
        Some(Ok(()))
    } else {
        None
    }
}

impl<T: MaybeSend + 'static, Sink> Drop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(&mut self) {
        self.0.flags.unlock();
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::default()),
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + future without spawning.
    ///
    /// Fails when the strategy's high water mark is NaN or negative.
    pub fn prepare(
        self,
    ) -> StreamResult<(
        WritableStream<T, Sink, Unlocked>,
        impl Future<Output = ()> + MaybeSend,
    )> {
        WritableStream::new_inner(self.sink, self.strategy)
    }

    /// Spawn bundled into one task
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Sink, Unlocked>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }

    /// Spawn using a static function reference
    pub fn spawn_ref<F, R>(
        self,
        spawn_fn: &'static F,
    ) -> StreamResult<WritableStream<T, Sink, Unlocked>>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::spawn_test_task;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    /// Records every sink call in order.
    #[derive(Clone, Default)]
    struct RecordingSink {
        log: SharedPtr<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingSink {
        fn failing_on(chunk: &'static str) -> Self {
            Self {
                fail_on: Some(chunk),
                ..Self::default()
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl WritableSink<String> for RecordingSink {
        async fn write(
            &mut self,
            chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            if self.fail_on.is_some_and(|bad| bad == chunk) {
                return Err(format!("cannot write {chunk}").into());
            }
            self.log.lock().push(format!("write:{chunk}"));
            Ok(())
        }

        async fn close(
            &mut self,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.log.lock().push("close".to_string());
            Ok(())
        }
    }

    /// Blocks every write until released.
    struct GatedSink {
        gate: SharedPtr<Notify>,
        log: SharedPtr<Mutex<Vec<String>>>,
    }

    impl GatedSink {
        fn new() -> (Self, SharedPtr<Notify>, SharedPtr<Mutex<Vec<String>>>) {
            let gate = SharedPtr::new(Notify::new());
            let log = SharedPtr::new(Mutex::new(Vec::new()));
            (
                Self {
                    gate: SharedPtr::clone(&gate),
                    log: SharedPtr::clone(&log),
                },
                gate,
                log,
            )
        }
    }

    impl WritableSink<String> for GatedSink {
        fn write(
            &mut self,
            chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            let gate = SharedPtr::clone(&self.gate);
            let log = SharedPtr::clone(&self.log);
            async move {
                log.lock().push(format!("start:{chunk}"));
                gate.notified().await;
                log.lock().push(format!("done:{chunk}"));
                Ok(())
            }
        }

        async fn abort(
            &mut self,
            reason: Option<Reason>,
            _controller: &mut WritableStreamDefaultController,
        ) -> StreamResult<()> {
            let reason = reason.map(|r| r.to_string()).unwrap_or_default();
            self.log.lock().push(format!("abort:{reason}"));
            Ok(())
        }
    }

    fn spawn_writable<S: WritableSink<String>>(
        sink: S,
        high_water_mark: f64,
    ) -> WritableStream<String, S> {
        WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(high_water_mark))
            .spawn(spawn_test_task)
            .unwrap()
    }

    #[tokio::test]
    async fn close_waits_for_queued_writes() {
        let sink = RecordingSink::default();
        let stream = spawn_writable(sink.clone(), 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        let a = writer.write("a".to_string());
        let b = writer.write("b".to_string());
        let closed = writer.close();

        let (a, b, closed) = tokio::join!(a, b, closed);
        a.unwrap();
        b.unwrap();
        closed.unwrap();

        assert_eq!(sink.log(), vec!["write:a", "write:b", "close"]);
        writer.closed().await.unwrap();
        assert_eq!(writer.desired_size(), Some(0.0));
    }

    #[tokio::test]
    async fn ready_tracks_backpressure() {
        let (sink, gate, _log) = GatedSink::new();
        let stream = spawn_writable(sink, 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        writer.ready().await.unwrap();
        let first = writer.write("one".to_string());
        sleep(Duration::from_millis(20)).await;

        assert_eq!(writer.desired_size(), Some(0.0));
        assert!(
            timeout(Duration::from_millis(50), writer.ready()).await.is_err(),
            "ready must stay pending while the queue is full"
        );

        gate.notify_one();
        first.await.unwrap();
        timeout(Duration::from_secs(1), writer.ready())
            .await
            .expect("ready resolves once the queue drains")
            .unwrap();
        assert_eq!(writer.desired_size(), Some(1.0));
    }

    #[tokio::test]
    async fn write_counts_against_high_water_mark_immediately() {
        let (sink, gate, _log) = GatedSink::new();
        let stream = spawn_writable(sink, 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();
        assert_eq!(writer.desired_size(), Some(1.0));

        let first = writer.write("one".to_string());
        assert_eq!(writer.desired_size(), Some(0.0));
        assert!(
            timeout(Duration::from_millis(50), writer.ready()).await.is_err(),
            "ready must be pending as soon as the write is queued"
        );

        let second = writer.write("two".to_string());
        assert_eq!(writer.desired_size(), Some(-1.0));

        gate.notify_one();
        first.await.unwrap();
        gate.notify_one();
        second.await.unwrap();
        timeout(Duration::from_secs(1), writer.ready())
            .await
            .expect("ready resolves once both writes drain")
            .unwrap();
        assert_eq!(writer.desired_size(), Some(1.0));
    }

    #[tokio::test]
    async fn zero_high_water_mark_starts_with_backpressure() {
        let stream = spawn_writable(RecordingSink::default(), 0.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        assert_eq!(writer.desired_size(), Some(0.0));
        assert!(
            timeout(Duration::from_millis(50), writer.ready()).await.is_err()
        );

        // Requesting close lifts it.
        writer.close().await.unwrap();
        writer.ready().await.unwrap();
    }

    #[tokio::test]
    async fn sink_write_error_errors_the_stream() {
        let sink = RecordingSink::failing_on("bad");
        let stream = spawn_writable(sink.clone(), 4.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        writer.write("ok".to_string()).await.unwrap();
        let err = writer.write("bad".to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot write bad");

        let closed = writer.closed().await.unwrap_err();
        assert_eq!(closed.to_string(), "cannot write bad");

        let later = writer.write("later".to_string()).await.unwrap_err();
        assert_eq!(later.to_string(), "cannot write bad");
        assert!(writer.ready().await.is_err());
        assert_eq!(writer.desired_size(), None);
        assert_eq!(sink.log(), vec!["write:ok"]);
    }

    #[tokio::test]
    async fn write_after_close_is_rejected_without_reaching_sink() {
        let sink = RecordingSink::default();
        let stream = spawn_writable(sink.clone(), 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        let closing = writer.close();
        let rejected = writer.write("late".to_string()).await;
        assert!(matches!(rejected, Err(StreamError::Closing)));
        assert!(matches!(writer.close().await, Err(StreamError::Closing)));

        closing.await.unwrap();
        assert!(matches!(
            writer.write("later".to_string()).await,
            Err(StreamError::Closed)
        ));
        assert!(matches!(writer.close().await, Err(StreamError::Closed)));
        assert_eq!(sink.log(), vec!["close"]);
    }

    #[tokio::test]
    async fn abort_waits_for_in_flight_write_and_rejects_queue() {
        let (sink, gate, log) = GatedSink::new();
        let stream = spawn_writable(sink, 4.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        let first = writer.write("a".to_string());
        let second = writer.write("b".to_string());
        sleep(Duration::from_millis(20)).await;

        let aborted = writer.abort(Some("stop".into()));
        let second = second.await.unwrap_err();
        assert!(matches!(second, StreamError::Aborted(Some(_))));

        gate.notify_one();
        aborted.await.unwrap();
        // The in-flight write's outcome is the abort, not its own success.
        assert!(matches!(first.await, Err(StreamError::Aborted(_))));
        assert_eq!(*log.lock(), vec!["start:a", "done:a", "abort:stop"]);

        let closed = writer.closed().await.unwrap_err();
        assert_eq!(closed.to_string(), "Stream was aborted: stop");
    }

    #[tokio::test]
    async fn abort_falls_back_to_close() {
        let sink = RecordingSink::default();
        let stream = spawn_writable(sink.clone(), 1.0);

        stream.abort(None).await.unwrap();
        assert_eq!(sink.log(), vec!["close"]);

        let (_locked, writer) = stream.get_writer().unwrap();
        assert!(matches!(
            writer.write("x".to_string()).await,
            Err(StreamError::Aborted(None))
        ));
        assert!(matches!(
            writer.abort(None).await,
            Err(StreamError::Aborted(None))
        ));
    }

    #[tokio::test]
    async fn abort_after_close_resolves() {
        let stream = spawn_writable(RecordingSink::default(), 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();
        writer.close().await.unwrap();
        writer.abort(Some("too late".into())).await.unwrap();
        writer.closed().await.unwrap();
    }

    #[tokio::test]
    async fn writer_lock_is_exclusive() {
        let stream = spawn_writable(RecordingSink::default(), 1.0);
        assert!(!stream.locked());

        let (_locked, writer) = stream.get_writer().unwrap();
        assert!(stream.locked());
        assert!(matches!(stream.get_writer(), Err(StreamError::Locked)));
        assert!(matches!(
            stream.abort(None).await,
            Err(StreamError::Locked)
        ));

        let stream = writer.release_lock();
        assert!(!stream.locked());
        let (_locked, writer) = stream.get_writer().unwrap();
        drop(writer);
        assert!(!stream.locked());
    }

    #[tokio::test]
    async fn controller_error_rejects_everything_pending() {
        struct HoldingSink {
            controller: SharedPtr<Mutex<Option<WritableStreamDefaultController>>>,
            gate: SharedPtr<Notify>,
        }

        impl WritableSink<u32> for HoldingSink {
            async fn start(
                &mut self,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                *self.controller.lock() = Some(controller.clone());
                Ok(())
            }

            async fn write(
                &mut self,
                _chunk: u32,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                self.gate.notified().await;
                Ok(())
            }
        }

        let slot = SharedPtr::new(Mutex::new(None));
        let sink = HoldingSink {
            controller: SharedPtr::clone(&slot),
            gate: SharedPtr::new(Notify::new()),
        };
        let stream = WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(1.0))
            .spawn(spawn_test_task)
            .unwrap();
        let (_locked, writer) = stream.get_writer().unwrap();

        let first = writer.write(1);
        let second = writer.write(2);
        sleep(Duration::from_millis(20)).await;

        let controller = slot.lock().clone().expect("sink started");
        controller.error("fatal".into()).unwrap();
        assert!(controller.is_errored());
        assert!(controller.error("again".into()).is_err());

        assert_eq!(first.await.unwrap_err().to_string(), "fatal");
        assert_eq!(second.await.unwrap_err().to_string(), "fatal");
        assert_eq!(writer.ready().await.unwrap_err().to_string(), "fatal");
        assert_eq!(writer.closed().await.unwrap_err().to_string(), "fatal");
        assert_eq!(writer.close().await.unwrap_err().to_string(), "fatal");
    }

    #[tokio::test]
    async fn with_abort_interrupts_long_write() {
        struct StuckSink;

        impl WritableSink<u32> for StuckSink {
            async fn write(
                &mut self,
                _chunk: u32,
                controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                controller.with_abort(future::pending::<()>()).await
            }
        }

        let stream = WritableStream::builder(StuckSink)
            .spawn(spawn_test_task)
            .unwrap();
        let (_locked, writer) = stream.get_writer().unwrap();

        let stuck = writer.write(7);
        sleep(Duration::from_millis(20)).await;

        timeout(Duration::from_secs(1), writer.abort(Some("enough".into())))
            .await
            .expect("abort is not blocked by the stuck write")
            .unwrap();
        assert!(matches!(stuck.await, Err(StreamError::Aborted(_))));
    }

    #[tokio::test]
    async fn sizing_failure_errors_stream_and_rejects_write() {
        struct Picky;

        impl QueuingStrategy<u32> for Picky {
            fn size(&self, chunk: &u32) -> StreamResult<f64> {
                if *chunk > 100 {
                    Err("too big".into())
                } else {
                    Ok(1.0)
                }
            }

            fn high_water_mark(&self) -> f64 {
                8.0
            }
        }

        let stream = WritableStream::builder(StuckFree)
            .strategy(Picky)
            .spawn(spawn_test_task)
            .unwrap();
        let (_locked, writer) = stream.get_writer().unwrap();

        writer.write(1).await.unwrap();
        assert_eq!(writer.write(500).await.unwrap_err().to_string(), "too big");
        assert_eq!(writer.closed().await.unwrap_err().to_string(), "too big");
    }

    struct StuckFree;

    impl WritableSink<u32> for StuckFree {}

    #[tokio::test]
    async fn start_failure_errors_stream() {
        struct BrokenStart;

        impl WritableSink<u32> for BrokenStart {
            async fn start(
                &mut self,
                _controller: &mut WritableStreamDefaultController,
            ) -> StreamResult<()> {
                Err("no connection".into())
            }
        }

        let stream = WritableStream::builder(BrokenStart)
            .spawn(spawn_test_task)
            .unwrap();
        let (_locked, writer) = stream.get_writer().unwrap();

        let err = writer.closed().await.unwrap_err();
        assert_eq!(err.to_string(), "no connection");
        assert_eq!(writer.write(1).await.unwrap_err().to_string(), "no connection");
    }

    #[test]
    fn builder_rejects_invalid_high_water_mark() {
        let result = WritableStream::builder(StuckFree)
            .strategy(CountQueuingStrategy::new(-2.0))
            .prepare();
        assert!(matches!(result, Err(StreamError::InvalidHighWaterMark(_))));
    }

    #[tokio::test]
    async fn enqueue_when_ready_feeds_sink() {
        let sink = RecordingSink::default();
        let stream = spawn_writable(sink.clone(), 1.0);
        let (_locked, writer) = stream.get_writer().unwrap();

        for word in ["x", "y", "z"] {
            writer.enqueue_when_ready(word.to_string()).await.unwrap();
        }
        writer.close().await.unwrap();
        assert_eq!(sink.log(), vec!["write:x", "write:y", "write:z", "close"]);
    }

    #[tokio::test]
    async fn prepared_stream_runs_on_caller_task() {
        let sink = RecordingSink::default();
        let (stream, fut) = WritableStream::builder(sink.clone()).prepare().unwrap();
        let task = tokio::spawn(fut);

        let (locked, writer) = stream.get_writer().unwrap();
        writer.write("only".to_string()).await.unwrap();
        writer.close().await.unwrap();
        drop(writer);
        drop(locked);
        drop(stream);

        timeout(Duration::from_secs(1), task)
            .await
            .expect("task ends once every handle is gone")
            .unwrap();
        assert_eq!(sink.log(), vec!["write:only", "close"]);
    }
}
