use super::{
    CountQueuingStrategy, Locked, QueuingStrategy, StreamResult, Unlocked,
    error::{Reason, StreamError},
    queue::QueueWithSizes,
    shared::{StreamFlags, WakerSet, wait_closed},
    validate_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use futures::{
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
        oneshot,
    },
    future::{self, poll_fn},
    stream::{self, Stream, StreamExt},
};
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    task::{Context, Poll},
};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------

/// Underlying source of a [`ReadableStream`].
///
/// Every method is optional; the defaults resolve immediately. `pull` is never
/// called again while a previous `pull` is outstanding, and not at all before
/// `start` settles.
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    fn cancel(
        &mut self,
        reason: Option<Reason>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

// ----------- Commands -----------
enum StreamCommand<T> {
    Read {
        completion: oneshot::Sender<StreamResult<Option<T>>>,
    },
    Cancel {
        reason: Option<Reason>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
}

enum ControllerMsg<T> {
    Enqueue { chunk: T },
    Close,
    Error,
}

// ----------- Controller -----------

/// Handle given to a [`ReadableSource`] to push chunks into its stream.
///
/// Calls are checked against the stream state synchronously and then applied
/// by the stream task in the order they were made.
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    tx: UnboundedSender<ControllerMsg<T>>,
    flags: SharedPtr<StreamFlags>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            flags: SharedPtr::clone(&self.flags),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    fn check_readable(&self) -> StreamResult<()> {
        if self.flags.is_errored() {
            return Err(self.flags.stored_error());
        }
        if self.flags.is_closed() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// `None` once errored, `0` once closed, otherwise the high water mark
    /// minus the queued size.
    pub fn desired_size(&self) -> Option<f64> {
        self.flags.desired_size()
    }

    /// Request close. The stream closes once every queued chunk has been read.
    pub fn close(&self) -> StreamResult<()> {
        self.check_readable()?;
        if self.flags.request_close() {
            return Err(StreamError::Closing);
        }
        self.tx
            .unbounded_send(ControllerMsg::Close)
            .map_err(|_| StreamError::TaskDropped)
    }

    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        self.check_readable()?;
        if self.flags.is_closing() {
            return Err(StreamError::Closing);
        }
        self.tx
            .unbounded_send(ControllerMsg::Enqueue { chunk })
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Error the stream: queued chunks are discarded and every pending and
    /// future read rejects with `error`.
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.check_readable()?;
        if !self.flags.try_error(error) {
            return self.check_readable();
        }
        let _ = self.tx.unbounded_send(ControllerMsg::Error);
        Ok(())
    }
}

// ----------- Stream Inner State -----------

// Source calls being driven by the task. The source is moved into the future
// and handed back when it settles.
enum InFlight<Source> {
    Start(PlatformBoxFutureStatic<(Source, StreamResult<()>)>),
    Pull(PlatformBoxFutureStatic<(Source, StreamResult<()>)>),
    Cancel(PlatformBoxFutureStatic<StreamResult<()>>),
}

enum Settled<Source> {
    Start(Source, StreamResult<()>),
    Pull(Source, StreamResult<()>),
    Cancel(StreamResult<()>),
}

impl<Source> InFlight<Source> {
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<Settled<Source>> {
        match self {
            InFlight::Start(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(source, result)| Settled::Start(source, result)),
            InFlight::Pull(fut) => fut
                .as_mut()
                .poll(cx)
                .map(|(source, result)| Settled::Pull(source, result)),
            InFlight::Cancel(fut) => fut.as_mut().poll(cx).map(Settled::Cancel),
        }
    }
}

struct ReadableStreamInner<T: MaybeSend + 'static, Source> {
    state: StreamState,
    queue: QueueWithSizes<T>,
    strategy: BoxedStrategy<T>,
    source: Option<Source>,
    controller: ReadableStreamDefaultController<T>,
    in_flight: Option<InFlight<Source>>,
    started: bool,
    close_requested: bool,
    pull_again: bool,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
    pending_cancel: Option<Option<Reason>>,
    cancel_completion: Option<oneshot::Sender<StreamResult<()>>>,
    flags: SharedPtr<StreamFlags>,
    closed_wakers: WakerSet,
}

impl<T, Source> ReadableStreamInner<T, Source>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    fn begin_start(&mut self) {
        if let Some(mut source) = self.source.take() {
            let mut controller = self.controller.clone();
            self.in_flight = Some(InFlight::Start(Box::pin(async move {
                let result = source.start(&mut controller).await;
                (source, result)
            })));
        }
    }

    fn publish_queue_size(&self) {
        self.flags.set_queue_total_size(self.queue.total_size());
    }

    fn has_live_reads(&self) -> bool {
        self.pending_reads.iter().any(|read| !read.is_canceled())
    }

    fn should_call_pull(&self) -> bool {
        if self.state != StreamState::Readable
            || self.flags.is_errored()
            || self.flags.is_closing()
            || !self.started
        {
            return false;
        }
        if self.has_live_reads() {
            return true;
        }
        self.flags.high_water_mark() - self.queue.total_size() > 0.0
    }

    fn call_pull_if_needed(&mut self) {
        if !self.should_call_pull() {
            return;
        }
        if self.in_flight.is_some() {
            self.pull_again = true;
            return;
        }
        let Some(mut source) = self.source.take() else {
            return;
        };
        trace!(queued = self.queue.len(), "calling pull");
        let mut controller = self.controller.clone();
        self.in_flight = Some(InFlight::Pull(Box::pin(async move {
            let result = source.pull(&mut controller).await;
            (source, result)
        })));
    }

    /// Hand `chunk` to the oldest read still being awaited; gives the chunk
    /// back when there is none.
    fn fulfill_read(&mut self, mut chunk: T) -> Option<T> {
        while let Some(read) = self.pending_reads.pop_front() {
            match read.send(Ok(Some(chunk))) {
                Ok(()) => return None,
                Err(returned) => {
                    // The receiver is gone; the chunk comes back untouched.
                    let Ok(Some(returned)) = returned else {
                        return None;
                    };
                    chunk = returned;
                }
            }
        }
        Some(chunk)
    }

    fn finalize_close(&mut self) {
        if !self.flags.try_close() {
            return;
        }
        self.state = StreamState::Closed;
        for read in self.pending_reads.drain(..) {
            let _ = read.send(Ok(None));
        }
        self.closed_wakers.wake_all();
        debug!("readable stream closed");
    }

    /// Cleanup once the flags report errored.
    fn on_errored(&mut self) {
        self.state = StreamState::Errored;
        self.queue.clear();
        self.publish_queue_size();
        let error = self.flags.stored_error();
        for read in self.pending_reads.drain(..) {
            let _ = read.send(Err(error.clone()));
        }
        self.closed_wakers.wake_all();
        debug!(%error, "readable stream errored");
    }

    fn error_stream(&mut self, error: StreamError) {
        if self.state != StreamState::Readable {
            return;
        }
        if self.flags.try_error(error) {
            self.on_errored();
        }
    }

    fn handle_controller_msg(&mut self, msg: ControllerMsg<T>) {
        match msg {
            ControllerMsg::Enqueue { chunk } => {
                if self.state != StreamState::Readable {
                    return;
                }
                let Some(chunk) = self.fulfill_read(chunk) else {
                    self.call_pull_if_needed();
                    return;
                };
                let sized = self
                    .strategy
                    .size(&chunk)
                    .and_then(|size| self.queue.enqueue(chunk, size).map_err(|(err, _)| err));
                match sized {
                    Ok(()) => {
                        self.publish_queue_size();
                        self.call_pull_if_needed();
                    }
                    Err(err) => self.error_stream(err),
                }
            }
            ControllerMsg::Close => {
                if self.state != StreamState::Readable {
                    return;
                }
                self.close_requested = true;
                if self.queue.is_empty() {
                    self.finalize_close();
                }
            }
            ControllerMsg::Error => {
                if self.state == StreamState::Readable {
                    self.on_errored();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: StreamCommand<T>) {
        match cmd {
            StreamCommand::Read { completion } => {
                self.flags.mark_disturbed();
                if self.flags.is_errored() {
                    let _ = completion.send(Err(self.flags.stored_error()));
                    return;
                }
                if self.state == StreamState::Closed {
                    let _ = completion.send(Ok(None));
                    return;
                }
                match self.queue.dequeue() {
                    Some(chunk) => {
                        self.publish_queue_size();
                        let _ = completion.send(Ok(Some(chunk)));
                        if self.close_requested && self.queue.is_empty() {
                            self.finalize_close();
                        } else {
                            self.call_pull_if_needed();
                        }
                    }
                    None => {
                        self.pending_reads.push_back(completion);
                        self.call_pull_if_needed();
                    }
                }
            }
            StreamCommand::Cancel { reason, completion } => {
                self.flags.mark_disturbed();
                if self.flags.is_errored() {
                    let _ = completion.send(Err(self.flags.stored_error()));
                    return;
                }
                if self.state == StreamState::Closed {
                    let _ = completion.send(Ok(()));
                    return;
                }
                self.queue.clear();
                self.publish_queue_size();
                self.finalize_close();
                if self.state != StreamState::Closed {
                    let _ = completion.send(Err(self.flags.stored_error()));
                    return;
                }
                debug!(reason = ?reason, "readable stream canceled");
                self.cancel_completion = Some(completion);
                self.pending_cancel = Some(reason);
                if self.in_flight.is_none() {
                    self.begin_cancel();
                }
            }
        }
    }

    fn begin_cancel(&mut self) {
        let Some(reason) = self.pending_cancel.take() else {
            return;
        };
        match self.source.take() {
            Some(mut source) => {
                self.in_flight = Some(InFlight::Cancel(Box::pin(async move {
                    source.cancel(reason).await
                })));
            }
            None => {
                if let Some(completion) = self.cancel_completion.take() {
                    let _ = completion.send(Ok(()));
                }
            }
        }
    }

    fn settle(&mut self, settled: Settled<Source>) {
        match settled {
            Settled::Start(source, result) => {
                self.source = Some(source);
                self.started = true;
                if self.pending_cancel.is_some() {
                    self.begin_cancel();
                    return;
                }
                match result {
                    Ok(()) => self.call_pull_if_needed(),
                    Err(err) => {
                        debug!(error = %err, "readable source start failed");
                        self.error_stream(err);
                    }
                }
            }
            Settled::Pull(source, result) => {
                self.source = Some(source);
                if self.pending_cancel.is_some() {
                    self.begin_cancel();
                    return;
                }
                match result {
                    Ok(()) => {
                        if self.pull_again {
                            self.pull_again = false;
                            self.call_pull_if_needed();
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "readable source pull failed");
                        self.error_stream(err);
                    }
                }
            }
            Settled::Cancel(result) => {
                if let Err(err) = &result {
                    debug!(error = %err, "readable source cancel failed");
                }
                if let Some(completion) = self.cancel_completion.take() {
                    let _ = completion.send(result);
                }
            }
        }
    }
}

// ----------- Stream Task -----------
async fn readable_stream_task<T, Source>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg<T>>,
    mut inner: ReadableStreamInner<T, Source>,
) where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    inner.begin_start();
    let mut commands_closed = false;

    poll_fn(|cx| {
        loop {
            // Controller messages first: a source's enqueues must land before
            // pull scheduling is evaluated again.
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
                    // Whatever the operation enqueued lands before pull
                    // scheduling looks at the queue again. The op still counts
                    // as in flight here, so a pull it asks for is deferred.
                    while let Poll::Ready(Some(msg)) = ctrl_rx.poll_next_unpin(cx) {
                        inner.handle_controller_msg(msg);
                    }
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

// ----------- Main ReadableStream with Typestate -----------

/// A readable stream. `LockState` is [`Unlocked`] for the handle returned by
/// the builder and [`Locked`] for the view handed out with a reader.
pub struct ReadableStream<T: MaybeSend + 'static, Source, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    flags: SharedPtr<StreamFlags>,
    closed_wakers: WakerSet,
    _phantom: PhantomData<fn() -> (T, Source, LockState)>,
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    pub(crate) fn new_inner(
        source: Source,
        strategy: BoxedStrategy<T>,
    ) -> StreamResult<(
        Self,
        ReadableStreamDefaultController<T>,
        impl Future<Output = ()> + MaybeSend + use<T, Source>,
    )> {
        let high_water_mark = validate_high_water_mark(strategy.high_water_mark())?;
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let flags = SharedPtr::new(StreamFlags::new(high_water_mark));
        let closed_wakers = WakerSet::new();

        let controller = ReadableStreamDefaultController {
            tx: ctrl_tx,
            flags: SharedPtr::clone(&flags),
        };

        let inner = ReadableStreamInner {
            state: StreamState::Readable,
            queue: QueueWithSizes::new(),
            strategy,
            source: Some(source),
            controller: controller.clone(),
            in_flight: None,
            started: false,
            close_requested: false,
            pull_again: false,
            pending_reads: VecDeque::new(),
            pending_cancel: None,
            cancel_completion: None,
            flags: SharedPtr::clone(&flags),
            closed_wakers: closed_wakers.clone(),
        };

        let stream = Self {
            command_tx,
            flags,
            closed_wakers,
            _phantom: PhantomData,
        };

        Ok((
            stream,
            controller,
            readable_stream_task(command_rx, ctrl_rx, inner),
        ))
    }

    /// Returns a builder for this readable stream
    pub fn builder(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }
}

impl<T: MaybeSend + 'static, Source, LockState> ReadableStream<T, Source, LockState> {
    fn relabel<L>(&self) -> ReadableStream<T, Source, L> {
        ReadableStream {
            command_tx: self.command_tx.clone(),
            flags: SharedPtr::clone(&self.flags),
            closed_wakers: self.closed_wakers.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.flags.is_locked()
    }

    /// Whether the stream has ever been read from or canceled.
    pub fn is_disturbed(&self) -> bool {
        self.flags.is_disturbed()
    }

    /// Cancel the stream, discarding queued chunks and forwarding `reason` to
    /// the source. Rejects with [`StreamError::Locked`] while a reader holds
    /// the lock; use [`ReadableStreamDefaultReader::cancel`] instead.
    pub fn cancel(&self, reason: Option<Reason>) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.flags.is_locked() {
            Err(StreamError::Locked)
        } else {
            send_cancel(&self.command_tx, reason)
        };
        async move { sent?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }
}

fn send_cancel<T>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<Reason>,
) -> StreamResult<oneshot::Receiver<StreamResult<()>>> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Cancel {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    Ok(rx)
}

/// Reader kinds accepted by [`ReadableStream::get_reader_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    /// Bring-your-own-buffer reading; only meaningful for byte streams.
    Byob,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    pub mode: Option<ReaderMode>,
}

impl<T: MaybeSend + 'static, Source> ReadableStream<T, Source, Unlocked> {
    /// Lock the stream to a new default reader.
    pub fn get_reader(
        &self,
    ) -> StreamResult<(
        ReadableStream<T, Source, Locked>,
        ReadableStreamDefaultReader<T, Source>,
    )> {
        self.get_reader_with(ReaderOptions::default())
    }

    pub fn get_reader_with(
        &self,
        options: ReaderOptions,
    ) -> StreamResult<(
        ReadableStream<T, Source, Locked>,
        ReadableStreamDefaultReader<T, Source>,
    )> {
        if let Some(ReaderMode::Byob) = options.mode {
            return Err(StreamError::Unsupported(
                "BYOB readers require a byte stream",
            ));
        }
        if !self.flags.try_lock() {
            return Err(StreamError::Locked);
        }
        Ok((
            self.relabel(),
            ReadableStreamDefaultReader(self.relabel()),
        ))
    }
}

// ----------- Default Reader -----------

/// Exclusive reader of a [`ReadableStream`]. Dropping it releases the lock.
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static, Source>(
    ReadableStream<T, Source, Locked>,
);

impl<T: MaybeSend + 'static, Source> ReadableStreamDefaultReader<T, Source> {
    /// Read the next chunk. `Ok(None)` once the stream is closed and drained.
    ///
    /// The request is registered when this is called, so reads issued
    /// back to back are fulfilled in call order even if awaited later.
    pub fn read(&self) -> impl Future<Output = StreamResult<Option<T>>> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .0
            .command_tx
            .unbounded_send(StreamCommand::Read { completion: tx })
            .map_err(|_| StreamError::TaskDropped);
        async move {
            sent?;
            rx.await.unwrap_or(Err(StreamError::TaskDropped))
        }
    }

    /// Resolves when the stream closes, rejects with the stored error when it
    /// errors.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Source> {
        wait_closed(SharedPtr::clone(&self.0.flags), self.0.closed_wakers.clone())
    }

    pub fn cancel(&self, reason: Option<Reason>) -> impl Future<Output = StreamResult<()>> {
        let sent = send_cancel(&self.0.command_tx, reason);
        async move { sent?.await.unwrap_or(Err(StreamError::TaskDropped)) }
    }

    /// Release the lock and get the unlocked stream back.
    pub fn release_lock(self) -> ReadableStream<T, Source, Unlocked> {
        // The lock itself is released by `Drop`.
        self.0.relabel()
    }

    /// Adapt the reader into a [`Stream`] that ends after the last chunk or
    /// after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = StreamResult<T>> {
        stream::unfold((self, false), |(reader, done)| async move {
            if done {
                return None;
            }
            let next = reader.read().await;
            match next {
                Ok(Some(chunk)) => Some((Ok(chunk), (reader, false))),
                Ok(None) => None,
                Err(err) => Some((Err(err), (reader, true))),
            }
        })
    }
}

impl<T: MaybeSend + 'static, Source> Drop for ReadableStreamDefaultReader<T, Source> {
    fn drop(&mut self) {
        self.0.flags.unlock();
    }
}

// ----------- Convenience Sources -----------
pub struct IteratorSource<I: MaybeSend + 'static> {
    iter: I,
}

impl<I: MaybeSend + 'static, T: MaybeSend + 'static> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.iter.next() {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S: MaybeSend + 'static> {
    stream: S,
}

impl<S: MaybeSend + 'static, T: MaybeSend + 'static> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    async fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        if let Some(item) = self.stream.next().await {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, Source> ReadableStreamBuilder<T, Source>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self {
            source,
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
        ReadableStream<T, Source, Unlocked>,
        impl Future<Output = ()> + MaybeSend,
    )> {
        let (stream, _controller, fut) = ReadableStream::new_inner(self.source, self.strategy)?;
        Ok((stream, fut))
    }

    /// Spawn bundled into one task
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T, Source, Unlocked>>
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
    ) -> StreamResult<ReadableStream<T, Source, Unlocked>>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

// Shortcut methods on ReadableStream for common cases
impl<T: MaybeSend + 'static> ReadableStream<T, IteratorSource<std::vec::IntoIter<T>>, Unlocked> {
    /// Create from Vec - shortcut for ReadableStreamBuilder::from_vec()
    pub fn from_vec(vec: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::from_vec(vec)
    }
}

impl<T: MaybeSend + 'static, I> ReadableStream<T, IteratorSource<I>, Unlocked>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// Create from Iterator - shortcut for ReadableStreamBuilder::from_iterator()
    pub fn from_iterator(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>> {
        ReadableStreamBuilder::from_iterator(iter)
    }
}

impl<T: MaybeSend + 'static, S> ReadableStream<T, AsyncStreamSource<S>, Unlocked>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// Create from Stream - shortcut for ReadableStreamBuilder::from_stream()
    pub fn from_stream(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>> {
        ReadableStreamBuilder::from_stream(stream)
    }
}

impl<T: MaybeSend + 'static> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
    /// Create a builder from a Vec
    pub fn from_vec(vec: Vec<T>) -> Self {
        Self::new(IteratorSource {
            iter: vec.into_iter(),
        })
    }
}

impl<T: MaybeSend + 'static, I> ReadableStreamBuilder<T, IteratorSource<I>>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
{
    /// Create a builder from an Iterator
    pub fn from_iterator(iter: I) -> Self {
        Self::new(IteratorSource { iter })
    }
}

impl<T: MaybeSend + 'static, S> ReadableStreamBuilder<T, AsyncStreamSource<S>>
where
    S: Stream<Item = T> + Unpin + MaybeSend + 'static,
{
    /// Create a builder from a Stream
    pub fn from_stream(stream: S) -> Self {
        Self::new(AsyncStreamSource { stream })
    }
}
