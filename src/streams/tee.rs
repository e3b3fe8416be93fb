//! Splitting one readable stream into two branches that see the same chunks.
//!
//! The upstream reader is shared by both branch sources and a coordinator
//! future. A branch `pull` only raises the `reading` flag; the coordinator
//! performs the upstream read and fans the result out to both branches, so a
//! branch cancel is never stuck behind an outstanding upstream read.

use super::{
    CountQueuingStrategy, QueuingStrategy, StreamResult, Unlocked,
    error::{Reason, StreamError},
    readable::{
        ReadableSource, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamDefaultReader,
    },
    validate_high_water_mark,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, Either, FutureExt, Shared, poll_fn},
    task::AtomicWaker,
};
use parking_lot::Mutex;
use std::{future::Future, pin::pin, task::Poll};
use tracing::{debug, trace};

const BRANCH_COUNT: usize = 2;

struct TeeState<T: MaybeSend + 'static> {
    reading: bool,
    canceled: [bool; BRANCH_COUNT],
    reasons: [Option<Reason>; BRANCH_COUNT],
    branches: [Option<ReadableStreamDefaultController<T>>; BRANCH_COUNT],
    cancel_tx: Option<oneshot::Sender<StreamResult<()>>>,
    cancel_done: Shared<oneshot::Receiver<StreamResult<()>>>,
}

impl<T: MaybeSend + Clone + 'static> TeeState<T> {
    fn all_canceled(&self) -> bool {
        self.canceled.iter().all(|canceled| *canceled)
    }

    fn open_branches(&self) -> impl Iterator<Item = &ReadableStreamDefaultController<T>> {
        self.branches
            .iter()
            .zip(self.canceled)
            .filter_map(|(branch, canceled)| if canceled { None } else { branch.as_ref() })
    }

    fn deliver(&self, chunk: T) {
        for branch in self.open_branches() {
            let _ = branch.enqueue(chunk.clone());
        }
    }

    fn close_branches(&self) {
        for branch in self.open_branches() {
            let _ = branch.close();
        }
    }

    fn error_branches(&self, error: &StreamError) {
        for branch in self.branches.iter().flatten() {
            let _ = branch.error(error.clone());
        }
    }

    fn resolve_cancel(&mut self, result: StreamResult<()>) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Upstream ended on its own: a branch still waiting for its sibling to
    /// cancel has nothing left to wait for.
    fn upstream_finished(&mut self) {
        if !self.all_canceled() {
            self.resolve_cancel(Ok(()));
        }
    }
}

struct TeeShared<T: MaybeSend + 'static, Source> {
    reader: ReadableStreamDefaultReader<T, Source>,
    state: Mutex<TeeState<T>>,
    read_waker: AtomicWaker,
}

impl<T: MaybeSend + Clone + 'static, Source> TeeShared<T, Source> {
    fn read_requested(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            if self.state.lock().reading {
                return Poll::Ready(());
            }
            self.read_waker.register(cx.waker());
            if self.state.lock().reading {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}

/// Source behind each branch returned by [`ReadableStream::tee`].
pub struct TeeSource<T: MaybeSend + 'static, Source> {
    branch: usize,
    shared: SharedPtr<TeeShared<T, Source>>,
}

impl<T, Source> ReadableSource<T> for TeeSource<T, Source>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    async fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<T>,
    ) -> StreamResult<()> {
        let already_reading = std::mem::replace(&mut self.shared.state.lock().reading, true);
        if !already_reading {
            trace!(branch = self.branch + 1, "tee branch requested a chunk");
            self.shared.read_waker.wake();
        }
        Ok(())
    }

    /// Resolves only once both branches are canceled (with the result of the
    /// upstream cancel) or upstream finishes on its own.
    async fn cancel(&mut self, reason: Option<Reason>) -> StreamResult<()> {
        let (composite, done) = {
            let mut state = self.shared.state.lock();
            state.canceled[self.branch] = true;
            state.reasons[self.branch] = reason;
            let composite = if state.all_canceled() {
                Some(Reason::Composite(
                    state.reasons.iter_mut().map(Option::take).collect(),
                ))
            } else {
                None
            };
            (composite, state.cancel_done.clone())
        };

        if let Some(composite) = composite {
            debug!(reason = %composite, "both tee branches canceled, canceling upstream");
            let result = self.shared.reader.cancel(Some(composite)).await;
            self.shared.state.lock().resolve_cancel(result);
        }

        done.await.unwrap_or(Err(StreamError::TaskDropped))
    }
}

async fn coordinate<T, Source>(shared: SharedPtr<TeeShared<T, Source>>)
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    let upstream_closed = shared.reader.closed();
    let watch = async {
        match upstream_closed.await {
            Err(err) => {
                debug!(error = %err, "tee upstream errored");
                let mut state = shared.state.lock();
                state.error_branches(&err);
                state.upstream_finished();
            }
            // A normal close is picked up by the read loop.
            Ok(()) => future::pending::<()>().await,
        }
    };

    let reads = async {
        loop {
            shared.read_requested().await;
            let next = shared.reader.read().await;
            let finished = {
                let mut state = shared.state.lock();
                state.reading = false;
                match next {
                    Ok(Some(chunk)) => {
                        state.deliver(chunk);
                        false
                    }
                    Ok(None) => {
                        trace!("tee upstream closed");
                        state.close_branches();
                        state.upstream_finished();
                        true
                    }
                    Err(err) => {
                        state.error_branches(&err);
                        state.upstream_finished();
                        true
                    }
                }
            };
            if finished {
                break;
            }
        }
    };

    future::select(pin!(reads), pin!(watch)).await;
}

/// Configures and starts the two branches of a tee.
pub struct TeeBuilder<T: MaybeSend + 'static, Source> {
    stream: ReadableStream<T, Source, Unlocked>,
    branch1_strategy: BoxedStrategy<T>,
    branch2_strategy: BoxedStrategy<T>,
}

impl<T, Source> TeeBuilder<T, Source>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    fn new(stream: ReadableStream<T, Source, Unlocked>) -> Self {
        Self {
            stream,
            branch1_strategy: Box::new(CountQueuingStrategy::default()),
            branch2_strategy: Box::new(CountQueuingStrategy::default()),
        }
    }

    /// Set queuing strategy for the first branch
    pub fn branch1_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(
        mut self,
        strategy: S,
    ) -> Self {
        self.branch1_strategy = Box::new(strategy);
        self
    }

    /// Set queuing strategy for the second branch
    pub fn branch2_strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(
        mut self,
        strategy: S,
    ) -> Self {
        self.branch2_strategy = Box::new(strategy);
        self
    }

    /// Set the same queuing strategy for both branches
    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + Clone + 'static>(
        mut self,
        strategy: S,
    ) -> Self {
        self.branch1_strategy = Box::new(strategy.clone());
        self.branch2_strategy = Box::new(strategy);
        self
    }

    /// Lock the upstream stream and return both branches plus the future that
    /// drives them.
    ///
    /// The future runs until both branch tasks finish. If that happens before
    /// upstream ended, upstream is canceled.
    #[allow(clippy::type_complexity)]
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
        impl Future<Output = ()> + MaybeSend,
    )> {
        validate_high_water_mark(self.branch1_strategy.high_water_mark())?;
        validate_high_water_mark(self.branch2_strategy.high_water_mark())?;
        let (_locked, reader) = self.stream.get_reader()?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let shared = SharedPtr::new(TeeShared {
            reader,
            state: Mutex::new(TeeState {
                reading: false,
                canceled: [false; BRANCH_COUNT],
                reasons: [None, None],
                branches: [None, None],
                cancel_tx: Some(cancel_tx),
                cancel_done: cancel_rx.shared(),
            }),
            read_waker: AtomicWaker::new(),
        });

        let (branch1, controller1, task1) = ReadableStream::new_inner(
            TeeSource {
                branch: 0,
                shared: SharedPtr::clone(&shared),
            },
            self.branch1_strategy,
        )?;
        let (branch2, controller2, task2) = ReadableStream::new_inner(
            TeeSource {
                branch: 1,
                shared: SharedPtr::clone(&shared),
            },
            self.branch2_strategy,
        )?;
        shared.state.lock().branches = [Some(controller1), Some(controller2)];

        let fut = async move {
            let branches = pin!(future::join(task1, task2));
            let coordinator = pin!(coordinate(SharedPtr::clone(&shared)));
            match future::select(branches, coordinator).await {
                Either::Left(_) => {
                    debug!("both tee branches finished, canceling upstream");
                    let _ = shared
                        .reader
                        .cancel(Some("Both tee branches terminated".into()))
                        .await;
                }
                Either::Right(((), branches)) => {
                    branches.await;
                }
            }
        };

        Ok((branch1, branch2, fut))
    }

    /// Spawn both branches and the coordinator in a single task
    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> StreamResult<(
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
    )>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }

    /// Spawn both branches and the coordinator using a static function reference
    pub fn spawn_ref<F, R>(
        self,
        spawn_fn: &'static F,
    ) -> StreamResult<(
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
        ReadableStream<T, TeeSource<T, Source>, Unlocked>,
    )>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (branch1, branch2, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok((branch1, branch2))
    }
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: MaybeSend + Clone + 'static,
    Source: 'static,
{
    /// Split the stream into two branches. Every chunk is cloned into each
    /// branch that has not been canceled.
    ///
    /// The stream is locked when the returned builder is prepared.
    pub fn tee(self) -> TeeBuilder<T, Source> {
        TeeBuilder::new(self)
    }
}
