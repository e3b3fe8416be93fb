use super::{StreamResult, error::StreamError};
use crate::platform::SharedPtr;
use futures::future::poll_fn;
use parking_lot::{Mutex, RwLock};
use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    task::{Poll, Waker},
};

/// A lightweight, thread-safe set storing multiple wakers.
/// It ensures wakers are stored without duplicates (based on `will_wake`).
#[derive(Clone, Default)]
pub(crate) struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub fn new() -> Self {
        WakerSet(SharedPtr::new(Mutex::new(Vec::new())))
    }

    /// Adds a waker to the set.
    /// If a waker that would wake the same task is already present, it does not add a duplicate.
    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake all registered wakers and clear the set.
    pub fn wake_all(&self) {
        let wakers: Vec<Waker> = self.0.lock().drain(..).collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// State published by a stream task for synchronous queries from handles.
///
/// Terminal transitions go through [`StreamFlags::try_close`] and
/// [`StreamFlags::try_error`], so the first one wins whichever side makes it.
/// Backpressure and the queue total are written by the stream task; a
/// writable's writer also counts a chunk in when it hands it over.
pub(crate) struct StreamFlags {
    locked: AtomicBool,
    closed: AtomicBool,
    errored: AtomicBool,
    closing: AtomicBool,
    disturbed: AtomicBool,
    backpressure: AtomicBool,
    queue_total_size: AtomicU64,
    high_water_mark: f64,
    stored_error: RwLock<Option<StreamError>>,
}

impl StreamFlags {
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            locked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            disturbed: AtomicBool::new(false),
            backpressure: AtomicBool::new(false),
            queue_total_size: AtomicU64::new(0f64.to_bits()),
            high_water_mark,
            stored_error: RwLock::new(None),
        }
    }

    /// Take the exclusive lock; `false` if someone already holds it.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mark a close request; returns `true` if one was already recorded.
    pub fn request_close(&self) -> bool {
        self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_disturbed(&self) -> bool {
        self.disturbed.load(Ordering::SeqCst)
    }

    pub fn mark_disturbed(&self) {
        self.disturbed.store(true, Ordering::SeqCst);
    }

    pub fn has_backpressure(&self) -> bool {
        self.backpressure.load(Ordering::SeqCst)
    }

    pub fn set_backpressure(&self, backpressure: bool) {
        self.backpressure.store(backpressure, Ordering::SeqCst);
    }

    /// Move to the closed state unless the stream already reached a terminal
    /// state. Returns whether this call made the transition.
    pub fn try_close(&self) -> bool {
        let _guard = self.stored_error.write();
        if self.is_closed() || self.is_errored() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        true
    }

    /// Move to the errored state unless the stream already reached a terminal
    /// state. The error is stored before the flag is raised so observers of
    /// `errored` always find it.
    pub fn try_error(&self, error: StreamError) -> bool {
        let mut stored = self.stored_error.write();
        if self.is_closed() || self.is_errored() {
            return false;
        }
        *stored = Some(error);
        self.errored.store(true, Ordering::SeqCst);
        true
    }

    /// `Some` once the stream is closed (`Ok`) or errored (`Err`).
    pub fn terminal_result(&self) -> Option<StreamResult<()>> {
        if self.is_errored() {
            Some(Err(self.stored_error()))
        } else if self.is_closed() {
            Some(Ok(()))
        } else {
            None
        }
    }

    pub fn stored_error(&self) -> StreamError {
        self.stored_error
            .read()
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn queue_total_size(&self) -> f64 {
        f64::from_bits(self.queue_total_size.load(Ordering::SeqCst))
    }

    pub fn set_queue_total_size(&self, size: f64) {
        self.queue_total_size.store(size.to_bits(), Ordering::SeqCst);
    }

    /// Adjust the queue total by `delta`, never going below zero.
    pub fn add_queue_total_size(&self, delta: f64) {
        let _ = self
            .queue_total_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + delta).max(0.0).to_bits())
            });
    }

    /// `None` when errored, `0` when closed, otherwise the room left below
    /// the high water mark.
    pub fn desired_size(&self) -> Option<f64> {
        if self.is_errored() {
            return None;
        }
        if self.is_closed() {
            return Some(0.0);
        }
        Some(self.high_water_mark - self.queue_total_size())
    }
}

/// Resolves once the stream behind `flags` is closed, rejects once it errors.
pub(crate) fn wait_closed(
    flags: SharedPtr<StreamFlags>,
    wakers: WakerSet,
) -> impl Future<Output = StreamResult<()>> {
    poll_fn(move |cx| {
        if let Some(result) = flags.terminal_result() {
            return Poll::Ready(result);
        }
        wakers.register(cx.waker());
        // Re-check after registering so a transition in between is not missed.
        match flags.terminal_result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    })
}
