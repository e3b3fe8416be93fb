pub mod error;
pub mod queue;
pub mod readable;
mod shared;
pub mod tee;
pub mod writable;

pub use error::{Reason, StreamError};
pub use queue::QueueWithSizes;
pub use readable::{
    AsyncStreamSource, IteratorSource, ReadableSource, ReadableStream, ReadableStreamBuilder,
    ReadableStreamDefaultController, ReadableStreamDefaultReader, ReaderMode, ReaderOptions,
};
pub use tee::{TeeBuilder, TeeSource};
pub use writable::{
    WritableSink, WritableStream, WritableStreamBuilder, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};

pub type StreamResult<T> = Result<T, StreamError>;

/// Type-level marker for unlocked streams
pub struct Unlocked;
/// Type-level marker for locked streams
pub struct Locked;

/// Generic queuing strategy trait
///
/// Both methods have defaults matching an absent strategy: every chunk counts
/// as 1 and the high water mark is 1.
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk.
    ///
    /// An `Err`, or a size that is NaN, negative or infinite, errors the
    /// stream the chunk was enqueued on.
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> f64 {
        1.0
    }
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl Default for CountQueuingStrategy {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&[u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&[u8]) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Check a strategy's high water mark before a stream is built from it.
pub(crate) fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::InvalidHighWaterMark(high_water_mark));
    }
    Ok(high_water_mark)
}

#[cfg(test)]
pub(crate) fn spawn_test_task(fut: crate::platform::PlatformFuture<'static, ()>) {
    #[cfg(feature = "send")]
    tokio::spawn(fut);
    #[cfg(feature = "local")]
    tokio::task::spawn_local(fut);
}
