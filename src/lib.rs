//! Readable and writable streams with size-aware queues, backpressure,
//! exclusive reader/writer locks and tee.
//!
//! Every stream is driven by a task future that owns its queue and its
//! source or sink. Builders hand that future to a spawn function of your
//! choice (or return it from `prepare`), and handles talk to it over channels.
//!
//! ```
//! use stream_engine::ReadableStream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stream_engine::StreamResult<()> {
//! let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn)?;
//! let (_locked, reader) = stream.get_reader()?;
//!
//! let mut total = 0;
//! while let Some(n) = reader.read().await? {
//!     total += n;
//! }
//! assert_eq!(total, 6);
//! # Ok(())
//! # }
//! ```

pub mod platform;
pub mod streams;

#[doc(hidden)]
pub mod host;

pub use streams::*;
