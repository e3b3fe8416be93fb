//! Constructors reserved for embedders that drive a stream from native code.
//!
//! Not part of the documented API surface.

use crate::platform::MaybeSend;
use crate::streams::{
    QueuingStrategy, ReadableSource, ReadableStream, ReadableStreamDefaultController,
    StreamResult, Unlocked,
};
use std::future::Future;

/// Source that leaves all production to whoever holds the controller.
pub struct HostSource;

impl<T: MaybeSend + 'static> ReadableSource<T> for HostSource {}

/// Build a readable stream whose controller is handed straight back to the
/// caller instead of to a source.
///
/// The returned future is the stream task and must be driven by the caller.
pub fn create_externally_controlled_readable<T, S>(
    strategy: S,
) -> StreamResult<(
    ReadableStream<T, HostSource, Unlocked>,
    ReadableStreamDefaultController<T>,
    impl Future<Output = ()> + MaybeSend,
)>
where
    T: MaybeSend + 'static,
    S: QueuingStrategy<T> + MaybeSend + 'static,
{
    ReadableStream::new_inner(HostSource, Box::new(strategy))
}
