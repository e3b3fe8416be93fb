/// Compile-time checks that Send/Sync bounds are right for each feature.
///
/// Run with:
///   cargo test --features send  (default)
///   cargo test --no-default-features --features local
use stream_engine::{
    IteratorSource, ReadableStream, ReadableStreamDefaultReader, StreamError, WritableSink,
    WritableStream, WritableStreamDefaultController, WritableStreamDefaultWriter,
};

#[allow(dead_code)]
fn assert_send<T: Send>() {}

#[allow(dead_code)]
fn assert_sync<T: Sync>() {}

#[allow(dead_code)]
struct DummySink;

impl WritableSink<String> for DummySink {
    async fn write(
        &mut self,
        _chunk: String,
        _controller: &mut WritableStreamDefaultController,
    ) -> Result<(), StreamError> {
        Ok(())
    }
}

type VecStream = ReadableStream<i32, IteratorSource<std::vec::IntoIter<i32>>>;

#[cfg(feature = "send")]
#[test]
fn send_feature_handles_are_send_and_sync() {
    assert_send::<VecStream>();
    assert_sync::<VecStream>();
    assert_send::<ReadableStreamDefaultReader<i32, IteratorSource<std::vec::IntoIter<i32>>>>();

    assert_send::<WritableStream<String, DummySink>>();
    assert_sync::<WritableStream<String, DummySink>>();
    assert_send::<WritableStreamDefaultWriter<String, DummySink>>();
    assert_send::<WritableStreamDefaultController>();

    assert_send::<StreamError>();
    assert_sync::<StreamError>();
}

#[cfg(feature = "local")]
#[test]
fn local_feature_accepts_non_send_chunks() {
    use std::rc::Rc;

    // Rc chunks are only allowed when nothing requires Send.
    let _: Option<ReadableStream<Rc<i32>, IteratorSource<std::vec::IntoIter<Rc<i32>>>>> = None;
}

#[test]
fn handle_types_are_nameable() {
    let _: Option<VecStream> = None;
    let _: Option<WritableStream<String, DummySink>> = None;
}
