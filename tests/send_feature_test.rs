/// `spawn(tokio::spawn)` only compiles when the task future is Send.

#[cfg(feature = "send")]
#[tokio::test]
async fn send_feature_with_tokio_spawn() {
    use stream_engine::ReadableStream;

    let stream = ReadableStream::from_vec(vec![1, 2, 3])
        .spawn(tokio::spawn)
        .unwrap();

    let (_, reader) = stream.get_reader().unwrap();

    let mut result = Vec::new();
    while let Some(val) = reader.read().await.unwrap() {
        result.push(val);
    }

    assert_eq!(result, vec![1, 2, 3]);
}

#[cfg(feature = "send")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tee_runs_on_multi_threaded_runtime() {
    use stream_engine::ReadableStream;

    let stream = ReadableStream::from_vec(vec![String::from("x")])
        .spawn(tokio::spawn)
        .unwrap();
    let (left, right) = stream.tee().spawn(tokio::spawn).unwrap();

    let (_l, left) = left.get_reader().unwrap();
    let (_r, right) = right.get_reader().unwrap();
    assert_eq!(left.read().await.unwrap().as_deref(), Some("x"));
    assert_eq!(right.read().await.unwrap().as_deref(), Some("x"));
}

#[cfg(feature = "local")]
#[tokio::test]
async fn local_feature_with_spawn_local() {
    use std::rc::Rc;
    use stream_engine::ReadableStream;
    use tokio::task::LocalSet;

    let local = LocalSet::new();

    local
        .run_until(async {
            // Rc is !Send; spawn_local accepts it.
            let stream = ReadableStream::from_vec(vec![Rc::new(1), Rc::new(2)])
                .spawn(tokio::task::spawn_local)
                .unwrap();

            let (_, reader) = stream.get_reader().unwrap();

            let mut result = Vec::new();
            while let Some(val) = reader.read().await.unwrap() {
                result.push(*val);
            }

            assert_eq!(result, vec![1, 2]);
        })
        .await;
}
