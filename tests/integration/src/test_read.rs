//! Read path integration tests.

#[cfg(test)]
mod tests {
    use blobrepo_core::{
        BlobPath, BlobStoreError, ByteRange, InMemoryObjectClient, config::MIB,
    };
    use bytes::Bytes;
    use futures::TryStreamExt;

    use crate::{
        cleanup_bucket, live_store, memory_store, memory_store_with, pattern, repository_config,
    };

    #[tokio::test]
    async fn test_should_read_range_of_small_blob() {
        let (client, store) = memory_store(5 * MIB);
        let data = pattern(1024);
        client.insert("repo/b.bin", Bytes::from(data.clone()));

        let container = store.base_container();
        let mut reader = container
            .read_blob_range("b.bin", 100, 100)
            .await
            .unwrap_or_else(|e| panic!("open range: {e}"));
        let read = reader.read_to_end().await.unwrap_or_else(|e| panic!("read range: {e}"));

        assert_eq!(read, data[100..=199].to_vec());
        assert_eq!(
            client.get_ranges("repo/b.bin"),
            vec![Some(ByteRange::new(100, 199).unwrap_or_else(|e| panic!("range: {e}")))]
        );
    }

    #[tokio::test]
    async fn test_should_resume_after_broken_connections() {
        let (client, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket").with_chunk_size(16 * 1024),
            repository_config("repo-bucket", 5 * MIB),
        );
        let data = pattern(1024 * 1024);
        client.insert("repo/idx/seg.dat", Bytes::from(data.clone()));
        client.break_next_reads(100_000, 3);

        let container = store.blob_container(BlobPath::parse("repo/idx"));
        let mut reader = container
            .read_blob("seg.dat")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let read = reader.read_to_end().await.unwrap_or_else(|e| panic!("read: {e}"));

        assert_eq!(read.len(), data.len());
        assert!(read == data, "resumed read must be byte-identical");
        assert_eq!(reader.attempt(), 4);

        let starts: Vec<u64> = client
            .get_ranges("repo/idx/seg.dat")
            .into_iter()
            .map(|r| r.map_or(0, |r| r.start()))
            .collect();
        assert_eq!(starts.len(), 4);
        assert_eq!(starts[0], 0);
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(client.stream_aborts(), 3);
    }

    #[tokio::test]
    async fn test_should_give_up_after_max_read_attempts() {
        let mut config = repository_config("repo-bucket", 5 * MIB);
        config.max_read_attempts = 3;
        let (client, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket").with_chunk_size(4),
            config,
        );
        client.insert("repo/flaky", Bytes::from(pattern(4096)));
        client.break_next_reads(8, 10);

        let mut reader = store
            .base_container()
            .read_blob("flaky")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let err = reader.read_to_end().await.err().unwrap_or_else(|| panic!("must give up"));

        match err {
            BlobStoreError::ReadExhausted {
                attempts,
                suppressed,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(suppressed.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.get_ranges("repo/flaky").len(), 3);
        assert!(matches!(
            reader.read_to_end().await,
            Err(BlobStoreError::IllegalState { .. })
        ));
        assert_eq!(client.get_ranges("repo/flaky").len(), 3);
    }

    #[tokio::test]
    async fn test_should_stream_whole_blob() {
        let (client, store) = memory_store(5 * MIB);
        let data = pattern(300 * 1024);
        client.insert("repo/stream.bin", Bytes::from(data.clone()));

        let reader = store
            .base_container()
            .read_blob("stream.bin")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let chunks: Vec<Bytes> = reader
            .into_stream()
            .try_collect()
            .await
            .unwrap_or_else(|e| panic!("stream: {e}"));
        let read: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_should_abort_partially_read_blob_on_close() {
        let (client, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket").with_chunk_size(1024),
            repository_config("repo-bucket", 5 * MIB),
        );
        client.insert("repo/big.bin", Bytes::from(pattern(64 * 1024)));

        let mut reader = store
            .base_container()
            .read_blob("big.bin")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        let mut buf = [0u8; 10];
        let n = reader.read(&mut buf).await.unwrap_or_else(|e| panic!("read: {e}"));
        assert!(n > 0);
        reader.close();
        assert!(reader.is_closed());
        assert_eq!(client.stream_aborts(), 1);
    }

    #[tokio::test]
    async fn test_should_report_missing_blob_on_open() {
        let (_, store) = memory_store(5 * MIB);
        let err = store
            .base_container()
            .read_blob("nope")
            .await
            .err()
            .unwrap_or_else(|| panic!("missing blob"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    #[ignore = "requires running S3 endpoint"]
    async fn test_should_read_back_from_live_endpoint() {
        let (client, store) = live_store().await;
        let container = store.base_container();
        let data = pattern(64 * 1024);

        container
            .write_blob_bytes("live.bin", Bytes::from(data.clone()), false)
            .await
            .unwrap_or_else(|e| panic!("write: {e}"));
        let mut reader = container
            .read_blob("live.bin")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        assert_eq!(reader.read_to_end().await.unwrap_or_else(|e| panic!("read: {e}")), data);

        let mut reader = container
            .read_blob_range("live.bin", 1000, 500)
            .await
            .unwrap_or_else(|e| panic!("open range: {e}"));
        assert_eq!(
            reader.read_to_end().await.unwrap_or_else(|e| panic!("read range: {e}")),
            data[1000..1500].to_vec()
        );

        let err = container
            .read_blob("missing.bin")
            .await
            .err()
            .unwrap_or_else(|| panic!("missing"));
        assert!(err.is_not_found());

        cleanup_bucket(&client).await;
    }
}
