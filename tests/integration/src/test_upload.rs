//! Upload path integration tests.

#[cfg(test)]
mod tests {
    use blobrepo_core::{BlobStoreError, ClientCall, config::MIB};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use crate::{cleanup_bucket, live_store, memory_store, pattern};

    fn part_calls(calls: &[ClientCall]) -> Vec<(u32, u64, bool)> {
        calls
            .iter()
            .filter_map(|c| match c {
                ClientCall::UploadPart {
                    part_number,
                    size,
                    is_last,
                    ..
                } => Some((*part_number, *size, *is_last)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_should_split_large_blob_into_ordered_parts() {
        let (client, store) = memory_store(64 * MIB);
        let size = 150 * MIB;
        let source = tokio::io::repeat(0x5A).take(size);

        store
            .base_container()
            .write_blob("a.bin", source, size, false)
            .await
            .unwrap_or_else(|e| panic!("multipart write: {e}"));

        let calls = client.calls();
        assert_eq!(
            part_calls(&calls),
            vec![(1, 64 * MIB, false), (2, 64 * MIB, false), (3, 22 * MIB, true)]
        );
        let completed = calls.iter().find_map(|c| match c {
            ClientCall::CompleteMultipart { part_numbers, .. } => Some(part_numbers.clone()),
            _ => None,
        });
        assert_eq!(completed, Some(vec![1, 2, 3]));

        let stored = client.object("repo/a.bin").unwrap_or_else(|| panic!("object stored"));
        assert_eq!(stored.len() as u64, size);
        assert!(stored.iter().all(|b| *b == 0x5A));
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_should_use_single_put_up_to_buffer_size() {
        let (client, store) = memory_store(5 * MIB);
        let data = pattern(5 * 1024 * 1024);

        store
            .base_container()
            .write_blob_bytes("exact.bin", Bytes::from(data.clone()), false)
            .await
            .unwrap_or_else(|e| panic!("single put: {e}"));

        assert!(part_calls(&client.calls()).is_empty());
        assert_eq!(client.object("repo/exact.bin"), Some(Bytes::from(data)));
    }

    #[tokio::test]
    async fn test_should_leave_no_object_when_last_part_fails() {
        let (client, store) = memory_store(5 * MIB);
        client.fail_part(3);
        let data = pattern(12 * 1024 * 1024);

        let err = store
            .base_container()
            .write_blob("broken.bin", data.as_slice(), data.len() as u64, false)
            .await
            .err()
            .unwrap_or_else(|| panic!("last part fails"));

        assert!(matches!(err, BlobStoreError::Client { .. }), "got {err}");
        assert!(!client.contains("repo/broken.bin"));
        assert_eq!(client.aborted_uploads(), 1);
        assert_eq!(client.pending_uploads(), 0);
        assert!(
            client
                .calls()
                .iter()
                .any(|c| matches!(c, ClientCall::AbortMultipart { .. }))
        );
    }

    #[tokio::test]
    async fn test_should_abort_when_source_runs_short() {
        let (client, store) = memory_store(5 * MIB);
        let data = pattern(7 * 1024 * 1024);

        let err = store
            .base_container()
            .write_blob("short.bin", data.as_slice(), 8 * MIB, false)
            .await
            .err()
            .unwrap_or_else(|| panic!("source shorter than declared"));

        assert!(matches!(err, BlobStoreError::Io { .. }), "got {err}");
        assert!(!client.contains("repo/short.bin"));
        assert_eq!(client.aborted_uploads(), 1);
    }

    #[tokio::test]
    async fn test_should_commit_chunked_writer_in_order() {
        let (client, store) = memory_store(5 * MIB);
        let data = Bytes::from(pattern(11 * 1024 * 1024 + 17));
        let source = data.clone();

        store
            .base_container()
            .write_blob_with("meta.dat", false, true, move |writer| {
                Box::pin(async move {
                    for chunk in source.chunks(300 * 1024) {
                        writer.write(chunk).await?;
                    }
                    Ok(())
                })
            })
            .await
            .unwrap_or_else(|e| panic!("chunked write: {e}"));

        let parts = part_calls(&client.calls());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], (1, 5 * MIB, false));
        assert_eq!(parts[1], (2, 5 * MIB, false));
        assert_eq!(parts[2], (3, MIB + 17, true));
        assert_eq!(client.object("repo/meta.dat"), Some(data));
    }

    #[tokio::test]
    async fn test_should_discard_chunked_writer_on_failure() {
        let (client, store) = memory_store(5 * MIB);

        let err = store
            .base_container()
            .write_blob_with("half.dat", false, false, |writer| {
                Box::pin(async move {
                    writer.write(&pattern(11 * 1024 * 1024)).await?;
                    Err(BlobStoreError::illegal_state("producer failed"))
                })
            })
            .await
            .err()
            .unwrap_or_else(|| panic!("producer failure surfaces"));

        assert!(matches!(err, BlobStoreError::IllegalState { .. }));
        assert!(!client.contains("repo/half.dat"));
        assert_eq!(client.aborted_uploads(), 1);
        assert_eq!(client.pending_uploads(), 0);
    }

    #[tokio::test]
    #[ignore = "requires running S3 endpoint"]
    async fn test_should_upload_multipart_to_live_endpoint() {
        let (client, store) = live_store().await;
        let container = store.base_container();
        let data = pattern(12 * 1024 * 1024);

        container
            .write_blob("multi.bin", data.as_slice(), data.len() as u64, false)
            .await
            .unwrap_or_else(|e| panic!("multipart write: {e}"));
        let listed = container.list_blobs().await.unwrap_or_else(|e| panic!("list: {e}"));
        assert_eq!(listed["multi.bin"].length, data.len() as u64);

        let mut reader = container
            .read_blob("multi.bin")
            .await
            .unwrap_or_else(|e| panic!("open: {e}"));
        assert!(reader.read_to_end().await.unwrap_or_else(|e| panic!("read: {e}")) == data);

        cleanup_bucket(&client).await;
    }
}
