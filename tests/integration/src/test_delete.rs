//! Delete path integration tests.

#[cfg(test)]
mod tests {
    use blobrepo_core::{BatchDeleteError, BlobPath, BlobStoreError, ClientCall, config::MIB};
    use bytes::Bytes;

    use crate::{cleanup_bucket, live_store, memory_store};

    #[tokio::test]
    async fn test_should_report_exactly_the_refused_keys() {
        let (client, store) = memory_store(5 * MIB);
        let names: Vec<String> = (0..2500).map(|i| format!("blob-{i:04}")).collect();
        for name in &names {
            client.insert(format!("repo/{name}"), Bytes::from_static(b"x"));
        }
        let refused = ["repo/blob-1200", "repo/blob-1500", "repo/blob-1999"];
        for key in refused {
            client.refuse_delete(key, "AccessDenied");
        }

        let err = store
            .base_container()
            .delete_blobs_ignoring_if_not_exists(&names)
            .await
            .err()
            .unwrap_or_else(|| panic!("refused keys surface"));

        match err {
            BlobStoreError::Delete {
                sample,
                outstanding,
                source,
            } => {
                assert_eq!(outstanding, 3);
                assert_eq!(sample, refused.map(str::to_owned).to_vec());
                assert!(matches!(
                    source.primary(),
                    BatchDeleteError::Partial { failures } if failures.len() == 3
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        let batches = client.delete_batches();
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
        assert_eq!(client.object_count(), 3);
    }

    #[tokio::test]
    async fn test_should_delete_marker_after_children() {
        let (client, store) = memory_store(5 * MIB);
        let container = store.blob_container(BlobPath::parse("repo/indices"));
        client.insert("repo/indices/", Bytes::new());
        for i in 0..1500 {
            client.insert(format!("repo/indices/shard/{i:04}"), Bytes::from_static(b"abcd"));
        }
        client.insert("repo/index-0", Bytes::new());

        let result = container.delete().await.unwrap_or_else(|e| panic!("container delete: {e}"));
        assert_eq!(result.blobs_deleted, 1501);
        assert_eq!(result.bytes_deleted, 6000);

        let batches = client.delete_batches();
        let marker_batch = batches
            .iter()
            .position(|b| b == &vec!["repo/indices/".to_owned()])
            .unwrap_or_else(|| panic!("marker deleted on its own"));
        assert_eq!(marker_batch, batches.len() - 1);
        assert_eq!(client.keys(), vec!["repo/index-0"]);

        let last_list = client
            .calls()
            .iter()
            .rposition(|c| matches!(c, ClientCall::List { .. }))
            .unwrap_or_else(|| panic!("listed"));
        let first_delete = client
            .calls()
            .iter()
            .position(|c| matches!(c, ClientCall::DeleteObjects { .. }))
            .unwrap_or_else(|| panic!("deleted"));
        assert!(first_delete < last_list, "deletes stream while listing");
    }

    #[tokio::test]
    async fn test_should_recover_from_failed_batch_by_retrying() {
        let (client, store) = memory_store(5 * MIB);
        for i in 0..10 {
            client.insert(format!("repo/b{i}"), Bytes::new());
        }
        client.fail_delete_call(1);
        let container = store.base_container();
        let names: Vec<String> = (0..10).map(|i| format!("b{i}")).collect();

        let err = container
            .delete_blobs_ignoring_if_not_exists(&names)
            .await
            .err()
            .unwrap_or_else(|| panic!("whole batch failed"));
        assert!(matches!(err, BlobStoreError::Delete { outstanding: 10, .. }));

        container
            .delete_blobs_ignoring_if_not_exists(&names)
            .await
            .unwrap_or_else(|e| panic!("second attempt succeeds: {e}"));
        assert_eq!(client.object_count(), 0);
    }

    #[tokio::test]
    async fn test_should_require_existing_blob_for_single_delete() {
        let (client, store) = memory_store(5 * MIB);
        client.insert("repo/one", Bytes::new());
        let container = store.base_container();

        container.delete_blob("one").await.unwrap_or_else(|e| panic!("delete existing: {e}"));
        let err = container
            .delete_blob("one")
            .await
            .err()
            .unwrap_or_else(|| panic!("already gone"));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    #[ignore = "requires running S3 endpoint"]
    async fn test_should_delete_container_on_live_endpoint() {
        let (client, store) = live_store().await;
        let container = store.blob_container(store.base_path().add("indices"));
        for i in 0..25 {
            container
                .write_blob_bytes(&format!("blob-{i}"), Bytes::from_static(b"data"), false)
                .await
                .unwrap_or_else(|e| panic!("write: {e}"));
        }

        let result = container.delete().await.unwrap_or_else(|e| panic!("delete: {e}"));
        assert_eq!(result.blobs_deleted, 25);
        assert_eq!(result.bytes_deleted, 100);
        assert!(container.list_blobs().await.unwrap_or_else(|e| panic!("list: {e}")).is_empty());

        cleanup_bucket(&client).await;
    }
}
