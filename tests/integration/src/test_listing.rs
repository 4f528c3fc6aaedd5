//! Listing integration tests.

#[cfg(test)]
mod tests {
    use blobrepo_core::{BlobPath, InMemoryObjectClient, config::MIB};
    use bytes::Bytes;

    use crate::{cleanup_bucket, live_store, memory_store_with, repository_config};

    #[tokio::test]
    async fn test_should_list_across_pages() {
        let (client, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket").with_page_size(7),
            repository_config("repo-bucket", 5 * MIB),
        );
        for i in 0..40 {
            client.insert(format!("repo/snap-{i:02}.dat"), Bytes::from(vec![0u8; i]));
        }
        for i in 0..12 {
            client.insert(format!("repo/indices/idx-{i:02}/meta"), Bytes::new());
        }

        let container = store.base_container();
        let blobs = container.list_blobs().await.unwrap_or_else(|e| panic!("list: {e}"));
        assert_eq!(blobs.len(), 40);
        assert_eq!(blobs["snap-39.dat"].length, 39);

        let indices = store.blob_container(BlobPath::parse("repo/indices"));
        let children = indices.children().await.unwrap_or_else(|e| panic!("children: {e}"));
        assert_eq!(children.len(), 12);
        assert_eq!(
            children["idx-07"].key_path(),
            "repo/indices/idx-07/"
        );

        let top = container.children().await.unwrap_or_else(|e| panic!("children: {e}"));
        assert_eq!(top.keys().cloned().collect::<Vec<_>>(), vec!["indices"]);
    }

    #[tokio::test]
    async fn test_should_list_same_blobs_regardless_of_page_size() {
        let mut listings = Vec::new();
        for page_size in [1000, 2500] {
            let (client, store) = memory_store_with(
                InMemoryObjectClient::new("repo-bucket").with_page_size(page_size),
                repository_config("repo-bucket", 5 * MIB),
            );
            for i in 0..2500 {
                client.insert(format!("repo/blob-{i:04}"), Bytes::from_static(b"ab"));
            }
            let blobs = store
                .base_container()
                .list_blobs()
                .await
                .unwrap_or_else(|e| panic!("list: {e}"));
            listings.push(blobs);
        }
        assert_eq!(listings[0].len(), 2500);
        assert_eq!(listings[0], listings[1]);
    }

    #[tokio::test]
    async fn test_should_filter_blobs_by_prefix() {
        let (client, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket"),
            repository_config("repo-bucket", 5 * MIB),
        );
        for name in ["index-1", "index-2", "index.latest", "meta-x.dat", "snap-x.dat"] {
            client.insert(format!("repo/{name}"), Bytes::from_static(b"1"));
        }

        let container = store.base_container();
        let index = container
            .list_blobs_by_prefix(Some("index-"))
            .await
            .unwrap_or_else(|e| panic!("list: {e}"));
        assert_eq!(
            index.keys().cloned().collect::<Vec<_>>(),
            vec!["index-1", "index-2"]
        );
        assert!(
            container
                .list_blobs_by_prefix(Some("nothing"))
                .await
                .unwrap_or_else(|e| panic!("list: {e}"))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_should_list_empty_container() {
        let (_, store) = memory_store_with(
            InMemoryObjectClient::new("repo-bucket"),
            repository_config("repo-bucket", 5 * MIB),
        );
        let container = store.blob_container(BlobPath::parse("repo/empty"));
        assert!(container.list_blobs().await.unwrap_or_else(|e| panic!("list: {e}")).is_empty());
        assert!(container.children().await.unwrap_or_else(|e| panic!("children: {e}")).is_empty());
    }

    #[tokio::test]
    #[ignore = "requires running S3 endpoint"]
    async fn test_should_list_children_on_live_endpoint() {
        let (client, store) = live_store().await;
        let base = store.base_container();
        for path in ["a/1.dat", "a/2.dat", "b/1.dat", "top.dat"] {
            base.write_blob_bytes(path, Bytes::from_static(b"x"), false)
                .await
                .unwrap_or_else(|e| panic!("write: {e}"));
        }

        let blobs = base.list_blobs().await.unwrap_or_else(|e| panic!("list: {e}"));
        assert_eq!(blobs.keys().cloned().collect::<Vec<_>>(), vec!["top.dat"]);
        let children = base.children().await.unwrap_or_else(|e| panic!("children: {e}"));
        assert_eq!(children.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);

        cleanup_bucket(&client).await;
    }
}
