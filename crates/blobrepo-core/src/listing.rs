//! Paged listing.

use std::{fmt, sync::Arc};

use crate::{
    client::{ListPage, ListRequest, ObjectClient},
    error::ClientError,
};

/// Walks every page of a listing, following continuation tokens.
pub struct ListingWalker {
    client: Arc<dyn ObjectClient>,
    request: ListRequest,
    done: bool,
}

impl fmt::Debug for ListingWalker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListingWalker")
            .field("request", &self.request)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ListingWalker {
    /// Start walking from the first page of `request`.
    #[must_use]
    pub fn new(client: Arc<dyn ObjectClient>, request: ListRequest) -> Self {
        Self {
            client,
            request,
            done: false,
        }
    }

    /// The next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<ListPage>, ClientError> {
        if self.done {
            return Ok(None);
        }
        let page = self.client.list_objects(&self.request).await?;
        match &page.next_continuation {
            Some(token) => self.request.continuation = Some(token.clone()),
            None => self.done = true,
        }
        Ok(Some(page))
    }

    /// Fetch every remaining page.
    pub async fn collect_pages(mut self) -> Result<Vec<ListPage>, ClientError> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }
}
