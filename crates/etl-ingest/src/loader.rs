//! Idempotent upsert loader
//!
//! Items are keyed by (source kind, source name, external id). Applying the
//! same items twice leaves the store as applying them once.

use etl_common::Result;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DEFAULT_BATCH_SIZE;
use crate::models::NormalizedItem;
use crate::store::ItemStore;

pub struct Loader<S: ?Sized> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: ItemStore + ?Sized> Loader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upsert all items in one transaction.
    pub async fn upsert(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let loaded = self.store.upsert_items(items, run_id).await?;
        debug!(run_id = %run_id, loaded, "Upserted items");
        Ok(loaded)
    }

    /// Upsert in chunks of `batch_size`, each committed on its own.
    ///
    /// On failure the chunks already applied stay applied; the error
    /// carries how many items were loaded before it.
    pub async fn upsert_batched(&self, items: &[NormalizedItem], run_id: Uuid) -> Result<u64> {
        let mut loaded = 0u64;

        for (index, chunk) in items.chunks(self.batch_size).enumerate() {
            let count = self.upsert(chunk, run_id).await.map_err(|e| {
                e.with_context("batch", index + 1)
                    .with_context("loaded_so_far", loaded)
            })?;
            loaded += count;
            debug!(run_id = %run_id, batch = index + 1, count, "Loaded batch");
        }

        if !items.is_empty() {
            info!(run_id = %run_id, loaded, "Loaded items");
        }

        Ok(loaded)
    }
}
