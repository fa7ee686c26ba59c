use crate::api::SourceCatalog;
use crate::auth::AuthorizationManager;
use crate::error::{Result, TransferError};
use crate::models::{CollectionFolder, CollectionItem};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Source-side reads. Remembers the last folder listing so folder indices
/// handed out to the user can be checked before they are used.
pub struct CollectionRepository {
    catalog: Arc<dyn SourceCatalog>,
    auth: Arc<AuthorizationManager>,
    folders: Mutex<Option<Vec<CollectionFolder>>>,
}

impl CollectionRepository {
    pub fn new(catalog: Arc<dyn SourceCatalog>, auth: Arc<AuthorizationManager>) -> Self {
        Self {
            catalog,
            auth,
            folders: Mutex::new(None),
        }
    }

    pub async fn list_folders(&self) -> Result<Vec<CollectionFolder>> {
        self.auth.require_authorized()?;
        let folders = self.observe(self.catalog.list_folders().await).await?;
        info!("Fetched {} folders from {}", folders.len(), self.catalog.name());
        *self.folders.lock().await = Some(folders.clone());
        Ok(folders)
    }

    /// Folder at `index` in the most recent listing.
    pub async fn folder(&self, index: usize) -> Result<CollectionFolder> {
        let guard = self.folders.lock().await;
        guard
            .as_ref()
            .and_then(|fs| fs.iter().find(|f| f.ordinal_index == index))
            .cloned()
            .ok_or(TransferError::InvalidFolder(index))
    }

    /// Every item of the folder, all pages, in source order.
    pub async fn list_items(&self, index: usize) -> Result<Vec<CollectionItem>> {
        self.auth.require_authorized()?;
        let folder = self.folder(index).await?;
        let items = self.observe(self.catalog.list_items(&folder).await).await?;
        info!("Fetched {} items from folder '{}'", items.len(), folder.name);
        Ok(items)
    }

    pub async fn forget(&self) {
        *self.folders.lock().await = None;
    }

    async fn observe<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_unauthorized() {
                self.auth.invalidate().await;
            }
        }
        res
    }
}
