use super::{Authorizer, CatalogQuery, DestinationCatalog, SourceCatalog};
use crate::error::{Result, TransferError};
use crate::models::{
    AuthStatus, AuthorizationRequest, CatalogHit, CollectionFolder, CollectionItem, Playlist, ProviderRole,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// In-memory authorizer. Completion is simulated by `complete_authorization`
/// or directly with `grant()`, which is what an out-of-band browser flow does.
pub struct MockAuthorizer {
    role: ProviderRole,
    authorized: AtomicBool,
    failing: AtomicBool,
    begin_calls: AtomicUsize,
    status_calls: AtomicUsize,
    pending: Mutex<Option<String>>,
}

impl MockAuthorizer {
    pub fn new(role: ProviderRole) -> Self {
        Self {
            role,
            authorized: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            begin_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            pending: Mutex::new(None),
        }
    }

    pub fn authorized(role: ProviderRole) -> Self {
        let m = Self::new(role);
        m.grant();
        m
    }

    pub fn grant(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.authorized.store(false, Ordering::SeqCst);
    }

    /// Make `check_status` fail as if the provider were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for MockAuthorizer {
    fn name(&self) -> &str {
        "mock"
    }

    fn role(&self) -> ProviderRole {
        self.role
    }

    async fn check_status(&self) -> Result<AuthStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::upstream(self.role, "mock outage"));
        }
        if self.authorized.load(Ordering::SeqCst) {
            Ok(AuthStatus::authorized_as(format!("mock-{}-user", self.role)))
        } else {
            Ok(AuthStatus::unauthorized())
        }
    }

    async fn begin_authorization(&self) -> Result<AuthorizationRequest> {
        let n = self.begin_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = format!("mock-request-{}", n);
        if let Ok(mut g) = self.pending.lock() {
            *g = Some(request_id.clone());
        }
        info!("MockAuthorizer: begin_authorization {} for {}", request_id, self.role);
        Ok(AuthorizationRequest {
            url: format!("https://mock.invalid/authorize?request={}", request_id),
            request_id,
        })
    }

    async fn complete_authorization(&self, callback: &str) -> Result<()> {
        let pending = self.pending.lock().ok().and_then(|mut g| g.take());
        match pending {
            Some(_) if !callback.trim().is_empty() => {
                self.grant();
                Ok(())
            }
            Some(id) => {
                if let Ok(mut g) = self.pending.lock() {
                    *g = Some(id);
                }
                Err(TransferError::callback(self.role, "empty verifier"))
            }
            None => Err(TransferError::callback(self.role, "no authorization in progress")),
        }
    }

    async fn logout(&self) -> Result<()> {
        self.revoke();
        if let Ok(mut g) = self.pending.lock() {
            *g = None;
        }
        Ok(())
    }
}

/// Fixed folders with fixed contents.
#[derive(Default)]
pub struct MockSourceCatalog {
    folders: Vec<(CollectionFolder, Vec<CollectionItem>)>,
    unauthorized: AtomicBool,
    failing: AtomicBool,
}

impl MockSourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_folder(mut self, name: &str, items: Vec<CollectionItem>) -> Self {
        let idx = self.folders.len();
        let folder = CollectionFolder {
            id: idx.to_string(),
            name: name.to_string(),
            item_count: items.len() as u64,
            ordinal_index: idx,
        };
        self.folders.push((folder, items));
        self
    }

    /// Respond to every call with a 401-equivalent.
    pub fn set_unauthorized(&self, v: bool) {
        self.unauthorized.store(v, Ordering::SeqCst);
    }

    pub fn set_failing(&self, v: bool) {
        self.failing.store(v, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(TransferError::Unauthorized(ProviderRole::Source));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransferError::upstream(ProviderRole::Source, "mock outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceCatalog for MockSourceCatalog {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_folders(&self) -> Result<Vec<CollectionFolder>> {
        self.check()?;
        Ok(self.folders.iter().map(|(f, _)| f.clone()).collect())
    }

    async fn list_items(&self, folder: &CollectionFolder) -> Result<Vec<CollectionItem>> {
        self.check()?;
        self.folders
            .iter()
            .find(|(f, _)| f.id == folder.id)
            .map(|(_, items)| items.clone())
            .ok_or_else(|| TransferError::upstream(ProviderRole::Source, "mock: no such folder"))
    }
}

fn key(artist: &str, title: &str) -> (String, String) {
    (artist.trim().to_lowercase(), title.trim().to_lowercase())
}

/// Catalog of known albums keyed by (artist, title), case-insensitive.
/// Searches sleep for a per-title delay so concurrent completion order
/// differs from submission order.
#[derive(Default)]
pub struct MockDestinationCatalog {
    albums: HashMap<(String, String), CatalogHit>,
    tracks_per_album: usize,
    search_delay: Option<Duration>,
    unauthorized: AtomicBool,
    failing_titles: Mutex<Vec<String>>,
    add_items_failing: AtomicBool,
    search_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    playlists: Mutex<Vec<Playlist>>,
    added: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockDestinationCatalog {
    pub fn new() -> Self {
        Self {
            tracks_per_album: 10,
            ..Default::default()
        }
    }

    pub fn with_album(mut self, artist: &str, title: &str) -> Self {
        let id = format!("album-{}", self.albums.len() + 1);
        let hit = CatalogHit {
            destination_id: id.clone(),
            uri: Some(format!("mock:album:{}", id)),
            artist: artist.to_string(),
            title: title.to_string(),
            image_url: Some(format!("https://img.mock.invalid/{}.jpg", id)),
            url: Some(format!("https://open.mock.invalid/album/{}", id)),
        };
        self.albums.insert(key(artist, title), hit);
        self
    }

    /// Base delay; each search waits `delay / (1 + title length % 4)`.
    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    pub fn set_unauthorized(&self, v: bool) {
        self.unauthorized.store(v, Ordering::SeqCst);
    }

    /// Searches for this title fail as an upstream outage.
    pub fn fail_on_title(&self, title: &str) {
        if let Ok(mut g) = self.failing_titles.lock() {
            g.push(title.to_lowercase());
        }
    }

    /// Playlist creation still works; adding items fails as an outage.
    pub fn set_add_items_failing(&self, v: bool) {
        self.add_items_failing.store(v, Ordering::SeqCst);
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn playlists(&self) -> Vec<Playlist> {
        self.playlists.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn added(&self) -> Vec<(String, Vec<String>)> {
        self.added.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DestinationCatalog for MockDestinationCatalog {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search_catalog(&self, query: &CatalogQuery) -> Result<Option<CatalogHit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.search_delay {
            let divisor = 1 + (query.title.len() % 4) as u32;
            tokio::time::sleep(delay / divisor).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(TransferError::Unauthorized(ProviderRole::Destination));
        }
        let title = query.title.to_lowercase();
        let failing = self
            .failing_titles
            .lock()
            .map(|g| g.contains(&title))
            .unwrap_or(false);
        if failing {
            return Err(TransferError::upstream(ProviderRole::Destination, "mock outage"));
        }

        let hit = match &query.artist {
            Some(artist) => self.albums.get(&key(artist, &query.title)).cloned(),
            None => self
                .albums
                .iter()
                .find(|((_, t), _)| *t == title.trim())
                .map(|(_, hit)| hit.clone()),
        };
        Ok(hit)
    }

    async fn create_playlist(&self, name: &str, _description: &str) -> Result<Playlist> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(TransferError::Unauthorized(ProviderRole::Destination));
        }
        let mut g = self
            .playlists
            .lock()
            .map_err(|_| TransferError::upstream(ProviderRole::Destination, "mock poisoned"))?;
        let id = format!("mock-playlist-{}", g.len() + 1);
        let playlist = Playlist {
            destination_url: format!("https://open.mock.invalid/playlist/{}", id),
            id,
            name: name.to_string(),
        };
        info!("MockDestinationCatalog: create_playlist {}", name);
        g.push(playlist.clone());
        Ok(playlist)
    }

    async fn add_items(&self, playlist: &Playlist, destination_ids: &[String]) -> Result<usize> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(TransferError::Unauthorized(ProviderRole::Destination));
        }
        if self.add_items_failing.load(Ordering::SeqCst) {
            return Err(TransferError::upstream(ProviderRole::Destination, "503"));
        }
        if let Ok(mut g) = self.added.lock() {
            g.push((playlist.id.clone(), destination_ids.to_vec()));
        }
        Ok(destination_ids.len() * self.tracks_per_album)
    }
}
