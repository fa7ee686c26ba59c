use crate::api::DestinationCatalog;
use crate::auth::AuthorizationManager;
use crate::error::{Result, TransferError};
use crate::models::{
    CollectionFolder, CollectionItem, MatchResult, Playlist, ProviderRole, ReportEntry, TransferState,
    TransferSummary,
};
use crate::report::{self, ReportFormat};
use crate::util::is_blank;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct Run {
    state: TransferState,
    epoch: u64,
    folder: Option<CollectionFolder>,
    items: Vec<CollectionItem>,
    results: Vec<MatchResult>,
    playlists: Vec<Playlist>,
    /// Created in this run but not yet filled; the next create call adds
    /// the items to it instead of creating another playlist.
    unfilled: Option<Playlist>,
    /// Survives run resets: the last report built in this process.
    report: Option<Vec<ReportEntry>>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            state: TransferState::Idle,
            epoch: 0,
            folder: None,
            items: Vec::new(),
            results: Vec::new(),
            playlists: Vec::new(),
            unfilled: None,
            report: None,
        }
    }
}

impl Run {
    fn state(&self) -> TransferState {
        self.state
    }

    fn reset(&mut self, state: TransferState) {
        self.epoch += 1;
        self.state = state;
        self.results.clear();
        self.unfilled = None;
    }
}

/// Transfer run state machine:
/// `Idle -> CollectionLoaded -> Matched -> PlaylistCreated`.
///
/// Matching happens outside the lock; results are tagged with the epoch
/// they started in and dropped if the run was reset meanwhile.
pub struct TransferReconciler {
    catalog: Arc<dyn DestinationCatalog>,
    auth: Arc<AuthorizationManager>,
    format: ReportFormat,
    run: Mutex<Run>,
}

impl TransferReconciler {
    pub fn new(catalog: Arc<dyn DestinationCatalog>, auth: Arc<AuthorizationManager>, format: ReportFormat) -> Self {
        Self {
            catalog,
            auth,
            format,
            run: Mutex::new(Run::default()),
        }
    }

    pub async fn state(&self) -> TransferState {
        self.run.lock().await.state()
    }

    pub async fn epoch(&self) -> u64 {
        self.run.lock().await.epoch
    }

    pub async fn folder(&self) -> Option<CollectionFolder> {
        self.run.lock().await.folder.clone()
    }

    pub async fn results(&self) -> Vec<MatchResult> {
        self.run.lock().await.results.clone()
    }

    pub async fn playlists(&self) -> Vec<Playlist> {
        self.run.lock().await.playlists.clone()
    }

    /// Start a new run over `items`. Prior match results are discarded.
    pub async fn load_collection(&self, folder: CollectionFolder, items: Vec<CollectionItem>) {
        let mut run = self.run.lock().await;
        run.reset(TransferState::CollectionLoaded);
        info!("Loaded {} items from '{}' (run {})", items.len(), folder.name, run.epoch);
        run.folder = Some(folder);
        run.items = items;
    }

    /// Snapshot of the items to match plus the epoch to hand back to
    /// `record_matches`.
    pub async fn begin_matching(&self) -> Result<(u64, Vec<CollectionItem>)> {
        let run = self.run.lock().await;
        match run.state() {
            TransferState::Idle => Err(TransferError::InvalidState {
                expected: TransferState::CollectionLoaded,
                actual: TransferState::Idle,
            }),
            _ => Ok((run.epoch, run.items.clone())),
        }
    }

    pub async fn record_matches(&self, epoch: u64, results: Vec<MatchResult>) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.epoch != epoch {
            warn!("Discarding {} match results from abandoned run {}", results.len(), epoch);
            self.auth.require_authorized()?;
            return Err(TransferError::InvalidState {
                expected: TransferState::CollectionLoaded,
                actual: run.state(),
            });
        }
        debug_assert_eq!(results.len(), run.items.len());
        run.results = results;
        run.state = TransferState::Matched;
        Ok(())
    }

    /// Create the playlist, fill it with every matched item and build the
    /// report. Allowed from Matched, and again from PlaylistCreated as an
    /// explicit retry (which creates a second playlist).
    ///
    /// The playlist and report are recorded as soon as creation succeeds. If
    /// adding items then fails, the next call fills that same playlist and
    /// `name` is ignored.
    pub async fn create_playlist(&self, name: &str, description: &str) -> Result<TransferSummary> {
        self.auth.require_authorized()?;
        if is_blank(name) {
            return Err(TransferError::EmptyName);
        }
        let mut run = self.run.lock().await;
        match run.state() {
            TransferState::Matched | TransferState::PlaylistCreated => {}
            actual => {
                return Err(TransferError::InvalidState {
                    expected: TransferState::Matched,
                    actual,
                })
            }
        }

        let ids: Vec<String> = run
            .results
            .iter()
            .filter_map(|r| r.destination_id().map(str::to_string))
            .collect();

        let playlist = match run.unfilled.take() {
            Some(playlist) => {
                info!("Retrying items for playlist '{}' ({})", playlist.name, playlist.destination_url);
                playlist
            }
            None => {
                let playlist = self.observe(self.catalog.create_playlist(name.trim(), description).await).await?;
                let entries = report::build_report(&run.results);
                run.report = Some(entries);
                run.playlists.push(playlist.clone());
                run.state = TransferState::PlaylistCreated;
                playlist
            }
        };

        let tracks_added = if ids.is_empty() {
            0
        } else {
            match self.observe(self.catalog.add_items(&playlist, &ids).await).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        "Playlist '{}' was created at {} but its items could not be added: {}",
                        playlist.name, playlist.destination_url, e
                    );
                    run.unfilled = Some(playlist);
                    return Err(e);
                }
            }
        };

        let matched = ids.len();
        let not_found = run.results.len() - matched;
        info!(
            "Created playlist '{}' with {} tracks from {} matched items ({} not found)",
            playlist.name, tracks_added, matched, not_found
        );

        Ok(TransferSummary {
            playlist,
            tracks_added,
            matched,
            not_found,
        })
    }

    /// Rebuild the report from the current run's results.
    pub async fn build_report(&self) -> Result<Vec<ReportEntry>> {
        let mut run = self.run.lock().await;
        match run.state() {
            TransferState::Matched | TransferState::PlaylistCreated => {}
            actual => {
                return Err(TransferError::InvalidState {
                    expected: TransferState::Matched,
                    actual,
                })
            }
        }
        let entries = report::build_report(&run.results);
        run.report = Some(entries.clone());
        Ok(entries)
    }

    pub async fn report(&self) -> Option<Vec<ReportEntry>> {
        self.run.lock().await.report.clone()
    }

    /// The last built report rendered in the configured format.
    pub async fn export_report(&self) -> Result<Vec<u8>> {
        let run = self.run.lock().await;
        let entries = run.report.as_ref().ok_or(TransferError::ReportNotFound)?;
        report::render(entries, self.format).map_err(TransferError::storage)
    }

    pub fn report_format(&self) -> ReportFormat {
        self.format
    }

    /// Drop the current run; in-flight matches will be discarded.
    pub async fn abandon(&self) {
        let mut run = self.run.lock().await;
        if run.state() != TransferState::Idle {
            info!("Abandoning transfer run {}", run.epoch);
        }
        run.reset(TransferState::Idle);
        run.folder = None;
        run.items.clear();
    }

    async fn observe<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_unauthorized() && e.provider() == Some(ProviderRole::Destination) {
                self.auth.invalidate().await;
            }
        }
        res
    }
}
