use crate::api::discogs::DiscogsProvider;
use crate::api::spotify::SpotifyProvider;
use crate::api::{Authorizer, DestinationCatalog, SourceCatalog};
use crate::auth::AuthorizationManager;
use crate::collection::CollectionRepository;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::matcher::{CatalogMatcher, MatchPolicy};
use crate::models::{
    AuthStatus, AuthorizationRequest, CollectionFolder, CollectionItem, MatchResult, ProviderRole, TransferState,
    TransferSummary,
};
use crate::reconciler::TransferReconciler;
use crate::report::ReportFormat;
use crate::util::expand_template;
use std::sync::Arc;
use tracing::info;

/// Per-role authorization snapshot for `status()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub source: AuthStatus,
    pub destination: AuthStatus,
}

/// One user session: both providers' authorization plus the current
/// transfer run.
pub struct TransferSession {
    cfg: Config,
    source_auth: Arc<AuthorizationManager>,
    destination_auth: Arc<AuthorizationManager>,
    collection: CollectionRepository,
    matcher: CatalogMatcher,
    reconciler: TransferReconciler,
}

impl TransferSession {
    /// Wire up the Discogs and Spotify providers described by `cfg`.
    pub fn from_config(cfg: Config) -> Self {
        let discogs = Arc::new(DiscogsProvider::from_config(&cfg));
        let spotify = Arc::new(SpotifyProvider::from_config(&cfg));
        Self::with_providers(cfg, discogs.clone(), discogs, spotify.clone(), spotify)
    }

    pub fn with_providers(
        cfg: Config,
        source_auth: Arc<dyn Authorizer>,
        source: Arc<dyn SourceCatalog>,
        destination_auth: Arc<dyn Authorizer>,
        destination: Arc<dyn DestinationCatalog>,
    ) -> Self {
        let source_auth = Arc::new(AuthorizationManager::new(source_auth));
        let destination_auth = Arc::new(AuthorizationManager::new(destination_auth));
        let collection = CollectionRepository::new(source, source_auth.clone());
        let matcher = CatalogMatcher::new(
            destination.clone(),
            destination_auth.clone(),
            MatchPolicy::from_config(&cfg),
            cfg.match_concurrency,
        );
        let reconciler = TransferReconciler::new(
            destination,
            destination_auth.clone(),
            ReportFormat::parse(&cfg.report_format),
        );
        Self {
            cfg,
            source_auth,
            destination_auth,
            collection,
            matcher,
            reconciler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn auth(&self, role: ProviderRole) -> &Arc<AuthorizationManager> {
        match role {
            ProviderRole::Source => &self.source_auth,
            ProviderRole::Destination => &self.destination_auth,
        }
    }

    /// Ask both providers; no state changes.
    pub async fn status(&self) -> Result<SessionStatus> {
        let (source, destination) = futures::try_join!(
            self.source_auth.check_status(),
            self.destination_auth.check_status()
        )?;
        Ok(SessionStatus { source, destination })
    }

    /// Initial discovery for both providers.
    pub async fn discover(&self) -> Result<SessionStatus> {
        let (source, destination) =
            futures::try_join!(self.source_auth.discover(), self.destination_auth.discover())?;
        Ok(SessionStatus { source, destination })
    }

    pub async fn begin_authorization(&self, role: ProviderRole) -> Result<AuthorizationRequest> {
        self.auth(role).begin_authorization().await
    }

    pub async fn poll_until_authorized(&self, role: ProviderRole) -> Result<AuthStatus> {
        self.auth(role)
            .poll_until_authorized(self.cfg.poll_interval(role), self.cfg.poll_timeout())
            .await
    }

    pub async fn complete_authorization(&self, role: ProviderRole, callback: &str) -> Result<()> {
        self.auth(role).complete_authorization(callback).await
    }

    /// Logging out of either provider also abandons the current run. A
    /// rejected logout leaves the run alone.
    pub async fn logout(&self, role: ProviderRole) -> Result<()> {
        let res = self.auth(role).logout().await;
        if matches!(res, Err(TransferError::NotSupported(_))) {
            return res;
        }
        self.reconciler.abandon().await;
        if role == ProviderRole::Source {
            self.collection.forget().await;
        }
        res
    }

    pub async fn list_folders(&self) -> Result<Vec<CollectionFolder>> {
        self.collection.list_folders().await
    }

    /// Fetch a folder's items and start a new transfer run over them.
    pub async fn load_folder(&self, index: usize) -> Result<Vec<CollectionItem>> {
        let items = self.collection.list_items(index).await?;
        let folder = self.collection.folder(index).await?;
        self.reconciler.load_collection(folder, items.clone()).await;
        Ok(items)
    }

    pub async fn match_collection(&self) -> Result<Vec<MatchResult>> {
        let (epoch, items) = self.reconciler.begin_matching().await?;
        let results = self.matcher.match_all(&items).await?;
        self.reconciler.record_matches(epoch, results.clone()).await?;
        Ok(results)
    }

    /// Create the playlist. `name` falls back to the configured template.
    pub async fn create_playlist(&self, name: Option<&str>) -> Result<TransferSummary> {
        let folder_name = self
            .reconciler
            .folder()
            .await
            .map(|f| f.name)
            .unwrap_or_default();
        let name = match name {
            Some(n) => n.to_string(),
            None => expand_template(&self.cfg.playlist_name_template, &folder_name),
        };
        let description = expand_template(&self.cfg.playlist_description_template, &folder_name);
        let summary = self.reconciler.create_playlist(&name, &description).await?;
        info!("Playlist available at {}", summary.playlist.destination_url);
        Ok(summary)
    }

    pub async fn export_report(&self) -> Result<Vec<u8>> {
        self.reconciler.export_report().await
    }

    pub fn report_format(&self) -> ReportFormat {
        self.reconciler.report_format()
    }

    pub async fn transfer_state(&self) -> TransferState {
        self.reconciler.state().await
    }

    pub fn reconciler(&self) -> &TransferReconciler {
        &self.reconciler
    }
}
