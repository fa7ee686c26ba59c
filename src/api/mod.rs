pub mod discogs;
pub mod discogs_auth;
pub mod mock;
pub mod pkce;
pub mod spotify;
pub mod spotify_auth;

use crate::error::{Result, TransferError};
use crate::models::{
    AuthStatus, AuthorizationRequest, CatalogHit, CollectionFolder, CollectionItem, Playlist, ProviderRole,
};

/// Authorization side of a provider: the minimal set of operations the
/// AuthorizationManager needs. Token storage stays behind the implementation.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    /// Return the provider's name (for logging, UI, etc)
    fn name(&self) -> &str;

    fn role(&self) -> ProviderRole;

    /// Side-effect-free (from the caller's view) "is this provider authorized" query.
    async fn check_status(&self) -> Result<AuthStatus>;

    /// Start a new authorization attempt and return the URL the user must visit.
    async fn begin_authorization(&self) -> Result<AuthorizationRequest>;

    /// Exchange the out-of-band callback (redirect URL or verifier code) for a token.
    async fn complete_authorization(&self, callback: &str) -> Result<()>;

    /// Drop the stored token and any in-flight attempt.
    async fn logout(&self) -> Result<()>;
}

/// Source catalog: the user's collection, grouped into folders.
#[async_trait::async_trait]
pub trait SourceCatalog: Send + Sync {
    fn name(&self) -> &str;

    async fn list_folders(&self) -> Result<Vec<CollectionFolder>>;

    /// All items of a folder, every upstream page concatenated in order.
    async fn list_items(&self, folder: &CollectionFolder) -> Result<Vec<CollectionItem>>;
}

/// Query handed to the destination search. `artist` is None for the
/// title-only passes of the similarity policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub artist: Option<String>,
    pub title: String,
    /// Use field filters (`album:`/`artist:`) rather than free text.
    pub fielded: bool,
}

impl CatalogQuery {
    pub fn fielded(artist: &str, title: &str) -> Self {
        Self {
            artist: Some(artist.to_string()),
            title: title.to_string(),
            fielded: true,
        }
    }

    pub fn title_only(title: &str) -> Self {
        Self {
            artist: None,
            title: title.to_string(),
            fielded: true,
        }
    }
}

/// Destination catalog: search, playlist creation and population.
#[async_trait::async_trait]
pub trait DestinationCatalog: Send + Sync {
    fn name(&self) -> &str;

    /// Best match for the query or None.
    async fn search_catalog(&self, query: &CatalogQuery) -> Result<Option<CatalogHit>>;

    async fn create_playlist(&self, name: &str, description: &str) -> Result<Playlist>;

    /// Add the matched destination ids to the playlist; returns the number of
    /// playlist entries added.
    async fn add_items(&self, playlist: &Playlist, destination_ids: &[String]) -> Result<usize>;
}

/// Map an HTTP response onto the error taxonomy: 401 means the session is
/// gone, anything else unsuccessful means the provider is unavailable.
pub(crate) async fn check_response(
    role: ProviderRole,
    what: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        log::warn!("{} returned 401 for {} provider", what, role);
        return Err(TransferError::Unauthorized(role));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return Err(TransferError::upstream(
            role,
            format!("{} rate_limited: retry_after={:?}", what, retry_after),
        ));
    }
    let txt = resp.text().await.unwrap_or_default();
    Err(TransferError::upstream(role, format!("{} failed: {} => {}", what, status, txt)))
}

pub(crate) fn transport(role: ProviderRole, what: &str) -> impl Fn(reqwest::Error) -> TransferError + '_ {
    move |e| TransferError::upstream(role, format!("{}: {}", what, e))
}
