use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a transfer a provider sits on. Each role carries its own
/// authorization state; one never implies the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    Source,
    Destination,
}

impl ProviderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderRole::Source => "source",
            ProviderRole::Destination => "destination",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" | "discogs" => Ok(ProviderRole::Source),
            "destination" | "dest" | "spotify" => Ok(ProviderRole::Destination),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Unauthenticated,
    PendingAuthorization,
    Authorized,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::PendingAuthorization => "pending authorization",
            AuthState::Authorized => "authorized",
        };
        f.write_str(s)
    }
}

/// Answer to the "is this provider authorized" query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authorized: bool,
    pub username: Option<String>,
}

impl AuthStatus {
    pub fn unauthorized() -> Self {
        Self::default()
    }

    pub fn authorized_as(username: impl Into<String>) -> Self {
        Self {
            authorized: true,
            username: Some(username.into()),
        }
    }
}

/// What a provider hands back when an authorization attempt starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    /// Opaque id of the in-flight attempt (OAuth request token or `state`).
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationSession {
    pub provider: ProviderRole,
    pub state: AuthState,
    pub pending_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFolder {
    /// Provider-side folder id.
    pub id: String,
    pub name: String,
    pub item_count: u64,
    pub ordinal_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionItem {
    pub source_id: String,
    pub artist: String,
    pub title: String,
    pub year: Option<u32>,
    pub cover_art_url: Option<String>,
    pub source_url: Option<String>,
}

impl CollectionItem {
    pub fn new(source_id: impl Into<String>, artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            artist: artist.into(),
            title: title.into(),
            year: None,
            cover_art_url: None,
            source_url: None,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// Top hit returned by a destination catalog search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogHit {
    pub destination_id: String,
    pub uri: Option<String>,
    pub artist: String,
    pub title: String,
    pub image_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Matched {
        destination_id: String,
        image_url: Option<String>,
        url: Option<String>,
    },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub item: CollectionItem,
    pub outcome: MatchOutcome,
}

impl MatchResult {
    pub fn not_found(item: CollectionItem) -> Self {
        Self {
            item,
            outcome: MatchOutcome::NotFound,
        }
    }

    pub fn matched(item: CollectionItem, hit: &CatalogHit) -> Self {
        Self {
            item,
            outcome: MatchOutcome::Matched {
                destination_id: hit.destination_id.clone(),
                image_url: hit.image_url.clone(),
                url: hit.url.clone(),
            },
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Matched { .. })
    }

    pub fn destination_id(&self) -> Option<&str> {
        match &self.outcome {
            MatchOutcome::Matched { destination_id, .. } => Some(destination_id),
            MatchOutcome::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub destination_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Matched { destination_id: String, url: Option<String> },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// 1-based position in the transferred collection.
    pub index: usize,
    pub artist: String,
    pub title: String,
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    CollectionLoaded,
    Matched,
    PlaylistCreated,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::CollectionLoaded => "collection loaded",
            TransferState::Matched => "matched",
            TransferState::PlaylistCreated => "playlist created",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub playlist: Playlist,
    pub tracks_added: usize,
    pub matched: usize,
    pub not_found: usize,
}
