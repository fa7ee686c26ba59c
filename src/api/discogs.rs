use super::{check_response, transport, SourceCatalog};
use crate::config::Config;
use crate::db::TokenStore;
use crate::error::{Result, TransferError};
use crate::models::{CollectionFolder, CollectionItem, ProviderRole};
use crate::util::strip_disambiguation;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub(crate) const PROVIDER_KEY: &str = "discogs";
const ROLE: ProviderRole = ProviderRole::Source;
const PAGE_SIZE: u32 = 100;

/// OAuth 1.0a access token as persisted in the token store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    pub token_secret: String,
}

/// Discogs provider backed by the Discogs REST API.
/// Requests are signed with OAuth 1.0a PLAINTEXT; tokens live in the token store.
pub struct DiscogsProvider {
    pub(crate) client: Client,
    pub(crate) consumer_key: String,
    pub(crate) consumer_secret: String,
    pub(crate) callback_url: String,
    pub(crate) api_base: String,
    pub(crate) web_base: String,
    pub(crate) user_agent: String,
    pub(crate) store: TokenStore,
    pub(crate) username: tokio::sync::Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct FoldersResponse {
    #[serde(default)]
    folders: Vec<FolderJson>,
}

#[derive(Deserialize)]
struct FolderJson {
    id: serde_json::Value,
    name: String,
    #[serde(default)]
    count: u64,
}

#[derive(Deserialize)]
struct ReleasesPage {
    #[serde(default)]
    pagination: Option<Pagination>,
    #[serde(default)]
    releases: Vec<ReleaseJson>,
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    urls: PaginationUrls,
}

#[derive(Deserialize, Default)]
struct PaginationUrls {
    next: Option<String>,
}

#[derive(Deserialize)]
struct ReleaseJson {
    id: u64,
    basic_information: BasicInformation,
}

#[derive(Deserialize)]
struct BasicInformation {
    title: String,
    #[serde(default)]
    year: Option<u32>,
    #[serde(default)]
    thumb: Option<String>,
    #[serde(default)]
    resource_url: Option<String>,
    #[serde(default)]
    artists: Vec<ArtistJson>,
}

#[derive(Deserialize)]
struct ArtistJson {
    name: String,
}

impl DiscogsProvider {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            client: Client::new(),
            consumer_key: cfg.discogs_consumer_key.clone(),
            consumer_secret: cfg.discogs_consumer_secret.clone(),
            callback_url: cfg.discogs_callback_url.clone(),
            api_base: cfg.discogs_api_base.trim_end_matches('/').to_string(),
            web_base: cfg.discogs_web_base.trim_end_matches('/').to_string(),
            user_agent: cfg.user_agent.clone(),
            store: TokenStore::new(cfg.db_path.clone()),
            username: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn load_token(&self) -> Result<Option<StoredToken>> {
        let raw = self
            .store
            .load_token(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?;
        match raw {
            Some(s) => {
                let st: StoredToken = serde_json::from_str(&s)
                    .map_err(|e| TransferError::storage(format!("parse discogs token json: {}", e)))?;
                Ok(Some(st))
            }
            None => Ok(None),
        }
    }

    /// Signed GET against an absolute URL with the stored access token.
    async fn signed_get(&self, url: &str, what: &str) -> Result<reqwest::Response> {
        let token = self.load_token().await?.ok_or(TransferError::Unauthorized(ROLE))?;
        let header = self.oauth_header(Some((&token.token, &token.token_secret)), &[]);
        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, header)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(transport(ROLE, what))?;
        check_response(ROLE, what, resp).await
    }

    /// Fetch the identity behind the stored token. `Ok(None)` when there is no
    /// token or upstream rejected it.
    pub(crate) async fn fetch_identity(&self) -> Result<Option<String>> {
        if self.load_token().await?.is_none() {
            return Ok(None);
        }
        let url = format!("{}/oauth/identity", self.api_base);
        let resp = match self.signed_get(&url, "identity").await {
            Ok(r) => r,
            Err(TransferError::Unauthorized(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let j: serde_json::Value = resp
            .json()
            .await
            .map_err(transport(ROLE, "identity"))?;
        let username = j["username"]
            .as_str()
            .ok_or_else(|| TransferError::upstream(ROLE, "identity response has no username"))?
            .to_string();
        *self.username.lock().await = Some(username.clone());
        Ok(Some(username))
    }

    async fn get_username(&self) -> Result<String> {
        {
            let g = self.username.lock().await;
            if let Some(u) = g.as_ref() {
                return Ok(u.clone());
            }
        }
        self.fetch_identity()
            .await?
            .ok_or(TransferError::Unauthorized(ROLE))
    }

    fn folder_releases_url(&self, username: &str, folder_id: &str) -> String {
        format!(
            "{}/users/{}/collection/folders/{}/releases?per_page={}&page=1",
            self.api_base,
            urlencoding::encode(username),
            urlencoding::encode(folder_id),
            PAGE_SIZE
        )
    }
}

fn release_to_item(r: ReleaseJson) -> CollectionItem {
    let info = r.basic_information;
    let artist = info
        .artists
        .first()
        .map(|a| strip_disambiguation(&a.name))
        .unwrap_or_default();
    CollectionItem {
        source_id: r.id.to_string(),
        artist,
        title: info.title,
        year: info.year.filter(|y| *y > 0),
        cover_art_url: info.thumb.filter(|t| !t.is_empty()),
        source_url: info.resource_url.filter(|u| !u.is_empty()),
    }
}

fn folder_id_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SourceCatalog for DiscogsProvider {
    fn name(&self) -> &str {
        PROVIDER_KEY
    }

    async fn list_folders(&self) -> Result<Vec<CollectionFolder>> {
        let username = self.get_username().await?;
        let url = format!(
            "{}/users/{}/collection/folders",
            self.api_base,
            urlencoding::encode(&username)
        );
        let resp = self.signed_get(&url, "list folders").await?;
        let body: FoldersResponse = resp.json().await.map_err(transport(ROLE, "list folders"))?;
        let folders: Vec<CollectionFolder> = body
            .folders
            .into_iter()
            .enumerate()
            .map(|(idx, f)| CollectionFolder {
                id: folder_id_string(&f.id),
                name: f.name,
                item_count: f.count,
                ordinal_index: idx,
            })
            .collect();
        debug!("Discogs user {} has {} folders", username, folders.len());
        Ok(folders)
    }

    async fn list_items(&self, folder: &CollectionFolder) -> Result<Vec<CollectionItem>> {
        let username = self.get_username().await?;
        let mut items = Vec::new();
        let mut next: Option<String> = Some(self.folder_releases_url(&username, &folder.id));
        let mut pages = 0u32;

        while let Some(url) = next {
            let resp = self.signed_get(&url, "list folder releases").await?;
            let page: ReleasesPage = resp
                .json()
                .await
                .map_err(transport(ROLE, "list folder releases"))?;
            pages += 1;
            items.extend(page.releases.into_iter().map(release_to_item));
            next = page.pagination.and_then(|p| p.urls.next);
        }

        debug!(
            "Fetched {} items from Discogs folder '{}' in {} page(s)",
            items.len(),
            folder.name,
            pages
        );
        Ok(items)
    }
}
