use super::{check_response, transport, CatalogQuery, DestinationCatalog};
use crate::config::Config;
use crate::db::TokenStore;
use crate::error::{Result, TransferError};
use crate::models::{CatalogHit, Playlist, ProviderRole};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub(crate) const PROVIDER_KEY: &str = "spotify";
const ROLE: ProviderRole = ProviderRole::Destination;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: i64, // epoch seconds
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// Spotify provider backed by Spotify Web API.
/// Token management reads token JSON from the token store and persists refreshed tokens.
pub struct SpotifyProvider {
    pub(crate) client: Client,
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) redirect_uri: String,
    pub(crate) scope: String,
    pub(crate) api_base: String,
    pub(crate) auth_base: String,
    pub(crate) store: TokenStore,
    max_batch: usize,
    token: tokio::sync::Mutex<Option<StoredToken>>,
    user_id: tokio::sync::Mutex<Option<String>>,
}

impl SpotifyProvider {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            client: Client::new(),
            client_id: cfg.spotify_client_id.clone(),
            client_secret: cfg.spotify_client_secret.clone(),
            redirect_uri: cfg.spotify_redirect_uri.clone(),
            scope: cfg.spotify_scope.clone(),
            api_base: cfg.spotify_api_base.trim_end_matches('/').to_string(),
            auth_base: cfg.spotify_auth_base.trim_end_matches('/').to_string(),
            store: TokenStore::new(cfg.db_path.clone()),
            max_batch: cfg.max_batch_size_spotify.clamp(1, 100),
            token: tokio::sync::Mutex::new(None),
            user_id: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) fn uses_pkce(&self) -> bool {
        self.client_secret.is_empty()
    }

    pub(crate) fn basic_auth_header(&self) -> String {
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret))
        )
    }

    async fn load_token_from_store(&self) -> Result<Option<StoredToken>> {
        let raw = self
            .store
            .load_token(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?;
        match raw {
            Some(s) => {
                let st: StoredToken = serde_json::from_str(&s)
                    .map_err(|e| TransferError::storage(format!("parse token json: {}", e)))?;
                Ok(Some(st))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn persist_token(&self, st: &StoredToken) -> Result<()> {
        let s = serde_json::to_string(st).map_err(TransferError::storage)?;
        self.store
            .save_token(PROVIDER_KEY, s)
            .await
            .map_err(TransferError::storage)
    }

    /// Drop in-memory token and user caches so the next call re-reads the store.
    pub(crate) async fn forget_cached(&self) {
        *self.token.lock().await = None;
        *self.user_id.lock().await = None;
    }

    /// Load the token (from the store when `reload` or nothing is cached) and
    /// refresh it when it is about to expire. Returns false when there is no token.
    async fn ensure_token(&self, reload: bool) -> Result<bool> {
        let mut lock = self.token.lock().await;
        if reload || lock.is_none() {
            *lock = self.load_token_from_store().await?;
        }
        let Some(st) = lock.as_ref() else {
            return Ok(false);
        };
        let now = Utc::now().timestamp();
        if now + 30 >= st.expires_at {
            debug!("Spotify token is near expiry, refreshing");
            let mut cur = st.clone();
            self.refresh_token_internal(&mut cur).await?;
            *lock = Some(cur);
        }
        Ok(true)
    }

    async fn refresh_token_internal(&self, cur: &mut StoredToken) -> Result<()> {
        let refresh_token = cur
            .refresh_token
            .clone()
            .ok_or(TransferError::Unauthorized(ROLE))?;
        let url = format!("{}/api/token", self.auth_base);
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        let mut req = self.client.post(&url);
        if self.uses_pkce() {
            params.push(("client_id", self.client_id.clone()));
        } else {
            req = req.header(AUTHORIZATION, self.basic_auth_header());
        }
        let resp = req
            .form(&params)
            .send()
            .await
            .map_err(transport(ROLE, "refresh token"))?;
        let status = resp.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED {
            // invalid_grant / invalid_client: the grant is gone, user must re-authorize
            let body = resp.text().await.unwrap_or_default();
            warn!("Failed to refresh token: {} - {}", status, body);
            return Err(TransferError::Unauthorized(ROLE));
        }
        let resp = check_response(ROLE, "refresh token", resp).await?;
        let j: serde_json::Value = resp.json().await.map_err(transport(ROLE, "refresh token"))?;
        let access_token = j["access_token"]
            .as_str()
            .ok_or_else(|| TransferError::upstream(ROLE, "no access_token in refresh response"))?
            .to_string();
        let expires_in = j["expires_in"].as_i64().unwrap_or(3600);
        cur.access_token = access_token;
        cur.token_type = "Bearer".into();
        cur.expires_at = Utc::now().timestamp() + expires_in;
        if let Some(s) = j["scope"].as_str() {
            cur.scope = Some(s.to_string());
        }
        if let Some(r) = j["refresh_token"].as_str() {
            cur.refresh_token = Some(r.to_string());
        }
        self.persist_token(cur).await
    }

    pub async fn get_bearer(&self) -> Result<String> {
        if !self.ensure_token(false).await? {
            return Err(TransferError::Unauthorized(ROLE));
        }
        let lock = self.token.lock().await;
        let st = lock.as_ref().ok_or(TransferError::Unauthorized(ROLE))?;
        Ok(format!("Bearer {}", st.access_token))
    }

    /// `/me` for the stored token. `Ok(None)` when there is no usable token.
    pub(crate) async fn fetch_me(&self) -> Result<Option<String>> {
        match self.ensure_token(true).await {
            Ok(true) => {}
            Ok(false) | Err(TransferError::Unauthorized(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        let bearer = self.get_bearer().await?;
        let url = format!("{}/me", self.api_base);
        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, &bearer)
            .send()
            .await
            .map_err(transport(ROLE, "fetch /me"))?;
        let resp = match check_response(ROLE, "fetch /me", resp).await {
            Ok(r) => r,
            Err(TransferError::Unauthorized(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let j: serde_json::Value = resp.json().await.map_err(transport(ROLE, "fetch /me"))?;
        let id = j["id"]
            .as_str()
            .ok_or_else(|| TransferError::upstream(ROLE, "no id in /me response"))?
            .to_string();
        *self.user_id.lock().await = Some(id.clone());
        Ok(Some(id))
    }

    async fn get_user_id(&self) -> Result<String> {
        {
            let g = self.user_id.lock().await;
            if let Some(u) = g.as_ref() {
                return Ok(u.clone());
            }
        }
        self.fetch_me().await?.ok_or(TransferError::Unauthorized(ROLE))
    }

    /// All track URIs of an album, following `next` pages.
    async fn album_track_uris(&self, album_id: &str) -> Result<Vec<String>> {
        let mut uris = Vec::new();
        let mut next: Option<String> = Some(format!(
            "{}/albums/{}/tracks?limit=50",
            self.api_base,
            urlencoding::encode(album_id)
        ));
        while let Some(url) = next {
            let bearer = self.get_bearer().await?;
            let resp = self
                .client
                .get(&url)
                .header(AUTHORIZATION, &bearer)
                .send()
                .await
                .map_err(transport(ROLE, "album tracks"))?;
            let resp = check_response(ROLE, "album tracks", resp).await?;
            let j: serde_json::Value = resp.json().await.map_err(transport(ROLE, "album tracks"))?;
            if let Some(items) = j["items"].as_array() {
                for it in items {
                    if let Some(uri) = it["uri"].as_str() {
                        uris.push(uri.to_string());
                    }
                }
            }
            next = j["next"].as_str().map(|s| s.to_string());
        }
        Ok(uris)
    }
}

impl CatalogQuery {
    /// Spotify search syntax for this query.
    pub fn to_search_string(&self) -> String {
        match (&self.artist, self.fielded) {
            (Some(artist), true) => format!("album:{} artist:{}", self.title, artist),
            (Some(artist), false) => format!("{} artist:{}", self.title, artist),
            (None, true) => format!("album:{}", self.title),
            (None, false) => self.title.clone(),
        }
    }
}

#[async_trait]
impl DestinationCatalog for SpotifyProvider {
    fn name(&self) -> &str {
        PROVIDER_KEY
    }

    async fn search_catalog(&self, query: &CatalogQuery) -> Result<Option<CatalogHit>> {
        let q = query.to_search_string();
        let url = format!(
            "{}/search?q={}&type=album&limit=1",
            self.api_base,
            urlencoding::encode(&q)
        );
        let bearer = self.get_bearer().await?;
        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, &bearer)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport(ROLE, "search"))?;
        let resp = check_response(ROLE, "search", resp).await?;
        let j: serde_json::Value = resp.json().await.map_err(transport(ROLE, "search"))?;
        let Some(album) = j["albums"]["items"].as_array().and_then(|a| a.first()) else {
            debug!("Search '{}' returned no items", q);
            return Ok(None);
        };
        let Some(id) = album["id"].as_str() else {
            return Err(TransferError::upstream(ROLE, "search hit has no id"));
        };
        Ok(Some(CatalogHit {
            destination_id: id.to_string(),
            uri: album["uri"].as_str().map(|s| s.to_string()),
            artist: album["artists"][0]["name"].as_str().unwrap_or("").to_string(),
            title: album["name"].as_str().unwrap_or("").to_string(),
            image_url: album["images"][0]["url"].as_str().map(|s| s.to_string()),
            url: album["external_urls"]["spotify"].as_str().map(|s| s.to_string()),
        }))
    }

    async fn create_playlist(&self, name: &str, description: &str) -> Result<Playlist> {
        let user_id = self.get_user_id().await?;
        let bearer = self.get_bearer().await?;
        let url = format!(
            "{}/users/{}/playlists",
            self.api_base,
            url::form_urlencoded::byte_serialize(user_id.as_bytes()).collect::<String>()
        );
        let body = json!({
            "name": name,
            "description": description,
            "public": true
        });
        debug!(
            "Creating playlist with name: '{}' and description: '{}' for user id: {}",
            name, description, user_id
        );
        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, &bearer)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport(ROLE, "create playlist"))?;
        let resp = check_response(ROLE, "create playlist", resp).await?;
        let j: serde_json::Value = resp.json().await.map_err(transport(ROLE, "create playlist"))?;
        let id = j["id"]
            .as_str()
            .ok_or_else(|| TransferError::upstream(ROLE, "create playlist response has no id"))?
            .to_string();
        let destination_url = j["external_urls"]["spotify"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("https://open.spotify.com/playlist/{}", id));
        Ok(Playlist {
            id,
            name: name.to_string(),
            destination_url,
        })
    }

    async fn add_items(&self, playlist: &Playlist, destination_ids: &[String]) -> Result<usize> {
        let mut track_uris = Vec::new();
        for album_id in destination_ids {
            track_uris.extend(self.album_track_uris(album_id).await?);
        }

        let url = format!("{}/playlists/{}/tracks", self.api_base, playlist.id);
        for (batch_no, chunk) in track_uris.chunks(self.max_batch).enumerate() {
            debug!(
                "Batch {}: adding {} tracks to playlist '{}'",
                batch_no + 1,
                chunk.len(),
                playlist.name
            );
            let bearer = self.get_bearer().await?;
            let resp = self
                .client
                .post(&url)
                .header(AUTHORIZATION, &bearer)
                .json(&json!({ "uris": chunk }))
                .send()
                .await
                .map_err(transport(ROLE, "add tracks"))?;
            check_response(ROLE, "add tracks", resp).await?;
        }
        Ok(track_uris.len())
    }
}
