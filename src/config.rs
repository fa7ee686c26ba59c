use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::ProviderRole;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // path to database file holding provider tokens
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Discogs (source)
    #[serde(default)]
    pub discogs_consumer_key: String,
    #[serde(default)]
    pub discogs_consumer_secret: String,
    /// OAuth callback; "oob" shows the verifier code to the user instead of redirecting.
    #[serde(default = "default_discogs_callback")]
    pub discogs_callback_url: String,
    #[serde(default = "default_discogs_api_base")]
    pub discogs_api_base: String,
    #[serde(default = "default_discogs_web_base")]
    pub discogs_web_base: String,

    // Spotify (destination)
    #[serde(default)]
    pub spotify_client_id: String,
    /// Leave empty to use the PKCE public-client flow.
    #[serde(default)]
    pub spotify_client_secret: String,
    #[serde(default = "default_spotify_redirect_uri")]
    pub spotify_redirect_uri: String,
    #[serde(default = "default_spotify_scope")]
    pub spotify_scope: String,
    #[serde(default = "default_spotify_api_base")]
    pub spotify_api_base: String,
    #[serde(default = "default_spotify_auth_base")]
    pub spotify_auth_base: String,

    // Authorization polling
    #[serde(default = "default_source_poll_interval")]
    pub source_poll_interval_ms: u64,
    #[serde(default = "default_destination_poll_interval")]
    pub destination_poll_interval_ms: u64,
    /// Unset means poll until cancelled.
    #[serde(default)]
    pub auth_poll_timeout_secs: Option<u64>,

    // Matching
    #[serde(default = "default_match_concurrency")]
    pub match_concurrency: usize,
    #[serde(default = "default_match_policy")]
    pub match_policy: String,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,

    #[serde(default = "default_max_batch_spotify")]
    pub max_batch_size_spotify: usize,

    // Playlist + report
    #[serde(default = "default_playlist_name_template")]
    pub playlist_name_template: String,
    #[serde(default = "default_playlist_description_template")]
    pub playlist_description_template: String,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default = "default_report_format")]
    pub report_format: String,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("discofy").join("discofy.db"))
        .unwrap_or_else(|| "discofy.db".into())
}
fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("discofy").join("logs"))
        .unwrap_or_else(|| "logs".into())
}
fn default_user_agent() -> String { format!("discofy/{}", env!("CARGO_PKG_VERSION")) }
fn default_discogs_callback() -> String { "oob".into() }
fn default_discogs_api_base() -> String { "https://api.discogs.com".into() }
fn default_discogs_web_base() -> String { "https://www.discogs.com".into() }
fn default_spotify_redirect_uri() -> String { "http://127.0.0.1:8888/callback".into() }
fn default_spotify_scope() -> String { "playlist-modify-public".into() }
fn default_spotify_api_base() -> String { "https://api.spotify.com/v1".into() }
fn default_spotify_auth_base() -> String { "https://accounts.spotify.com".into() }
fn default_source_poll_interval() -> u64 { 5000 }
fn default_destination_poll_interval() -> u64 { 200 }
fn default_match_concurrency() -> usize { 4 }
fn default_match_policy() -> String { "first_result".into() }
fn default_similarity_threshold() -> u32 { 85 }
fn default_max_batch_spotify() -> usize { 100 }
fn default_playlist_name_template() -> String { "Discogs - ${folder_name}".into() }
fn default_playlist_description_template() -> String {
    "This is a playlist created from the Discogs collection folder '${folder_name}' using discofy".into()
}
fn default_report_path() -> PathBuf { "discofy_report.txt".into() }
fn default_report_format() -> String { "text".into() }

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(s)?;
        cfg.apply_env_fallbacks();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Secrets left blank in the file are taken from the environment.
    fn apply_env_fallbacks(&mut self) {
        fill_from_env(&mut self.discogs_consumer_key, "DISCOGS_CONSUMER_KEY");
        fill_from_env(&mut self.discogs_consumer_secret, "DISCOGS_CONSUMER_SECRET");
        fill_from_env(&mut self.spotify_client_id, "SPOTIFY_CLIENT_ID");
        fill_from_env(&mut self.spotify_client_secret, "SPOTIFY_CLIENT_SECRET");
    }

    fn validate(&self) -> anyhow::Result<()> {
        match self.match_policy.as_str() {
            "first_result" | "similarity" => {}
            other => anyhow::bail!("unknown match_policy '{}' (expected first_result or similarity)", other),
        }
        match self.report_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("unknown report_format '{}' (expected text or json)", other),
        }
        if self.similarity_threshold > 100 {
            anyhow::bail!("similarity_threshold must be within 0..=100");
        }
        if self.max_batch_size_spotify == 0 || self.max_batch_size_spotify > 100 {
            anyhow::bail!("max_batch_size_spotify must be within 1..=100");
        }
        Ok(())
    }

    pub fn poll_interval(&self, role: ProviderRole) -> Duration {
        match role {
            ProviderRole::Source => Duration::from_millis(self.source_poll_interval_ms),
            ProviderRole::Destination => Duration::from_millis(self.destination_poll_interval_ms),
        }
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.auth_poll_timeout_secs.map(Duration::from_secs)
    }
}

fn fill_from_env(field: &mut String, var: &str) {
    if field.trim().is_empty() {
        if let Ok(v) = std::env::var(var) {
            *field = v;
        }
    }
}
