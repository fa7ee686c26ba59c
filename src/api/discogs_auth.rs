//! OAuth 1.0a for Discogs, PLAINTEXT signature method:
//! 1. `request_token` is fetched and its secret kept as the pending authorization.
//! 2. The user opens `/oauth/authorize` and approves. With the `oob` callback
//!    Discogs shows a verifier code; with a real callback it redirects with
//!    `oauth_token` + `oauth_verifier`.
//! 3. Either the code or the redirect URL is handed to `complete_authorization`,
//!    which trades it for an access token stored in the token DB.

use super::discogs::{DiscogsProvider, StoredToken, PROVIDER_KEY};
use super::{check_response, transport, Authorizer};
use crate::error::{Result, TransferError};
use crate::models::{AuthStatus, AuthorizationRequest, ProviderRole};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use log::info;
use url::Url;

const ROLE: ProviderRole = ProviderRole::Source;

#[derive(Serialize, Deserialize)]
struct PendingSecret {
    token_secret: String,
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn parse_form(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.trim().as_bytes())
        .into_owned()
        .collect()
}

fn form_value(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

impl DiscogsProvider {
    /// Build the `Authorization: OAuth ...` header. `token` is (token, secret).
    pub(crate) fn oauth_header(&self, token: Option<(&str, &str)>, extra: &[(&str, &str)]) -> String {
        let token_secret = token.map(|(_, s)| s).unwrap_or("");
        let signature = format!(
            "{}&{}",
            urlencoding::encode(&self.consumer_secret),
            urlencoding::encode(token_secret)
        );
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = nonce();

        let mut params: Vec<(&str, &str)> = vec![
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce.as_str()),
            ("oauth_signature", signature.as_str()),
            ("oauth_signature_method", "PLAINTEXT"),
            ("oauth_timestamp", timestamp.as_str()),
        ];
        if let Some((t, _)) = token {
            params.push(("oauth_token", t));
        }
        params.extend_from_slice(extra);

        let joined = params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {}", joined)
    }

    /// Split user input into (oauth_token, verifier). A bare code carries no
    /// token and is paired with the pending request later.
    fn parse_callback(input: &str) -> Result<(Option<String>, String)> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransferError::callback(ROLE, "empty verifier"));
        }
        if input.starts_with("http://") || input.starts_with("https://") {
            let parsed = Url::parse(input).map_err(|e| TransferError::callback(ROLE, format!("invalid callback URL: {}", e)))?;
            let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
            if form_value(&pairs, "denied").is_some() {
                return Err(TransferError::callback(ROLE, "authorization was denied by the user"));
            }
            let verifier = form_value(&pairs, "oauth_verifier")
                .ok_or_else(|| TransferError::callback(ROLE, "no oauth_verifier in callback URL"))?;
            return Ok((form_value(&pairs, "oauth_token"), verifier));
        }
        Ok((None, input.to_string()))
    }
}

#[async_trait]
impl Authorizer for DiscogsProvider {
    fn name(&self) -> &str {
        PROVIDER_KEY
    }

    fn role(&self) -> ProviderRole {
        ROLE
    }

    async fn check_status(&self) -> Result<AuthStatus> {
        Ok(match self.fetch_identity().await? {
            Some(username) => AuthStatus::authorized_as(username),
            None => AuthStatus::unauthorized(),
        })
    }

    async fn begin_authorization(&self) -> Result<AuthorizationRequest> {
        let url = format!("{}/oauth/request_token", self.api_base);
        let header = self.oauth_header(None, &[("oauth_callback", self.callback_url.as_str())]);
        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, header)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(transport(ROLE, "request token"))?;
        let body = check_response(ROLE, "request token", resp)
            .await?
            .text()
            .await
            .map_err(transport(ROLE, "request token"))?;
        let pairs = parse_form(&body);
        let token = form_value(&pairs, "oauth_token")
            .ok_or_else(|| TransferError::upstream(ROLE, "request token response has no oauth_token"))?;
        let secret = form_value(&pairs, "oauth_token_secret")
            .ok_or_else(|| TransferError::upstream(ROLE, "request token response has no oauth_token_secret"))?;

        let secret_json = serde_json::to_string(&PendingSecret { token_secret: secret })
            .map_err(TransferError::storage)?;
        self.store
            .save_pending(PROVIDER_KEY, token.clone(), secret_json)
            .await
            .map_err(TransferError::storage)?;

        let mut authorize = Url::parse(&format!("{}/oauth/authorize", self.web_base))
            .map_err(|e| TransferError::upstream(ROLE, format!("bad discogs_web_base: {}", e)))?;
        authorize.query_pairs_mut().append_pair("oauth_token", &token);

        Ok(AuthorizationRequest {
            url: authorize.to_string(),
            request_id: token,
        })
    }

    async fn complete_authorization(&self, callback: &str) -> Result<()> {
        let (request_token, pending_json) = self
            .store
            .load_pending(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?
            .ok_or_else(|| TransferError::callback(ROLE, "no authorization in progress"))?;
        let pending: PendingSecret = serde_json::from_str(&pending_json).map_err(TransferError::storage)?;

        let (callback_token, verifier) = Self::parse_callback(callback)?;
        if let Some(t) = callback_token {
            if t != request_token {
                return Err(TransferError::callback(
                    ROLE,
                    "callback does not belong to the pending authorization",
                ));
            }
        }

        let url = format!("{}/oauth/access_token", self.api_base);
        let header = self.oauth_header(
            Some((&request_token, &pending.token_secret)),
            &[("oauth_verifier", verifier.as_str())],
        );
        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, header)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(transport(ROLE, "access token"))?;
        let resp = match check_response(ROLE, "access token", resp).await {
            Ok(r) => r,
            Err(TransferError::Unauthorized(_)) => {
                return Err(TransferError::callback(ROLE, "verifier was rejected"));
            }
            Err(e) => return Err(e),
        };
        let body = resp.text().await.map_err(transport(ROLE, "access token"))?;
        let pairs = parse_form(&body);
        let stored = StoredToken {
            token: form_value(&pairs, "oauth_token")
                .ok_or_else(|| TransferError::upstream(ROLE, "access token response has no oauth_token"))?,
            token_secret: form_value(&pairs, "oauth_token_secret").ok_or_else(|| {
                TransferError::upstream(ROLE, "access token response has no oauth_token_secret")
            })?,
        };
        let token_json = serde_json::to_string(&stored).map_err(TransferError::storage)?;
        self.store
            .complete_pending(PROVIDER_KEY, token_json)
            .await
            .map_err(TransferError::storage)?;
        *self.username.lock().await = None;

        info!("Discogs token successfully obtained and saved");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.store
            .clear(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?;
        *self.username.lock().await = None;
        info!("Removed Discogs credentials");
        Ok(())
    }
}
