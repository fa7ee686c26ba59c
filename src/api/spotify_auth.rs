use super::pkce;
use super::spotify::{SpotifyProvider, StoredToken, PROVIDER_KEY};
use super::{check_response, transport, Authorizer};
use crate::error::{Result, TransferError};
use crate::models::{AuthStatus, AuthorizationRequest, ProviderRole};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use log::info;
use url::Url;

const ROLE: ProviderRole = ProviderRole::Destination;

/// Authorization code flow:
/// 1. Build the Spotify authorization URL with a random `state` (plus a PKCE
///    challenge when no client secret is configured) and hand it out.
/// 2. User opens it in a browser, approves and gets redirected to the redirect URI.
/// 3. The redirect URL reaches `complete_authorization` (pasted, or from a
///    callback listener), which checks `state` and exchanges `code` for tokens.
/// 4. Tokens land in the token store, where `check_status` picks them up.
#[derive(Serialize, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct PendingSecret {
    code_verifier: Option<String>,
}

#[async_trait]
impl Authorizer for SpotifyProvider {
    fn name(&self) -> &str {
        PROVIDER_KEY
    }

    fn role(&self) -> ProviderRole {
        ROLE
    }

    async fn check_status(&self) -> Result<AuthStatus> {
        Ok(match self.fetch_me().await? {
            Some(user_id) => AuthStatus::authorized_as(user_id),
            None => AuthStatus::unauthorized(),
        })
    }

    async fn begin_authorization(&self) -> Result<AuthorizationRequest> {
        let state = uuid::Uuid::new_v4().to_string();
        let mut url = Url::parse(&format!("{}/authorize", self.auth_base))
            .map_err(|e| TransferError::upstream(ROLE, format!("bad spotify_auth_base: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &self.scope)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", &state)
            .append_pair("show_dialog", "true");

        let mut pending = PendingSecret::default();
        if self.uses_pkce() {
            let verifier = pkce::generate_code_verifier();
            url.query_pairs_mut()
                .append_pair("code_challenge_method", "S256")
                .append_pair("code_challenge", &pkce::code_challenge_s256(&verifier));
            pending.code_verifier = Some(verifier);
        }

        let secret_json = serde_json::to_string(&pending).map_err(TransferError::storage)?;
        self.store
            .save_pending(PROVIDER_KEY, state.clone(), secret_json)
            .await
            .map_err(TransferError::storage)?;

        info!("Built Spotify authorisation url for state {}", state);
        Ok(AuthorizationRequest {
            url: url.to_string(),
            request_id: state,
        })
    }

    async fn complete_authorization(&self, callback: &str) -> Result<()> {
        let (expected_state, pending_json) = self
            .store
            .load_pending(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?
            .ok_or_else(|| TransferError::callback(ROLE, "no authorization in progress"))?;
        let pending: PendingSecret = serde_json::from_str(&pending_json).map_err(TransferError::storage)?;

        let parsed = Url::parse(callback.trim())
            .map_err(|e| TransferError::callback(ROLE, format!("invalid url pasted: {}", e)))?;
        let param = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        if let Some(err) = param("error") {
            return Err(TransferError::callback(ROLE, format!("spotify returned error '{}'", err)));
        }
        if param("state").as_deref() != Some(expected_state.as_str()) {
            return Err(TransferError::callback(
                ROLE,
                "state does not match the pending authorization",
            ));
        }
        let code = param("code").ok_or_else(|| TransferError::callback(ROLE, "no code in redirect URL"))?;

        // Exchange code for tokens
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.clone()),
        ];
        let mut req = self.client.post(format!("{}/api/token", self.auth_base));
        match pending.code_verifier {
            Some(verifier) => {
                params.push(("client_id", self.client_id.clone()));
                params.push(("code_verifier", verifier));
            }
            None => {
                req = req.header(AUTHORIZATION, self.basic_auth_header());
            }
        }
        let resp = req
            .form(&params)
            .send()
            .await
            .map_err(transport(ROLE, "token exchange"))?;
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            let txt = resp.text().await.unwrap_or_default();
            return Err(TransferError::callback(ROLE, format!("token exchange failed: {}", txt)));
        }
        let resp = check_response(ROLE, "token exchange", resp).await?;
        let tr: TokenResponse = resp.json().await.map_err(transport(ROLE, "token exchange"))?;

        // Compute expires_at as now + expires_in
        let stored = StoredToken {
            access_token: tr.access_token,
            token_type: tr.token_type,
            expires_at: chrono::Utc::now().timestamp() + tr.expires_in,
            refresh_token: tr.refresh_token,
            scope: tr.scope,
        };
        let token_json = serde_json::to_string(&stored).map_err(TransferError::storage)?;
        self.store
            .complete_pending(PROVIDER_KEY, token_json)
            .await
            .map_err(TransferError::storage)?;
        self.forget_cached().await;

        info!("Spotify token successfully obtained. Expires at: {}", stored.expires_at);
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.store
            .clear(PROVIDER_KEY)
            .await
            .map_err(TransferError::storage)?;
        self.forget_cached().await;
        info!("Removed Spotify credentials");
        Ok(())
    }
}
