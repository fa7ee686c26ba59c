use discofy::api::spotify::SpotifyProvider;
use discofy::api::{Authorizer, CatalogQuery, DestinationCatalog};
use discofy::auth::AuthorizationManager;
use discofy::config::Config;
use discofy::db;
use discofy::models::{AuthState, Playlist};
use discofy::TransferError;
use mockito::{Matcher, Server};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config_for(base: &str, db_path: &Path, client_secret: &str, max_batch: usize) -> Config {
    Config::from_toml_str(&format!(
        "db_path = '{}'\n\
         spotify_api_base = '{}'\n\
         spotify_auth_base = '{}'\n\
         spotify_client_id = 'cid'\n\
         spotify_client_secret = '{}'\n\
         max_batch_size_spotify = {}\n",
        db_path.display(),
        base,
        base,
        client_secret,
        max_batch
    ))
    .unwrap()
}

fn seed_token(db_path: &Path, access: &str, expires_in: i64) {
    let conn = db::open_or_create(db_path).unwrap();
    let stored = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_at": chrono::Utc::now().timestamp() + expires_in,
        "refresh_token": "rtok",
        "scope": "playlist-modify-public"
    })
    .to_string();
    db::save_credential_raw(&conn, "spotify", &stored).unwrap();
}

fn album_json(id: &str, artist: &str, name: &str) -> serde_json::Value {
    json!({
        "id": id,
        "uri": format!("spotify:album:{}", id),
        "name": name,
        "artists": [{ "name": artist }],
        "images": [{ "url": format!("https://i.scdn.test/{}.jpg", id) }],
        "external_urls": { "spotify": format!("https://open.spotify.com/album/{}", id) }
    })
}

#[test]
fn search_maps_top_album_and_empty_results() {
    let mut server = Server::new();
    let base = server.url();

    let _m_hit = server
        .mock("GET", "/search")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("q".into(), "album:Kind of Blue artist:Miles Davis".into()),
            Matcher::UrlEncoded("type".into(), "album".into()),
            Matcher::UrlEncoded("limit".into(), "1".into()),
        ]))
        .match_header("authorization", "Bearer good_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "albums": { "items": [album_json("1weenld61qoidwYuZ1GESA", "Miles Davis", "Kind Of Blue")] } }).to_string())
        .create();
    let _m_miss = server
        .mock("GET", "/search")
        .match_query(Matcher::UrlEncoded("q".into(), "album:Nonexistent".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "albums": { "items": [] } }).to_string())
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "good_token", 3600);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let hit = provider
            .search_catalog(&CatalogQuery::fielded("Miles Davis", "Kind of Blue"))
            .await
            .unwrap()
            .expect("a hit");
        assert_eq!(hit.destination_id, "1weenld61qoidwYuZ1GESA");
        assert_eq!(hit.artist, "Miles Davis");
        assert_eq!(hit.title, "Kind Of Blue");
        assert_eq!(hit.uri.as_deref(), Some("spotify:album:1weenld61qoidwYuZ1GESA"));
        assert!(hit.image_url.is_some());
        assert!(hit.url.unwrap().starts_with("https://open.spotify.com/album/"));

        let miss = provider
            .search_catalog(&CatalogQuery::title_only("Nonexistent"))
            .await
            .unwrap();
        assert!(miss.is_none());
    });
}

#[test]
fn search_status_mapping() {
    let mut server = Server::new();
    let base = server.url();
    let _m_401 = server
        .mock("GET", "/search")
        .match_query(Matcher::UrlEncoded("q".into(), "album:Revoked".into()))
        .with_status(401)
        .with_body(r#"{"error":{"status":401,"message":"The access token expired"}}"#)
        .create();
    let _m_500 = server
        .mock("GET", "/search")
        .match_query(Matcher::UrlEncoded("q".into(), "album:Broken".into()))
        .with_status(502)
        .with_body("bad gateway")
        .create();
    let _m_429 = server
        .mock("GET", "/search")
        .match_query(Matcher::UrlEncoded("q".into(), "album:Busy".into()))
        .with_status(429)
        .with_header("retry-after", "7")
        .with_body("")
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "good_token", 3600);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let err = provider
            .search_catalog(&CatalogQuery::title_only("Revoked"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Unauthorized(_)));

        let err = provider
            .search_catalog(&CatalogQuery::title_only("Broken"))
            .await
            .unwrap_err();
        assert!(err.is_upstream());
        assert!(err.to_string().contains("502"));

        let err = provider
            .search_catalog(&CatalogQuery::title_only("Busy"))
            .await
            .unwrap_err();
        assert!(err.is_upstream());
        assert!(err.to_string().contains("rate_limited"));
        assert!(err.to_string().contains('7'));
    });
}

#[test]
fn search_without_token_is_unauthorized() {
    let server = Server::new();
    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    let provider = SpotifyProvider::from_config(&config_for(&server.url(), &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let err = provider
            .search_catalog(&CatalogQuery::title_only("Anything"))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert!(!provider.check_status().await.unwrap().authorized);
    });
}

#[test]
fn expired_token_is_refreshed_and_persisted() {
    let mut server = Server::new();
    let base = server.url();
    let _m_token = server
        .mock("POST", "/api/token")
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .match_body(Matcher::Regex("grant_type=refresh_token".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "new_access_token", "token_type": "Bearer", "expires_in": 3600 }).to_string())
        .expect(1)
        .create();
    let _m_me = server
        .mock("GET", "/me")
        .match_header("authorization", "Bearer new_access_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "mock_user" }).to_string())
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "old_token", -60);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let status = provider.check_status().await.unwrap();
        assert_eq!(status.username.as_deref(), Some("mock_user"));
    });
    _m_token.assert();

    let conn = db::open_or_create(&db_path).unwrap();
    let stored = db::load_credential(&conn, "spotify").unwrap().unwrap();
    assert!(stored.contains("new_access_token"));
    // the refresh token survives a response that omits it
    assert!(stored.contains("rtok"));
}

#[test]
fn rejected_refresh_means_unauthorized() {
    let mut server = Server::new();
    let base = server.url();
    let _m_token = server
        .mock("POST", "/api/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#)
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "old_token", -60);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        assert!(!provider.check_status().await.unwrap().authorized);
        let err = provider
            .search_catalog(&CatalogQuery::title_only("Anything"))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    });
}

#[test]
fn playlist_created_and_album_tracks_added_in_batches() {
    let mut server = Server::new();
    let base = server.url();

    let _m_me = server
        .mock("GET", "/me")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "mock_user" }).to_string())
        .create();
    let _m_create = server
        .mock("POST", "/users/mock_user/playlists")
        .match_body(Matcher::PartialJson(json!({ "name": "Discogs - Jazz", "public": true })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "P1", "external_urls": { "spotify": "https://open.spotify.com/playlist/P1" } }).to_string())
        .expect(1)
        .create();
    let _m_a1_page1 = server
        .mock("GET", "/albums/A1/tracks")
        .match_query(Matcher::Exact("limit=50".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "items": [{ "uri": "spotify:track:a1t1" }, { "uri": "spotify:track:a1t2" }],
                "next": format!("{}/albums/A1/tracks?offset=2&limit=50", base)
            })
            .to_string(),
        )
        .create();
    let _m_a1_page2 = server
        .mock("GET", "/albums/A1/tracks")
        .match_query(Matcher::Exact("offset=2&limit=50".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "items": [{ "uri": "spotify:track:a1t3" }], "next": null }).to_string())
        .expect(1)
        .create();
    let _m_a2 = server
        .mock("GET", "/albums/A2/tracks")
        .match_query(Matcher::Exact("limit=50".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "items": [{ "uri": "spotify:track:a2t1" }, { "uri": "spotify:track:a2t2" }], "next": null }).to_string())
        .create();
    let _m_add_first = server
        .mock("POST", "/playlists/P1/tracks")
        .match_body(Matcher::Json(json!({ "uris": ["spotify:track:a1t1", "spotify:track:a1t2"] })))
        .with_status(201)
        .with_body(json!({ "snapshot_id": "s1" }).to_string())
        .expect(1)
        .create();
    let _m_add_rest = server
        .mock("POST", "/playlists/P1/tracks")
        .match_body(Matcher::Regex("a1t3".into()))
        .with_status(201)
        .with_body(json!({ "snapshot_id": "s2" }).to_string())
        .expect(1)
        .create();
    let _m_add_last = server
        .mock("POST", "/playlists/P1/tracks")
        .match_body(Matcher::Json(json!({ "uris": ["spotify:track:a2t2"] })))
        .with_status(201)
        .with_body(json!({ "snapshot_id": "s3" }).to_string())
        .expect(1)
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "good_token", 3600);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 2));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let playlist = rt.block_on(async {
        let playlist = provider
            .create_playlist("Discogs - Jazz", "Created by discofy")
            .await
            .unwrap();
        assert_eq!(playlist.id, "P1");
        assert_eq!(playlist.destination_url, "https://open.spotify.com/playlist/P1");

        let added = provider
            .add_items(&playlist, &["A1".to_string(), "A2".to_string()])
            .await
            .unwrap();
        assert_eq!(added, 5);
        playlist
    });
    assert_eq!(playlist.name, "Discogs - Jazz");
    _m_create.assert();
    _m_a1_page2.assert();
    _m_add_first.assert();
    _m_add_rest.assert();
    _m_add_last.assert();
}

#[test]
fn add_items_failure_is_reported() {
    let mut server = Server::new();
    let base = server.url();
    let _m_tracks = server
        .mock("GET", "/albums/A1/tracks")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "items": [{ "uri": "spotify:track:x" }], "next": null }).to_string())
        .create();
    let _m_add = server
        .mock("POST", "/playlists/P9/tracks")
        .with_status(403)
        .with_body(r#"{"error":{"status":403,"message":"Forbidden"}}"#)
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    seed_token(&db_path, "good_token", 3600);
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));
    let playlist = Playlist {
        id: "P9".into(),
        name: "Broken".into(),
        destination_url: "https://open.spotify.com/playlist/P9".into(),
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let err = provider.add_items(&playlist, &["A1".to_string()]).await.unwrap_err();
        assert!(err.is_upstream());
        assert!(err.to_string().contains("403"));
        // nothing to add means no request at all
        assert_eq!(provider.add_items(&playlist, &[]).await.unwrap(), 0);
    });
}

#[test]
fn code_flow_with_client_secret() {
    let mut server = Server::new();
    let base = server.url();
    let _m_token = server
        .mock("POST", "/api/token")
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("grant_type=authorization_code".into()),
            Matcher::Regex("code=abc".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "access_token": "fresh_token",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "rtok2",
                "scope": "playlist-modify-public"
            })
            .to_string(),
        )
        .expect(1)
        .create();
    let _m_me = server
        .mock("GET", "/me")
        .match_header("authorization", "Bearer fresh_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "mock_user" }).to_string())
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "shh", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let req = provider.begin_authorization().await.unwrap();
        let url = url::Url::parse(&req.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let get = |k: &str| pairs.iter().find(|(pk, _)| pk == k).map(|(_, v)| v.clone());
        assert_eq!(url.path(), "/authorize");
        assert_eq!(get("state").as_deref(), Some(req.request_id.as_str()));
        assert_eq!(get("client_id").as_deref(), Some("cid"));
        assert_eq!(get("response_type").as_deref(), Some("code"));
        assert!(get("code_challenge").is_none());

        let err = provider
            .complete_authorization("http://127.0.0.1:8888/callback?code=abc&state=forged")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::CallbackRejected { .. }));

        let err = provider
            .complete_authorization(&format!(
                "http://127.0.0.1:8888/callback?error=access_denied&state={}",
                req.request_id
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::CallbackRejected { .. }));

        provider
            .complete_authorization(&format!(
                "http://127.0.0.1:8888/callback?code=abc&state={}",
                req.request_id
            ))
            .await
            .unwrap();
        let status = provider.check_status().await.unwrap();
        assert_eq!(status.username.as_deref(), Some("mock_user"));

        provider.logout().await.unwrap();
        assert!(!provider.check_status().await.unwrap().authorized);
    });
    _m_token.assert();
}

#[test]
fn pkce_flow_without_client_secret() {
    std::env::remove_var("SPOTIFY_CLIENT_SECRET");
    let mut server = Server::new();
    let base = server.url();
    let _m_token = server
        .mock("POST", "/api/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("code_verifier=[A-Za-z0-9]{64}".into()),
            Matcher::Regex("client_id=cid".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "pkce_token", "token_type": "Bearer", "expires_in": 3600 }).to_string())
        .expect(1)
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    let provider = SpotifyProvider::from_config(&config_for(&base, &db_path, "", 100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let req = provider.begin_authorization().await.unwrap();
        assert!(req.url.contains("code_challenge_method=S256"));
        assert!(req.url.contains("code_challenge="));
        provider
            .complete_authorization(&format!("http://127.0.0.1:8888/callback?code=xyz&state={}", req.request_id))
            .await
            .unwrap();
    });
    _m_token.assert();

    let conn = db::open_or_create(&db_path).unwrap();
    assert!(db::load_credential(&conn, "spotify").unwrap().unwrap().contains("pkce_token"));
    assert!(db::load_pending_authorization(&conn, "spotify").unwrap().is_none());
}

#[test]
fn completion_from_another_instance_reaches_the_poll_loop() {
    let mut server = Server::new();
    let base = server.url();
    let _m_token = server
        .mock("POST", "/api/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "shared_token", "token_type": "Bearer", "expires_in": 3600 }).to_string())
        .create();
    let _m_me = server
        .mock("GET", "/me")
        .match_header("authorization", "Bearer shared_token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "id": "mock_user" }).to_string())
        .create();

    let td = tempdir().unwrap();
    let db_path = td.path().join("tokens.db");
    let cfg = config_for(&base, &db_path, "shh", 100);
    // two providers over one token store, like two CLI processes
    let waiting = Arc::new(SpotifyProvider::from_config(&cfg));
    let completing = SpotifyProvider::from_config(&cfg);

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let mgr = Arc::new(AuthorizationManager::new(waiting));
        let req = mgr.begin_authorization().await.unwrap();
        let poll = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.poll_until_authorized(Duration::from_millis(20), None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.state(), AuthState::PendingAuthorization);

        completing
            .complete_authorization(&format!("http://127.0.0.1:8888/callback?code=c1&state={}", req.request_id))
            .await
            .unwrap();
        let status = poll.await.unwrap().unwrap();
        assert_eq!(status.username.as_deref(), Some("mock_user"));
        assert_eq!(mgr.state(), AuthState::Authorized);
    });
}
