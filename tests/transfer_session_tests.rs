use discofy::api::Authorizer;
use discofy::api::mock::{MockAuthorizer, MockDestinationCatalog, MockSourceCatalog};
use discofy::config::Config;
use discofy::models::{AuthState, CollectionItem, ProviderRole, TransferState};
use discofy::{TransferError, TransferSession};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    session: Arc<TransferSession>,
    source_auth: Arc<MockAuthorizer>,
    destination_auth: Arc<MockAuthorizer>,
    source: Arc<MockSourceCatalog>,
    destination: Arc<MockDestinationCatalog>,
}

fn jazz_items() -> Vec<CollectionItem> {
    vec![
        CollectionItem::new("101", "Miles Davis", "Kind of Blue"),
        CollectionItem::new("102", "Bogus Artist", "Nonexistent Album 9999"),
    ]
}

fn harness_with(source: MockSourceCatalog, destination: MockDestinationCatalog, toml: &str) -> Harness {
    let cfg = Config::from_toml_str(toml).unwrap();
    let source_auth = Arc::new(MockAuthorizer::authorized(ProviderRole::Source));
    let destination_auth = Arc::new(MockAuthorizer::authorized(ProviderRole::Destination));
    let source = Arc::new(source);
    let destination = Arc::new(destination);
    let session = Arc::new(TransferSession::with_providers(
        cfg,
        source_auth.clone(),
        source.clone(),
        destination_auth.clone(),
        destination.clone(),
    ));
    Harness {
        session,
        source_auth,
        destination_auth,
        source,
        destination,
    }
}

fn jazz_harness() -> Harness {
    harness_with(
        MockSourceCatalog::new()
            .with_folder("All", vec![])
            .with_folder("Jazz", jazz_items()),
        MockDestinationCatalog::new().with_album("Miles Davis", "Kind of Blue"),
        "",
    )
}

async fn matched_jazz() -> Harness {
    let h = jazz_harness();
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(1).await.unwrap();
    h.session.match_collection().await.unwrap();
    h
}

fn entry_lines(report: &[u8]) -> Vec<String> {
    String::from_utf8(report.to_vec())
        .unwrap()
        .lines()
        .filter(|l| !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn jazz_folder_end_to_end() {
    let h = jazz_harness();
    let status = h.session.discover().await.unwrap();
    assert!(status.source.authorized && status.destination.authorized);
    assert_eq!(h.session.transfer_state().await, TransferState::Idle);

    let folders = h.session.list_folders().await.unwrap();
    assert_eq!(folders.len(), 2);
    assert_eq!(folders[1].name, "Jazz");

    let items = h.session.load_folder(1).await.unwrap();
    assert_eq!(items, jazz_items());
    assert_eq!(h.session.transfer_state().await, TransferState::CollectionLoaded);

    let results = h.session.match_collection().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_matched());
    assert!(!results[1].is_matched());
    assert_eq!(h.session.transfer_state().await, TransferState::Matched);

    let summary = h.session.create_playlist(None).await.unwrap();
    assert_eq!(summary.playlist.name, "Discogs - Jazz");
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.tracks_added, 10);
    assert_eq!(h.session.transfer_state().await, TransferState::PlaylistCreated);
    assert_eq!(h.destination.added(), vec![(summary.playlist.id.clone(), vec!["album-1".to_string()])]);

    let lines = entry_lines(&h.session.export_report().await.unwrap());
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("MATCHED\tMiles Davis - Kind of Blue\t101"));
    assert_eq!(lines[1], "NOT_FOUND\tBogus Artist - Nonexistent Album 9999\t102");
}

#[tokio::test]
async fn create_playlist_with_destination_unauthorized() {
    let h = matched_jazz().await;
    h.destination_auth.revoke();
    h.session.discover().await.unwrap();
    assert_eq!(h.session.auth(ProviderRole::Destination).state(), AuthState::Unauthenticated);

    let err = h.session.create_playlist(Some("My Mix")).await.unwrap_err();
    assert!(matches!(err, TransferError::Unauthorized(ProviderRole::Destination)));
    assert!(h.destination.playlists().is_empty());
    assert_eq!(h.session.transfer_state().await, TransferState::Matched);
}

#[tokio::test]
async fn unknown_folder_index_is_invalid() {
    let h = jazz_harness();
    h.session.discover().await.unwrap();

    // nothing listed yet
    let err = h.session.load_folder(0).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidFolder(0)));

    h.session.list_folders().await.unwrap();
    let err = h.session.load_folder(7).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidFolder(7)));
    assert_eq!(h.session.transfer_state().await, TransferState::Idle);
}

#[tokio::test]
async fn export_before_any_report_is_not_found() {
    let h = matched_jazz().await;
    let err = h.session.export_report().await.unwrap_err();
    assert!(matches!(err, TransferError::ReportNotFound));
}

#[tokio::test]
async fn report_has_one_entry_per_item_in_order() {
    let items: Vec<CollectionItem> = (0..9)
        .map(|i| CollectionItem::new(format!("{}", 500 + i), format!("Band {}", i), format!("Record {}", "I".repeat(i + 1))))
        .collect();
    let mut dest = MockDestinationCatalog::new().with_search_delay(Duration::from_millis(30));
    for it in items.iter().step_by(2) {
        dest = dest.with_album(&it.artist, &it.title);
    }
    let h = harness_with(
        MockSourceCatalog::new().with_folder("Mixed", items.clone()),
        dest,
        "match_concurrency = 3",
    );
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(0).await.unwrap();
    h.session.match_collection().await.unwrap();
    h.session.create_playlist(Some("Mixed bag")).await.unwrap();

    let lines = entry_lines(&h.session.export_report().await.unwrap());
    assert_eq!(lines.len(), items.len());
    for (i, (line, item)) in lines.iter().zip(items.iter()).enumerate() {
        let expected = if i % 2 == 0 { "MATCHED\t" } else { "NOT_FOUND\t" };
        assert!(line.starts_with(expected), "line {}: {}", i, line);
        assert!(line.contains(&format!("\t{}", item.source_id)));
    }
}

#[tokio::test]
async fn json_report_format() {
    let h = harness_with(
        MockSourceCatalog::new().with_folder("Jazz", jazz_items()),
        MockDestinationCatalog::new().with_album("Miles Davis", "Kind of Blue"),
        "report_format = \"json\"",
    );
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(0).await.unwrap();
    h.session.match_collection().await.unwrap();
    h.session.create_playlist(None).await.unwrap();

    let v: serde_json::Value = serde_json::from_slice(&h.session.export_report().await.unwrap()).unwrap();
    assert_eq!(v["total"], 2);
    assert_eq!(v["matched"], 1);
    assert_eq!(v["entries"][0]["outcome"], "matched");
    assert_eq!(v["entries"][1]["source_id"], "102");
}

#[tokio::test]
async fn blank_playlist_name_is_rejected() {
    let h = matched_jazz().await;
    let err = h.session.create_playlist(Some("   ")).await.unwrap_err();
    assert!(matches!(err, TransferError::EmptyName));
    assert!(h.destination.playlists().is_empty());
}

#[tokio::test]
async fn create_playlist_requires_matched_run() {
    let h = jazz_harness();
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(1).await.unwrap();
    let err = h.session.create_playlist(Some("Too early")).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::InvalidState {
            expected: TransferState::Matched,
            actual: TransferState::CollectionLoaded
        }
    ));
}

#[tokio::test]
async fn retry_creates_a_second_playlist() {
    let h = matched_jazz().await;
    let first = h.session.create_playlist(Some("Take 1")).await.unwrap();
    let second = h.session.create_playlist(Some("Take 2")).await.unwrap();
    assert_ne!(first.playlist.id, second.playlist.id);
    assert_eq!(h.destination.playlists().len(), 2);
}

#[tokio::test]
async fn failed_add_items_keeps_the_created_playlist() {
    let h = matched_jazz().await;
    h.destination.set_add_items_failing(true);
    let err = h.session.create_playlist(Some("Take 1")).await.unwrap_err();
    assert!(err.is_upstream());

    // the playlist exists upstream, so the run knows about it
    let recorded = h.session.reconciler().playlists().await;
    assert_eq!(recorded, h.destination.playlists());
    assert_eq!(recorded.len(), 1);
    assert_eq!(h.session.transfer_state().await, TransferState::PlaylistCreated);
    assert_eq!(entry_lines(&h.session.export_report().await.unwrap()).len(), 2);

    // retrying fills the same playlist
    h.destination.set_add_items_failing(false);
    let summary = h.session.create_playlist(Some("Take 2")).await.unwrap();
    assert_eq!(summary.playlist.id, recorded[0].id);
    assert_eq!(summary.tracks_added, 10);
    assert_eq!(h.destination.playlists().len(), 1);
    assert_eq!(h.destination.added(), vec![(recorded[0].id.clone(), vec!["album-1".to_string()])]);
    assert_eq!(h.session.reconciler().playlists().await.len(), 1);

    // once filled, an explicit retry creates a new one again
    h.session.create_playlist(Some("Take 3")).await.unwrap();
    assert_eq!(h.destination.playlists().len(), 2);
}

#[tokio::test]
async fn loading_a_folder_forgets_an_unfilled_playlist() {
    let h = matched_jazz().await;
    h.destination.set_add_items_failing(true);
    h.session.create_playlist(Some("Take 1")).await.unwrap_err();
    h.destination.set_add_items_failing(false);

    h.session.load_folder(1).await.unwrap();
    h.session.match_collection().await.unwrap();
    let summary = h.session.create_playlist(Some("Fresh")).await.unwrap();
    assert_eq!(summary.playlist.name, "Fresh");
    assert_eq!(h.destination.playlists().len(), 2);
}

#[tokio::test]
async fn nothing_matched_still_creates_playlist() {
    let h = harness_with(
        MockSourceCatalog::new().with_folder("Obscure", jazz_items()),
        MockDestinationCatalog::new(),
        "",
    );
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(0).await.unwrap();
    h.session.match_collection().await.unwrap();
    let summary = h.session.create_playlist(None).await.unwrap();
    assert_eq!(summary.tracks_added, 0);
    assert_eq!(summary.not_found, 2);
    assert!(h.destination.added().is_empty());
    let lines = entry_lines(&h.session.export_report().await.unwrap());
    assert!(lines.iter().all(|l| l.starts_with("NOT_FOUND")));
}

#[tokio::test]
async fn failed_match_keeps_collection_loaded() {
    let h = jazz_harness();
    h.destination.fail_on_title("Nonexistent Album 9999");
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(1).await.unwrap();
    let err = h.session.match_collection().await.unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(h.session.transfer_state().await, TransferState::CollectionLoaded);
    assert!(h.session.reconciler().results().await.is_empty());
}

#[tokio::test]
async fn loading_another_folder_discards_matches() {
    let h = matched_jazz().await;
    h.session.load_folder(0).await.unwrap();
    assert_eq!(h.session.transfer_state().await, TransferState::CollectionLoaded);
    assert!(h.session.reconciler().results().await.is_empty());
}

#[tokio::test]
async fn source_errors_are_distinguished() {
    let h = jazz_harness();
    // not discovered yet: gate rejects before any upstream call
    let err = h.session.list_folders().await.unwrap_err();
    assert!(matches!(err, TransferError::Unauthorized(ProviderRole::Source)));

    h.session.discover().await.unwrap();
    h.source.set_failing(true);
    assert!(h.session.list_folders().await.unwrap_err().is_upstream());
    assert_eq!(h.session.auth(ProviderRole::Source).state(), AuthState::Authorized);

    h.source.set_failing(false);
    h.source.set_unauthorized(true);
    assert!(h.session.list_folders().await.unwrap_err().is_unauthorized());
    assert_eq!(h.session.auth(ProviderRole::Source).state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn logout_mid_match_discards_results() {
    let h = harness_with(
        MockSourceCatalog::new().with_folder("Jazz", jazz_items()),
        MockDestinationCatalog::new()
            .with_album("Miles Davis", "Kind of Blue")
            .with_search_delay(Duration::from_millis(80)),
        "",
    );
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(0).await.unwrap();

    let matching = {
        let session = h.session.clone();
        tokio::spawn(async move { session.match_collection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.session.logout(ProviderRole::Source).await.unwrap();

    let err = matching.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::InvalidState { .. }));
    assert_eq!(h.session.transfer_state().await, TransferState::Idle);
    assert!(h.session.reconciler().results().await.is_empty());
    assert!(!h.source_auth.check_status().await.unwrap().authorized);
    assert_eq!(h.session.auth(ProviderRole::Source).state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn destination_logout_mid_match_reports_unauthorized() {
    let h = harness_with(
        MockSourceCatalog::new().with_folder("Jazz", jazz_items()),
        MockDestinationCatalog::new().with_search_delay(Duration::from_millis(80)),
        "",
    );
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(0).await.unwrap();

    let matching = {
        let session = h.session.clone();
        tokio::spawn(async move { session.match_collection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.session.logout(ProviderRole::Destination).await.unwrap();

    let err = matching.await.unwrap().unwrap_err();
    assert!(matches!(err, TransferError::Unauthorized(ProviderRole::Destination)));
    assert_eq!(h.session.transfer_state().await, TransferState::Idle);
}

#[tokio::test]
async fn logout_with_no_session() {
    let h = jazz_harness();
    let err = h.session.logout(ProviderRole::Destination).await.unwrap_err();
    assert!(matches!(err, TransferError::NotSupported(ProviderRole::Destination)));
}

#[tokio::test]
async fn rejected_logout_keeps_the_run() {
    let h = jazz_harness();
    // destination never authorized, so it has no session to log out of
    h.destination_auth.revoke();
    h.session.discover().await.unwrap();
    h.session.list_folders().await.unwrap();
    h.session.load_folder(1).await.unwrap();

    let err = h.session.logout(ProviderRole::Destination).await.unwrap_err();
    assert!(matches!(err, TransferError::NotSupported(ProviderRole::Destination)));
    assert_eq!(h.session.transfer_state().await, TransferState::CollectionLoaded);
    assert_eq!(h.session.reconciler().folder().await.unwrap().name, "Jazz");
}
