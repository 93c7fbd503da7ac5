//! End-to-end runs against a mocked Gmail API and token endpoint

use go_away::cli::{self, Cli, Commands};
use go_away::config::{Config, GmailConfig, InboxSpec, ScanConfig};
use go_away::credentials::{CredentialStore, SqliteCredentialStore};
use go_away::models::{Credential, ProviderKind};
use go_away::store::Store;
use go_away::GoAwayError;
use indicatif::{MultiProgress, ProgressDrawTarget};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ADDRESS: &str = "me@gmail.com";

fn cli(dir: &TempDir) -> Cli {
    Cli {
        config: dir.path().join("go-away.toml"),
        database: Some(dir.path().join("go-away.sqlite3")),
        verbose: false,
        command: Commands::Run {
            dry_run: false,
            report: None,
        },
    }
}

fn config(server: &MockServer) -> Config {
    Config {
        gmail: GmailConfig {
            client_id: Some("client-id".to_string()),
            client_secret: Some("client-secret".to_string()),
            token_uri: format!("{}/token", server.uri()),
            api_base: server.uri(),
            ..GmailConfig::default()
        },
        scan: ScanConfig {
            safe_senders: vec!["@mybank.example".to_string()],
        },
        inboxes: vec![InboxSpec::Gmail {
            address: ADDRESS.to_string(),
        }],
        ..Config::default()
    }
}

/// Store a credential so no interactive authorization is needed
fn authorize(database: &Path, access_token: &str) {
    let store = Arc::new(Store::open(database).unwrap());
    let inbox = store.upsert_inbox(ADDRESS, ProviderKind::Gmail).unwrap();
    SqliteCredentialStore::new(store, inbox.id)
        .save(&Credential {
            access_token: access_token.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: None,
        })
        .unwrap();
}

fn hidden_progress() -> MultiProgress {
    MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
}

fn metadata(id: &str, headers: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": id,
        "threadId": id,
        "payload": { "headers": headers }
    }))
}

async fn mount_inbox(server: &MockServer, token: &str) {
    let bearer = format!("Bearer {}", token);
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .and(header("authorization", bearer.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{ "id": "m1" }, { "id": "m2" }, { "id": "m3" }, { "id": "m4" }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m1"))
        .respond_with(metadata(
            "m1",
            serde_json::json!([
                { "name": "From", "value": "Weekly <news@weekly.example>" },
                { "name": "List-Id", "value": "Weekly <weekly.example>" },
                { "name": "List-Unsubscribe", "value": "<https://weekly.example/u>, <mailto:leave@weekly.example?subject=unsubscribe>" }
            ]),
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m2"))
        .respond_with(metadata(
            "m2",
            serde_json::json!([
                { "name": "From", "value": "Statements <no-reply@mybank.example>" },
                { "name": "List-Unsubscribe", "value": "<mailto:stop@mybank.example>" }
            ]),
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m3"))
        .respond_with(metadata(
            "m3",
            serde_json::json!([
                { "name": "From", "value": "Weekly <news@weekly.example>" },
                { "name": "List-Id", "value": "<weekly.example>" },
                { "name": "List-Unsubscribe", "value": "<mailto:leave@weekly.example>" }
            ]),
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages/m4"))
        .respond_with(metadata(
            "m4",
            serde_json::json!([{ "name": "From", "value": "friend@example.com" }]),
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_repeated_runs_unsubscribe_once() {
    let server = MockServer::start().await;
    mount_inbox(&server, "access").await;
    Mock::given(method("POST"))
        .and(path("/gmail/v1/users/me/messages/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "sent" })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cli = cli(&dir);
    let config = config(&server);
    authorize(cli.database.as_deref().unwrap(), "access");

    let report_path = dir.path().join("reports").join("run.md");
    let first = cli::run_pipeline(
        &cli,
        &config,
        false,
        Some(report_path.as_path()),
        hidden_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let inbox = &first.inboxes[0];
    assert_eq!(inbox.address, ADDRESS);
    assert_eq!(inbox.scanned, 3);
    assert_eq!(inbox.safe_senders, 1);
    assert_eq!(inbox.unsubscribed, 1);
    assert_eq!(inbox.already_unsubscribed, 1);
    assert_eq!(inbox.no_directive, 1);
    assert_eq!(inbox.actions[0].mailto, "leave@weekly.example");
    assert_eq!(inbox.actions[0].list_id, "weekly.example");

    let markdown = std::fs::read_to_string(&report_path).unwrap();
    assert!(markdown.contains("leave@weekly.example"));

    let second = cli::run_pipeline(
        &cli,
        &config,
        false,
        None,
        hidden_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let inbox = &second.inboxes[0];
    assert_eq!(inbox.scanned, 3);
    assert_eq!(inbox.already_seen, 3);
    assert_eq!(inbox.unsubscribed, 0);
    assert_eq!(second.actions_executed(), 0);

    let statuses = cli::status(&cli, &config).unwrap();
    assert!(statuses[0].authorized);
    assert_eq!(statuses[0].seen, 3);
    assert_eq!(statuses[0].unsubscribed, 1);
}

#[tokio::test]
async fn test_dry_run_sends_and_records_nothing() {
    let server = MockServer::start().await;
    mount_inbox(&server, "access").await;
    Mock::given(method("POST"))
        .and(path("/gmail/v1/users/me/messages/send"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cli = cli(&dir);
    let config = config(&server);
    authorize(cli.database.as_deref().unwrap(), "access");

    let report = cli::run_pipeline(
        &cli,
        &config,
        true,
        None,
        hidden_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.dry_run);
    // m3 shares m1's list, but nothing was recorded for m1 either
    assert_eq!(report.actions_planned(), 2);
    assert_eq!(report.actions_executed(), 0);

    let statuses = cli::status(&cli, &config).unwrap();
    assert_eq!(statuses[0].seen, 0);
    assert_eq!(statuses[0].unsubscribed, 0);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "fresh", "expires_in": 3600 })),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_inbox(&server, "fresh").await;
    Mock::given(method("POST"))
        .and(path("/gmail/v1/users/me/messages/send"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cli = cli(&dir);
    let config = config(&server);
    let database = cli.database.clone().unwrap();
    authorize(&database, "stale");

    let report = cli::run_pipeline(
        &cli,
        &config,
        false,
        None,
        hidden_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.actions_executed(), 1);

    let store = Arc::new(Store::open(&database).unwrap());
    let inbox = store.upsert_inbox(ADDRESS, ProviderKind::Gmail).unwrap();
    let stored = SqliteCredentialStore::new(store, inbox.id)
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
}

#[tokio::test]
async fn test_revoked_refresh_token_stops_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({ "error": "invalid_grant" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let cli = cli(&dir);
    let config = config(&server);
    authorize(cli.database.as_deref().unwrap(), "stale");

    let err = cli::run_pipeline(
        &cli,
        &config,
        false,
        None,
        hidden_progress(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, GoAwayError::Auth(_)));
    assert!(err.is_fatal());
}
