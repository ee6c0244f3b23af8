use super::*;
use crate::credentials::EncryptedFileStore;
use crate::resolver::{CredentialSources, PartialCredentials};
use crate::session::fake::FakeConnector;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    connector: Arc<FakeConnector>,
    tools: AuthTools,
}

fn harness_with(connector: FakeConnector, sources: CredentialSources) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CredentialStore> = Arc::new(
        EncryptedFileStore::open(dir.path().join("credentials.enc"), dir.path().join(".key"))
            .unwrap(),
    );
    let connector = Arc::new(connector);
    let sessions = Arc::new(SessionManager::new(connector.clone(), Duration::from_secs(5)));
    let resolver = CredentialResolver::new(sources, store.clone());

    Harness {
        tools: AuthTools::new(store, resolver, sessions),
        connector,
        dir,
    }
}

fn harness() -> Harness {
    harness_with(
        FakeConnector::new()
            .with_account("acme-x", "alice", "p1")
            .with_account("acme-x", "carol", "p3"),
        CredentialSources::default(),
    )
}

fn authenticate(account: &str, user: &str, password: &str) -> AuthenticateArgs {
    AuthenticateArgs {
        account: account.to_string(),
        user: user.to_string(),
        password: SecretString::from(password.to_string()),
        options: ConnectionOptions::default(),
        save_credentials: true,
    }
}

fn identity_args(account: &str, user: &str) -> IdentityArgs {
    IdentityArgs {
        account: account.to_string(),
        user: user.to_string(),
    }
}

#[tokio::test]
async fn authenticate_then_list() {
    let h = harness();

    let outcome = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    assert!(outcome.saved);
    assert!(outcome.status.connected);
    assert_eq!(outcome.status.provenance, Some(Provenance::Interactive));

    let listed = h.tools.list_saved_credentials().await.unwrap();
    assert_eq!(listed.count, 1);
    assert_eq!(listed.credentials, vec![Identity::new("acme-x", "alice")]);
}

#[tokio::test]
async fn authenticate_without_saving() {
    let h = harness();
    let mut args = authenticate("acme-x", "alice", "p1");
    args.save_credentials = false;

    let outcome = h.tools.authenticate_snowflake(args).await.unwrap();
    assert!(!outcome.saved);
    assert_eq!(h.tools.list_saved_credentials().await.unwrap().count, 0);
}

#[tokio::test]
async fn failed_authentication_saves_nothing() {
    let h = harness();

    let err = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "not-the-password"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "authentication_failed");
    assert!(!err.is_retryable());
    assert!(!err.to_string().contains("not-the-password"));
    assert_eq!(h.tools.list_saved_credentials().await.unwrap().count, 0);
}

#[tokio::test]
async fn authenticate_with_blank_field_is_configuration_invalid() {
    let h = harness();

    let err = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "  ", "p1"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "configuration_invalid");
    assert_eq!(h.connector.logins.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn use_saved_credentials_unknown_identity_lists_available() {
    let h = harness();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();

    let err = h
        .tools
        .use_saved_credentials(identity_args("acme-x", "bob"))
        .await
        .unwrap_err();

    match err {
        ToolError::CredentialsNotFound {
            requested,
            available,
        } => {
            assert_eq!(requested, Identity::new("acme-x", "bob"));
            assert_eq!(available, vec![Identity::new("acme-x", "alice")]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn use_saved_credentials_switches_session() {
    let h = harness();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "carol", "p3"))
        .await
        .unwrap();

    // Account matching ignores case
    let status = h
        .tools
        .use_saved_credentials(identity_args("ACME-X", "alice"))
        .await
        .unwrap();

    assert_eq!(status.identity, Some(Identity::new("acme-x", "alice")));
    assert_eq!(status.provenance, Some(Provenance::Store));
    // alice's first session and carol's session were both replaced
    assert_eq!(h.connector.logged_out().len(), 2);
}

#[tokio::test]
async fn corrupt_store_lists_empty() {
    let h = harness();
    std::fs::write(h.dir.path().join("credentials.enc"), b"definitely not ciphertext").unwrap();

    let listed = h.tools.list_saved_credentials().await.unwrap();
    assert_eq!(listed.count, 0);

    // Fresh credentials can still be saved over the unreadable file
    let outcome = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    assert!(outcome.saved);
    assert_eq!(h.tools.list_saved_credentials().await.unwrap().count, 1);
}

#[tokio::test]
async fn store_write_failure_reports_unsaved() {
    let h = harness();
    // A directory where the store file should be makes the rename fail
    std::fs::create_dir(h.dir.path().join("credentials.enc")).unwrap();

    let outcome = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();

    assert!(outcome.status.connected);
    assert!(!outcome.saved);
}

#[tokio::test]
async fn delete_saved_credentials_argument_rules() {
    let h = harness();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "carol", "p3"))
        .await
        .unwrap();

    let err = h
        .tools
        .delete_saved_credentials(DeleteArgs {
            account: Some("acme-x".to_string()),
            user: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_arguments");
    assert_eq!(h.tools.list_saved_credentials().await.unwrap().count, 2);

    let outcome = h
        .tools
        .delete_saved_credentials(DeleteArgs {
            account: Some("acme-x".to_string()),
            user: Some("alice".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(outcome.deleted, 1);

    let outcome = h
        .tools
        .delete_saved_credentials(DeleteArgs {
            account: Some("acme-x".to_string()),
            user: Some("alice".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(outcome.deleted, 0);

    let outcome = h.tools.delete_saved_credentials(DeleteArgs::default()).await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert_eq!(h.tools.list_saved_credentials().await.unwrap().count, 0);
}

#[tokio::test]
async fn status_when_disconnected_offers_saved_identities() {
    let h = harness();
    h.tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    h.tools.sessions().close().await;

    let status = h.tools.auth_status().await;
    assert!(!status.session.connected);
    assert_eq!(status.saved, vec![Identity::new("acme-x", "alice")]);
    assert!(status.hint.as_deref().unwrap().contains(USE_SAVED_CREDENTIALS));

    let text = status.render_text();
    assert!(text.contains("Not connected"));
    assert!(text.contains("acme-x: alice"));
}

#[tokio::test]
async fn status_when_connected_never_shows_password() {
    let h = harness();
    let mut args = authenticate("acme-x", "alice", "p1");
    args.options.warehouse = Some("COMPUTE_WH".to_string());
    h.tools.authenticate_snowflake(args).await.unwrap();

    let status = h.tools.auth_status().await;
    assert!(status.session.connected);
    assert!(status.hint.is_none());

    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("acme-x"));
    assert!(!json.contains("p1\""));
    assert!(!json.contains("password"));

    let text = status.render_text();
    assert!(text.contains("Connected to Snowflake"));
    assert!(text.contains("COMPUTE_WH"));
    assert!(text.contains("interactive"));
}

#[tokio::test]
async fn status_text_includes_last_error() {
    let h = harness();
    let _ = h
        .tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "wrong"))
        .await;

    let text = h.tools.auth_status().await.render_text();
    assert!(text.contains("Last error: authentication failed"));
    assert!(text.contains(AUTHENTICATE_SNOWFLAKE));
}

#[tokio::test]
async fn ensure_connected_resolves_from_env() {
    let env = PartialCredentials::from_lookup(|name| match name {
        "SNOWFLAKE_ACCOUNT" => Some("acme-x".to_string()),
        "SNOWFLAKE_USER" => Some("alice".to_string()),
        "SNOWFLAKE_PASSWORD" => Some("p1".to_string()),
        _ => None,
    });
    let h = harness_with(
        FakeConnector::new().with_account("acme-x", "alice", "p1"),
        CredentialSources {
            env,
            ..Default::default()
        },
    );

    let status = h.tools.ensure_connected().await.unwrap();
    assert_eq!(status.provenance, Some(Provenance::Env));

    // Second call reuses the live session
    h.tools.ensure_connected().await.unwrap();
    assert_eq!(h.connector.logins.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ensure_connected_without_sources_is_not_authenticated() {
    let h = harness();

    let err = h.tools.ensure_connected().await.unwrap_err();
    assert_eq!(err.kind(), "not_authenticated");
    assert_eq!(err.available(), Some(&[][..]));
    assert!(err.to_string().contains(AUTHENTICATE_SNOWFLAKE));
}

#[tokio::test]
async fn ensure_connected_does_not_fall_back_after_failed_login() {
    let env = PartialCredentials::from_lookup(|name| match name {
        "SNOWFLAKE_ACCOUNT" => Some("acme-x".to_string()),
        "SNOWFLAKE_USER" => Some("alice".to_string()),
        "SNOWFLAKE_PASSWORD" => Some("p1".to_string()),
        _ => None,
    });
    let cli = PartialCredentials {
        account: Some("acme-x".to_string()),
        user: Some("alice".to_string()),
        password: Some(SecretString::from("stale".to_string())),
        options: ConnectionOptions::default(),
    };
    let h = harness_with(
        FakeConnector::new().with_account("acme-x", "alice", "p1"),
        CredentialSources {
            cli,
            env,
            ..Default::default()
        },
    );

    let err = h.tools.ensure_connected().await.unwrap_err();
    assert_eq!(err.kind(), "authentication_failed");
    assert!(!h.tools.sessions().is_connected().await);
}

/// Wraps a store and records the thread each call runs on.
struct ThreadRecordingStore {
    inner: EncryptedFileStore,
    threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
}

impl ThreadRecordingStore {
    fn record(&self) {
        self.threads
            .lock()
            .unwrap()
            .push(std::thread::current().id());
    }
}

impl CredentialStore for ThreadRecordingStore {
    fn upsert(&self, record: CredentialRecord) -> anyhow::Result<()> {
        self.record();
        self.inner.upsert(record)
    }

    fn get(&self, identity: &Identity) -> anyhow::Result<Option<CredentialRecord>> {
        self.record();
        self.inner.get(identity)
    }

    fn list(&self) -> anyhow::Result<Vec<Identity>> {
        self.record();
        self.inner.list()
    }

    fn delete(&self, identity: &Identity) -> anyhow::Result<bool> {
        self.record();
        self.inner.delete(identity)
    }

    fn delete_all(&self) -> anyhow::Result<usize> {
        self.record();
        self.inner.delete_all()
    }

    fn mark_used(&self, identity: &Identity) -> anyhow::Result<bool> {
        self.record();
        self.inner.mark_used(identity)
    }
}

#[tokio::test]
async fn store_io_stays_off_the_runtime_thread() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ThreadRecordingStore {
        inner: EncryptedFileStore::open(
            dir.path().join("credentials.enc"),
            dir.path().join(".key"),
        )
        .unwrap(),
        threads: std::sync::Mutex::new(Vec::new()),
    });
    let connector = Arc::new(FakeConnector::new().with_account("acme-x", "alice", "p1"));
    let sessions = Arc::new(SessionManager::new(connector, Duration::from_secs(5)));
    let resolver = CredentialResolver::new(CredentialSources::default(), store.clone());
    let tools = AuthTools::new(store.clone(), resolver, sessions);

    tools
        .authenticate_snowflake(authenticate("acme-x", "alice", "p1"))
        .await
        .unwrap();
    tools
        .use_saved_credentials(identity_args("acme-x", "alice"))
        .await
        .unwrap();
    tools.list_saved_credentials().await.unwrap();
    tools.sessions().close().await;
    tools.auth_status().await;
    let _ = tools.ensure_connected().await;
    tools
        .delete_saved_credentials(DeleteArgs::default())
        .await
        .unwrap();

    // The test runtime is single-threaded, so this is its only worker
    let runtime_thread = std::thread::current().id();
    let threads = store.threads.lock().unwrap().clone();
    assert!(threads.len() >= 7);
    assert!(threads.iter().all(|id| *id != runtime_thread));
}

#[tokio::test]
async fn excluded_tools_are_refused() {
    let h = harness();
    let tools = h
        .tools
        .with_excluded([DELETE_SAVED_CREDENTIALS, "no_such_tool"]);

    let err = tools
        .delete_saved_credentials(DeleteArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::ToolExcluded(ref name) if name == DELETE_SAVED_CREDENTIALS));

    assert_eq!(
        tools.enabled_tools(),
        vec![
            AUTHENTICATE_SNOWFLAKE,
            USE_SAVED_CREDENTIALS,
            LIST_SAVED_CREDENTIALS
        ]
    );
}

#[test]
fn authenticate_args_from_json() {
    let args: AuthenticateArgs = serde_json::from_str(
        r#"{"account": "acme-x", "user": "alice", "password": "p1", "warehouse": "WH"}"#,
    )
    .unwrap();

    assert!(args.save_credentials);
    assert_eq!(args.options.warehouse.as_deref(), Some("WH"));
    assert!(!format!("{:?}", args).contains("p1"));
}
