use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    token_json TEXT NOT NULL,
    last_refreshed INTEGER
);
CREATE TABLE IF NOT EXISTS pending_authorizations (
    provider TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    secret_json TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Save raw credential JSON for a provider (provider = "discogs" or "spotify")
pub fn save_credential_raw(conn: &Connection, provider: &str, json_blob: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO credentials (provider, token_json, last_refreshed) VALUES (?1, ?2, strftime('%s','now')) ON CONFLICT(provider) DO UPDATE SET token_json = excluded.token_json, last_refreshed = strftime('%s','now')",
        params![provider, json_blob],
    )?;
    Ok(())
}

/// Load raw credential JSON for a provider
pub fn load_credential(conn: &Connection, provider: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT token_json FROM credentials WHERE provider = ?1 LIMIT 1")?;
    let row = stmt
        .query_row(params![provider], |r| r.get::<_, String>(0))
        .optional()?;
    Ok(row)
}

pub fn delete_credential(conn: &Connection, provider: &str) -> Result<usize> {
    let n = conn.execute("DELETE FROM credentials WHERE provider = ?1", params![provider])?;
    Ok(n)
}

/// Record the in-flight authorization for a provider, replacing any older attempt.
pub fn save_pending_authorization(conn: &Connection, provider: &str, request_id: &str, secret_json: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO pending_authorizations (provider, request_id, secret_json, created_at) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(provider) DO UPDATE SET request_id = excluded.request_id, secret_json = excluded.secret_json, created_at = excluded.created_at",
        params![provider, request_id, secret_json, now],
    )?;
    Ok(())
}

/// Returns (request_id, secret_json) for the provider's in-flight authorization.
pub fn load_pending_authorization(conn: &Connection, provider: &str) -> Result<Option<(String, String)>> {
    let mut stmt = conn.prepare("SELECT request_id, secret_json FROM pending_authorizations WHERE provider = ?1 LIMIT 1")?;
    let row = stmt
        .query_row(params![provider], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .optional()?;
    Ok(row)
}

pub fn delete_pending_authorization(conn: &Connection, provider: &str) -> Result<()> {
    conn.execute("DELETE FROM pending_authorizations WHERE provider = ?1", params![provider])?;
    Ok(())
}

/// Async handle over the token database for the provider clients. Each call
/// opens its own connection on the blocking pool.
#[derive(Debug, Clone)]
pub struct TokenStore {
    db_path: PathBuf,
}

impl TokenStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        let out = tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = open_or_create(&db_path)
                .with_context(|| format!("opening token store at {}", db_path.display()))?;
            f(&conn)
        })
        .await??;
        Ok(out)
    }

    pub async fn load_token(&self, provider: &'static str) -> Result<Option<String>> {
        self.run(move |c| load_credential(c, provider)).await
    }

    pub async fn save_token(&self, provider: &'static str, json: String) -> Result<()> {
        self.run(move |c| save_credential_raw(c, provider, &json)).await
    }

    pub async fn save_pending(&self, provider: &'static str, request_id: String, secret_json: String) -> Result<()> {
        self.run(move |c| save_pending_authorization(c, provider, &request_id, &secret_json))
            .await
    }

    pub async fn load_pending(&self, provider: &'static str) -> Result<Option<(String, String)>> {
        self.run(move |c| load_pending_authorization(c, provider)).await
    }

    /// Store the exchanged token and drop the pending attempt in one go.
    pub async fn complete_pending(&self, provider: &'static str, token_json: String) -> Result<()> {
        self.run(move |c| {
            save_credential_raw(c, provider, &token_json)?;
            delete_pending_authorization(c, provider)
        })
        .await
    }

    /// Forget everything held for a provider (logout).
    pub async fn clear(&self, provider: &'static str) -> Result<()> {
        self.run(move |c| {
            delete_credential(c, provider)?;
            delete_pending_authorization(c, provider)
        })
        .await
    }
}
