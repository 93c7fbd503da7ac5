//! SQLite persistence shared by the ledger and the credential store
//!
//! One file holds the two append-only fact tables used by the
//! [`Ledger`](crate::ledger::Ledger) and its table of in-flight sends, the
//! inbox registry, and a per-inbox key/value bag used for credentials.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GoAwayError, Result};
use crate::models::{Inbox, ProviderKind};

const SCHEMA: &str = "
create table if not exists seen (
    id integer primary key autoincrement,
    ts text not null,
    message_id text not null,
    recipient text not null,
    unique (message_id, recipient)
);
create table if not exists unsubscribes (
    id integer primary key autoincrement,
    ts text not null,
    message_id text not null,
    list_id text not null,
    recipient text not null,
    unique (list_id, recipient)
);
create table if not exists pending_unsubscribes (
    id integer primary key autoincrement,
    ts text not null,
    message_id text not null,
    list_id text not null,
    recipient text not null,
    unique (list_id, recipient)
);
create table if not exists inboxes (
    id integer primary key autoincrement,
    addr text not null,
    provider text not null,
    unique (addr, provider)
);
create table if not exists config (
    inbox_id integer not null,
    key text not null,
    value text,
    primary key (inbox_id, key),
    foreign key (inbox_id) references inboxes(id)
);
";

/// How long a writer waits for another connection's lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle on the go-away database
///
/// The connection sits behind a mutex only so the store can be shared
/// between tasks. Dedup guarantees come from the unique keys in the schema,
/// which also hold for separate processes opening the same file.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("pragma journal_mode = wal", [], |row| row.get(0))?;
        debug!("Opened store at {:?} (journal_mode={})", path, mode);

        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs without a file
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("pragma foreign_keys = on;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GoAwayError::State("store connection lock poisoned".to_string()))
    }

    /// Register an inbox, returning the existing row if it is already known
    pub fn upsert_inbox(&self, address: &str, provider: ProviderKind) -> Result<Inbox> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "insert or ignore into inboxes (addr, provider) values (?1, ?2)",
            params![address, provider.as_str()],
        )?;
        let id: i64 = conn.query_row(
            "select id from inboxes where addr = ?1 and provider = ?2",
            params![address, provider.as_str()],
            |row| row.get(0),
        )?;

        if inserted > 0 {
            info!("Registered {} inbox {} (id={})", provider, address, id);
        }

        Ok(Inbox {
            id,
            provider,
            address: address.to_string(),
        })
    }

    /// All registered inboxes, in registration order
    pub fn list_inboxes(&self) -> Result<Vec<Inbox>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("select id, addr, provider from inboxes order by id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut inboxes = Vec::new();
        for row in rows {
            let (id, address, provider) = row?;
            let provider = ProviderKind::parse(&provider).ok_or_else(|| {
                GoAwayError::Config(format!("unknown inbox provider '{}' for {}", provider, address))
            })?;
            inboxes.push(Inbox {
                id,
                provider,
                address,
            });
        }
        Ok(inboxes)
    }

    /// Set a per-inbox config value, replacing any previous value
    pub fn config_set(&self, inbox_id: i64, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "insert into config (inbox_id, key, value) values (?1, ?2, ?3)
             on conflict (inbox_id, key) do update set value = excluded.value",
            params![inbox_id, key, value],
        )?;
        Ok(())
    }

    /// Set several per-inbox config values in one transaction
    pub fn config_set_many(&self, inbox_id: i64, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "insert into config (inbox_id, key, value) values (?1, ?2, ?3)
                 on conflict (inbox_id, key) do update set value = excluded.value",
                params![inbox_id, key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn config_get(&self, inbox_id: i64, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row(
                "select value from config where inbox_id = ?1 and key = ?2",
                params![inbox_id, key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn config_is_set(&self, inbox_id: i64, key: &str) -> Result<bool> {
        Ok(self
            .config_get(inbox_id, key)?
            .is_some_and(|value| !value.is_empty()))
    }

    /// Remove all config keys starting with `prefix` for one inbox
    pub fn config_clear_prefix(&self, inbox_id: i64, prefix: &str) -> Result<usize> {
        let removed = self.conn()?.execute(
            "delete from config where inbox_id = ?1 and substr(key, 1, length(?2)) = ?2",
            params![inbox_id, prefix],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_inbox_is_idempotent() {
        let store = Store::open_in_memory().unwrap();

        let first = store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();
        let second = store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();
        assert_eq!(first, second);

        let other = store.upsert_inbox("work@example.com", ProviderKind::Gmail).unwrap();
        assert_ne!(first.id, other.id);

        let inboxes = store.list_inboxes().unwrap();
        assert_eq!(inboxes, vec![first, other]);
    }

    #[test]
    fn test_config_set_get_overwrite() {
        let store = Store::open_in_memory().unwrap();
        let inbox = store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();

        assert_eq!(store.config_get(inbox.id, "credentials::accessToken").unwrap(), None);
        assert!(!store.config_is_set(inbox.id, "credentials::accessToken").unwrap());

        store.config_set(inbox.id, "credentials::accessToken", "one").unwrap();
        store.config_set(inbox.id, "credentials::accessToken", "two").unwrap();

        assert_eq!(
            store.config_get(inbox.id, "credentials::accessToken").unwrap().as_deref(),
            Some("two")
        );
        assert!(store.config_is_set(inbox.id, "credentials::accessToken").unwrap());
    }

    #[test]
    fn test_config_is_per_inbox() {
        let store = Store::open_in_memory().unwrap();
        let a = store.upsert_inbox("a@example.com", ProviderKind::Gmail).unwrap();
        let b = store.upsert_inbox("b@example.com", ProviderKind::Gmail).unwrap();

        store.config_set(a.id, "k", "for-a").unwrap();
        assert_eq!(store.config_get(b.id, "k").unwrap(), None);
    }

    #[test]
    fn test_config_clear_prefix() {
        let store = Store::open_in_memory().unwrap();
        let inbox = store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();

        store.config_set(inbox.id, "credentials::accessToken", "a").unwrap();
        store.config_set(inbox.id, "credentials::refreshToken", "r").unwrap();
        store.config_set(inbox.id, "other", "kept").unwrap();

        assert_eq!(store.config_clear_prefix(inbox.id, "credentials::").unwrap(), 2);
        assert_eq!(store.config_get(inbox.id, "other").unwrap().as_deref(), Some("kept"));
        assert_eq!(store.config_get(inbox.id, "credentials::refreshToken").unwrap(), None);
    }

    /// Make every write of `key` to the config table fail
    pub(crate) fn reject_config_key(store: &Store, key: &str) {
        store
            .conn()
            .unwrap()
            .execute_batch(&format!(
                "create trigger reject_insert before insert on config when new.key = '{key}'
                 begin select raise(abort, 'rejected'); end;
                 create trigger reject_update before update on config when new.key = '{key}'
                 begin select raise(abort, 'rejected'); end;"
            ))
            .unwrap();
    }

    #[test]
    fn test_config_set_many_is_all_or_nothing() {
        let store = Store::open_in_memory().unwrap();
        let inbox = store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();
        store.config_set(inbox.id, "a", "old").unwrap();
        reject_config_key(&store, "c");

        let result = store.config_set_many(inbox.id, &[("a", "new"), ("b", "new"), ("c", "new")]);
        assert!(matches!(result, Err(GoAwayError::Storage(_))));
        assert_eq!(store.config_get(inbox.id, "a").unwrap().as_deref(), Some("old"));
        assert_eq!(store.config_get(inbox.id, "b").unwrap(), None);

        store
            .config_set_many(inbox.id, &[("a", "new"), ("b", "new")])
            .unwrap();
        assert_eq!(store.config_get(inbox.id, "a").unwrap().as_deref(), Some("new"));
        assert_eq!(store.config_get(inbox.id, "b").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_config_requires_registered_inbox() {
        let store = Store::open_in_memory().unwrap();
        let result = store.config_set(42, "k", "v");
        assert!(matches!(result, Err(GoAwayError::Storage(_))));
    }

    #[test]
    fn test_open_file_persists_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("go-away.sqlite3");

        {
            let store = Store::open(&path).unwrap();
            store.upsert_inbox("me@example.com", ProviderKind::Gmail).unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        let inboxes = reopened.list_inboxes().unwrap();
        assert_eq!(inboxes.len(), 1);
        assert_eq!(inboxes[0].address, "me@example.com");
    }
}
