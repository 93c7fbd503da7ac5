//! Dedup ledger: durable "seen" and "unsubscribed" facts
//!
//! Both facts are append-only and keyed on compound unique indexes, so
//! recording them is idempotent even when several connections race on the
//! same pair. Reads return true forever after the first successful write.
//!
//! A send is bracketed by a reservation on the (list, recipient) pair: it is
//! written before the request goes out and swapped for the unsubscribe fact
//! in the same transaction that marks the message seen. A reservation that
//! outlives its run means a request may have gone out unrecorded, and is
//! treated as sent.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::{GoAwayError, Result};
use crate::models::{SeenRecord, UnsubscribeRecord};
use crate::store::Store;

/// Idempotent gatekeeping for the unsubscribe pipeline
pub trait Ledger: Send + Sync {
    /// Was this message already processed for this recipient?
    fn seen(&self, message_id: &str, recipient: &str) -> Result<bool>;

    /// Record the message as processed. Returns false if it already was.
    fn mark_seen(&self, message_id: &str, recipient: &str) -> Result<bool>;

    /// Has this recipient already been unsubscribed from this list?
    fn unsubscribed(&self, list_id: &str, recipient: &str) -> Result<bool>;

    /// Record an unsubscribe. Returns false if the (list, recipient) pair
    /// was already recorded, in which case the original record is kept.
    fn record_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool>;

    /// Reserve the (list, recipient) pair ahead of a send. Returns false if
    /// another reservation already holds it.
    fn begin_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool>;

    /// Message holding an outstanding reservation on the pair, if any
    fn pending_unsubscribe(&self, list_id: &str, recipient: &str) -> Result<Option<String>>;

    /// Record the unsubscribe, mark the message seen and drop the
    /// reservation, all or nothing. Returns false if the pair was already
    /// recorded.
    fn complete_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool>;

    /// Drop the reservation after a send that did not go out, marking the
    /// message seen in the same transaction when `mark_seen` is set
    fn abandon_unsubscribe(
        &self,
        message_id: &str,
        list_id: &str,
        recipient: &str,
        mark_seen: bool,
    ) -> Result<()>;
}

impl Ledger for Store {
    fn seen(&self, message_id: &str, recipient: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "select count(*) from seen where message_id = ?1 and recipient = ?2",
            params![message_id, recipient],
            |row| row.get(0),
        )?;
        Ok(count >= 1)
    }

    fn mark_seen(&self, message_id: &str, recipient: &str) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "insert or ignore into seen (ts, message_id, recipient) values (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), message_id, recipient],
        )?;
        Ok(inserted > 0)
    }

    fn unsubscribed(&self, list_id: &str, recipient: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "select count(*) from unsubscribes where list_id = ?1 and recipient = ?2",
            params![list_id, recipient],
            |row| row.get(0),
        )?;
        Ok(count >= 1)
    }

    fn record_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "insert or ignore into unsubscribes (ts, message_id, list_id, recipient)
             values (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), message_id, list_id, recipient],
        )?;
        Ok(inserted > 0)
    }

    fn begin_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "insert or ignore into pending_unsubscribes (ts, message_id, list_id, recipient)
             values (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), message_id, list_id, recipient],
        )?;
        Ok(inserted > 0)
    }

    fn pending_unsubscribe(&self, list_id: &str, recipient: &str) -> Result<Option<String>> {
        let message_id = self
            .conn()?
            .query_row(
                "select message_id from pending_unsubscribes where list_id = ?1 and recipient = ?2",
                params![list_id, recipient],
                |row| row.get(0),
            )
            .optional()?;
        Ok(message_id)
    }

    fn complete_unsubscribe(&self, message_id: &str, list_id: &str, recipient: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "insert or ignore into unsubscribes (ts, message_id, list_id, recipient)
             values (?1, ?2, ?3, ?4)",
            params![now, message_id, list_id, recipient],
        )?;
        tx.execute(
            "insert or ignore into seen (ts, message_id, recipient) values (?1, ?2, ?3)",
            params![now, message_id, recipient],
        )?;
        tx.execute(
            "delete from pending_unsubscribes where list_id = ?1 and recipient = ?2",
            params![list_id, recipient],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn abandon_unsubscribe(
        &self,
        message_id: &str,
        list_id: &str,
        recipient: &str,
        mark_seen: bool,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "delete from pending_unsubscribes
             where message_id = ?1 and list_id = ?2 and recipient = ?3",
            params![message_id, list_id, recipient],
        )?;
        if mark_seen {
            tx.execute(
                "insert or ignore into seen (ts, message_id, recipient) values (?1, ?2, ?3)",
                params![Utc::now().to_rfc3339(), message_id, recipient],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Totals for one recipient, shown by the `status` command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub seen: u64,
    pub unsubscribed: u64,
}

impl Store {
    pub fn counts(&self, recipient: &str) -> Result<LedgerCounts> {
        let conn = self.conn()?;
        let seen: i64 = conn.query_row(
            "select count(*) from seen where recipient = ?1",
            params![recipient],
            |row| row.get(0),
        )?;
        let unsubscribed: i64 = conn.query_row(
            "select count(*) from unsubscribes where recipient = ?1",
            params![recipient],
            |row| row.get(0),
        )?;
        Ok(LedgerCounts {
            seen: seen as u64,
            unsubscribed: unsubscribed as u64,
        })
    }

    /// Unsubscribe records for a recipient, newest first
    pub fn unsubscribe_records(&self, recipient: &str) -> Result<Vec<UnsubscribeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "select message_id, list_id, recipient, ts from unsubscribes
             where recipient = ?1 order by id desc",
        )?;
        let rows = stmt.query_map(params![recipient], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (message_id, list_id, recipient, ts) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| GoAwayError::State(format!("invalid timestamp '{}': {}", ts, e)))?
                .with_timezone(&Utc);
            records.push(UnsubscribeRecord {
                message_id,
                list_id,
                recipient,
                timestamp,
            });
        }
        Ok(records)
    }

    /// Messages processed for a recipient, newest first
    pub fn seen_records(&self, recipient: &str) -> Result<Vec<SeenRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "select message_id, recipient, ts from seen where recipient = ?1 order by id desc",
        )?;
        let rows = stmt.query_map(params![recipient], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let records = rows
            .map(|row| -> Result<SeenRecord> {
                let (message_id, recipient, ts) = row?;
                let timestamp = DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| GoAwayError::State(format!("invalid timestamp '{}': {}", ts, e)))?
                    .with_timezone(&Utc);
                Ok(SeenRecord {
                    message_id,
                    recipient,
                    timestamp,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(records)
    }
}
