//! Database access shim for the conditions schema.
//!
//! Thin parameterized-SQL wrappers over `rusqlite`: no retries, no
//! transactions beyond a single commit per call, no concurrency.  The schema
//! itself is owned by the upload service; this module only reads rows back
//! and performs the two writes the campaign needs (tag cleanup and the
//! synchronization-mode stamp after a CREATE).

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::HarnessResult;

/// Conditions schema as the harness expects to find it.
///
/// Used by tests and scratch fixtures; production stores are created and
/// migrated by the service, never by this crate.
pub const CONDITIONS_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS TAG (
    NAME            TEXT PRIMARY KEY,
    TIME_TYPE       TEXT NOT NULL,
    SYNCHRONIZATION TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS IOV (
    TAG_NAME       TEXT NOT NULL,
    SINCE          INTEGER NOT NULL,
    INSERTION_TIME INTEGER NOT NULL,
    PAYLOAD_HASH   TEXT NOT NULL,
    PRIMARY KEY (TAG_NAME, SINCE)
);
CREATE TABLE IF NOT EXISTS TAG_LOG (
    TAG_NAME   TEXT NOT NULL,
    EVENT_TIME INTEGER NOT NULL,
    ACTION     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS TAG_METADATA (
    TAG_NAME            TEXT NOT NULL,
    MIN_SERIALIZATION_V TEXT NOT NULL,
    MIN_SINCE           INTEGER NOT NULL
);
";

/// The most recent insertion observed in a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovInsertion {
    /// Insertion point of the row.
    pub since: i64,
    /// Milliseconds since the Unix epoch at which the row was written.
    pub insertion_time_ms: i64,
}

/// One `(since, payload_hash)` row of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iov {
    pub since: i64,
    pub payload_hash: String,
}

/// One serialization-boundary row of a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub min_serialization_v: String,
    pub min_since: i64,
}

/// A single field-level difference between two row sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDiff {
    /// Zero-based row index (by insertion-point order).
    pub index: usize,
    /// Name of the diverging field.
    pub field: &'static str,
    pub left: String,
    pub right: String,
}

/// Result of comparing two ordered row sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetComparison {
    pub left_count: usize,
    pub right_count: usize,
    pub diffs: Vec<RowDiff>,
}

impl SetComparison {
    /// True when both sets have the same cardinality and no field diverges.
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.left_count == self.right_count && self.diffs.is_empty()
    }

    /// Human-readable one-line summaries of every divergence.
    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.left_count != self.right_count {
            out.push(format!(
                "row count mismatch: {} vs {}",
                self.left_count, self.right_count
            ));
        }
        for d in &self.diffs {
            out.push(format!(
                "{}[{}]: {} vs {}",
                d.field, d.index, d.left, d.right
            ));
        }
        out
    }
}

/// Connection to the service's conditions store.
pub struct CondDb {
    conn: Connection,
}

impl CondDb {
    /// Open the conditions store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` if the file cannot be opened.
    pub fn open(path: &Path) -> HarnessResult<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Wrap an already-open connection (test seam).
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// The most recent insertion for `tag` at or after `not_before_ms`,
    /// taking the first row in insertion-point order.
    ///
    /// Returns `None` when nothing was inserted in the window.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on query failure.
    pub fn last_inserted_since(
        &self,
        tag: &str,
        not_before_ms: i64,
    ) -> HarnessResult<Option<IovInsertion>> {
        let row = self
            .conn
            .query_row(
                "SELECT SINCE, INSERTION_TIME FROM IOV \
                 WHERE TAG_NAME = ?1 AND INSERTION_TIME >= ?2 ORDER BY SINCE",
                (tag, not_before_ms),
                |r| {
                    Ok(IovInsertion {
                        since: r.get(0)?,
                        insertion_time_ms: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Stamp a synchronization mode onto a tag.
    ///
    /// The upload tool always creates tags in the permissive mode; the
    /// campaign stamps the phase's mode right after every CREATE step.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on update failure.
    pub fn set_synchronization(&self, tag: &str, mode: &str) -> HarnessResult<()> {
        self.conn.execute(
            "UPDATE TAG SET SYNCHRONIZATION = ?1 WHERE NAME = ?2",
            (mode, tag),
        )?;
        debug!(tag, mode, "synchronization mode updated");
        Ok(())
    }

    /// Delete every row belonging to `tag` across the four related tables,
    /// in a single committed transaction.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on delete failure.
    pub fn remove_tag(&mut self, tag: &str) -> HarnessResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM TAG_METADATA WHERE TAG_NAME = ?1", (tag,))?;
        tx.execute("DELETE FROM IOV WHERE TAG_NAME = ?1", (tag,))?;
        tx.execute("DELETE FROM TAG_LOG WHERE TAG_NAME = ?1", (tag,))?;
        tx.execute("DELETE FROM TAG WHERE NAME = ?1", (tag,))?;
        tx.commit()?;
        debug!(tag, "tag removed");
        Ok(())
    }

    /// Full ordered `(since, payload_hash)` row set of a tag.
    ///
    /// A missing tag yields an empty set, not an error.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on query failure.
    pub fn iovs(&self, tag: &str) -> HarnessResult<Vec<Iov>> {
        fetch_iovs(&self.conn, tag)
    }

    /// Full ordered row set of a tag inside a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` if the snapshot cannot be opened or
    /// queried.
    pub fn iovs_in_snapshot(path: &Path, tag: &str) -> HarnessResult<Vec<Iov>> {
        let conn = Connection::open(path)?;
        fetch_iovs(&conn, tag)
    }

    /// Ordered serialization-boundary rows of a tag.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on query failure.
    pub fn tag_metadata(&self, tag: &str) -> HarnessResult<Vec<MetadataRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT MIN_SERIALIZATION_V, MIN_SINCE FROM TAG_METADATA \
             WHERE TAG_NAME = ?1 ORDER BY MIN_SINCE",
        )?;
        let rows = stmt.query_map((tag,), |r| {
            Ok(MetadataRow {
                min_serialization_v: r.get(0)?,
                min_since: r.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn fetch_iovs(conn: &Connection, tag: &str) -> HarnessResult<Vec<Iov>> {
    let mut stmt = conn.prepare(
        "SELECT SINCE, PAYLOAD_HASH FROM IOV WHERE TAG_NAME = ?1 ORDER BY SINCE",
    )?;
    let rows = stmt.query_map((tag,), |r| {
        Ok(Iov {
            since: r.get(0)?,
            payload_hash: r.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Compare two tags' IOV sets row-by-row, by insertion-point order.
#[must_use]
pub fn compare_iovs(left: &[Iov], right: &[Iov]) -> SetComparison {
    let mut diffs = Vec::new();
    for (i, (l, r)) in left.iter().zip(right.iter()).enumerate() {
        if l.since != r.since {
            diffs.push(RowDiff {
                index: i,
                field: "since",
                left: l.since.to_string(),
                right: r.since.to_string(),
            });
        }
        if l.payload_hash != r.payload_hash {
            diffs.push(RowDiff {
                index: i,
                field: "payload_hash",
                left: l.payload_hash.clone(),
                right: r.payload_hash.clone(),
            });
        }
    }
    SetComparison {
        left_count: left.len(),
        right_count: right.len(),
        diffs,
    }
}

/// Compare two tags' serialization-boundary rows row-by-row.
#[must_use]
pub fn compare_metadata(left: &[MetadataRow], right: &[MetadataRow]) -> SetComparison {
    let mut diffs = Vec::new();
    for (i, (l, r)) in left.iter().zip(right.iter()).enumerate() {
        if l.min_serialization_v != r.min_serialization_v {
            diffs.push(RowDiff {
                index: i,
                field: "min_serialization_v",
                left: l.min_serialization_v.clone(),
                right: r.min_serialization_v.clone(),
            });
        }
        if l.min_since != r.min_since {
            diffs.push(RowDiff {
                index: i,
                field: "min_since",
                left: l.min_since.to_string(),
                right: r.min_since.to_string(),
            });
        }
    }
    SetComparison {
        left_count: left.len(),
        right_count: right.len(),
        diffs,
    }
}
