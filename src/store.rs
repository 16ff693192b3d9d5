use std::collections::{HashMap, HashSet};
use std::path::Path;

use containerd_snapshots::{Info, Kind, Usage};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{from_str, to_string};

use crate::error::{Result, SnapshotError};

/// A snapshot row resolved together with its committed ancestry.
/// `parent_ids[0]` is the immediate parent.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub parent_ids: Vec<String>,
}

/// Transactional metadata store backing the snapshotter.
///
/// Every mutating operation runs inside a single SQLite transaction;
/// the commit order of those transactions is what gives
/// Prepare → Commit → Mounts its happens-before chain.
pub struct MetaStore {
    conn: Connection,
}

struct Row {
    id: i64,
    parent: String,
    kind: Kind,
    labels: HashMap<String, String>,
    size: i64,
    inodes: i64,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                key    TEXT NOT NULL UNIQUE,
                parent TEXT NOT NULL DEFAULT '',
                kind   INTEGER NOT NULL,
                labels TEXT NOT NULL DEFAULT '{}',
                size   INTEGER NOT NULL DEFAULT 0,
                inodes INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn create_snapshot(
        &mut self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Snapshot> {
        let tx = self.conn.transaction()?;
        if fetch_row(&tx, key)?.is_some() {
            return Err(SnapshotError::AlreadyExists(format!("snapshot {key}")));
        }
        if !parent.is_empty() {
            let parent_row = fetch_row(&tx, parent)?
                .ok_or_else(|| SnapshotError::NotFound(format!("parent snapshot {parent}")))?;
            if parent_row.kind != Kind::Committed {
                return Err(SnapshotError::InvalidArgument(format!(
                    "parent snapshot {parent} is not committed"
                )));
            }
        }
        tx.execute(
            "INSERT INTO snapshots (key, parent, kind, labels) VALUES (?1, ?2, ?3, ?4)",
            params![key, parent, kind_to_i64(kind), to_string(labels)?],
        )?;
        let id = tx.last_insert_rowid();
        let parent_ids = parent_chain(&tx, parent)?;
        tx.commit()?;
        Ok(Snapshot {
            id: id.to_string(),
            kind,
            parent_ids,
        })
    }

    pub fn get_info(&mut self, key: &str) -> Result<(String, Info, Usage)> {
        let tx = self.conn.transaction()?;
        let row = fetch_row(&tx, key)?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {key}")))?;
        Ok((
            row.id.to_string(),
            Info {
                kind: row.kind,
                name: key.to_string(),
                parent: row.parent.clone(),
                labels: row.labels.clone(),
                ..Info::default()
            },
            Usage {
                size: row.size,
                inodes: row.inodes,
            },
        ))
    }

    pub fn get_snapshot(&mut self, key: &str) -> Result<Snapshot> {
        let tx = self.conn.transaction()?;
        let row = fetch_row(&tx, key)?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {key}")))?;
        let parent_ids = parent_chain(&tx, &row.parent)?;
        Ok(Snapshot {
            id: row.id.to_string(),
            kind: row.kind,
            parent_ids,
        })
    }

    /// Applies an update to the mutable fields of a snapshot record.
    /// With no fieldpaths the labels are replaced wholesale; otherwise
    /// only the named paths (`labels` or `labels.<key>`) are applied.
    pub fn update_info(&mut self, info: &Info, fieldpaths: Option<&[String]>) -> Result<Info> {
        let tx = self.conn.transaction()?;
        let row = fetch_row(&tx, &info.name)?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", info.name)))?;

        let mut labels = row.labels.clone();
        match fieldpaths {
            None => labels = info.labels.clone(),
            Some(paths) if paths.is_empty() => labels = info.labels.clone(),
            Some(paths) => {
                for path in paths {
                    if path == "labels" {
                        labels = info.labels.clone();
                    } else if let Some(name) = path.strip_prefix("labels.") {
                        match info.labels.get(name) {
                            Some(v) => {
                                labels.insert(name.to_string(), v.clone());
                            }
                            None => {
                                labels.remove(name);
                            }
                        }
                    } else {
                        return Err(SnapshotError::InvalidArgument(format!(
                            "cannot update immutable field {path:?}"
                        )));
                    }
                }
            }
        }

        tx.execute(
            "UPDATE snapshots SET labels = ?1 WHERE key = ?2",
            params![to_string(&labels)?, info.name],
        )?;
        tx.commit()?;
        Ok(Info {
            kind: row.kind,
            name: info.name.clone(),
            parent: row.parent,
            labels,
            ..Info::default()
        })
    }

    /// Commits the active snapshot `key` under the new name `name`,
    /// recording its usage. Non-empty labels replace the stored set.
    pub fn commit_active(
        &mut self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: &HashMap<String, String>,
    ) -> Result<String> {
        let tx = self.conn.transaction()?;
        if fetch_row(&tx, name)?.is_some() {
            return Err(SnapshotError::AlreadyExists(format!("snapshot {name}")));
        }
        let row = fetch_row(&tx, key)?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {key}")))?;
        if row.kind != Kind::Active {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {key} is not active"
            )));
        }
        let labels = if labels.is_empty() { &row.labels } else { labels };
        tx.execute(
            "UPDATE snapshots SET key = ?1, kind = ?2, size = ?3, inodes = ?4, labels = ?5
             WHERE key = ?6",
            params![
                name,
                kind_to_i64(Kind::Committed),
                usage.size,
                usage.inodes,
                to_string(labels)?,
                key
            ],
        )?;
        tx.commit()?;
        Ok(row.id.to_string())
    }

    /// Removes the record for `key` and returns its id.
    pub fn remove(&mut self, key: &str) -> Result<String> {
        let tx = self.conn.transaction()?;
        let row = fetch_row(&tx, key)?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {key}")))?;
        tx.execute("DELETE FROM snapshots WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(row.id.to_string())
    }

    /// The set of ids with live records; directories not in this set are
    /// orphans.
    pub fn id_map(&mut self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM snapshots")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    pub fn walk(&mut self) -> Result<Vec<Info>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, parent, kind, labels FROM snapshots ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut infos = Vec::new();
        for row in rows {
            let (key, parent, kind, labels) = row?;
            infos.push(Info {
                kind: i64_to_kind(kind),
                name: key,
                parent,
                labels: from_str(&labels)?,
                ..Info::default()
            });
        }
        Ok(infos)
    }
}

fn fetch_row(tx: &Transaction<'_>, key: &str) -> Result<Option<Row>> {
    let row = tx
        .query_row(
            "SELECT id, parent, kind, labels, size, inodes FROM snapshots WHERE key = ?1",
            params![key],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((id, parent, kind, labels, size, inodes)) => Ok(Some(Row {
            id,
            parent,
            kind: i64_to_kind(kind),
            labels: from_str(&labels)?,
            size,
            inodes,
        })),
    }
}

/// Walks the committed ancestry starting at `parent`, immediate parent
/// first.
fn parent_chain(tx: &Transaction<'_>, parent: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut next = parent.to_string();
    while !next.is_empty() {
        let row = fetch_row(tx, &next)?
            .ok_or_else(|| SnapshotError::NotFound(format!("parent snapshot {next}")))?;
        ids.push(row.id.to_string());
        next = row.parent;
    }
    Ok(ids)
}

fn kind_to_i64(kind: Kind) -> i64 {
    match kind {
        Kind::View => 1,
        Kind::Active => 2,
        Kind::Committed => 3,
        _ => 0,
    }
}

fn i64_to_kind(raw: i64) -> Kind {
    match raw {
        1 => Kind::View,
        2 => Kind::Active,
        3 => Kind::Committed,
        _ => Kind::Unknown,
    }
}
