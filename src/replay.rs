//! Local replay buffer for pending commands.
//!
//! A small SQLite file that mirrors the command queue so operator intents
//! survive an app restart. Uses rusqlite with WAL mode. The buffer holds only
//! commands; orders are always re-fetched from the server.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ReplayError;
use crate::model::{Command, CommandId, CommandPayload};
use crate::queue::CommandQueue;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

pub struct ReplayBuffer {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ReplayBuffer {
    /// Open (or create) the buffer at `path`. On corruption or open failure
    /// the file is deleted and opened once more; queued intents are lost in
    /// that case but the session keeps working.
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ReplayError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        info!("Opening replay buffer at {}", path.display());

        let conn = match open_and_migrate(path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Replay buffer open failed ({}), deleting and retrying once",
                    first_err
                );
                if path.exists() {
                    let _ = fs::remove_file(path);
                    let _ = fs::remove_file(path.with_extension("db-wal"));
                    let _ = fs::remove_file(path.with_extension("db-shm"));
                }
                open_and_migrate(path)?
            }
        };

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, ReplayError> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the stored queue with `queue`, preserving its order.
    pub fn save(&mut self, queue: &CommandQueue) -> Result<(), ReplayError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM pending_commands", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO pending_commands (
                     seq, id, order_id, kind, payload, created_at, retry_count
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (seq, entry) in queue.iter().enumerate() {
                let command = &entry.command;
                stmt.execute(params![
                    seq as i64,
                    command.id.as_str(),
                    command.order_id(),
                    command.kind().as_str(),
                    serde_json::to_string(&command.payload)?,
                    command.created_at.to_rfc3339(),
                    command.retry_count,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stored commands in submission order. Rows that no longer decode are
    /// skipped with a warning.
    pub fn load(&self) -> Result<Vec<Command>, ReplayError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, created_at, retry_count
             FROM pending_commands
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut commands = Vec::new();
        for row in rows {
            let (id, payload, created_at, retry_count) = row?;
            let payload: CommandPayload = match serde_json::from_str(&payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(command_id = %id, error = %e, "dropping undecodable replay row");
                    continue;
                }
            };
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            commands.push(Command {
                id: CommandId::from(id.as_str()),
                payload,
                created_at,
                retry_count,
            });
        }
        Ok(commands)
    }
}

fn open_and_migrate(path: &Path) -> Result<Connection, ReplayError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), ReplayError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating replay buffer from v{current} to v{CURRENT_SCHEMA_VERSION}");
    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), ReplayError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_commands (
            seq INTEGER NOT NULL,
            id TEXT PRIMARY KEY,
            order_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_pending_commands_seq ON pending_commands(seq);
        INSERT INTO schema_version (version) VALUES (1);",
    )?;
    Ok(())
}
