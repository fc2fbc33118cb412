#![forbid(unsafe_code)]

//! SQLite-backed [`TapeStore`]. Steps live in an append-only table guarded
//! by `BEFORE UPDATE`/`BEFORE DELETE` triggers; saving an extended tape
//! inserts only the steps past the stored high-water mark.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rusqlite::{params, Connection, OptionalExtension};
use tape_kernel_domain::{
    now_utc, DateTimeUtc, Step, StepContent, StepId, StepMetadata, StepType, Tape, TapeId,
    TapeMetadata,
};
use tape_kernel_store_core::{StoreError, TapeSearch, TapeStore};
use time::format_description::well_known::Rfc3339;
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tapes (
    tape_id     TEXT PRIMARY KEY,
    author      TEXT NOT NULL,
    parent_id   TEXT,
    created_at  TEXT NOT NULL,
    saved_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tape_steps (
    tape_id      TEXT NOT NULL REFERENCES tapes(tape_id),
    seq          INTEGER NOT NULL,
    step_id      TEXT NOT NULL,
    step_type    TEXT NOT NULL CHECK (step_type IN ('thought', 'action', 'observation')),
    content      TEXT NOT NULL,
    agent        TEXT NOT NULL,
    node         TEXT NOT NULL,
    prompt_id    TEXT,
    recorded_at  TEXT NOT NULL,
    metadata_id  TEXT NOT NULL,
    PRIMARY KEY (tape_id, seq)
);

CREATE TRIGGER IF NOT EXISTS tape_steps_no_update
BEFORE UPDATE ON tape_steps
BEGIN
    SELECT RAISE(ABORT, 'tape steps are append-only');
END;

CREATE TRIGGER IF NOT EXISTS tape_steps_no_delete
BEFORE DELETE ON tape_steps
BEGIN
    SELECT RAISE(ABORT, 'tape steps are append-only');
END;

CREATE INDEX IF NOT EXISTS idx_tape_steps_agent ON tape_steps(agent);
CREATE INDEX IF NOT EXISTS idx_tape_steps_node ON tape_steps(node);
CREATE INDEX IF NOT EXISTS idx_tapes_parent ON tapes(parent_id);
";

pub struct SqliteTapeStore {
    conn: Mutex<Connection>,
}

impl SqliteTapeStore {
    /// Open (creating if needed) a tape database and run migrations.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the database cannot be opened
    /// or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open tape db at {}", path.as_ref().display()))
            .map_err(StoreError::Backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(wrap)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(wrap)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(wrap)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("connection mutex poisoned")))
    }
}

impl TapeStore for SqliteTapeStore {
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA).map_err(wrap)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, format_ts(&now_utc())?],
        )
        .map_err(wrap)?;
        Ok(())
    }

    fn save_tape(&self, tape: &Tape) -> Result<TapeId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(wrap)?;

        tx.execute(
            "INSERT INTO tapes (tape_id, author, parent_id, created_at, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tape_id) DO UPDATE SET saved_at = excluded.saved_at",
            params![
                tape.metadata.tape_id.to_string(),
                tape.metadata.author,
                tape.metadata.parent_id.map(|id| id.to_string()),
                format_ts(&tape.metadata.created_at)?,
                format_ts(&now_utc())?,
            ],
        )
        .map_err(wrap)?;

        // Steps already stored keep their rows; only the tail is inserted.
        let stored: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM tape_steps WHERE tape_id = ?1",
                params![tape.metadata.tape_id.to_string()],
                |row| row.get(0),
            )
            .map_err(wrap)?;
        let stored = usize::try_from(stored).map_err(|err| StoreError::Backend(err.into()))?;

        for (seq, step) in tape.steps().iter().enumerate().skip(stored) {
            let content = serde_json::to_string(&step.content)
                .context("serialize step content")
                .map_err(StoreError::Backend)?;
            tx.execute(
                "INSERT INTO tape_steps
                     (tape_id, seq, step_id, step_type, content, agent, node,
                      prompt_id, recorded_at, metadata_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    tape.metadata.tape_id.to_string(),
                    seq as i64,
                    step.step_id.to_string(),
                    step.step_type.as_str(),
                    content,
                    step.metadata.agent,
                    step.metadata.node,
                    step.metadata.prompt_id,
                    format_ts(&step.metadata.recorded_at)?,
                    step.metadata.id.to_string(),
                ],
            )
            .map_err(wrap)?;
        }

        tx.commit().map_err(wrap)?;
        tracing::debug!(tape_id = %tape.metadata.tape_id, steps = tape.len(), "tape saved");
        Ok(tape.metadata.tape_id)
    }

    fn load_tape(&self, tape_id: TapeId) -> Result<Tape, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT author, parent_id, created_at FROM tapes WHERE tape_id = ?1",
                params![tape_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(wrap)?;
        let Some((author, parent_id, created_at)) = row else {
            return Err(StoreError::NotFound(tape_id));
        };
        let metadata = TapeMetadata {
            author,
            parent_id: parent_id.map(|id| parse_tape_id(&id)).transpose()?,
            created_at: parse_ts(&created_at)?,
            tape_id,
        };

        let mut stmt = conn
            .prepare(
                "SELECT step_id, step_type, content, agent, node, prompt_id,
                        recorded_at, metadata_id
                 FROM tape_steps WHERE tape_id = ?1 ORDER BY seq",
            )
            .map_err(wrap)?;
        let rows = stmt
            .query_map(params![tape_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(wrap)?;

        let mut steps = Vec::new();
        for row in rows {
            let (step_id, step_type, content, agent, node, prompt_id, recorded_at, metadata_id) =
                row.map_err(wrap)?;
            let content: StepContent = serde_json::from_str(&content)
                .context("decode step content")
                .map_err(StoreError::Backend)?;
            steps.push(Step {
                step_type: parse_step_type(&step_type)?,
                content,
                metadata: StepMetadata {
                    agent,
                    node,
                    prompt_id,
                    recorded_at: parse_ts(&recorded_at)?,
                    id: parse_ulid(&metadata_id)?,
                },
                step_id: StepId(parse_ulid(&step_id)?),
            });
        }
        Ok(Tape::from_parts(metadata, steps))
    }

    fn get_tape_history(&self, tape_id: TapeId) -> Result<Vec<TapeId>, StoreError> {
        let conn = self.lock()?;
        let mut history = Vec::new();
        let mut current = Some(tape_id);
        while let Some(id) = current {
            let row = conn
                .query_row(
                    "SELECT parent_id FROM tapes WHERE tape_id = ?1",
                    params![id.to_string()],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()
                .map_err(wrap)?;
            match row {
                Some(parent) => {
                    history.push(id);
                    current = parent.map(|p| parse_tape_id(&p)).transpose()?;
                }
                // Unknown starting tape is an error; an unsaved ancestor
                // just ends the walk.
                None if history.is_empty() => return Err(StoreError::NotFound(id)),
                None => break,
            }
        }
        Ok(history)
    }

    fn search_tapes(&self, filter: &TapeSearch) -> Result<Vec<TapeId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = if filter.is_empty() {
            conn.prepare("SELECT tape_id FROM tapes ORDER BY tape_id DESC")
                .map_err(wrap)?
        } else {
            conn.prepare(
                "SELECT DISTINCT t.tape_id
                 FROM tapes t JOIN tape_steps s ON s.tape_id = t.tape_id
                 WHERE (?1 IS NULL OR s.agent = ?1)
                   AND (?2 IS NULL OR s.node = ?2)
                 ORDER BY t.tape_id DESC",
            )
            .map_err(wrap)?
        };
        let rows: Vec<String> = if filter.is_empty() {
            stmt.query_map([], |row| row.get(0))
                .map_err(wrap)?
                .collect::<Result<_, _>>()
                .map_err(wrap)?
        } else {
            stmt.query_map(params![filter.agent, filter.node], |row| row.get(0))
                .map_err(wrap)?
                .collect::<Result<_, _>>()
                .map_err(wrap)?
        };
        rows.iter().map(|id| parse_tape_id(id)).collect()
    }
}

fn wrap(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn format_ts(ts: &DateTimeUtc) -> Result<String, StoreError> {
    ts.format(&Rfc3339)
        .context("format timestamp")
        .map_err(StoreError::Backend)
}

fn parse_ts(raw: &str) -> Result<DateTimeUtc, StoreError> {
    DateTimeUtc::parse(raw, &Rfc3339)
        .with_context(|| format!("parse timestamp '{raw}'"))
        .map_err(StoreError::Backend)
}

fn parse_ulid(raw: &str) -> Result<Ulid, StoreError> {
    Ulid::from_string(raw)
        .with_context(|| format!("parse ulid '{raw}'"))
        .map_err(StoreError::Backend)
}

fn parse_tape_id(raw: &str) -> Result<TapeId, StoreError> {
    Ok(TapeId(parse_ulid(raw)?))
}

fn parse_step_type(raw: &str) -> Result<StepType, StoreError> {
    match raw {
        "thought" => Ok(StepType::Thought),
        "action" => Ok(StepType::Action),
        "observation" => Ok(StepType::Observation),
        other => Err(StoreError::Backend(anyhow!("unknown step type '{other}'"))),
    }
}
