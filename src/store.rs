use crate::error::Result;
use crate::mastery::{MasteryRepository, WordMasteryState};
use crate::session::{
    AnswerCorrection, DictationDetail, DictationSession, DictationTask, SessionStatus,
    SessionSummary, TaskSource, TaskWord,
};
use crate::{LearnerId, SessionId, TaskId, WordId};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mastery_states (
    learner_id INTEGER NOT NULL,
    word_id INTEGER NOT NULL,
    stage INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    correct_attempts INTEGER NOT NULL,
    mastery_score REAL NOT NULL,
    last_attempt_at TEXT,
    next_due_at TEXT,
    is_mastered BOOLEAN NOT NULL,
    PRIMARY KEY (learner_id, word_id),
    CHECK (correct_attempts <= attempts)
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    learner_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_words (
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    position INTEGER NOT NULL,
    word_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    PRIMARY KEY (task_id, position)
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id),
    learner_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT,
    end_time TEXT,
    total_words INTEGER,
    correct_count INTEGER,
    accuracy REAL,
    total_time_secs INTEGER
);

-- at most one running session per task
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_in_progress
    ON sessions(task_id) WHERE status = 'in_progress';

CREATE INDEX IF NOT EXISTS idx_sessions_learner_start ON sessions(learner_id, start_time);

CREATE TABLE IF NOT EXISTS session_details (
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    position INTEGER NOT NULL,
    word_id INTEGER NOT NULL,
    expected_text TEXT NOT NULL,
    user_input TEXT,
    is_correct BOOLEAN,
    retry_count INTEGER NOT NULL,
    time_spent_secs INTEGER NOT NULL,
    PRIMARY KEY (session_id, position)
);

CREATE TABLE IF NOT EXISTS answer_corrections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    word_id INTEGER NOT NULL,
    previous_input TEXT,
    previous_correct BOOLEAN,
    corrected_input TEXT NOT NULL,
    corrected_correct BOOLEAN NOT NULL,
    reason TEXT,
    corrected_at TEXT NOT NULL
);
"#;

/// SQLite-backed storage for tasks, sessions and mastery rows.
///
/// Every mutation goes through [`Store::transaction`], which holds the
/// connection lock and an immediate SQLite transaction for its whole
/// duration, so read-modify-write sequences never interleave.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and its schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` in one immediate transaction; commits only if `f` succeeds
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// True when a write tripped a UNIQUE index
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn ts(value: DateTime<Utc>) -> String {
    // fixed width so that text comparison orders chronologically
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
        })
        .transpose()
}

fn req_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    opt_ts(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "timestamp".to_string(),
        Type::Null,
    ))
}

fn status_of(row: &Row<'_>, idx: usize) -> rusqlite::Result<SessionStatus> {
    let text: String = row.get(idx)?;
    SessionStatus::parse(&text)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, text, Type::Text))
}

// ---- tasks ----

pub fn insert_task(
    conn: &Connection,
    learner_id: LearnerId,
    words: &[TaskWord],
    source: TaskSource,
    now: DateTime<Utc>,
) -> Result<DictationTask> {
    conn.execute(
        "INSERT INTO tasks (learner_id, source, created_at) VALUES (?1, ?2, ?3)",
        params![learner_id, source.to_string(), ts(now)],
    )?;
    let id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO task_words (task_id, position, word_id, text) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, word) in words.iter().enumerate() {
        stmt.execute(params![id, position as i64, word.word_id, word.text])?;
    }

    Ok(DictationTask {
        id,
        learner_id,
        words: words.to_vec(),
        source,
        created_at: now,
    })
}

pub fn load_task(conn: &Connection, task_id: TaskId) -> Result<Option<DictationTask>> {
    let header = conn
        .query_row(
            "SELECT learner_id, source, created_at FROM tasks WHERE id = ?1",
            [task_id],
            |row| {
                let source: String = row.get(1)?;
                let source = TaskSource::parse(&source)
                    .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, source, Type::Text))?;
                Ok((row.get::<_, LearnerId>(0)?, source, req_ts(row, 2)?))
            },
        )
        .optional()?;

    let Some((learner_id, source, created_at)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT word_id, text FROM task_words WHERE task_id = ?1 ORDER BY position",
    )?;
    let words = stmt
        .query_map([task_id], |row| {
            Ok(TaskWord {
                word_id: row.get(0)?,
                text: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(DictationTask {
        id: task_id,
        learner_id,
        words,
        source,
        created_at,
    }))
}

// ---- sessions ----

/// Persist a new session and its details, assigning its id.
///
/// Inserting an `in_progress` session for a task that already has one fails
/// with a UNIQUE violation (see [`is_unique_violation`]).
pub fn insert_session(conn: &Connection, session: &mut DictationSession) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (task_id, learner_id, status, start_time) VALUES (?1, ?2, ?3, ?4)",
        params![
            session.task_id,
            session.learner_id,
            session.status.to_string(),
            session.start_time.map(ts),
        ],
    )?;
    session.id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO session_details
        (session_id, position, word_id, expected_text, user_input, is_correct, retry_count, time_spent_secs)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )?;
    for (position, detail) in session.details.iter().enumerate() {
        stmt.execute(params![
            session.id,
            position as i64,
            detail.word_id,
            detail.expected_text,
            detail.user_input,
            detail.is_correct,
            detail.retry_count,
            detail.time_spent_secs,
        ])?;
    }
    Ok(())
}

/// Write back status, timestamps, aggregate and every detail
pub fn update_session(conn: &Connection, session: &DictationSession) -> Result<()> {
    let summary = session.summary.as_ref();
    conn.execute(
        r#"
        UPDATE sessions
        SET status = ?2, start_time = ?3, end_time = ?4,
            total_words = ?5, correct_count = ?6, accuracy = ?7, total_time_secs = ?8
        WHERE id = ?1
        "#,
        params![
            session.id,
            session.status.to_string(),
            session.start_time.map(ts),
            session.end_time.map(ts),
            summary.map(|s| s.total_words),
            summary.map(|s| s.correct_count),
            summary.map(|s| s.accuracy),
            summary.map(|s| s.total_time_secs),
        ],
    )?;

    let mut stmt = conn.prepare_cached(
        r#"
        UPDATE session_details
        SET user_input = ?3, is_correct = ?4, retry_count = ?5, time_spent_secs = ?6
        WHERE session_id = ?1 AND position = ?2
        "#,
    )?;
    for (position, detail) in session.details.iter().enumerate() {
        stmt.execute(params![
            session.id,
            position as i64,
            detail.user_input,
            detail.is_correct,
            detail.retry_count,
            detail.time_spent_secs,
        ])?;
    }
    Ok(())
}

const SESSION_COLUMNS: &str = "id, task_id, learner_id, status, start_time, end_time, \
     total_words, correct_count, accuracy, total_time_secs";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<DictationSession> {
    let id: SessionId = row.get(0)?;
    let status = status_of(row, 3)?;
    let total_words: Option<u32> = row.get(6)?;
    let summary = match total_words {
        Some(total_words) => Some(SessionSummary {
            session_id: id,
            status,
            total_words,
            correct_count: row.get::<_, Option<u32>>(7)?.unwrap_or(0),
            accuracy: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
            total_time_secs: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        }),
        None => None,
    };

    Ok(DictationSession {
        id,
        task_id: row.get(1)?,
        learner_id: row.get(2)?,
        status,
        start_time: opt_ts(row, 4)?,
        end_time: opt_ts(row, 5)?,
        details: Vec::new(),
        summary,
    })
}

fn load_details(conn: &Connection, session_id: SessionId) -> Result<Vec<DictationDetail>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT word_id, expected_text, user_input, is_correct, retry_count, time_spent_secs
        FROM session_details
        WHERE session_id = ?1
        ORDER BY position
        "#,
    )?;
    let details = stmt
        .query_map([session_id], |row| {
            Ok(DictationDetail {
                word_id: row.get(0)?,
                expected_text: row.get(1)?,
                user_input: row.get(2)?,
                is_correct: row.get(3)?,
                retry_count: row.get(4)?,
                time_spent_secs: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(details)
}

pub fn load_session(conn: &Connection, session_id: SessionId) -> Result<Option<DictationSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
    let session = conn
        .query_row(&sql, [session_id], session_from_row)
        .optional()?;

    match session {
        Some(mut session) => {
            session.details = load_details(conn, session_id)?;
            Ok(Some(session))
        }
        None => Ok(None),
    }
}

pub fn active_session_id(conn: &Connection, task_id: TaskId) -> Result<Option<SessionId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM sessions WHERE task_id = ?1 AND status = 'in_progress'",
            [task_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Completed sessions of a learner that started within `[from, to)`
pub fn load_completed_sessions(
    conn: &Connection,
    learner_id: LearnerId,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DictationSession>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE learner_id = ?1 AND status = 'completed' AND start_time >= ?2 AND start_time < ?3 \
         ORDER BY start_time"
    );
    query_sessions(conn, &sql, params![learner_id, ts(from), ts(to)])
}

/// Every completed session of a learner, oldest first
pub fn load_all_completed_sessions(
    conn: &Connection,
    learner_id: LearnerId,
) -> Result<Vec<DictationSession>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE learner_id = ?1 AND status = 'completed' \
         ORDER BY start_time"
    );
    query_sessions(conn, &sql, params![learner_id])
}

fn query_sessions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<DictationSession>> {
    let mut stmt = conn.prepare(sql)?;
    let mut sessions = stmt
        .query_map(params, session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for session in sessions.iter_mut() {
        session.details = load_details(conn, session.id)?;
    }
    Ok(sessions)
}

// ---- corrections ----

pub fn insert_correction(conn: &Connection, correction: &AnswerCorrection) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO answer_corrections
        (session_id, word_id, previous_input, previous_correct, corrected_input, corrected_correct, reason, corrected_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            correction.session_id,
            correction.word_id,
            correction.previous_input,
            correction.previous_correct,
            correction.corrected_input,
            correction.corrected_correct,
            correction.reason,
            ts(correction.corrected_at),
        ],
    )?;
    Ok(())
}

pub fn load_corrections(conn: &Connection, session_id: SessionId) -> Result<Vec<AnswerCorrection>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT session_id, word_id, previous_input, previous_correct,
               corrected_input, corrected_correct, reason, corrected_at
        FROM answer_corrections
        WHERE session_id = ?1
        ORDER BY id
        "#,
    )?;
    let corrections = stmt
        .query_map([session_id], |row| {
            Ok(AnswerCorrection {
                session_id: row.get(0)?,
                word_id: row.get(1)?,
                previous_input: row.get(2)?,
                previous_correct: row.get(3)?,
                corrected_input: row.get(4)?,
                corrected_correct: row.get(5)?,
                reason: row.get(6)?,
                corrected_at: req_ts(row, 7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(corrections)
}

// ---- mastery ----

fn mastery_from_row(row: &Row<'_>) -> rusqlite::Result<WordMasteryState> {
    Ok(WordMasteryState {
        learner_id: row.get(0)?,
        word_id: row.get(1)?,
        stage: row.get(2)?,
        attempts: row.get(3)?,
        correct_attempts: row.get(4)?,
        mastery_score: row.get(5)?,
        last_attempt_at: opt_ts(row, 6)?,
        next_due_at: opt_ts(row, 7)?,
        is_mastered: row.get(8)?,
    })
}

const MASTERY_COLUMNS: &str = "learner_id, word_id, stage, attempts, correct_attempts, \
     mastery_score, last_attempt_at, next_due_at, is_mastered";

/// Every mastery row of a learner
pub fn load_learner_states(conn: &Connection, learner_id: LearnerId) -> Result<Vec<WordMasteryState>> {
    let sql = format!("SELECT {MASTERY_COLUMNS} FROM mastery_states WHERE learner_id = ?1 ORDER BY word_id");
    let mut stmt = conn.prepare(&sql)?;
    let states = stmt
        .query_map([learner_id], mastery_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(states)
}

impl MasteryRepository for Connection {
    fn load_mastery_states(
        &self,
        learner_id: LearnerId,
        word_ids: &[WordId],
    ) -> Result<HashMap<WordId, WordMasteryState>> {
        let sql = format!(
            "SELECT {MASTERY_COLUMNS} FROM mastery_states WHERE learner_id = ?1 AND word_id = ?2"
        );
        let mut stmt = self.prepare_cached(&sql)?;
        let mut states = HashMap::with_capacity(word_ids.len());
        for word_id in word_ids {
            if let Some(state) = stmt
                .query_row(params![learner_id, word_id], mastery_from_row)
                .optional()?
            {
                states.insert(*word_id, state);
            }
        }
        Ok(states)
    }

    fn save_mastery_states(&self, states: &[WordMasteryState]) -> Result<()> {
        let mut stmt = self.prepare_cached(
            r#"
            INSERT INTO mastery_states
            (learner_id, word_id, stage, attempts, correct_attempts, mastery_score, last_attempt_at, next_due_at, is_mastered)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(learner_id, word_id) DO UPDATE SET
                stage = excluded.stage,
                attempts = excluded.attempts,
                correct_attempts = excluded.correct_attempts,
                mastery_score = excluded.mastery_score,
                last_attempt_at = excluded.last_attempt_at,
                next_due_at = excluded.next_due_at,
                is_mastered = excluded.is_mastered
            "#,
        )?;
        for state in states {
            stmt.execute(params![
                state.learner_id,
                state.word_id,
                state.stage,
                state.attempts,
                state.correct_attempts,
                state.mastery_score,
                state.last_attempt_at.map(ts),
                state.next_due_at.map(ts),
                state.is_mastered,
            ])?;
        }
        Ok(())
    }
}
