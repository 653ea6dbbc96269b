//! SQLite-based store implementation

use chrono::{DateTime, Local, NaiveDate};
use rollcall_api::{AttendanceStatus, SessionStatus};
use rollcall_util::{
    format_day, format_timestamp, parse_day, parse_timestamp, MeetCode, SessionId, SubjectId,
    UserId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    AuditEvent, FinalOutcome, ParticipantRecord, SessionFields, SessionRecord, Store, StoreError,
    StoreResult, TokenRecord,
};

const SESSION_COLUMNS: &str = "id, meet_code, day, subject_id, is_placeholder, start_time, \
     end_time, first_third, grace_period, status, instructor_join, instructor_leave, \
     instructor_late, meeting_ended, unmatched_json, finalized_at, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "session_id, user_id, display_name, student_id, status, \
     first_join, last_leave, last_return, in_meeting, leave_count, return_count, \
     credited_secs, total_duration_secs, time_to_enter_secs, is_tardy, tardiness_count, synchronized, \
     pending_since, finalized, finalized_at, excused, overridden_by, updated_at";

const TOKEN_COLUMNS: &str = "token, session_id, user_id, subject_id, valid_from, expires_at, \
     consumed, consumed_at, consumed_by, created_at";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- One row per meeting occurrence
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                meet_code TEXT NOT NULL,
                day TEXT NOT NULL,
                subject_id TEXT,
                is_placeholder INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                first_third TEXT NOT NULL,
                grace_period INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                status_rank INTEGER NOT NULL DEFAULT 0,
                instructor_join TEXT,
                instructor_leave TEXT,
                instructor_late INTEGER NOT NULL DEFAULT 0,
                meeting_ended INTEGER NOT NULL DEFAULT 0,
                unmatched_json TEXT NOT NULL DEFAULT '[]',
                finalized_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (meet_code, day)
            );

            -- Reconciled presence per (session, user)
            CREATE TABLE IF NOT EXISTS participants (
                session_id TEXT NOT NULL REFERENCES sessions(id),
                user_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                student_id TEXT,
                status TEXT NOT NULL,
                first_join TEXT,
                last_leave TEXT,
                last_return TEXT,
                in_meeting INTEGER NOT NULL DEFAULT 0,
                leave_count INTEGER NOT NULL DEFAULT 0,
                return_count INTEGER NOT NULL DEFAULT 0,
                credited_secs INTEGER NOT NULL DEFAULT 0,
                total_duration_secs INTEGER NOT NULL DEFAULT 0,
                time_to_enter_secs INTEGER,
                is_tardy INTEGER NOT NULL DEFAULT 0,
                tardiness_count INTEGER NOT NULL DEFAULT 0,
                synchronized INTEGER NOT NULL DEFAULT 0,
                pending_since TEXT,
                finalized INTEGER NOT NULL DEFAULT 0,
                finalized_at TEXT,
                excused INTEGER NOT NULL DEFAULT 0,
                overridden_by TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, user_id)
            );

            -- Submission tokens
            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                subject_id TEXT,
                valid_from TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                consumed_at TEXT,
                consumed_by TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, user_id)
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_sessions_open ON sessions(finalized_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject_id);
            CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("invalid {} '{}'", column, value).into(),
    )
}

fn ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Local>> {
    let raw: String = row.get(column)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(column, &raw))
}

fn opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Local>>> {
    match row.get::<_, Option<String>>(column)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(column, &raw)),
        None => Ok(None),
    }
}

fn session_id(row: &Row<'_>, column: &str) -> rusqlite::Result<SessionId> {
    let raw: String = row.get(column)?;
    SessionId::parse(&raw).ok_or_else(|| conversion_error(column, &raw))
}

fn fmt_opt(dt: &Option<DateTime<Local>>) -> Option<String> {
    dt.as_ref().map(format_timestamp)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let meet_code: String = row.get("meet_code")?;
    let day: String = row.get("day")?;
    let status: String = row.get("status")?;
    let unmatched_json: String = row.get("unmatched_json")?;

    Ok(SessionRecord {
        id: session_id(row, "id")?,
        meet_code: MeetCode::parse(&meet_code)
            .ok_or_else(|| conversion_error("meet_code", &meet_code))?,
        day: parse_day(&day).ok_or_else(|| conversion_error("day", &day))?,
        fields: SessionFields {
            subject_id: row
                .get::<_, Option<String>>("subject_id")?
                .map(SubjectId::new),
            is_placeholder: row.get("is_placeholder")?,
            start_time: ts(row, "start_time")?,
            end_time: ts(row, "end_time")?,
            first_third: ts(row, "first_third")?,
            grace_period: row.get("grace_period")?,
        },
        status: SessionStatus::parse(&status).ok_or_else(|| conversion_error("status", &status))?,
        instructor_join: opt_ts(row, "instructor_join")?,
        instructor_leave: opt_ts(row, "instructor_leave")?,
        instructor_late: row.get("instructor_late")?,
        meeting_ended: row.get("meeting_ended")?,
        unmatched: serde_json::from_str(&unmatched_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        finalized_at: opt_ts(row, "finalized_at")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRecord> {
    let status: String = row.get("status")?;

    Ok(ParticipantRecord {
        session_id: session_id(row, "session_id")?,
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        display_name: row.get("display_name")?,
        student_id: row.get("student_id")?,
        status: AttendanceStatus::parse(&status)
            .ok_or_else(|| conversion_error("status", &status))?,
        first_join: opt_ts(row, "first_join")?,
        last_leave: opt_ts(row, "last_leave")?,
        last_return: opt_ts(row, "last_return")?,
        in_meeting: row.get("in_meeting")?,
        leave_count: row.get("leave_count")?,
        return_count: row.get("return_count")?,
        credited_secs: row.get("credited_secs")?,
        total_duration_secs: row.get("total_duration_secs")?,
        time_to_enter_secs: row.get("time_to_enter_secs")?,
        is_tardy: row.get("is_tardy")?,
        tardiness_count: row.get("tardiness_count")?,
        synchronized: row.get("synchronized")?,
        pending_since: opt_ts(row, "pending_since")?,
        finalized: row.get("finalized")?,
        finalized_at: opt_ts(row, "finalized_at")?,
        excused: row.get("excused")?,
        overridden_by: row.get("overridden_by")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<TokenRecord> {
    Ok(TokenRecord {
        token: row.get("token")?,
        session_id: session_id(row, "session_id")?,
        user_id: UserId::new(row.get::<_, String>("user_id")?),
        subject_id: row
            .get::<_, Option<String>>("subject_id")?
            .map(SubjectId::new),
        valid_from: ts(row, "valid_from")?,
        expires_at: ts(row, "expires_at")?,
        consumed: row.get("consumed")?,
        consumed_at: opt_ts(row, "consumed_at")?,
        consumed_by: row.get("consumed_by")?,
        created_at: ts(row, "created_at")?,
    })
}

impl Store for SqliteStore {
    fn find_session(
        &self,
        meet_code: &MeetCode,
        day: NaiveDate,
    ) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE meet_code = ? AND day = ?",
            SESSION_COLUMNS
        );
        let session = conn
            .query_row(&sql, params![meet_code.as_str(), format_day(day)], |row| {
                session_from_row(row)
            })
            .optional()?;
        Ok(session)
    }

    fn get_session(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let session = conn
            .query_row(&sql, [id.to_string()], |row| session_from_row(row))
            .optional()?;
        Ok(session)
    }

    fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let f = &session.fields;
        let unmatched_json = serde_json::to_string(&session.unmatched)?;

        conn.execute(
            r#"
            INSERT INTO sessions (
                id, meet_code, day, subject_id, is_placeholder, start_time, end_time,
                first_third, grace_period, status, status_rank, instructor_join,
                instructor_leave, instructor_late, meeting_ended, unmatched_json,
                finalized_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                session.id.to_string(),
                session.meet_code.as_str(),
                format_day(session.day),
                f.subject_id.as_ref().map(|s| s.as_str()),
                f.is_placeholder,
                format_timestamp(&f.start_time),
                format_timestamp(&f.end_time),
                format_timestamp(&f.first_third),
                f.grace_period,
                session.status.as_str(),
                session.status.rank(),
                fmt_opt(&session.instructor_join),
                fmt_opt(&session.instructor_leave),
                session.instructor_late,
                session.meeting_ended,
                unmatched_json,
                fmt_opt(&session.finalized_at),
                format_timestamp(&session.created_at),
                format_timestamp(&session.updated_at),
            ],
        )?;

        debug!(session_id = %session.id, meet_code = %session.meet_code, "Session inserted");
        Ok(())
    }

    fn refine_session(
        &self,
        id: &SessionId,
        fields: &SessionFields,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        if fields.is_placeholder {
            return Ok(false);
        }

        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE sessions SET
                subject_id = ?2, is_placeholder = 0, start_time = ?3, end_time = ?4,
                first_third = ?5, grace_period = ?6, updated_at = ?7
            WHERE id = ?1 AND is_placeholder = 1 AND finalized_at IS NULL
            "#,
            params![
                id.to_string(),
                fields.subject_id.as_ref().map(|s| s.as_str()),
                format_timestamp(&fields.start_time),
                format_timestamp(&fields.end_time),
                format_timestamp(&fields.first_third),
                fields.grace_period,
                format_timestamp(&now),
            ],
        )?;
        Ok(changed == 1)
    }

    fn advance_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET status = ?2, status_rank = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status_rank < ?3",
            params![
                id.to_string(),
                status.as_str(),
                status.rank(),
                format_timestamp(&now)
            ],
        )?;
        Ok(changed == 1)
    }

    fn set_instructor_join(
        &self,
        id: &SessionId,
        join: DateTime<Local>,
        late: bool,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET instructor_join = ?2, instructor_late = ?3, updated_at = ?4 \
             WHERE id = ?1 AND meeting_ended = 0",
            params![
                id.to_string(),
                format_timestamp(&join),
                late,
                format_timestamp(&now)
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_meeting_ended(
        &self,
        id: &SessionId,
        instructor_leave: DateTime<Local>,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET instructor_leave = ?2, meeting_ended = 1, updated_at = ?3 \
             WHERE id = ?1 AND meeting_ended = 0",
            params![
                id.to_string(),
                format_timestamp(&instructor_leave),
                format_timestamp(&now)
            ],
        )?;
        Ok(changed == 1)
    }

    fn push_unmatched(
        &self,
        id: &SessionId,
        names: &[String],
        capacity: usize,
        now: DateTime<Local>,
    ) -> StoreResult<()> {
        if names.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT unmatched_json FROM sessions WHERE id = ?",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        let mut log: Vec<String> = serde_json::from_str(&current)?;
        for name in names {
            if !log.contains(name) {
                log.push(name.clone());
            }
        }
        if log.len() > capacity {
            let overflow = log.len() - capacity;
            log.drain(..overflow);
        }

        tx.execute(
            "UPDATE sessions SET unmatched_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                serde_json::to_string(&log)?,
                format_timestamp(&now)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mark_session_finalized(&self, id: &SessionId, now: DateTime<Local>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE sessions SET
                finalized_at = ?2,
                status = CASE WHEN status_rank >= ?4 THEN status ELSE ?3 END,
                status_rank = MAX(status_rank, ?4),
                updated_at = ?2
            WHERE id = ?1 AND finalized_at IS NULL
            "#,
            params![
                id.to_string(),
                format_timestamp(&now),
                SessionStatus::Completed.as_str(),
                SessionStatus::Completed.rank(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn list_open_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE finalized_at IS NULL ORDER BY start_time",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| session_from_row(row))?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn get_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> StoreResult<Option<ParticipantRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM participants WHERE session_id = ? AND user_id = ?",
            PARTICIPANT_COLUMNS
        );
        let record = conn
            .query_row(
                &sql,
                params![session_id.to_string(), user_id.as_str()],
                |row| participant_from_row(row),
            )
            .optional()?;
        Ok(record)
    }

    fn list_participants(&self, session_id: &SessionId) -> StoreResult<Vec<ParticipantRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM participants WHERE session_id = ? ORDER BY display_name, user_id",
            PARTICIPANT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([session_id.to_string()], |row| participant_from_row(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn insert_participant_if_absent(&self, r: &ParticipantRecord) -> StoreResult<bool> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT OR IGNORE INTO participants ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            PARTICIPANT_COLUMNS
        );
        let changed = conn.execute(
            &sql,
            params![
                r.session_id.to_string(),
                r.user_id.as_str(),
                r.display_name,
                r.student_id,
                r.status.as_str(),
                fmt_opt(&r.first_join),
                fmt_opt(&r.last_leave),
                fmt_opt(&r.last_return),
                r.in_meeting,
                r.leave_count,
                r.return_count,
                r.credited_secs,
                r.total_duration_secs,
                r.time_to_enter_secs,
                r.is_tardy,
                r.tardiness_count,
                r.synchronized,
                fmt_opt(&r.pending_since),
                r.finalized,
                fmt_opt(&r.finalized_at),
                r.excused,
                r.overridden_by,
                format_timestamp(&r.updated_at),
            ],
        )?;
        Ok(changed == 1)
    }

    fn advance_participant(&self, r: &ParticipantRecord) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE participants SET
                display_name = ?3,
                student_id = COALESCE(?4, student_id),
                status = ?5,
                first_join = COALESCE(first_join, ?6),
                last_leave = ?7,
                last_return = ?8,
                in_meeting = ?9,
                leave_count = ?10,
                return_count = ?11,
                credited_secs = ?12,
                total_duration_secs = ?13,
                time_to_enter_secs = ?14,
                is_tardy = ?15,
                tardiness_count = ?16,
                synchronized = MAX(synchronized, ?17),
                pending_since = ?18,
                updated_at = ?19
            WHERE session_id = ?1 AND user_id = ?2
              AND finalized = 0
              AND credited_secs <= ?12
              AND total_duration_secs <= ?13
              AND leave_count <= ?10
              AND return_count <= ?11
            "#,
            params![
                r.session_id.to_string(),
                r.user_id.as_str(),
                r.display_name,
                r.student_id,
                r.status.as_str(),
                fmt_opt(&r.first_join),
                fmt_opt(&r.last_leave),
                fmt_opt(&r.last_return),
                r.in_meeting,
                r.leave_count,
                r.return_count,
                r.credited_secs,
                r.total_duration_secs,
                r.time_to_enter_secs,
                r.is_tardy,
                r.tardiness_count,
                r.synchronized,
                fmt_opt(&r.pending_since),
                format_timestamp(&r.updated_at),
            ],
        )?;

        if changed == 0 {
            debug!(
                session_id = %r.session_id,
                user_id = %r.user_id,
                "Participant write rejected by guard"
            );
        }
        Ok(changed == 1)
    }

    fn finalize_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        outcome: &FinalOutcome,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE participants SET
                status = ?3, is_tardy = ?4, tardiness_count = ?5,
                in_meeting = 0, pending_since = NULL,
                finalized = 1, finalized_at = ?6, updated_at = ?6
            WHERE session_id = ?1 AND user_id = ?2 AND finalized = 0
            "#,
            params![
                session_id.to_string(),
                user_id.as_str(),
                outcome.status.as_str(),
                outcome.is_tardy,
                outcome.tardiness_count,
                format_timestamp(&now),
            ],
        )?;
        Ok(changed == 1)
    }

    fn override_participant(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        status: AttendanceStatus,
        excused: bool,
        by: &str,
        now: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE participants SET
                status = ?3, excused = ?4, overridden_by = ?5, updated_at = ?6
            WHERE session_id = ?1 AND user_id = ?2 AND finalized = 1
            "#,
            params![
                session_id.to_string(),
                user_id.as_str(),
                status.as_str(),
                excused,
                by,
                format_timestamp(&now),
            ],
        )?;
        Ok(changed == 1)
    }

    fn count_prior_tardies(
        &self,
        subject_id: &SubjectId,
        user_id: &UserId,
        excluding: &SessionId,
    ) -> StoreResult<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM participants p
            JOIN sessions s ON s.id = p.session_id
            WHERE s.subject_id = ?1
              AND p.user_id = ?2
              AND p.session_id != ?3
              AND p.finalized = 1
              AND p.excused = 0
              AND p.is_tardy = 1
              AND s.grace_period = 0
            "#,
            params![subject_id.as_str(), user_id.as_str(), excluding.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn find_token(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM tokens WHERE token = ?", TOKEN_COLUMNS);
        let record = conn
            .query_row(&sql, [token], |row| token_from_row(row))
            .optional()?;
        Ok(record)
    }

    fn find_token_for(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> StoreResult<Option<TokenRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM tokens WHERE session_id = ? AND user_id = ?",
            TOKEN_COLUMNS
        );
        let record = conn
            .query_row(
                &sql,
                params![session_id.to_string(), user_id.as_str()],
                |row| token_from_row(row),
            )
            .optional()?;
        Ok(record)
    }

    fn insert_token(&self, t: &TokenRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT INTO tokens ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            TOKEN_COLUMNS
        );
        conn.execute(
            &sql,
            params![
                t.token,
                t.session_id.to_string(),
                t.user_id.as_str(),
                t.subject_id.as_ref().map(|s| s.as_str()),
                format_timestamp(&t.valid_from),
                format_timestamp(&t.expires_at),
                t.consumed,
                fmt_opt(&t.consumed_at),
                t.consumed_by,
                format_timestamp(&t.created_at),
            ],
        )?;
        Ok(())
    }

    fn delete_token(&self, token: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM tokens WHERE token = ?", [token])?;
        Ok(changed == 1)
    }

    fn consume_token(&self, token: &str, by: &str, now: DateTime<Local>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tokens SET consumed = 1, consumed_at = ?2, consumed_by = ?3 \
             WHERE token = ?1 AND consumed = 0",
            params![token, format_timestamp(&now), by],
        )?;
        Ok(changed == 1)
    }

    fn expire_tokens_for_session(
        &self,
        session_id: &SessionId,
        now: DateTime<Local>,
    ) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE tokens SET expires_at = ?2 WHERE session_id = ?1",
            params![session_id.to_string(), format_timestamp(&now)],
        )?;
        let removed = tx.execute(
            "DELETE FROM tokens WHERE session_id = ?1",
            [session_id.to_string()],
        )?;
        tx.commit()?;

        debug!(session_id = %session_id, removed, "Tokens expired");
        Ok(removed)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![format_timestamp(&event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = parse_timestamp(&timestamp_str).unwrap_or_else(rollcall_util::now);
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
