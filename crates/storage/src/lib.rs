use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{
        CallType, ConversationId, ParticipantId, ParticipantStatus, SessionId, SessionState,
        UserId,
    },
    protocol::{CallParticipantRecord, CallSessionRecord, SessionView},
};

const SESSION_COLUMNS: &str =
    "id, conversation_id, call_type, state, initiator_id, created_at, updated_at, ended_at";
const PARTICIPANT_COLUMNS: &str = "id, session_id, user_id, status, created_at, updated_at";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Everything needed to open a call: the session row and its first participant rows.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub initiator_id: UserId,
    pub initiator_status: ParticipantStatus,
    pub initial_state: SessionState,
    pub invitees: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub enum SessionInsert {
    Created(SessionView),
    AlreadyActive(SessionId),
}

/// Outcome of an upsert keyed on (session_id, user_id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantWrite {
    Inserted(CallParticipantRecord),
    Updated(CallParticipantRecord),
    /// The guard did not match: nothing was written.
    Unchanged,
}

impl ParticipantWrite {
    pub fn record(&self) -> Option<&CallParticipantRecord> {
        match self {
            ParticipantWrite::Inserted(record) | ParticipantWrite::Updated(record) => Some(record),
            ParticipantWrite::Unchanged => None,
        }
    }
}

/// Extra predicate on the participant rows, evaluated in the same statement
/// as a session state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionGuard {
    Always,
    HasJoined,
    NoJoined,
    /// Nobody joined and no invitee other than the initiator is still pending.
    NoJoinedNoPendingInvitees,
}

impl SessionGuard {
    fn sql(self) -> &'static str {
        match self {
            SessionGuard::Always => "",
            SessionGuard::HasJoined => {
                " AND EXISTS (SELECT 1 FROM call_participants p
                              WHERE p.session_id = call_sessions.id AND p.status = 'joined')"
            }
            SessionGuard::NoJoined => {
                " AND NOT EXISTS (SELECT 1 FROM call_participants p
                                  WHERE p.session_id = call_sessions.id AND p.status = 'joined')"
            }
            SessionGuard::NoJoinedNoPendingInvitees => {
                " AND NOT EXISTS (SELECT 1 FROM call_participants p
                                  WHERE p.session_id = call_sessions.id AND p.status = 'joined')
                  AND NOT EXISTS (SELECT 1 FROM call_participants p
                                  WHERE p.session_id = call_sessions.id
                                    AND p.status IN ('invited', 'ringing')
                                    AND p.user_id <> call_sessions.initiator_id)"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalePendingParticipant {
    pub participant: CallParticipantRecord,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedCallNotice {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // In-memory databases live and die with their connection, so keep exactly one.
        let pool = if database_url.starts_with("sqlite::memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(connect_options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(connect_options)
                .await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn add_conversation_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_id, user_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_conversation_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM conversation_members WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Opens a session with its initiator and invitee rows in one transaction.
    /// The partial unique index turns a second live session for the same
    /// conversation into `SessionInsert::AlreadyActive`.
    pub async fn insert_session(&self, new: &NewSession, now: DateTime<Utc>) -> Result<SessionInsert> {
        for _ in 0..2 {
            let session_id = SessionId::new();
            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query(
                "INSERT INTO call_sessions (id, conversation_id, call_type, state, initiator_id, created_at, updated_at, ended_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(session_id.0.to_string())
            .bind(new.conversation_id.0)
            .bind(new.call_type.as_str())
            .bind(new.initial_state.as_str())
            .bind(new.initiator_id.0)
            .bind(millis(now))
            .bind(millis(now))
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tx.rollback().await?;
                    if let Some(live) = self.latest_live_session(new.conversation_id).await? {
                        return Ok(SessionInsert::AlreadyActive(live.session_id));
                    }
                    // The live session ended between our insert and the lookup.
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            let rows = std::iter::once((new.initiator_id, new.initiator_status)).chain(
                new.invitees
                    .iter()
                    .filter(|user_id| **user_id != new.initiator_id)
                    .map(|user_id| (*user_id, ParticipantStatus::Invited)),
            );
            for (user_id, status) in rows {
                sqlx::query(
                    "INSERT INTO call_participants (id, session_id, user_id, status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(session_id, user_id) DO NOTHING",
                )
                .bind(ParticipantId::new().0.to_string())
                .bind(session_id.0.to_string())
                .bind(user_id.0)
                .bind(status.as_str())
                .bind(millis(now))
                .bind(millis(now))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;

            let view = self
                .load_view(session_id)
                .await?
                .ok_or_else(|| anyhow!("session {session_id} vanished right after insert"))?;
            return Ok(SessionInsert::Created(view));
        }

        Err(anyhow!(
            "could not open a session for conversation {}: live session kept changing",
            new.conversation_id.0
        ))
    }

    pub async fn load_session(&self, session_id: SessionId) -> Result<Option<CallSessionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions WHERE id = ?"
        ))
        .bind(session_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn load_participants(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<CallParticipantRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM call_participants
             WHERE session_id = ?
             ORDER BY created_at ASC, user_id ASC"
        ))
        .bind(session_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(participant_from_row).collect()
    }

    pub async fn load_view(&self, session_id: SessionId) -> Result<Option<SessionView>> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(None);
        };
        let participants = self.load_participants(session_id).await?;
        Ok(Some(SessionView {
            session,
            participants,
        }))
    }

    pub async fn latest_live_session(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<CallSessionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions
             WHERE conversation_id = ? AND state IN ('dialing', 'active', 'cooldown')
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Insert-or-update the user's row to JOINED, only while the session is live.
    /// Already-joined rows are left untouched.
    pub async fn upsert_joined(
        &self,
        session_id: SessionId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<ParticipantWrite> {
        self.upsert_participant(
            session_id,
            user_id,
            ParticipantStatus::Joined,
            "call_participants.status <> 'joined'",
            now,
        )
        .await
    }

    /// Insert-or-update the user's row to INVITED. Rows that are joined or
    /// already ringing keep their status.
    pub async fn upsert_invited(
        &self,
        session_id: SessionId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<ParticipantWrite> {
        self.upsert_participant(
            session_id,
            user_id,
            ParticipantStatus::Invited,
            "call_participants.status IN ('rejected', 'timeout', 'left')",
            now,
        )
        .await
    }

    async fn upsert_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
        status: ParticipantStatus,
        update_guard: &str,
        now: DateTime<Utc>,
    ) -> Result<ParticipantWrite> {
        let candidate_id = ParticipantId::new();
        let row = sqlx::query(&format!(
            "INSERT INTO call_participants (id, session_id, user_id, status, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?5
             WHERE EXISTS (SELECT 1 FROM call_sessions WHERE id = ?2 AND state <> 'ended')
             ON CONFLICT(session_id, user_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
             WHERE {update_guard}
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(candidate_id.0.to_string())
        .bind(session_id.0.to_string())
        .bind(user_id.0)
        .bind(status.as_str())
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(ParticipantWrite::Unchanged);
        };
        let record = participant_from_row(&row)?;
        if record.participant_id == candidate_id {
            Ok(ParticipantWrite::Inserted(record))
        } else {
            Ok(ParticipantWrite::Updated(record))
        }
    }

    /// Conditional status change of one user's row: applies only when the row
    /// is currently in one of `from`.
    pub async fn transition_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<CallParticipantRecord>> {
        if from.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "UPDATE call_participants SET status = ?, updated_at = ?
             WHERE session_id = ? AND user_id = ? AND status IN ({})
             RETURNING {PARTICIPANT_COLUMNS}",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(millis(now))
            .bind(session_id.0.to_string())
            .bind(user_id.0);
        for status in from {
            query = query.bind(status.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    /// Bulk variant used when a session is force-ended.
    pub async fn transition_session_participants(
        &self,
        session_id: SessionId,
        from: &[ParticipantStatus],
        to: ParticipantStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<CallParticipantRecord>> {
        if from.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE call_participants SET status = ?, updated_at = ?
             WHERE session_id = ? AND status IN ({})
             RETURNING {PARTICIPANT_COLUMNS}",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(millis(now))
            .bind(session_id.0.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(participant_from_row).collect()
    }

    /// `UPDATE call_sessions SET state = to WHERE id = ? AND state IN (from) AND <guard>`.
    /// `None` means the precondition no longer held.
    pub async fn transition_session(
        &self,
        session_id: SessionId,
        from: &[SessionState],
        to: SessionState,
        guard: SessionGuard,
        now: DateTime<Utc>,
    ) -> Result<Option<CallSessionRecord>> {
        if from.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "UPDATE call_sessions SET state = ?, updated_at = ?, ended_at = ?
             WHERE id = ? AND state IN ({}){}
             RETURNING {SESSION_COLUMNS}",
            placeholders(from.len()),
            guard.sql()
        );
        let ended_at = (to == SessionState::Ended).then(|| millis(now));
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(millis(now))
            .bind(ended_at)
            .bind(session_id.0.to_string());
        for state in from {
            query = query.bind(state.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Pending rows (invited or ringing) untouched since `cutoff` in sessions
    /// that are still live. The initiator's own row of a dialing session is
    /// not an invite and is left to the lifecycle.
    pub async fn stale_pending_participants(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StalePendingParticipant>> {
        let rows = sqlx::query(
            "SELECT p.id, p.session_id, p.user_id, p.status, p.created_at, p.updated_at, s.conversation_id
             FROM call_participants p
             INNER JOIN call_sessions s ON s.id = p.session_id
             WHERE p.status IN ('invited', 'ringing') AND p.updated_at <= ? AND s.state <> 'ended'
               AND NOT (p.user_id = s.initiator_id AND s.state = 'dialing')
             ORDER BY p.updated_at ASC
             LIMIT ?",
        )
        .bind(millis(cutoff))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StalePendingParticipant {
                    participant: participant_from_row(row)?,
                    conversation_id: ConversationId(row.try_get::<i64, _>(6)?),
                })
            })
            .collect()
    }

    /// Moves one stale pending row to TIMEOUT and enqueues its missed-call
    /// notice in the same transaction. Returns `None` when another sweep (or
    /// the user) got there first.
    pub async fn timeout_pending_participant(
        &self,
        participant_id: ParticipantId,
        conversation_id: ConversationId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<CallParticipantRecord>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE call_participants SET status = 'timeout', updated_at = ?
             WHERE id = ? AND status IN ('invited', 'ringing') AND updated_at <= ?
             RETURNING {PARTICIPANT_COLUMNS}"
        ))
        .bind(millis(now))
        .bind(participant_id.0.to_string())
        .bind(millis(cutoff))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let record = participant_from_row(&row)?;

        sqlx::query(
            "INSERT INTO missed_call_notices (participant_id, session_id, conversation_id, user_id, created_at, delivered_at)
             VALUES (?, ?, ?, ?, ?, NULL)
             ON CONFLICT(participant_id) DO NOTHING",
        )
        .bind(record.participant_id.0.to_string())
        .bind(record.session_id.0.to_string())
        .bind(conversation_id.0)
        .bind(record.user_id.0)
        .bind(millis(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(record))
    }

    pub async fn undelivered_missed_call_notices(&self, limit: u32) -> Result<Vec<MissedCallNotice>> {
        let rows = sqlx::query(
            "SELECT participant_id, session_id, conversation_id, user_id, created_at
             FROM missed_call_notices
             WHERE delivered_at IS NULL
             ORDER BY created_at ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MissedCallNotice {
                    participant_id: ParticipantId(parse_uuid(&row.try_get::<String, _>(0)?)?),
                    session_id: SessionId(parse_uuid(&row.try_get::<String, _>(1)?)?),
                    conversation_id: ConversationId(row.try_get::<i64, _>(2)?),
                    user_id: UserId(row.try_get::<i64, _>(3)?),
                    created_at: from_millis(row.try_get::<i64, _>(4)?)?,
                })
            })
            .collect()
    }

    pub async fn mark_notice_delivered(
        &self,
        participant_id: ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE missed_call_notices SET delivered_at = ?
             WHERE participant_id = ? AND delivered_at IS NULL",
        )
        .bind(millis(now))
        .bind(participant_id.0.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn stale_cooldown_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CallSessionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions
             WHERE state = 'cooldown' AND updated_at <= ?
             ORDER BY updated_at ASC
             LIMIT ?"
        ))
        .bind(millis(cutoff))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Live sessions whose state contradicts their participant rows, e.g. an
    /// ACTIVE call nobody is joined to because a writer died before settling.
    pub async fn unsettled_live_sessions(&self, limit: u32) -> Result<Vec<CallSessionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions
             WHERE (state = 'active'{no_joined})
                OR (state IN ('dialing', 'cooldown'){has_joined})
                OR (state = 'dialing'{nobody_left})
             ORDER BY updated_at ASC
             LIMIT ?",
            no_joined = SessionGuard::NoJoined.sql(),
            has_joined = SessionGuard::HasJoined.sql(),
            nobody_left = SessionGuard::NoJoinedNoPendingInvitees.sql(),
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Ends a cooldown session whose grace window has run out. Re-checks the
    /// window and the absence of joined rows in the same statement, so a late
    /// rejoin always wins.
    pub async fn end_expired_cooldown(
        &self,
        session_id: SessionId,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<CallSessionRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE call_sessions SET state = 'ended', updated_at = ?1, ended_at = ?1
             WHERE id = ?2 AND state = 'cooldown' AND updated_at <= ?3{}
             RETURNING {SESSION_COLUMNS}",
            SessionGuard::NoJoined.sql()
        ))
        .bind(millis(now))
        .bind(session_id.0.to_string())
        .bind(millis(cutoff))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Deletes ended sessions older than `cutoff` together with their
    /// participant rows and notices. Returns the deleted session rows.
    pub async fn delete_ended_sessions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CallSessionRecord>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM missed_call_notices WHERE session_id IN (
                SELECT id FROM call_sessions WHERE state = 'ended' AND ended_at <= ?
             )",
        )
        .bind(millis(cutoff))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM call_participants WHERE session_id IN (
                SELECT id FROM call_sessions WHERE state = 'ended' AND ended_at <= ?
             )",
        )
        .bind(millis(cutoff))
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(&format!(
            "DELETE FROM call_sessions WHERE state = 'ended' AND ended_at <= ?
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(millis(cutoff))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(session_from_row).collect()
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(value: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .ok_or_else(|| anyhow!("timestamp {value} out of range"))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("invalid uuid '{value}' in store"))
}

fn session_from_row(row: &SqliteRow) -> Result<CallSessionRecord> {
    Ok(CallSessionRecord {
        session_id: SessionId(parse_uuid(&row.try_get::<String, _>(0)?)?),
        conversation_id: ConversationId(row.try_get::<i64, _>(1)?),
        call_type: row.try_get::<String, _>(2)?.parse()?,
        state: row.try_get::<String, _>(3)?.parse()?,
        initiator_id: UserId(row.try_get::<i64, _>(4)?),
        created_at: from_millis(row.try_get::<i64, _>(5)?)?,
        updated_at: from_millis(row.try_get::<i64, _>(6)?)?,
        ended_at: row
            .try_get::<Option<i64>, _>(7)?
            .map(from_millis)
            .transpose()?,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<CallParticipantRecord> {
    Ok(CallParticipantRecord {
        participant_id: ParticipantId(parse_uuid(&row.try_get::<String, _>(0)?)?),
        session_id: SessionId(parse_uuid(&row.try_get::<String, _>(1)?)?),
        user_id: UserId(row.try_get::<i64, _>(2)?),
        status: row.try_get::<String, _>(3)?.parse()?,
        created_at: from_millis(row.try_get::<i64, _>(4)?)?,
        updated_at: from_millis(row.try_get::<i64, _>(5)?)?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
