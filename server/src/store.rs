//! Persistent state: users, submissions, matches and rating history.
//!
//! Backed by a single SQLite database. All access goes through [`Store`],
//! which wraps the connection in a mutex; that is plenty here because the
//! only long-lived writer is the submission worker, and everything it does
//! per statement is short. Readers (web handlers) take the same lock for
//! single quick queries.
//!
//! Invariants enforced at this layer:
//!
//! - at most one active submission per username (`ingest_submission`
//!   deactivates the rest in the same transaction);
//! - at most one valid match per unordered pair of submissions, enforced by
//!   a partial unique index on the normalized `(min, max)` pair;
//! - uploading a new submission invalidates every match of the user's prior
//!   submissions, monotonically.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use glicko2::Rating;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use time::OffsetDateTime;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    bio TEXT,
    link TEXT,
    public_key TEXT UNIQUE NOT NULL,
    created_at TIMESTAMP NOT NULL,
    last_login_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS submissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    filename TEXT NOT NULL,
    upload_time TIMESTAMP NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    is_active BOOLEAN NOT NULL DEFAULT 1,
    glicko_rating REAL NOT NULL DEFAULT 1500.0,
    glicko_rd REAL NOT NULL DEFAULT 350.0,
    glicko_volatility REAL NOT NULL DEFAULT 0.06
);

CREATE TABLE IF NOT EXISTS matches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    player1_id INTEGER NOT NULL REFERENCES submissions(id),
    player2_id INTEGER NOT NULL REFERENCES submissions(id),
    winner_id INTEGER NOT NULL REFERENCES submissions(id),
    player1_wins INTEGER NOT NULL DEFAULT 0,
    player2_wins INTEGER NOT NULL DEFAULT 0,
    player1_moves INTEGER,
    player2_moves INTEGER,
    is_valid BOOLEAN NOT NULL DEFAULT 1,
    timestamp TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS rating_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    submission_id INTEGER NOT NULL REFERENCES submissions(id),
    rating REAL NOT NULL,
    rd REAL NOT NULL,
    volatility REAL NOT NULL,
    match_id INTEGER REFERENCES matches(id),
    timestamp TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_player1 ON matches(player1_id);
CREATE INDEX IF NOT EXISTS idx_matches_player2 ON matches(player2_id);
CREATE INDEX IF NOT EXISTS idx_matches_valid ON matches(is_valid);
CREATE INDEX IF NOT EXISTS idx_submissions_username ON submissions(username);
CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);
CREATE INDEX IF NOT EXISTS idx_submissions_active ON submissions(is_active);
CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_unique_pair
    ON matches(MIN(player1_id, player2_id), MAX(player1_id, player2_id))
    WHERE is_valid = 1;
CREATE INDEX IF NOT EXISTS idx_rating_history_submission
    ON rating_history(submission_id, timestamp);
";

/// Lifecycle state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Uploaded, waiting for the worker.
    Pending,
    /// Currently being compiled/matched.
    Testing,
    /// Compiled; eligible as a rated opponent.
    Completed,
    /// Rejected by the compiler; never plays.
    CompilationFailed,
}

impl SubmissionStatus {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Testing => "testing",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::CompilationFailed => "compilation_failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "testing" => Some(SubmissionStatus::Testing),
            "completed" => Some(SubmissionStatus::Completed),
            "compilation_failed" => Some(SubmissionStatus::CompilationFailed),
            _ => None,
        }
    }
}

/// One submission row.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: i64,
    pub username: String,
    pub filename: String,
    pub upload_time: OffsetDateTime,
    pub status: SubmissionStatus,
    pub is_active: bool,
    pub rating: Rating,
}

/// One row of the public leaderboard.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub username: String,
    /// Glicko-2 rating, rounded for display.
    pub rating: i64,
    pub rd: i64,
    /// Total games won across all valid matches (1000 per match).
    pub wins: i64,
    pub losses: i64,
    pub win_pct: f64,
    pub avg_moves: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_played: OffsetDateTime,
    pub is_pending: bool,
}

/// A submission with its aggregated match statistics, for the per-user
/// history view where compilation failures are also visible.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionStats {
    pub id: i64,
    pub filename: String,
    #[serde(with = "time::serde::rfc3339")]
    pub upload_time: OffsetDateTime,
    pub status: SubmissionStatus,
    pub is_active: bool,
    pub rating: i64,
    pub rd: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_pct: f64,
    pub avg_moves: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_played: Option<OffsetDateTime>,
    pub has_matches: bool,
}

/// A finished match with usernames resolved, for the recent-matches view.
#[derive(Debug, Clone, Serialize)]
pub struct MatchSummary {
    pub player1: String,
    pub player2: String,
    pub winner: String,
    pub avg_moves: i64,
}

/// One audit point of a submission's rating after a match.
#[derive(Debug, Clone, Serialize)]
pub struct RatingHistoryPoint {
    pub rating: i64,
    pub rd: i64,
    pub volatility: f64,
    pub match_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A registered user. The public key is kept out of serialized output.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub bio: Option<String>,
    pub link: Option<String>,
    #[serde(skip)]
    pub public_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
}

/// Handle to the arena database; cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Store> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database {:?}", path.as_ref()))?;
        Self::init(conn)
    }

    /// Fresh in-memory database, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Store> {
        Self::init(Connection::open_in_memory().context("opening in-memory database")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Store> {
        // journal_mode returns a row, so it cannot go through execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .context("enabling WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("setting busy timeout")?;
        conn.execute_batch(SCHEMA).context("creating schema")?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- users ---------------------------------------------------------

    /// Register a user; fails on duplicate username or public key.
    pub fn create_user(
        &self,
        username: &str,
        name: &str,
        bio: &str,
        link: &str,
        public_key: &str,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock();
        let now = OffsetDateTime::now_utc();
        conn.execute(
            "INSERT INTO users (username, name, bio, link, public_key, created_at, last_login_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![username, name, bio, link, public_key, now],
        )
        .with_context(|| format!("creating user {username}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Look a user up by username.
    pub fn user_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, name, bio, link, public_key, created_at, last_login_at
             FROM users WHERE username = ?1",
            params![username],
            map_user,
        )
        .optional()
        .context("querying user by username")
    }

    /// Look a user up by (trimmed) public key.
    pub fn user_by_public_key(&self, public_key: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, username, name, bio, link, public_key, created_at, last_login_at
             FROM users WHERE TRIM(public_key) = ?1",
            params![public_key.trim()],
            map_user,
        )
        .optional()
        .context("querying user by public key")
    }

    /// Record a successful login.
    pub fn touch_last_login(&self, username: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login_at = ?1 WHERE username = ?2",
            params![OffsetDateTime::now_utc(), username],
        )
        .context("updating last login")?;
        Ok(())
    }

    /// All registered users, newest first.
    pub fn all_users(&self) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, name, bio, link, public_key, created_at, last_login_at
             FROM users ORDER BY created_at DESC",
        )?;
        let users = stmt
            .query_map([], map_user)?
            .collect::<Result<Vec<_>, _>>()
            .context("listing users")?;
        Ok(users)
    }

    // --- submissions ---------------------------------------------------

    /// Rotate a user's active submission: in one transaction, invalidate
    /// every match touching any of their prior submissions, deactivate
    /// those submissions, and insert the new one as pending with a fresh
    /// rating. Returns the new submission id.
    pub fn ingest_submission(&self, username: &str, filename: &str) -> anyhow::Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting ingest transaction")?;

        tx.execute(
            "UPDATE matches SET is_valid = 0
             WHERE player1_id IN (SELECT id FROM submissions WHERE username = ?1)
                OR player2_id IN (SELECT id FROM submissions WHERE username = ?1)",
            params![username],
        )
        .context("invalidating prior matches")?;

        tx.execute(
            "UPDATE submissions SET is_active = 0 WHERE username = ?1",
            params![username],
        )
        .context("deactivating prior submissions")?;

        tx.execute(
            "INSERT INTO submissions
                 (username, filename, upload_time, status, is_active,
                  glicko_rating, glicko_rd, glicko_volatility)
             VALUES (?1, ?2, ?3, 'pending', 1, ?4, ?5, ?6)",
            params![
                username,
                filename,
                OffsetDateTime::now_utc(),
                glicko2::DEFAULT_RATING,
                glicko2::DEFAULT_RD,
                glicko2::DEFAULT_VOLATILITY,
            ],
        )
        .context("inserting submission")?;

        let id = tx.last_insert_rowid();
        tx.commit().context("committing ingest")?;
        Ok(id)
    }

    /// Move a submission through its lifecycle.
    pub fn set_status(&self, id: i64, status: SubmissionStatus) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE submissions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .context("updating submission status")?;
        Ok(())
    }

    /// Active pending submissions in upload order (the worker's queue).
    pub fn pending_submissions(&self) -> anyhow::Result<Vec<Submission>> {
        self.submissions_where("status = 'pending' AND is_active = 1 ORDER BY upload_time")
    }

    /// Active completed submissions, ordered by username for deterministic
    /// round-robin scheduling.
    pub fn active_completed_submissions(&self) -> anyhow::Result<Vec<Submission>> {
        self.submissions_where("is_active = 1 AND status = 'completed' ORDER BY username")
    }

    fn submissions_where(&self, clause: &str) -> anyhow::Result<Vec<Submission>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, username, filename, upload_time, status, is_active,
                    glicko_rating, glicko_rd, glicko_volatility
             FROM submissions WHERE {clause}"
        ))?;
        let subs = stmt
            .query_map([], map_submission)?
            .collect::<Result<Vec<_>, _>>()
            .context("listing submissions")?;
        Ok(subs)
    }

    /// Usernames still waiting in the queue (pending or testing), in upload
    /// order.
    pub fn queued_player_names(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT username FROM submissions
             WHERE (status = 'pending' OR status = 'testing') AND is_active = 1
             ORDER BY upload_time",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()
            .context("listing queued players")?;
        Ok(names)
    }

    /// The current rating triple of a submission.
    pub fn submission_rating(&self, id: i64) -> anyhow::Result<Rating> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT glicko_rating, glicko_rd, glicko_volatility
             FROM submissions WHERE id = ?1",
            params![id],
            |row| {
                Ok(Rating {
                    rating: row.get(0)?,
                    rd: row.get(1)?,
                    volatility: row.get(2)?,
                })
            },
        )
        .with_context(|| format!("reading rating of submission {id}"))
    }

    /// Persist a new rating triple.
    pub fn update_rating(&self, id: i64, rating: Rating) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE submissions
             SET glicko_rating = ?1, glicko_rd = ?2, glicko_volatility = ?3
             WHERE id = ?4",
            params![rating.rating, rating.rd, rating.volatility, id],
        )
        .with_context(|| format!("updating rating of submission {id}"))?;
        Ok(())
    }

    // --- matches -------------------------------------------------------

    /// Whether a valid match exists between the unordered pair.
    pub fn has_valid_match_between(&self, a: i64, b: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM matches
                 WHERE is_valid = 1
                   AND ((player1_id = ?1 AND player2_id = ?2)
                     OR (player1_id = ?2 AND player2_id = ?1))",
                params![a, b],
                |row| row.get(0),
            )
            .context("checking match history")?;
        Ok(count > 0)
    }

    /// Insert a valid match. The caller must have checked
    /// [`has_valid_match_between`](Store::has_valid_match_between) first;
    /// inserting a second valid match for a pair violates the unique index
    /// and is a precondition violation, not a recoverable state.
    pub fn record_match(
        &self,
        player1_id: i64,
        player2_id: i64,
        winner_id: i64,
        player1_wins: u32,
        player2_wins: u32,
        player1_moves: u64,
        player2_moves: u64,
    ) -> anyhow::Result<i64> {
        assert!(
            winner_id == player1_id || winner_id == player2_id,
            "winner must be one of the players"
        );
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO matches
                 (player1_id, player2_id, winner_id, player1_wins, player2_wins,
                  player1_moves, player2_moves, is_valid, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                player1_id,
                player2_id,
                winner_id,
                player1_wins,
                player2_wins,
                player1_moves,
                player2_moves,
                OffsetDateTime::now_utc(),
            ],
        )
        .context("recording match")?;
        Ok(conn.last_insert_rowid())
    }

    /// All valid matches between active submissions, newest first.
    pub fn recent_matches(&self) -> anyhow::Result<Vec<MatchSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s1.username, s2.username, sw.username, m.player1_moves
             FROM matches m
             JOIN submissions s1 ON m.player1_id = s1.id
             JOIN submissions s2 ON m.player2_id = s2.id
             JOIN submissions sw ON m.winner_id = sw.id
             WHERE s1.is_active = 1 AND s2.is_active = 1 AND m.is_valid = 1
             ORDER BY m.timestamp DESC",
        )?;
        let matches = stmt
            .query_map([], |row| {
                Ok(MatchSummary {
                    player1: row.get(0)?,
                    player2: row.get(1)?,
                    winner: row.get(2)?,
                    avg_moves: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("listing matches")?;
        Ok(matches)
    }

    // --- rating history ------------------------------------------------

    /// Append an audit point for a submission's rating after a match.
    pub fn append_rating_history(
        &self,
        submission_id: i64,
        match_id: i64,
        rating: Rating,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rating_history
                 (submission_id, rating, rd, volatility, match_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                submission_id,
                rating.rating,
                rating.rd,
                rating.volatility,
                match_id,
                OffsetDateTime::now_utc(),
            ],
        )
        .context("appending rating history")?;
        Ok(())
    }

    /// Rating history of a user's active submission, oldest first.
    ///
    /// `None` when the user has no active submission, which the web layer
    /// maps to a 404.
    pub fn rating_history(&self, username: &str) -> anyhow::Result<Option<Vec<RatingHistoryPoint>>> {
        let conn = self.conn.lock();
        let submission_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM submissions WHERE username = ?1 AND is_active = 1",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .context("resolving active submission")?;
        let Some(submission_id) = submission_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT rating, rd, volatility, match_id, timestamp
             FROM rating_history
             WHERE submission_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let points = stmt
            .query_map(params![submission_id], |row| {
                Ok(RatingHistoryPoint {
                    rating: row.get::<_, f64>(0)?.round() as i64,
                    rd: row.get::<_, f64>(1)?.round() as i64,
                    volatility: row.get(2)?,
                    match_id: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("listing rating history")?;
        Ok(Some(points))
    }

    // --- aggregate views -----------------------------------------------

    /// The public leaderboard: rated entries first (rating desc, wins
    /// desc), then queued entries in upload order.
    pub fn leaderboard(&self, limit: usize) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.username,
                    s.glicko_rating AS rating,
                    s.glicko_rd AS rd,
                    COALESCE(SUM(CASE WHEN m.player1_id = s.id THEN m.player1_wins
                                      WHEN m.player2_id = s.id THEN m.player2_wins
                                      ELSE 0 END), 0) AS total_wins,
                    COALESCE(SUM(CASE WHEN m.player1_id = s.id THEN m.player2_wins
                                      WHEN m.player2_id = s.id THEN m.player1_wins
                                      ELSE 0 END), 0) AS total_losses,
                    COALESCE(AVG(CASE WHEN m.player1_id = s.id THEN m.player1_moves
                                      ELSE m.player2_moves END), 0.0) AS avg_moves,
                    COALESCE(MAX(m.timestamp), s.upload_time) AS last_played,
                    0 AS is_pending
             FROM submissions s
             LEFT JOIN matches m
                    ON (m.player1_id = s.id OR m.player2_id = s.id) AND m.is_valid = 1
             WHERE s.is_active = 1 AND s.status = 'completed'
             GROUP BY s.id

             UNION ALL

             SELECT s.username, ?2, ?3, 0, 0, 0.0, s.upload_time, 1
             FROM submissions s
             WHERE s.is_active = 1 AND s.status IN ('pending', 'testing')

             ORDER BY is_pending ASC, rating DESC, total_wins DESC, last_played ASC
             LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(
                params![limit as i64, glicko2::DEFAULT_RATING, glicko2::DEFAULT_RD],
                |row| {
                    let wins: i64 = row.get(3)?;
                    let losses: i64 = row.get(4)?;
                    Ok(LeaderboardEntry {
                        username: row.get(0)?,
                        rating: row.get::<_, f64>(1)?.round() as i64,
                        rd: row.get::<_, f64>(2)?.round() as i64,
                        wins,
                        losses,
                        win_pct: win_pct(wins, losses),
                        avg_moves: row.get(5)?,
                        last_played: row.get(6)?,
                        is_pending: row.get::<_, i64>(7)? == 1,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("building leaderboard")?;
        Ok(entries)
    }

    /// A user's last 10 submissions with aggregated stats, newest first.
    /// Compilation failures are visible here (unlike the leaderboard).
    pub fn user_submissions(&self, username: &str) -> anyhow::Result<Vec<SubmissionStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.filename, s.upload_time, s.status, s.is_active,
                    s.glicko_rating, s.glicko_rd,
                    COALESCE(SUM(CASE WHEN m.player1_id = s.id THEN m.player1_wins
                                      WHEN m.player2_id = s.id THEN m.player2_wins
                                      ELSE 0 END), 0) AS total_wins,
                    COALESCE(SUM(CASE WHEN m.player1_id = s.id THEN m.player2_wins
                                      WHEN m.player2_id = s.id THEN m.player1_wins
                                      ELSE 0 END), 0) AS total_losses,
                    COALESCE(AVG(CASE WHEN m.player1_id = s.id THEN m.player1_moves
                                      ELSE m.player2_moves END), 0.0) AS avg_moves,
                    MAX(m.timestamp) AS last_played,
                    COUNT(m.id) AS match_count
             FROM submissions s
             LEFT JOIN matches m
                    ON (m.player1_id = s.id OR m.player2_id = s.id) AND m.is_valid = 1
             WHERE s.username = ?1
             GROUP BY s.id
             ORDER BY s.upload_time DESC
             LIMIT 10",
        )?;
        let subs = stmt
            .query_map(params![username], |row| {
                let status_str: String = row.get(3)?;
                let status = parse_status(&status_str, 3)?;
                let wins: i64 = row.get(7)?;
                let losses: i64 = row.get(8)?;
                Ok(SubmissionStats {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    upload_time: row.get(2)?,
                    status,
                    is_active: row.get(4)?,
                    rating: row.get::<_, f64>(5)?.round() as i64,
                    rd: row.get::<_, f64>(6)?.round() as i64,
                    wins,
                    losses,
                    win_pct: win_pct(wins, losses),
                    avg_moves: row.get(9)?,
                    last_played: row.get(10)?,
                    has_matches: row.get::<_, i64>(11)? > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("listing user submissions")?;
        Ok(subs)
    }
}

fn win_pct(wins: i64, losses: i64) -> f64 {
    let total = wins + losses;
    if total > 0 {
        wins as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn parse_status(s: &str, column: usize) -> rusqlite::Result<SubmissionStatus> {
    SubmissionStatus::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            format!("unknown submission status '{s}'").into(),
        )
    })
}

fn map_submission(row: &Row<'_>) -> rusqlite::Result<Submission> {
    let status_str: String = row.get(4)?;
    Ok(Submission {
        id: row.get(0)?,
        username: row.get(1)?,
        filename: row.get(2)?,
        upload_time: row.get(3)?,
        status: parse_status(&status_str, 4)?,
        is_active: row.get(5)?,
        rating: Rating {
            rating: row.get(6)?,
            rd: row.get(7)?,
            volatility: row.get(8)?,
        },
    })
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        name: row.get(2)?,
        bio: row.get(3)?,
        link: row.get(4)?,
        public_key: row.get(5)?,
        created_at: row.get(6)?,
        last_login_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn ingest_keeps_one_active_submission_per_user() {
        let store = store();
        let first = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let second = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        assert_ne!(first, second);

        let pending = store.pending_submissions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert!(pending[0].is_active);
    }

    #[test]
    fn ingest_invalidates_prior_matches() {
        let store = store();
        let alice = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let bob = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        store.record_match(alice, bob, alice, 600, 400, 98, 98).unwrap();
        assert!(store.has_valid_match_between(alice, bob).unwrap());

        store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        assert!(!store.has_valid_match_between(alice, bob).unwrap());
    }

    #[test]
    fn valid_pair_is_unique_even_with_roles_swapped() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let b = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        store.record_match(a, b, a, 600, 400, 98, 98).unwrap();
        assert!(store.record_match(b, a, b, 500, 500, 97, 97).is_err());
    }

    #[test]
    fn invalidated_pair_can_be_replayed() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let b = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        store.record_match(a, b, a, 600, 400, 98, 98).unwrap();

        let a2 = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        store.record_match(a2, b, b, 400, 600, 98, 98).unwrap();
        assert!(store.has_valid_match_between(a2, b).unwrap());
    }

    #[test]
    fn pending_queue_is_fifo() {
        let store = store();
        store
            .ingest_submission("carol", "memory_functions_carol.cpp")
            .unwrap();
        store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let pending = store.pending_submissions().unwrap();
        let names: Vec<_> = pending.iter().map(|s| s.username.as_str()).collect();
        assert_eq!(names, ["carol", "alice"]);
    }

    #[test]
    fn active_completed_ordered_by_username() {
        let store = store();
        let c = store
            .ingest_submission("carol", "memory_functions_carol.cpp")
            .unwrap();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        store.set_status(c, SubmissionStatus::Completed).unwrap();
        store.set_status(a, SubmissionStatus::Completed).unwrap();

        let subs = store.active_completed_submissions().unwrap();
        let names: Vec<_> = subs.iter().map(|s| s.username.as_str()).collect();
        assert_eq!(names, ["alice", "carol"]);
    }

    #[test]
    fn leaderboard_orders_rated_before_pending() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let b = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        store.set_status(a, SubmissionStatus::Completed).unwrap();
        store.set_status(b, SubmissionStatus::Completed).unwrap();
        store.record_match(b, a, b, 700, 300, 98, 98).unwrap();
        store.update_rating(b, Rating { rating: 1600.0, rd: 250.0, volatility: 0.06 }).unwrap();
        store.update_rating(a, Rating { rating: 1400.0, rd: 250.0, volatility: 0.06 }).unwrap();
        store
            .ingest_submission("carol", "memory_functions_carol.cpp")
            .unwrap();

        let entries = store.leaderboard(50).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].username, "bob");
        assert_eq!(entries[0].wins, 700);
        assert_eq!(entries[0].losses, 300);
        assert_eq!(entries[1].username, "alice");
        assert_eq!(entries[2].username, "carol");
        assert!(entries[2].is_pending);
        assert!(!entries[0].is_pending);

        // Ratings non-increasing within the rated block.
        assert!(entries[0].rating >= entries[1].rating);
    }

    #[test]
    fn leaderboard_shows_completed_submission_with_zero_games() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        store.set_status(a, SubmissionStatus::Completed).unwrap();

        let entries = store.leaderboard(50).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_pending);
        assert_eq!(entries[0].wins, 0);
        assert_eq!(entries[0].rating, 1500);
    }

    #[test]
    fn leaderboard_hides_compilation_failures() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        store
            .set_status(a, SubmissionStatus::CompilationFailed)
            .unwrap();
        assert!(store.leaderboard(50).unwrap().is_empty());

        // But the richer per-user list shows it.
        let subs = store.user_submissions("alice").unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].status, SubmissionStatus::CompilationFailed);
    }

    #[test]
    fn rating_history_404_semantics() {
        let store = store();
        assert!(store.rating_history("ghost").unwrap().is_none());

        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let b = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        let match_id = store.record_match(a, b, a, 600, 400, 98, 98).unwrap();
        let rating = Rating { rating: 1550.0, rd: 200.0, volatility: 0.06 };
        store.append_rating_history(a, match_id, rating).unwrap();

        let history = store.rating_history("alice").unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].rating, 1550);
        assert_eq!(history[0].match_id, Some(match_id));
    }

    #[test]
    fn queued_player_names_in_upload_order() {
        let store = store();
        let a = store
            .ingest_submission("zoe", "memory_functions_zoe.cpp")
            .unwrap();
        store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        store.set_status(a, SubmissionStatus::Testing).unwrap();
        assert_eq!(store.queued_player_names().unwrap(), ["zoe", "alice"]);
    }

    #[test]
    fn users_roundtrip() {
        let store = store();
        store
            .create_user("alice", "Alice", "", "", "ssh-ed25519 AAAA alice")
            .unwrap();
        assert!(store.user_by_username("alice").unwrap().is_some());
        assert!(store.user_by_username("bob").unwrap().is_none());
        assert!(store
            .user_by_public_key(" ssh-ed25519 AAAA alice ")
            .unwrap()
            .is_some());
        assert!(store.create_user("alice", "A", "", "", "other-key").is_err());

        store.touch_last_login("alice").unwrap();
        let users = store.all_users().unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].last_login_at.is_some());
    }

    #[test]
    fn recent_matches_resolve_usernames() {
        let store = store();
        let a = store
            .ingest_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        let b = store
            .ingest_submission("bob", "memory_functions_bob.cpp")
            .unwrap();
        store.record_match(a, b, b, 400, 600, 97, 97).unwrap();

        let matches = store.recent_matches().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].player1, "alice");
        assert_eq!(matches[0].player2, "bob");
        assert_eq!(matches[0].winner, "bob");
        assert_eq!(matches[0].avg_moves, 97);
    }
}
