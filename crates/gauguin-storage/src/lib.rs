//! Gauguin Storage
//!
//! SQLite ledger of accepted channel photo posts and the per-day poll table

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

const POLL_COLUMNS: &str = "channel_id, poll_date, scheduled_at, posted_at, skipped_at, poll_message_id,
     chosen_post_message_id, question, options, last_error, last_error_at";

pub struct Storage {
    conn: rusqlite::Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRecord {
    pub channel_id: i64,
    pub message_id: i64,
    pub post_date: NaiveDate,
    pub photo_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyPoll {
    pub channel_id: i64,
    pub poll_date: NaiveDate,
    pub scheduled_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
    pub poll_message_id: Option<i64>,
    pub chosen_post_message_id: Option<i64>,
    pub question: Option<String>,
    pub options: Option<Vec<String>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl DailyPoll {
    pub fn is_terminal(&self) -> bool {
        self.posted_at.is_some() || self.skipped_at.is_some()
    }
}

/// Fixed-width UTC text so that SQL string comparison orders instants.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(idx, value)).transpose()
}

fn parse_date(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn post_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRecord> {
    Ok(PostRecord {
        channel_id: row.get(0)?,
        message_id: row.get(1)?,
        post_date: parse_date(2, row.get(2)?)?,
        photo_file_id: row.get(3)?,
        created_at: parse_ts(4, row.get(4)?)?,
    })
}

fn poll_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyPoll> {
    let options: Option<String> = row.get(8)?;
    let options = options
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw).map_err(|e| conversion_error(8, e)))
        .transpose()?;

    Ok(DailyPoll {
        channel_id: row.get(0)?,
        poll_date: parse_date(1, row.get(1)?)?,
        scheduled_at: parse_ts(2, row.get(2)?)?,
        posted_at: parse_opt_ts(3, row.get(3)?)?,
        skipped_at: parse_opt_ts(4, row.get(4)?)?,
        poll_message_id: row.get(5)?,
        chosen_post_message_id: row.get(6)?,
        question: row.get(7)?,
        options,
        last_error: row.get(9)?,
        last_error_at: parse_opt_ts(10, row.get(10)?)?,
    })
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                post_date TEXT NOT NULL,
                photo_file_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (channel_id, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_posts_channel_date
            ON posts(channel_id, post_date);

            CREATE TABLE IF NOT EXISTS daily_poll (
                channel_id INTEGER NOT NULL,
                poll_date TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                posted_at TEXT,
                skipped_at TEXT,
                poll_message_id INTEGER,
                chosen_post_message_id INTEGER,
                question TEXT,
                options TEXT,
                PRIMARY KEY (channel_id, poll_date)
            );
            ",
        )?;

        Self::ensure_ledger_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Deletes posts older than `retention_days`, but only while `today` has no
    /// posts yet: cleanup runs once, on the first post of a new day.
    pub fn prune_if_new_day(
        &self,
        today: NaiveDate,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM posts WHERE post_date = ?1 LIMIT 1",
                [format_date(&today)],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(0);
        }

        let cutoff = now - Duration::days(i64::from(retention_days));
        let deleted = self.conn.execute(
            "DELETE FROM posts WHERE created_at < ?1",
            [format_ts(&cutoff)],
        )?;
        Ok(deleted)
    }

    /// Returns `false` when the post was already recorded.
    pub fn record_post(
        &self,
        channel_id: i64,
        message_id: i64,
        post_date: NaiveDate,
        photo_file_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO posts (channel_id, message_id, post_date, photo_file_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(channel_id, message_id) DO NOTHING",
            (
                channel_id,
                message_id,
                format_date(&post_date),
                photo_file_id,
                format_ts(&now),
            ),
        )?;
        Ok(inserted > 0)
    }

    pub fn get_post(&self, channel_id: i64, message_id: i64) -> Result<Option<PostRecord>> {
        let post = self
            .conn
            .query_row(
                "SELECT channel_id, message_id, post_date, photo_file_id, created_at
                 FROM posts WHERE channel_id = ?1 AND message_id = ?2",
                (channel_id, message_id),
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    pub fn recent_posts(&self, limit: usize) -> Result<Vec<PostRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel_id, message_id, post_date, photo_file_id, created_at
             FROM posts
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], post_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_posts_for_date(&self, channel_id: i64, post_date: NaiveDate) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE channel_id = ?1 AND post_date = ?2",
            (channel_id, format_date(&post_date)),
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn pick_random_post(
        &self,
        channel_id: i64,
        post_date: NaiveDate,
    ) -> Result<Option<PostRecord>> {
        let post = self
            .conn
            .query_row(
                "SELECT channel_id, message_id, post_date, photo_file_id, created_at
                 FROM posts
                 WHERE channel_id = ?1 AND post_date = ?2
                 ORDER BY RANDOM()
                 LIMIT 1",
                (channel_id, format_date(&post_date)),
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    /// Insert-if-absent; returns `true` when a new row was created.
    pub fn ensure_daily_poll(
        &self,
        channel_id: i64,
        poll_date: NaiveDate,
        scheduled_at: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO daily_poll (channel_id, poll_date, scheduled_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id, poll_date) DO NOTHING",
            (channel_id, format_date(&poll_date), format_ts(&scheduled_at)),
        )?;
        Ok(inserted > 0)
    }

    pub fn get_daily_poll(&self, channel_id: i64, poll_date: NaiveDate) -> Result<Option<DailyPoll>> {
        let sql = format!(
            "SELECT {} FROM daily_poll WHERE channel_id = ?1 AND poll_date = ?2",
            POLL_COLUMNS
        );
        let poll = self
            .conn
            .query_row(&sql, (channel_id, format_date(&poll_date)), poll_from_row)
            .optional()?;
        Ok(poll)
    }

    /// Pending rows (neither posted nor skipped) scheduled at or before `now`.
    pub fn get_due_polls(&self, now: DateTime<Utc>) -> Result<Vec<DailyPoll>> {
        let sql = format!(
            "SELECT {} FROM daily_poll
             WHERE posted_at IS NULL
               AND skipped_at IS NULL
               AND scheduled_at <= ?1",
            POLL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([format_ts(&now)], poll_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn recent_polls(&self, limit: usize) -> Result<Vec<DailyPoll>> {
        let sql = format!(
            "SELECT {} FROM daily_poll ORDER BY poll_date DESC, channel_id LIMIT ?1",
            POLL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], poll_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Terminal transition; returns `false` if the row was already terminal or missing.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_poll_posted(
        &self,
        channel_id: i64,
        poll_date: NaiveDate,
        poll_message_id: i64,
        chosen_post_message_id: i64,
        question: &str,
        options: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let options_json = serde_json::to_string(options)
            .map_err(|e| anyhow!("Failed to encode poll options: {}", e))?;
        let changed = self.conn.execute(
            "UPDATE daily_poll
             SET posted_at = ?3,
                 poll_message_id = ?4,
                 chosen_post_message_id = ?5,
                 question = ?6,
                 options = ?7
             WHERE channel_id = ?1 AND poll_date = ?2
               AND posted_at IS NULL AND skipped_at IS NULL",
            (
                channel_id,
                format_date(&poll_date),
                format_ts(&now),
                poll_message_id,
                chosen_post_message_id,
                question,
                options_json,
            ),
        )?;
        Ok(changed > 0)
    }

    /// Terminal transition; returns `false` if the row was already terminal or missing.
    pub fn mark_poll_skipped(
        &self,
        channel_id: i64,
        poll_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE daily_poll
             SET skipped_at = ?3
             WHERE channel_id = ?1 AND poll_date = ?2
               AND posted_at IS NULL AND skipped_at IS NULL",
            (channel_id, format_date(&poll_date), format_ts(&now)),
        )?;
        Ok(changed > 0)
    }

    /// Annotates a pending row with the last failure; terminal rows are left alone.
    pub fn mark_poll_error(
        &self,
        channel_id: i64,
        poll_date: NaiveDate,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let message: String = message.chars().take(1000).collect();
        let changed = self.conn.execute(
            "UPDATE daily_poll
             SET last_error = ?3, last_error_at = ?4
             WHERE channel_id = ?1 AND poll_date = ?2
               AND posted_at IS NULL AND skipped_at IS NULL",
            (channel_id, format_date(&poll_date), message, format_ts(&now)),
        )?;
        Ok(changed > 0)
    }

    fn ensure_ledger_schema(conn: &rusqlite::Connection) -> Result<()> {
        let post_columns = Self::table_columns(conn, "posts")?;
        if !post_columns.iter().any(|c| c.eq_ignore_ascii_case("photo_file_id")) {
            conn.execute("ALTER TABLE posts ADD COLUMN photo_file_id TEXT", [])?;
        }

        let poll_columns = Self::table_columns(conn, "daily_poll")?;
        if !poll_columns.iter().any(|c| c.eq_ignore_ascii_case("last_error")) {
            conn.execute("ALTER TABLE daily_poll ADD COLUMN last_error TEXT", [])?;
        }
        if !poll_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case("last_error_at"))
        {
            conn.execute("ALTER TABLE daily_poll ADD COLUMN last_error_at TEXT", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_daily_poll_pending
             ON daily_poll(posted_at, skipped_at, scheduled_at)",
            [],
        )?;

        Ok(())
    }

    fn table_columns(conn: &rusqlite::Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut result = Vec::new();
        for col in columns {
            result.push(col?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::Storage;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use rusqlite::Connection;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("gauguin-storage-{}-{}.db", name, ts))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("valid instant")
    }

    #[test]
    fn record_post_is_idempotent_per_channel_message() {
        let path = temp_db_path("record");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);

        assert!(storage
            .record_post(-100, 10, day, Some("file-a"), at(2024, 1, 1, 8))
            .expect("first insert"));
        assert!(!storage
            .record_post(-100, 10, day, Some("file-b"), at(2024, 1, 1, 9))
            .expect("duplicate insert"));
        assert!(storage
            .record_post(-200, 10, day, None, at(2024, 1, 1, 9))
            .expect("other channel"));

        let post = storage.get_post(-100, 10).expect("query").expect("post");
        assert_eq!(post.photo_file_id.as_deref(), Some("file-a"));
        assert_eq!(storage.count_posts_for_date(-100, day).expect("count"), 1);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn prune_runs_only_before_first_post_of_the_day() {
        let path = temp_db_path("prune");
        let storage = Storage::new(&path).expect("storage init");
        let now = at(2024, 3, 1, 10);
        let old = now - Duration::days(40);

        storage
            .record_post(-100, 1, old.date_naive(), Some("old"), old)
            .expect("old post");

        let today = date(2024, 3, 1);
        storage
            .record_post(-100, 2, today, Some("today"), now)
            .expect("today post");
        assert_eq!(
            storage.prune_if_new_day(today, 30, now).expect("prune"),
            0,
            "a post for today already exists, cleanup must wait"
        );
        assert!(storage.get_post(-100, 1).expect("query").is_some());

        let tomorrow = date(2024, 3, 2);
        assert_eq!(
            storage
                .prune_if_new_day(tomorrow, 30, now + Duration::days(1))
                .expect("prune"),
            1
        );
        assert!(storage.get_post(-100, 1).expect("query").is_none());
        assert!(storage.get_post(-100, 2).expect("query").is_some());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn ensure_daily_poll_keeps_first_schedule() {
        let path = temp_db_path("ensure");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);

        assert!(storage
            .ensure_daily_poll(-100, day, at(2024, 1, 1, 10))
            .expect("insert"));
        assert!(!storage
            .ensure_daily_poll(-100, day, at(2024, 1, 1, 15))
            .expect("second insert"));

        let poll = storage
            .get_daily_poll(-100, day)
            .expect("query")
            .expect("row");
        assert_eq!(poll.scheduled_at, at(2024, 1, 1, 10));
        assert!(!poll.is_terminal());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn due_polls_exclude_future_and_terminal_rows() {
        let path = temp_db_path("due");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);

        storage
            .ensure_daily_poll(-100, day, at(2024, 1, 1, 10))
            .expect("due row");
        storage
            .ensure_daily_poll(-200, day, at(2024, 1, 1, 18))
            .expect("future row");
        storage
            .ensure_daily_poll(-300, day, at(2024, 1, 1, 9))
            .expect("skipped row");
        storage
            .mark_poll_skipped(-300, day, at(2024, 1, 1, 9))
            .expect("skip");

        let due = storage.get_due_polls(at(2024, 1, 1, 12)).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].channel_id, -100);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn terminal_poll_rows_are_never_rewritten() {
        let path = temp_db_path("terminal");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);
        storage
            .ensure_daily_poll(-100, day, at(2024, 1, 1, 10))
            .expect("row");

        let options = vec!["a".to_string(), "b".to_string()];
        assert!(storage
            .mark_poll_posted(-100, day, 900, 42, "Q?", &options, at(2024, 1, 1, 11))
            .expect("post"));
        assert!(!storage
            .mark_poll_skipped(-100, day, at(2024, 1, 1, 12))
            .expect("skip after post"));
        assert!(!storage
            .mark_poll_posted(-100, day, 901, 43, "Other?", &options, at(2024, 1, 1, 13))
            .expect("second post"));
        assert!(!storage
            .mark_poll_error(-100, day, "late failure", at(2024, 1, 1, 14))
            .expect("error after post"));

        let poll = storage
            .get_daily_poll(-100, day)
            .expect("query")
            .expect("row");
        assert_eq!(poll.posted_at, Some(at(2024, 1, 1, 11)));
        assert_eq!(poll.skipped_at, None);
        assert_eq!(poll.poll_message_id, Some(900));
        assert_eq!(poll.chosen_post_message_id, Some(42));
        assert_eq!(poll.question.as_deref(), Some("Q?"));
        assert_eq!(poll.options, Some(options));
        assert_eq!(poll.last_error, None);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn poll_error_annotation_keeps_row_pending() {
        let path = temp_db_path("error");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);
        storage
            .ensure_daily_poll(-100, day, at(2024, 1, 1, 10))
            .expect("row");

        assert!(storage
            .mark_poll_error(-100, day, "AI HTTP 502", at(2024, 1, 1, 11))
            .expect("annotate"));
        let poll = storage
            .get_daily_poll(-100, day)
            .expect("query")
            .expect("row");
        assert!(!poll.is_terminal());
        assert_eq!(poll.last_error.as_deref(), Some("AI HTTP 502"));
        assert_eq!(poll.last_error_at, Some(at(2024, 1, 1, 11)));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn pick_random_post_stays_within_channel_and_date() {
        let path = temp_db_path("random");
        let storage = Storage::new(&path).expect("storage init");
        let day = date(2024, 1, 1);
        for id in 100..105 {
            storage
                .record_post(-100, id, day, Some("f"), at(2024, 1, 1, 9))
                .expect("insert");
        }
        storage
            .record_post(-100, 999, date(2024, 1, 2), Some("f"), at(2024, 1, 2, 9))
            .expect("other day");
        storage
            .record_post(-200, 500, day, Some("f"), at(2024, 1, 1, 9))
            .expect("other channel");

        for _ in 0..20 {
            let post = storage
                .pick_random_post(-100, day)
                .expect("query")
                .expect("post");
            assert!((100..105).contains(&post.message_id));
        }
        assert!(storage
            .pick_random_post(-100, date(2024, 1, 3))
            .expect("query")
            .is_none());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn migrates_legacy_tables_without_photo_and_error_columns() {
        let path = temp_db_path("legacy");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "
            CREATE TABLE posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                post_date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (channel_id, message_id)
            );
            CREATE TABLE daily_poll (
                channel_id INTEGER NOT NULL,
                poll_date TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                posted_at TEXT,
                skipped_at TEXT,
                poll_message_id INTEGER,
                chosen_post_message_id INTEGER,
                question TEXT,
                options TEXT,
                PRIMARY KEY (channel_id, poll_date)
            );
            INSERT INTO posts (channel_id, message_id, post_date, created_at)
            VALUES (-100, 7, '2024-01-01', '2024-01-01T08:00:00Z');
            INSERT INTO daily_poll (channel_id, poll_date, scheduled_at)
            VALUES (-100, '2024-01-01', '2024-01-01T10:00:00Z');
            ",
        )
        .expect("seed legacy");
        drop(conn);

        let storage = Storage::new(&path).expect("migrated storage");
        let post = storage.get_post(-100, 7).expect("query").expect("post");
        assert_eq!(post.photo_file_id, None);
        let poll = storage
            .get_daily_poll(-100, date(2024, 1, 1))
            .expect("query")
            .expect("row");
        assert_eq!(poll.last_error, None);

        let _ = std::fs::remove_file(path);
    }
}
