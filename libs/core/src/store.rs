//! SQLite-backed store for jobs, inbound artifacts, and the provider-event
//! idempotency ledger. Access is serialized behind a mutex; every call is a
//! short read-modify-write, so last-write-wins at the record level.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;

use crate::error::FaxError;
use crate::job::{InboundArtifact, JobStatus, OutboundJob};
use crate::sanitize::sanitize_error;

#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS fax_jobs (
    id TEXT PRIMARY KEY,
    to_number TEXT NOT NULL,
    original_path TEXT NOT NULL,
    pdf_path TEXT NOT NULL,
    tiff_path TEXT,
    status TEXT NOT NULL,
    backend TEXT NOT NULL,
    provider_sid TEXT,
    pages INTEGER,
    error TEXT,
    pdf_url TEXT,
    pdf_token TEXT,
    pdf_token_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fax_jobs_provider_sid ON fax_jobs(provider_sid);

CREATE TABLE IF NOT EXISTS inbound_faxes (
    id TEXT PRIMARY KEY,
    from_number TEXT,
    to_number TEXT,
    status TEXT NOT NULL,
    backend TEXT NOT NULL,
    provider_sid TEXT,
    pages INTEGER,
    size_bytes INTEGER,
    sha256 TEXT,
    pdf_uri TEXT,
    retention_until INTEGER,
    pdf_token TEXT,
    pdf_token_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS provider_events (
    id TEXT PRIMARY KEY,
    provider_sid TEXT NOT NULL,
    event_type TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(provider_sid, event_type)
);
";

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FaxError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, FaxError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, FaxError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert_job(&self, job: &OutboundJob) -> Result<(), FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO fax_jobs (id, to_number, original_path, pdf_path, tiff_path, status,
                 backend, provider_sid, pages, error, pdf_url, pdf_token, pdf_token_expires_at,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                job.id,
                job.to_number,
                job.original_path,
                job.pdf_path,
                job.tiff_path,
                job.status.as_str(),
                job.backend,
                job.provider_sid,
                job.pages,
                job.error,
                job.pdf_url,
                job.pdf_token,
                job.pdf_token_expires_at.map(OffsetDateTime::unix_timestamp),
                job.created_at.unix_timestamp(),
                job.updated_at.unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<OutboundJob>, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let job = conn
            .query_row(
                "SELECT id, to_number, original_path, pdf_path, tiff_path, status, backend,
                        provider_sid, pages, error, pdf_url, pdf_token, pdf_token_expires_at,
                        created_at, updated_at
                 FROM fax_jobs WHERE id = ?1",
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn find_job_by_provider_sid(&self, sid: &str) -> Result<Option<OutboundJob>, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let job = conn
            .query_row(
                "SELECT id, to_number, original_path, pdf_path, tiff_path, status, backend,
                        provider_sid, pages, error, pdf_url, pdf_token, pdf_token_expires_at,
                        created_at, updated_at
                 FROM fax_jobs WHERE provider_sid = ?1 ORDER BY created_at DESC LIMIT 1",
                params![sid],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Applies a status transition with the monotonicity guard: once a job is
    /// terminal, automated transitions are silently ignored (`Ok(false)`).
    /// Operator-initiated transitions bypass the guard.
    pub fn apply_status(&self, update: &JobUpdate<'_>) -> Result<bool, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM fax_jobs WHERE id = ?1",
                params![update.job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        let terminal = JobStatus::parse(&current).is_some_and(|s| s.is_terminal());
        if terminal && !update.operator {
            tracing::debug!(
                job_id = %update.job_id,
                current = %current,
                requested = %update.status.as_str(),
                "ignoring transition out of terminal state"
            );
            return Ok(false);
        }
        let error = update.error.map(sanitize_error);
        conn.execute(
            "UPDATE fax_jobs SET status = ?2,
                 provider_sid = COALESCE(?3, provider_sid),
                 pages = COALESCE(?4, pages),
                 error = COALESCE(?5, error),
                 updated_at = ?6
             WHERE id = ?1",
            params![
                update.job_id,
                update.status.as_str(),
                update.provider_sid,
                update.pages,
                error,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        )?;
        Ok(true)
    }

    /// Attaches the tokenized artifact URL handed to cloud vendors.
    pub fn attach_job_token(
        &self,
        job_id: &str,
        token: &str,
        expires_at: OffsetDateTime,
        pdf_url: &str,
    ) -> Result<(), FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "UPDATE fax_jobs SET pdf_token = ?2, pdf_token_expires_at = ?3, pdf_url = ?4,
                 updated_at = ?5
             WHERE id = ?1",
            params![
                job_id,
                token,
                expires_at.unix_timestamp(),
                pdf_url,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_inbound(&self, artifact: &InboundArtifact) -> Result<(), FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT INTO inbound_faxes (id, from_number, to_number, status, backend, provider_sid,
                 pages, size_bytes, sha256, pdf_uri, retention_until, pdf_token,
                 pdf_token_expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                artifact.id,
                artifact.from_number,
                artifact.to_number,
                artifact.status,
                artifact.backend,
                artifact.provider_sid,
                artifact.pages,
                artifact.size_bytes.map(|v| v as i64),
                artifact.sha256,
                artifact.pdf_uri,
                artifact.retention_until.map(OffsetDateTime::unix_timestamp),
                artifact.pdf_token,
                artifact.pdf_token_expires_at.map(OffsetDateTime::unix_timestamp),
                artifact.created_at.unix_timestamp(),
                artifact.updated_at.unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_inbound(&self, id: &str) -> Result<Option<InboundArtifact>, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let artifact = conn
            .query_row(
                "SELECT id, from_number, to_number, status, backend, provider_sid, pages,
                        size_bytes, sha256, pdf_uri, retention_until, pdf_token,
                        pdf_token_expires_at, created_at, updated_at
                 FROM inbound_faxes WHERE id = ?1",
                params![id],
                row_to_inbound,
            )
            .optional()?;
        Ok(artifact)
    }

    pub fn list_inbound(&self, limit: u32, offset: u32) -> Result<Vec<InboundArtifact>, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let mut stmt = conn.prepare(
            "SELECT id, from_number, to_number, status, backend, provider_sid, pages,
                    size_bytes, sha256, pdf_uri, retention_until, pdf_token,
                    pdf_token_expires_at, created_at, updated_at
             FROM inbound_faxes ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], row_to_inbound)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_inbound(&self) -> Result<u64, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM inbound_faxes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Idempotency claim for provider-delivered events. Insertion of the
    /// (provider event id, event type) pair authorizes processing; a
    /// uniqueness violation means the event was already handled.
    pub fn claim_event(&self, provider_sid: &str, event_type: &str) -> Result<bool, FaxError> {
        let conn = self.conn.lock().expect("store mutex");
        let result = conn.execute(
            "INSERT INTO provider_events (id, provider_sid, event_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                crate::new_record_id(),
                provider_sid,
                event_type,
                OffsetDateTime::now_utc().unix_timestamp(),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// One status transition request against the store.
pub struct JobUpdate<'a> {
    pub job_id: &'a str,
    pub status: JobStatus,
    pub provider_sid: Option<&'a str>,
    pub pages: Option<u32>,
    pub error: Option<&'a str>,
    /// Explicit operator action may leave a terminal state; automated
    /// transitions may not.
    pub operator: bool,
}

impl<'a> JobUpdate<'a> {
    pub fn automated(job_id: &'a str, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            provider_sid: None,
            pages: None,
            error: None,
            operator: false,
        }
    }

    pub fn with_provider_sid(mut self, sid: &'a str) -> Self {
        self.provider_sid = Some(sid);
        self
    }

    pub fn with_pages(mut self, pages: u32) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }
}

fn timestamp(value: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(value).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundJob> {
    let status: String = row.get(5)?;
    Ok(OutboundJob {
        id: row.get(0)?,
        to_number: row.get(1)?,
        original_path: row.get(2)?,
        pdf_path: row.get(3)?,
        tiff_path: row.get(4)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        backend: row.get(6)?,
        provider_sid: row.get(7)?,
        pages: row.get(8)?,
        error: row.get(9)?,
        pdf_url: row.get(10)?,
        pdf_token: row.get(11)?,
        pdf_token_expires_at: row.get::<_, Option<i64>>(12)?.map(timestamp),
        created_at: timestamp(row.get(13)?),
        updated_at: timestamp(row.get(14)?),
    })
}

fn row_to_inbound(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboundArtifact> {
    Ok(InboundArtifact {
        id: row.get(0)?,
        from_number: row.get(1)?,
        to_number: row.get(2)?,
        status: row.get(3)?,
        backend: row.get(4)?,
        provider_sid: row.get(5)?,
        pages: row.get(6)?,
        size_bytes: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        sha256: row.get(8)?,
        pdf_uri: row.get(9)?,
        retention_until: row.get::<_, Option<i64>>(10)?.map(timestamp),
        pdf_token: row.get(11)?,
        pdf_token_expires_at: row.get::<_, Option<i64>>(12)?.map(timestamp),
        created_at: timestamp(row.get(13)?),
        updated_at: timestamp(row.get(14)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str) -> OutboundJob {
        OutboundJob::new(
            id.into(),
            "+15551234567".into(),
            format!("/tmp/{id}-doc.pdf"),
            format!("/tmp/{id}.pdf"),
            "phaxio".into(),
        )
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        store.insert_job(&sample_job("a1")).unwrap();
        let job = store.get_job("a1").unwrap().expect("job");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.backend, "phaxio");
        assert!(store.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn terminal_status_is_monotonic() {
        let store = JobStore::open_in_memory().unwrap();
        store.insert_job(&sample_job("a2")).unwrap();
        assert!(store
            .apply_status(&JobUpdate::automated("a2", JobStatus::Failed).with_error("boom"))
            .unwrap());
        // Automated transition out of FAILED is refused.
        assert!(!store
            .apply_status(&JobUpdate::automated("a2", JobStatus::InProgress))
            .unwrap());
        assert_eq!(store.get_job("a2").unwrap().unwrap().status, JobStatus::Failed);
        // Operator action may leave the terminal state.
        let mut op = JobUpdate::automated("a2", JobStatus::Queued);
        op.operator = true;
        assert!(store.apply_status(&op).unwrap());
        assert_eq!(store.get_job("a2").unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn persisted_errors_are_sanitized() {
        let store = JobStore::open_in_memory().unwrap();
        store.insert_job(&sample_job("a3")).unwrap();
        store
            .apply_status(
                &JobUpdate::automated("a3", JobStatus::Failed)
                    .with_error("vendor rejected +15551234567 hard"),
            )
            .unwrap();
        let error = store.get_job("a3").unwrap().unwrap().error.unwrap();
        assert!(!error.contains("15551234567"));
        assert!(error.len() <= 80);
    }

    #[test]
    fn event_claim_is_unique_per_sid_and_type() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(store.claim_event("999", "phaxio-inbound").unwrap());
        assert!(!store.claim_event("999", "phaxio-inbound").unwrap());
        // Same sid, different event type is a distinct claim.
        assert!(store.claim_event("999", "phaxio-status").unwrap());
    }

    #[test]
    fn lookup_by_provider_sid() {
        let store = JobStore::open_in_memory().unwrap();
        store.insert_job(&sample_job("a4")).unwrap();
        store
            .apply_status(
                &JobUpdate::automated("a4", JobStatus::InProgress).with_provider_sid("sid-77"),
            )
            .unwrap();
        let found = store.find_job_by_provider_sid("sid-77").unwrap().unwrap();
        assert_eq!(found.id, "a4");
    }
}
