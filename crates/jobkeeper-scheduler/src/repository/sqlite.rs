use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{types::Value, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use super::{JobRepository, Update};
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobStatus, LeaseRecord};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed repository, shareable between processes through the
/// database file.
///
/// Read-modify-write operations run inside `BEGIN IMMEDIATE` transactions so
/// the write lock is taken before the read, which makes them a real
/// compare-and-set across processes.
pub struct SqliteJobRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobRepository {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Repository("connection mutex poisoned".to_string()))
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let record: Option<String> = conn
        .query_row("SELECT record FROM jobs WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(record.map(|json| serde_json::from_str(&json)).transpose()?)
}

fn store_job(conn: &Connection, job: &Job) -> Result<()> {
    let record = serde_json::to_string(job)?;
    conn.execute(
        "INSERT INTO jobs (id, correlation_id, status, priority, due_at, last_update, record)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            correlation_id = excluded.correlation_id,
            status         = excluded.status,
            priority       = excluded.priority,
            due_at         = excluded.due_at,
            last_update    = excluded.last_update,
            record         = excluded.record",
        rusqlite::params![
            job.id,
            job.correlation_id,
            job.status.to_string(),
            job.priority,
            job.due_at().map(to_millis),
            to_millis(job.last_update),
            record,
        ],
    )?;
    Ok(())
}

fn load_lease(conn: &Connection, id: &str) -> Result<Option<LeaseRecord>> {
    let lease = conn
        .query_row(
            "SELECT id, token, last_heartbeat FROM leases WHERE id = ?1",
            [id],
            |row| {
                Ok(LeaseRecord {
                    id: row.get(0)?,
                    token: row.get(1)?,
                    last_heartbeat: row.get::<_, Option<i64>>(2)?.and_then(from_millis),
                })
            },
        )
        .optional()?;
    Ok(lease)
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        load_job(&conn, id)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn()?;
        store_job(&conn, job)
    }

    async fn update_job(&self, id: &str, update: Update<'_, Job>) -> Result<Option<Job>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = update(load_job(&tx, id)?);
        if let Some(ref job) = next {
            store_job(&tx, job)?;
        }
        tx.commit()?;
        Ok(next)
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    async fn find_due(
        &self,
        statuses: &[JobStatus],
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let mut params: Vec<Value> = statuses
            .iter()
            .map(|s| Value::Text(s.to_string()))
            .collect();
        params.push(Value::Integer(to_millis(to)));
        params.push(Value::Integer(
            from.map(to_millis).unwrap_or(i64::MIN),
        ));
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT id, record FROM jobs
             WHERE status IN ({placeholders})
               AND due_at IS NOT NULL AND due_at <= ? AND due_at >= ?
             ORDER BY due_at ASC, priority DESC
             LIMIT ?"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .filter_map(|r| {
                let (id, json) = match r {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("skipping unreadable job row: {e}");
                        return None;
                    }
                };
                match serde_json::from_str::<Job>(&json) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(job_id = %id, "skipping unreadable job record: {e}");
                        None
                    }
                }
            })
            .collect();
        Ok(jobs)
    }

    async fn get_lease(&self, id: &str) -> Result<Option<LeaseRecord>> {
        let conn = self.conn()?;
        load_lease(&conn, id)
    }

    async fn get_and_update_lease(
        &self,
        id: &str,
        update: Update<'_, LeaseRecord>,
    ) -> Result<Option<LeaseRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let next = update(load_lease(&tx, id)?);
        if let Some(ref lease) = next {
            tx.execute(
                "INSERT INTO leases (id, token, last_heartbeat) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    token = excluded.token,
                    last_heartbeat = excluded.last_heartbeat",
                rusqlite::params![id, lease.token, lease.last_heartbeat.map(to_millis)],
            )?;
        }
        tx.commit()?;
        Ok(next)
    }
}
