use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::{Job, JobState, JobStatusEntry, JobWithHistory};

const LATEST_STATUS: &str = "COALESCE((SELECT status FROM job_status_log WHERE job_id = j.id \
     ORDER BY created_at DESC, id DESC LIMIT 1), 'Unknown')";

pub async fn create(
    conn: &Connection,
    job_id: String,
    operation: String,
    object_path: String,
    started_by: u32,
) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, operation, object_path, started_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![&job_id, &operation, &object_path, started_by],
        )?;

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, 'Job started')",
            params![log_id, &job_id, JobState::Running.as_str()],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        operation: row.get(1)?,
        object_path: row.get(2)?,
        started_by: row.get(3)?,
        created_at: row.get(4)?,
        status: row.get(5)?,
    })
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Job> {
    conn.call(move |c| {
        let sql = format!(
            "SELECT j.id, j.operation, j.object_path, j.started_by, j.created_at, {}
             FROM jobs j
             WHERE j.id = ?1",
            LATEST_STATUS
        );
        let mut stmt = c.prepare(&sql)?;
        stmt.query_row(params![job_id], job_from_row)
    })
    .await
    .map_err(|e| anyhow!("Failed to get job: {}", e))
}

pub async fn get_with_history(conn: &Connection, job_id: String) -> Result<JobWithHistory> {
    let job = get(conn, job_id.clone()).await?;
    let history = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT status, description, created_at
                 FROM job_status_log
                 WHERE job_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok(JobStatusEntry {
                    status: row.get(0)?,
                    description: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow!("Failed to get job history: {}", e))?;

    Ok(JobWithHistory { job, history })
}

/// Newest first. `status` filters on the latest recorded status.
pub async fn list(
    conn: &Connection,
    limit: u32,
    offset: u32,
    status: Option<String>,
) -> Result<Vec<Job>> {
    conn.call(move |c| {
        let sql = format!(
            "SELECT * FROM (
                SELECT j.id, j.operation, j.object_path, j.started_by, j.created_at, {} AS status
                FROM jobs j
             )
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            LATEST_STATUS
        );
        let mut stmt = c.prepare(&sql)?;
        let rows = stmt.query_map(params![status, limit, offset], job_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list jobs: {}", e))
}

pub async fn update_status(
    conn: &Connection,
    job_id: String,
    status: JobState,
    description: Option<String>,
) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_id, job_id, status.as_str(), description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn records_status_transitions() {
        let conn = db::init_in_memory().await.unwrap();
        create(
            &conn,
            "job-1".into(),
            "format-mkfs".into(),
            "/block_devices/sdb".into(),
            1000,
        )
        .await
        .unwrap();
        update_status(&conn, "job-1".into(), JobState::Failed, Some("boom".into()))
            .await
            .unwrap();

        let job = get_with_history(&conn, "job-1".into()).await.unwrap();
        assert_eq!(job.job.status, "Failed");
        assert_eq!(job.job.started_by, 1000);
        assert_eq!(job.history.len(), 2);
        assert_eq!(job.history[0].status, "Running");
        assert_eq!(job.history[1].description.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn list_filters_on_latest_status() {
        let conn = db::init_in_memory().await.unwrap();
        for id in ["a", "b"] {
            create(&conn, id.into(), "format-erase".into(), "/block_devices/sdb".into(), 0)
                .await
                .unwrap();
        }
        update_status(&conn, "a".into(), JobState::Completed, None)
            .await
            .unwrap();

        let all = list(&conn, 10, 0, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let done = list(&conn, 10, 0, Some("Completed".into())).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "a");
        assert!(get(&conn, "missing".into()).await.is_err());
    }
}
