use std::path::Path;

use anyhow::{Context, Result};
use tokio_rusqlite::Connection;

pub mod jobs;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open job database {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// A throwaway database, for simulation runs and tests.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;
    Ok(())
}
