use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;

pub mod locks;

/// Open (creating if needed) the lock store at `path`.
pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open lock store {}", path.display()))?;
    prepare(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    prepare(&conn).await?;
    Ok(conn)
}

async fn prepare(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        // Several daemons may share one store file
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;

    Ok(())
}
