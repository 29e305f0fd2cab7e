use std::sync::atomic::{AtomicUsize, Ordering};

use deadpool::managed::{self, Pool, RecycleError, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError, params};

/// Hands out connections to one local libsql database
pub struct LibsqlManager {
    database: Database,
    recycle_count: AtomicUsize,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database, recycle_count: AtomicUsize::new(0) }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.database.connect()
    }

    /// Round-trips a counter through the connection before reuse
    async fn recycle(&self, conn: &mut Self::Type, _: &managed::Metrics) -> RecycleResult<Self::Error> {
        let recycle_count = self.recycle_count.fetch_add(1, Ordering::Relaxed) as u64;
        let row = conn
            .query("SELECT ?1", params![recycle_count])
            .await?
            .next()
            .await?
            .ok_or(LibsqlError::QueryReturnedNoRows)?;

        if row.get::<u64>(0)? != recycle_count {
            return Err(RecycleError::Message("connection returned a stale row".into()));
        }
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;
