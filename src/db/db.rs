// db/db.rs
use sqlx::{Pool, Postgres};

use crate::service::error::ServiceError;

#[derive(Clone)]
pub struct DBClient {
    pub pool: Pool<Postgres>,
}

impl std::fmt::Debug for DBClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBClient")
            .field("pool", &"Pool<Postgres>")
            .field("size", &self.pool.size())
            .finish()
    }
}

impl DBClient {
    pub fn new(pool: Pool<Postgres>) -> Self {
        DBClient { pool }
    }
}

/// Turns a unique-constraint violation into `AlreadyProcessed`.
pub(crate) fn unique_violation(error: sqlx::Error, message: &str) -> ServiceError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            ServiceError::already_processed(message)
        }
        _ => ServiceError::Database(error),
    }
}
