use sqlx::PgPool;

#[derive(Clone)]
pub struct PostgresRepository {
    pub pool: PgPool,
}

/// Maps a unique-constraint violation to `Ok(None)` so callers can treat it
/// as "someone else inserted it first".
pub(crate) fn unique_violation_as_none<T>(result: Result<T, sqlx::Error>) -> Result<Option<T>, sqlx::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(None),
        Err(err) => Err(err),
    }
}
