//! Backend admission control: bounds the number of concurrently-running
//! scans against a single analysis backend instance to its configured
//! `max_concurrent`, regardless of how many workers are dispatching work.
//!
//! The accounting itself lives in the repository store (`Database::
//! try_acquire_admission` / `release_admission`), grounded in
//! `db/sqlite.rs`'s `query!`/`query_as!` usage of a single SQLite
//! transaction as the serialization point — SQLite's single-writer
//! semantics make "read the count, then conditionally insert, in one
//! transaction" trivially race-free without a compare-and-swap loop. This
//! module is a thin RAII wrapper around that primitive so callers can't
//! forget to release a slot they acquired.

use error_stack::{Result, ResultExt};
use tracing::debug;

use crate::{
    db::{Admission, Database},
    ext::error_stack::DescribeContext,
    model::Id,
};

/// Errors encountered acquiring or releasing an admission slot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository store rejected the acquire/release/capacity query.
    #[error("query admission state")]
    Query,
}

/// An acquired admission slot for one `(backend_instance, job_id)` pair.
///
/// Holding this value is proof that this process currently counts against
/// that backend's `max_concurrent`; dropping it without calling
/// [`AdmissionGuard::release`] leaks the slot until the reconciler's
/// staleness sweep notices and releases it on this process's behalf, so
/// callers should always release explicitly on the normal exit path and
/// treat the implicit drop as a safety net, not the primary mechanism.
#[derive(Debug)]
pub struct AdmissionGuard {
    instance: String,
    job_id: Id,
    released: bool,
}

impl AdmissionGuard {
    /// Release this admission slot, freeing it for another task.
    pub async fn release<D: Database>(mut self, db: &D) -> Result<(), Error> {
        db.release_admission(&self.instance, self.job_id)
            .await
            .change_context(Error::Query)
            .describe_lazy(|| format!("release admission slot for backend '{}'", self.instance))?;
        self.released = true;
        Ok(())
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                backend_instance = %self.instance,
                job_id = %self.job_id,
                "admission guard dropped without being released; the reconciler will reclaim this slot",
            );
        }
    }
}

/// Attempt to acquire one admission slot on `instance` for `job_id`.
///
/// Returns `None` if the backend is at capacity; callers should requeue the
/// task with a delay rather than busy-loop retrying.
#[tracing::instrument(skip(db), fields(backend_instance = instance, max_concurrent))]
pub async fn try_acquire<D: Database>(
    db: &D,
    instance: &str,
    max_concurrent: i64,
    job_id: Id,
    data_source_id: Id,
) -> Result<Option<AdmissionGuard>, Error> {
    let admission = db
        .try_acquire_admission(instance, max_concurrent, job_id, data_source_id)
        .await
        .change_context(Error::Query)
        .describe_lazy(|| format!("attempt to acquire admission slot on backend '{instance}'"))?;

    match admission {
        Admission::Acquired => Ok(Some(AdmissionGuard {
            instance: instance.to_string(),
            job_id,
            released: false,
        })),
        Admission::Denied => Ok(None),
    }
}

/// Current admission state for `instance`: how many slots are in use out of
/// how many are configured.
pub async fn capacity<D: Database>(
    db: &D,
    instance: &str,
    max_concurrent: i64,
) -> Result<crate::db::AdmissionCapacity, Error> {
    db.admission_capacity(instance, max_concurrent)
        .await
        .change_context(Error::Query)
        .describe_lazy(|| format!("query admission capacity for backend '{instance}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_sqlite;

    async fn memory_db() -> impl Database {
        let dir = tempfile::tempdir().expect("tempdir");
        connect_sqlite(&dir.path().join("db.sqlite"))
            .await
            .expect("connect sqlite")
    }

    #[tokio::test]
    async fn acquire_is_bounded_by_max_concurrent() {
        let db = memory_db().await;
        let source = db
            .create_data_source("ds", "/tmp/ds.csv", 2, None)
            .await
            .expect("create data source");
        let job = db.create_job(*source.id(), 2).await.expect("create job");

        let first = try_acquire(&db, "backend-a", 1, *job.id(), *source.id())
            .await
            .expect("query succeeds")
            .expect("first acquire succeeds");
        let second = try_acquire(&db, "backend-a", 1, *job.id(), *source.id())
            .await
            .expect("query succeeds");
        assert!(second.is_none(), "second acquire must be denied at max_concurrent=1");

        first.release(&db).await.expect("release succeeds");
        let third = try_acquire(&db, "backend-a", 1, *job.id(), *source.id())
            .await
            .expect("query succeeds");
        assert!(third.is_some(), "acquire must succeed again after release");
    }

    #[tokio::test]
    async fn capacity_reflects_active_holders() {
        let db = memory_db().await;
        let source = db
            .create_data_source("ds", "/tmp/ds.csv", 1, None)
            .await
            .expect("create data source");
        let job = db.create_job(*source.id(), 1).await.expect("create job");

        let guard = try_acquire(&db, "backend-b", 3, *job.id(), *source.id())
            .await
            .expect("query succeeds")
            .expect("acquire succeeds");

        let cap = capacity(&db, "backend-b", 3).await.expect("query capacity");
        assert_eq!(cap.active, 1);
        assert_eq!(cap.available(), 2);

        guard.release(&db).await.expect("release succeeds");
        let cap = capacity(&db, "backend-b", 3).await.expect("query capacity");
        assert_eq!(cap.active, 0);
    }
}
