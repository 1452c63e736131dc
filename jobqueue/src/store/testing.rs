//! Conformance suite for implementations of [`Store`].
use assert_matches::assert_matches;
use chrono::{TimeDelta, Utc};
use serde_json::json;

use super::*;
use crate::work::WorkError;

/// Create the conformance test suite for a [`Store`] implementation.
///
/// Store implementors should include this as part of their tests.
///
/// # Example
///
/// ```
/// use jobqueue::store::memory::InMemoryStore;
/// use jobqueue::test_suite;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// A different async test attribute can be configured, for example when the store needs
/// arguments provided by the test harness:
///
/// ```ignore
/// use jobqueue::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: SqlitePool),
///     store: StoreImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn create_and_get $args {
          let store = $store;
          $crate::store::testing::create_and_get(store).await;
        }
        #[$attr]
        async fn create_duplicate_id $args {
          let store = $store;
          $crate::store::testing::create_duplicate_id(store).await;
        }
        #[$attr]
        async fn get_not_found $args {
          let store = $store;
          $crate::store::testing::get_not_found(store).await;
        }
        #[$attr]
        async fn update_claims_queued_job $args {
          let store = $store;
          $crate::store::testing::update_claims_queued_job(store).await;
        }
        #[$attr]
        async fn update_with_stale_status_conflicts $args {
          let store = $store;
          $crate::store::testing::update_with_stale_status_conflicts(store).await;
        }
        #[$attr]
        async fn update_not_found $args {
          let store = $store;
          $crate::store::testing::update_not_found(store).await;
        }
        #[$attr]
        async fn update_rejects_invalid_transition $args {
          let store = $store;
          $crate::store::testing::update_rejects_invalid_transition(store).await;
        }
        #[$attr]
        async fn update_records_result $args {
          let store = $store;
          $crate::store::testing::update_records_result(store).await;
        }
        #[$attr]
        async fn update_records_error $args {
          let store = $store;
          $crate::store::testing::update_records_error(store).await;
        }
        #[$attr]
        async fn update_begin_attempt_counts $args {
          let store = $store;
          $crate::store::testing::update_begin_attempt_counts(store).await;
        }
        #[$attr]
        async fn list_by_tenant_in_creation_order $args {
          let store = $store;
          $crate::store::testing::list_by_tenant_in_creation_order(store).await;
        }
        #[$attr]
        async fn list_by_tenant_and_status $args {
          let store = $store;
          $crate::store::testing::list_by_tenant_and_status(store).await;
        }
        #[$attr]
        async fn list_stranded $args {
          let store = $store;
          $crate::store::testing::list_stranded(store).await;
        }
        #[$attr]
        async fn concurrent_claims_have_one_winner $args {
          let store = $store;
          $crate::store::testing::concurrent_claims_have_one_winner(store).await;
        }
    };
}

fn job(tenant: &str) -> Job {
    Job::new(tenant.into(), json!({"prompt": "hello"}))
}

async fn created<S: Store>(store: &S, tenant: &str) -> Job {
    let job = job(tenant);
    store.create(job.clone()).await.unwrap();
    job
}

pub async fn create_and_get(store: impl Store) {
    let job = created(&store, "alice").await;

    let stored = store.get(job.id).await.unwrap();

    assert_eq!(stored.id, job.id);
    assert_eq!(stored.tenant_id, job.tenant_id);
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.request, job.request);
    assert_eq!(stored.attempt_count, 0);
    assert!(stored.result.is_none());
    assert!(stored.error.is_none());
    assert!(stored.completed_at.is_none());
    assert!((stored.created_at - job.created_at).abs() < TimeDelta::milliseconds(1));
}

pub async fn create_duplicate_id(store: impl Store) {
    let job = created(&store, "alice").await;
    let mut duplicate = self::job("bob");
    duplicate.id = job.id;

    let result = store.create(duplicate).await;

    assert_matches!(result, Err(StoreError::DuplicateId(id)) if id == job.id);
    assert_eq!(store.get(job.id).await.unwrap().tenant_id, "alice".into());
}

pub async fn get_not_found(store: impl Store) {
    let id = JobId::new();

    assert_matches!(store.get(id).await, Err(StoreError::NotFound(missing)) if missing == id);
}

pub async fn update_claims_queued_job(store: impl Store) {
    let job = created(&store, "alice").await;

    let claimed = store
        .update(job.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();

    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempt_count, 1);
    assert_eq!(store.get(job.id).await.unwrap(), claimed);
}

pub async fn update_with_stale_status_conflicts(store: impl Store) {
    let job = created(&store, "alice").await;
    store
        .update(job.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();

    let result = store
        .update(job.id, JobStatus::Queued, Mutation::Claim)
        .await;

    assert_matches!(
        result,
        Err(StoreError::Conflict {
            expected: JobStatus::Queued,
            actual: JobStatus::Running,
            ..
        })
    );
    assert_eq!(store.get(job.id).await.unwrap().attempt_count, 1);
}

pub async fn update_not_found(store: impl Store) {
    let id = JobId::new();

    let result = store.update(id, JobStatus::Queued, Mutation::Claim).await;

    assert_matches!(result, Err(StoreError::NotFound(missing)) if missing == id);
}

pub async fn update_rejects_invalid_transition(store: impl Store) {
    let job = created(&store, "alice").await;

    let result = store
        .update(
            job.id,
            JobStatus::Queued,
            Mutation::Complete { result: json!(1) },
        )
        .await;

    assert_matches!(result, Err(StoreError::InvalidTransition { .. }));
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Queued);
}

pub async fn update_records_result(store: impl Store) {
    let job = created(&store, "alice").await;
    store
        .update(job.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();

    store
        .update(
            job.id,
            JobStatus::Running,
            Mutation::Complete {
                result: json!({"answer": 42}),
            },
        )
        .await
        .unwrap();

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.result, Some(json!({"answer": 42})));
    assert!(stored.error.is_none());
    assert!(stored.completed_at.is_some());
}

pub async fn update_records_error(store: impl Store) {
    let job = created(&store, "alice").await;
    let error = WorkError::permanent("bad prompt").with_type("validation");

    store
        .update(
            job.id,
            JobStatus::Queued,
            Mutation::Fail {
                error: error.clone(),
            },
        )
        .await
        .unwrap();

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error, Some(error));
    assert!(stored.result.is_none());
    assert!(stored.completed_at.is_some());
}

pub async fn update_begin_attempt_counts(store: impl Store) {
    let job = created(&store, "alice").await;
    store
        .update(job.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();

    let retried = store
        .update(job.id, JobStatus::Running, Mutation::BeginAttempt)
        .await
        .unwrap();

    assert_eq!(retried.status, JobStatus::Running);
    assert_eq!(retried.attempt_count, 2);
}

pub async fn list_by_tenant_in_creation_order(store: impl Store) {
    let first = created(&store, "alice").await;
    let _other = created(&store, "bob").await;
    let second = created(&store, "alice").await;

    let jobs = store
        .list(Query::for_tenant("alice".into(), None))
        .await
        .unwrap();

    let ids: Vec<_> = jobs.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

pub async fn list_by_tenant_and_status(store: impl Store) {
    let queued = created(&store, "alice").await;
    let running = created(&store, "alice").await;
    store
        .update(running.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();

    let jobs = store
        .list(Query::for_tenant("alice".into(), Some(JobStatus::Running)))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, running.id);

    let jobs = store
        .list(Query::for_tenant("alice".into(), Some(JobStatus::Queued)))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, queued.id);

    let jobs = store
        .list(Query::for_tenant("bob".into(), Some(JobStatus::Queued)))
        .await
        .unwrap();
    assert!(jobs.is_empty());
}

pub async fn list_stranded(store: impl Store) {
    let mut old = job("alice");
    old.created_at = Utc::now() - TimeDelta::minutes(10);
    store.create(old.clone()).await.unwrap();
    let mut old_running = job("bob");
    old_running.created_at = Utc::now() - TimeDelta::minutes(10);
    store.create(old_running.clone()).await.unwrap();
    store
        .update(old_running.id, JobStatus::Queued, Mutation::Claim)
        .await
        .unwrap();
    let _recent = created(&store, "alice").await;

    let jobs = store
        .list(Query::stranded(Utc::now() - TimeDelta::minutes(1)))
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, old.id);
}

pub async fn concurrent_claims_have_one_winner(store: impl Store) {
    let job = created(&store, "alice").await;

    let results = futures::future::join_all(
        (0..8).map(|_| store.update(job.id, JobStatus::Queued, Mutation::Claim)),
    )
    .await;

    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .all(StoreError::is_conflict));
    assert_eq!(store.get(job.id).await.unwrap().attempt_count, 1);
}
