//! Postgres-backed scenarios. Gated by `CDX_DATABASE_URL` so the unit-test
//! suite stays hermetic; set the env var and point it at a scratch database
//! to run these.

use cdx_cursor::{advance, create_if_absent, evict, get, take, testkit_db_pool, LeaseError};

macro_rules! require_db {
    () => {
        if std::env::var(cdx_cursor::ENV_DB_URL).is_err() {
            eprintln!("skipping: {} not set", cdx_cursor::ENV_DB_URL);
            return;
        }
    };
}

#[tokio::test]
async fn only_one_take_succeeds_when_lease_is_free() {
    require_db!();
    let pool = testkit_db_pool().await.unwrap();
    let key = "scenario-exclusion-1";
    create_if_absent(&pool, key).await.unwrap();

    let first = take(&pool, key, "worker-a", 1000).await;
    assert!(first.is_ok());

    let second = take(&pool, key, "worker-b", 1001).await;
    assert!(matches!(second, Err(LeaseError::Busy)));

    evict(&pool, key, "worker-a").await.unwrap();
}

#[tokio::test]
async fn advance_requires_matching_owner() {
    require_db!();
    let pool = testkit_db_pool().await.unwrap();
    let key = "scenario-checkpoint-monotonicity";
    create_if_absent(&pool, key).await.unwrap();
    take(&pool, key, "worker-a", 1000).await.unwrap();

    let advanced = advance(&pool, key, "worker-a", 42, 3, 1050).await.unwrap();
    assert_eq!(advanced.checkpoint, 42);
    assert_eq!(advanced.checkpoint_sub_sequence_number, 3);

    let stolen = advance(&pool, key, "worker-b", 99, 0, 1060).await;
    assert!(matches!(stolen, Err(LeaseError::Stolen)));

    let lease = get(&pool, key).await.unwrap().unwrap();
    assert_eq!(lease.checkpoint, 42, "a stolen advance must not mutate the row");

    evict(&pool, key, "worker-a").await.unwrap();
}

#[tokio::test]
async fn evict_by_a_non_owner_is_a_harmless_no_op() {
    require_db!();
    let pool = testkit_db_pool().await.unwrap();
    let key = "scenario-evict-swallows-failure";
    create_if_absent(&pool, key).await.unwrap();
    take(&pool, key, "worker-a", 1000).await.unwrap();

    let evicted = evict(&pool, key, "worker-b").await.unwrap();
    assert!(!evicted, "non-owner evict must report false, not error");

    let lease = get(&pool, key).await.unwrap().unwrap();
    assert_eq!(lease.lease_owner, "worker-a");

    evict(&pool, key, "worker-a").await.unwrap();
}
