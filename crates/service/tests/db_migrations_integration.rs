use callsync_common::types::{CallKey, CallStateRecord, CallStatus};
use callsync_service::db::migrations::run_migrations;
use callsync_service::db::pool::{create_pg_pool, PoolConfig};
use callsync_service::store::CallStateStore;
use chrono::Utc;
use uuid::Uuid;

const EXPECTED_TABLES: &[&str] = &["call_states", "task_locks"];

async fn test_pool() -> Option<sqlx::PgPool> {
    let Some(database_url) = std::env::var("CALLSYNC_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db integration test: set CALLSYNC_TEST_DATABASE_URL");
        return None;
    };
    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    run_migrations(&pool).await.expect("migrations should apply");
    Some(pool)
}

#[tokio::test]
async fn migrations_create_expected_tables() {
    let Some(pool) = test_pool().await else { return };

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let Some(pool) = test_pool().await else { return };
    run_migrations(&pool).await.expect("second migration run should be a no-op");
}

#[tokio::test]
async fn postgres_store_round_trips_an_invitation() {
    let Some(pool) = test_pool().await else { return };
    let store = CallStateStore::Postgres(pool);

    let chat_id = i64::from(rand_suffix()) + 1_000_000;
    let owner = CallKey::new(Uuid::new_v4(), chat_id + 1);
    let callee = CallKey::new(Uuid::new_v4(), chat_id + 2);
    let now = Utc::now();

    let mut tx = store.begin().await.expect("begin");
    tx.upsert(&CallStateRecord::presence(owner, chat_id, None, false, now)).await.expect("owner");
    let invitation =
        CallStateRecord::invitation(callee, chat_id, owner, Some("/a.png".into()), true, now);
    tx.upsert(&invitation).await.expect("callee");
    tx.commit().await.expect("commit");

    let stored = store.get(callee).await.expect("get").expect("callee row exists");
    assert_eq!(stored.owner, Some(owner));
    assert_eq!(stored.status, CallStatus::BeingInvited);
    assert_eq!(stored.owner_avatar.as_deref(), Some("/a.png"));
    assert!(stored.chat_tet_a_tet);

    let mut tx = store.begin().await.expect("begin");
    let ringing = tx.list_being_invited_by_owner(owner).await.expect("owned rows");
    assert_eq!(ringing.iter().map(CallStateRecord::key).collect::<Vec<_>>(), vec![callee]);
    assert_eq!(tx.status(owner).await.expect("status"), CallStatus::InCall);

    assert_eq!(tx.remove_owned_and_owner(owner).await.expect("remove"), 2);
    tx.commit().await.expect("commit");
    assert_eq!(store.status(owner).await.expect("status"), CallStatus::NotFound);
}

fn rand_suffix() -> u32 {
    Uuid::new_v4().as_u128() as u32 % 1_000_000
}
