use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use callsync_common::types::{CallKey, CallOwner, CallStateRecord, CallStatus, ChatId, UserId};

use super::{Page, StoreError, StoreResult};

const SELECT_COLUMNS: &str = r#"
SELECT
    token_id,
    user_id,
    chat_id,
    token_taken,
    owner_token_id,
    owner_user_id,
    status,
    chat_tet_a_tet,
    owner_avatar,
    marked_for_remove_at,
    marked_for_orphan_remove_attempt,
    create_date_time
FROM call_states
"#;

#[derive(FromRow)]
struct CallStateRow {
    token_id: Uuid,
    user_id: i64,
    chat_id: i64,
    token_taken: bool,
    owner_token_id: Option<Uuid>,
    owner_user_id: Option<i64>,
    status: String,
    chat_tet_a_tet: bool,
    owner_avatar: Option<String>,
    marked_for_remove_at: Option<DateTime<Utc>>,
    marked_for_orphan_remove_attempt: i32,
    create_date_time: DateTime<Utc>,
}

impl TryFrom<CallStateRow> for CallStateRecord {
    type Error = StoreError;

    fn try_from(row: CallStateRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<CallStatus>()
            .map_err(|error| StoreError::InvalidRow(error.to_string()))?;
        let owner = match (row.owner_token_id, row.owner_user_id) {
            (Some(token_id), Some(user_id)) => Some(CallOwner::new(token_id, user_id)),
            (None, None) => None,
            _ => {
                return Err(StoreError::InvalidRow(format!(
                    "row {}/{} has a half-set owner",
                    row.user_id, row.token_id
                )))
            }
        };

        Ok(Self {
            token_id: row.token_id,
            user_id: row.user_id,
            chat_id: row.chat_id,
            token_taken: row.token_taken,
            owner,
            status,
            chat_tet_a_tet: row.chat_tet_a_tet,
            owner_avatar: row.owner_avatar,
            marked_for_remove_at: row.marked_for_remove_at,
            marked_for_orphan_remove_attempt: row.marked_for_orphan_remove_attempt,
            create_date_time: row.create_date_time,
        })
    }
}

fn into_records(rows: Vec<CallStateRow>) -> StoreResult<Vec<CallStateRecord>> {
    rows.into_iter().map(CallStateRecord::try_from).collect()
}

fn page_bounds(page: Page) -> (i64, i64) {
    (
        i64::try_from(page.limit).unwrap_or(i64::MAX),
        i64::try_from(page.offset).unwrap_or(i64::MAX),
    )
}

pub(super) async fn upsert(conn: &mut PgConnection, record: &CallStateRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO call_states (
            token_id,
            user_id,
            chat_id,
            token_taken,
            owner_token_id,
            owner_user_id,
            status,
            chat_tet_a_tet,
            owner_avatar,
            marked_for_remove_at,
            marked_for_orphan_remove_attempt,
            create_date_time
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (token_id, user_id) DO UPDATE
        SET chat_id = EXCLUDED.chat_id,
            token_taken = EXCLUDED.token_taken,
            owner_token_id = EXCLUDED.owner_token_id,
            owner_user_id = EXCLUDED.owner_user_id,
            status = EXCLUDED.status,
            chat_tet_a_tet = EXCLUDED.chat_tet_a_tet,
            owner_avatar = EXCLUDED.owner_avatar,
            marked_for_remove_at = EXCLUDED.marked_for_remove_at,
            marked_for_orphan_remove_attempt = EXCLUDED.marked_for_orphan_remove_attempt,
            create_date_time = EXCLUDED.create_date_time
        "#,
    )
    .bind(record.token_id)
    .bind(record.user_id)
    .bind(record.chat_id)
    .bind(record.token_taken)
    .bind(record.owner.map(|owner| owner.token_id))
    .bind(record.owner.map(|owner| owner.user_id))
    .bind(record.status.as_str())
    .bind(record.chat_tet_a_tet)
    .bind(record.owner_avatar.as_deref())
    .bind(record.marked_for_remove_at)
    .bind(record.marked_for_orphan_remove_attempt)
    .bind(record.create_date_time)
    .execute(conn)
    .await?;

    Ok(())
}

pub(super) async fn get(
    conn: &mut PgConnection,
    key: CallKey,
) -> StoreResult<Option<CallStateRecord>> {
    let query = format!("{SELECT_COLUMNS} WHERE token_id = $1 AND user_id = $2");
    sqlx::query_as::<_, CallStateRow>(&query)
        .bind(key.token_id)
        .bind(key.user_id)
        .fetch_optional(conn)
        .await?
        .map(CallStateRecord::try_from)
        .transpose()
}

pub(super) async fn list_by_user(
    conn: &mut PgConnection,
    user_id: UserId,
) -> StoreResult<Vec<CallStateRecord>> {
    let query =
        format!("{SELECT_COLUMNS} WHERE user_id = $1 ORDER BY chat_id, user_id, token_id");
    let rows = sqlx::query_as::<_, CallStateRow>(&query).bind(user_id).fetch_all(conn).await?;
    into_records(rows)
}

pub(super) async fn list_by_chat_and_status(
    conn: &mut PgConnection,
    chat_id: ChatId,
    status: CallStatus,
) -> StoreResult<Vec<CallStateRecord>> {
    let query = format!(
        "{SELECT_COLUMNS} WHERE chat_id = $1 AND status = $2 ORDER BY chat_id, user_id, token_id"
    );
    let rows = sqlx::query_as::<_, CallStateRow>(&query)
        .bind(chat_id)
        .bind(status.as_str())
        .fetch_all(conn)
        .await?;
    into_records(rows)
}

pub(super) async fn list_being_invited_by_owner(
    conn: &mut PgConnection,
    owner: CallOwner,
) -> StoreResult<Vec<CallStateRecord>> {
    let query = format!(
        "{SELECT_COLUMNS} \
         WHERE owner_token_id = $1 AND owner_user_id = $2 AND status = 'beingInvited' \
         ORDER BY chat_id, user_id, token_id"
    );
    let rows = sqlx::query_as::<_, CallStateRow>(&query)
        .bind(owner.token_id)
        .bind(owner.user_id)
        .fetch_all(conn)
        .await?;
    into_records(rows)
}

pub(super) async fn list_by_status(
    conn: &mut PgConnection,
    status: CallStatus,
    page: Page,
) -> StoreResult<Vec<CallStateRecord>> {
    let (limit, offset) = page_bounds(page);
    let query = format!(
        "{SELECT_COLUMNS} WHERE status = $1 ORDER BY chat_id, user_id, token_id LIMIT $2 OFFSET $3"
    );
    let rows = sqlx::query_as::<_, CallStateRow>(&query)
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(conn)
        .await?;
    into_records(rows)
}

pub(super) async fn list_all(
    conn: &mut PgConnection,
    page: Page,
) -> StoreResult<Vec<CallStateRecord>> {
    let (limit, offset) = page_bounds(page);
    let query = format!(
        "{SELECT_COLUMNS} \
         ORDER BY COALESCE(owner_user_id, user_id), chat_id, user_id, token_id \
         LIMIT $1 OFFSET $2"
    );
    let rows =
        sqlx::query_as::<_, CallStateRow>(&query).bind(limit).bind(offset).fetch_all(conn).await?;
    into_records(rows)
}

pub(super) async fn set_status(
    conn: &mut PgConnection,
    key: CallKey,
    status: CallStatus,
) -> StoreResult<bool> {
    let updated = sqlx::query(
        "UPDATE call_states SET status = $3 WHERE token_id = $1 AND user_id = $2",
    )
    .bind(key.token_id)
    .bind(key.user_id)
    .bind(status.as_str())
    .execute(conn)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

pub(super) async fn set_orphan_attempt(
    conn: &mut PgConnection,
    key: CallKey,
    attempt: i32,
) -> StoreResult<bool> {
    let updated = sqlx::query(
        r#"
        UPDATE call_states
        SET marked_for_orphan_remove_attempt = $3
        WHERE token_id = $1 AND user_id = $2
        "#,
    )
    .bind(key.token_id)
    .bind(key.user_id)
    .bind(attempt)
    .execute(conn)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

pub(super) async fn set_marked_for_remove_at(
    conn: &mut PgConnection,
    key: CallKey,
    at: Option<DateTime<Utc>>,
) -> StoreResult<bool> {
    let updated = sqlx::query(
        "UPDATE call_states SET marked_for_remove_at = $3 WHERE token_id = $1 AND user_id = $2",
    )
    .bind(key.token_id)
    .bind(key.user_id)
    .bind(at)
    .execute(conn)
    .await?
    .rows_affected();

    Ok(updated == 1)
}

pub(super) async fn remove(conn: &mut PgConnection, key: CallKey) -> StoreResult<bool> {
    let deleted = sqlx::query("DELETE FROM call_states WHERE token_id = $1 AND user_id = $2")
        .bind(key.token_id)
        .bind(key.user_id)
        .execute(conn)
        .await?
        .rows_affected();

    Ok(deleted == 1)
}

pub(super) async fn remove_owned_and_owner(
    conn: &mut PgConnection,
    owner: CallOwner,
) -> StoreResult<u64> {
    let owned = sqlx::query(
        "DELETE FROM call_states WHERE owner_token_id = $1 AND owner_user_id = $2",
    )
    .bind(owner.token_id)
    .bind(owner.user_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let own = sqlx::query("DELETE FROM call_states WHERE token_id = $1 AND user_id = $2")
        .bind(owner.token_id)
        .bind(owner.user_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    Ok(owned + own)
}

pub(super) async fn remove_batch(conn: &mut PgConnection, keys: &[CallKey]) -> StoreResult<u64> {
    let token_ids: Vec<Uuid> = keys.iter().map(|key| key.token_id).collect();
    let user_ids: Vec<i64> = keys.iter().map(|key| key.user_id).collect();

    let deleted = sqlx::query(
        r#"
        DELETE FROM call_states
        WHERE (token_id, user_id) IN (
            SELECT token_id, user_id
            FROM UNNEST($1::uuid[], $2::bigint[]) AS doomed(token_id, user_id)
        )
        "#,
    )
    .bind(token_ids)
    .bind(user_ids)
    .execute(conn)
    .await?
    .rows_affected();

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::db::{
        migrations::run_migrations,
        pool::{create_pg_pool, PoolConfig},
    };
    use crate::store::{CallStateStore, Page};
    use callsync_common::types::{CallKey, CallStateRecord, CallStatus};

    async fn test_store() -> Option<CallStateStore> {
        let Some(database_url) = std::env::var("CALLSYNC_TEST_DATABASE_URL").ok() else {
            eprintln!("skipping call-state postgres test: set CALLSYNC_TEST_DATABASE_URL");
            return None;
        };

        let pool = create_pg_pool(&database_url, PoolConfig::default())
            .await
            .expect("test postgres pool should connect");
        run_migrations(&pool).await.expect("migrations should apply");

        Some(CallStateStore::Postgres(pool))
    }

    #[tokio::test]
    async fn upsert_get_and_cascade_round_trip_through_postgres() {
        let Some(store) = test_store().await else {
            return;
        };

        // Chat ids far from anything other tests touch.
        let chat_id = 9_000_000 + i64::from(rand_suffix());
        let now = Utc::now();
        let owner = CallKey::new(Uuid::new_v4(), 1);
        let owner_row = CallStateRecord::presence(owner, chat_id, Some("/o.png".into()), false, now);
        let callee =
            CallStateRecord::invitation(CallKey::new(Uuid::new_v4(), 2), chat_id, owner, None, true, now);

        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&owner_row).await.expect("upsert owner");
        tx.upsert(&callee).await.expect("upsert callee");
        tx.commit().await.expect("commit");

        let fetched = store.get(callee.key()).await.expect("get").expect("callee row exists");
        assert_eq!(fetched.owner, Some(owner));
        assert_eq!(fetched.status, CallStatus::BeingInvited);
        assert!(fetched.chat_tet_a_tet);

        let mut tx = store.begin().await.expect("begin");
        let invited = tx.list_being_invited_by_owner(owner).await.expect("list owned");
        assert_eq!(invited.len(), 1);
        let in_chat = tx
            .list_by_chat_and_status(chat_id, CallStatus::InCall)
            .await
            .expect("list by chat");
        assert_eq!(in_chat.len(), 1);
        assert!(!tx.list_all(Page::first(10)).await.expect("list all").is_empty());
        assert_eq!(tx.remove_owned_and_owner(owner).await.expect("cascade"), 2);
        tx.commit().await.expect("commit");

        assert_eq!(store.status(owner).await.expect("status"), CallStatus::NotFound);
    }

    fn rand_suffix() -> u16 {
        (Uuid::new_v4().as_u128() & 0xffff) as u16
    }
}
