//! `queue_edus`: pending EDU deliveries, each with an optional expiry.

use sqlx::{Executor, QueryBuilder, Sqlite};
use tessera_common::TesseraResult;

/// Record that `server_name` is owed the EDU `json_nid`. Repeating it is a no-op.
pub async fn insert_queue_edu<'e, E>(
    executor: E,
    server_name: &str,
    json_nid: i64,
    edu_type: &str,
    expires_at: Option<i64>,
) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO queue_edus (server_name, json_nid, edu_type, expires_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(server_name)
    .bind(json_nid)
    .bind(edu_type)
    .bind(expires_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Up to `limit` pending ids for a destination, oldest first.
pub async fn select_queue_edus<'e, E>(executor: E, server_name: &str, limit: u32) -> TesseraResult<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT json_nid FROM queue_edus WHERE server_name = ? ORDER BY json_nid ASC LIMIT ?",
    )
    .bind(server_name)
    .bind(i64::from(limit))
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(nid,)| nid).collect())
}

pub async fn delete_queue_edus<'e, E>(executor: E, server_name: &str, json_nids: &[i64]) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM queue_edus WHERE server_name = ");
    qb.push_bind(server_name);
    qb.push(" AND json_nid IN (");
    let mut ids = qb.separated(", ");
    for nid in json_nids {
        ids.push_bind(*nid);
    }
    ids.push_unseparated(")");

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected())
}

/// Drop every destination's claim on the given bodies.
pub async fn delete_queue_edus_for_json<'e, E>(executor: E, json_nids: &[i64]) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM queue_edus WHERE json_nid IN (");
    let mut ids = qb.separated(", ");
    for nid in json_nids {
        ids.push_bind(*nid);
    }
    ids.push_unseparated(")");

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected())
}

/// Ids of bodies with at least one association expired at `now_ms`.
pub async fn select_expired_json_nids<'e, E>(executor: E, now_ms: i64) -> TesseraResult<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT DISTINCT json_nid FROM queue_edus WHERE expires_at IS NOT NULL AND expires_at <= ?",
    )
    .bind(now_ms)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(nid,)| nid).collect())
}

pub async fn delete_expired_edus<'e, E>(executor: E, now_ms: i64) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM queue_edus WHERE expires_at IS NOT NULL AND expires_at <= ?")
        .bind(now_ms)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn select_pending_edu_server_names<'e, E>(executor: E) -> TesseraResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT server_name FROM queue_edus ORDER BY server_name ASC")
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}
