//! `queue_pdus`: which destinations still owe which PDU bodies.

use sqlx::{Executor, QueryBuilder, Sqlite};
use tessera_common::TesseraResult;

/// Record that `server_name` is owed `json_nid`. Repeating it is a no-op.
pub async fn insert_queue_pdu<'e, E>(executor: E, server_name: &str, json_nid: i64) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO queue_pdus (server_name, json_nid) VALUES (?, ?)")
        .bind(server_name)
        .bind(json_nid)
        .execute(executor)
        .await?;
    Ok(())
}

/// Up to `limit` pending ids for a destination, oldest first.
pub async fn select_queue_pdus<'e, E>(executor: E, server_name: &str, limit: u32) -> TesseraResult<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT json_nid FROM queue_pdus WHERE server_name = ? ORDER BY json_nid ASC LIMIT ?",
    )
    .bind(server_name)
    .bind(i64::from(limit))
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(nid,)| nid).collect())
}

pub async fn delete_queue_pdus<'e, E>(executor: E, server_name: &str, json_nids: &[i64]) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM queue_pdus WHERE server_name = ");
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
pub async fn delete_queue_pdus_for_json<'e, E>(executor: E, json_nids: &[i64]) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM queue_pdus WHERE json_nid IN (");
    let mut ids = qb.separated(", ");
    for nid in json_nids {
        ids.push_bind(*nid);
    }
    ids.push_unseparated(")");

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected())
}

pub async fn select_pending_pdu_server_names<'e, E>(executor: E) -> TesseraResult<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT server_name FROM queue_pdus ORDER BY server_name ASC")
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}
