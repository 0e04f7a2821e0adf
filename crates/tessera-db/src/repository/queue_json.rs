//! `queue_json`: the bodies of queued PDUs and EDUs.

use sqlx::{Executor, QueryBuilder, Sqlite};
use tessera_common::TesseraResult;

/// Store a body and return its numeric id.
pub async fn insert_json<'e, E>(executor: E, json_body: &str, room_id: Option<&str>) -> TesseraResult<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("INSERT INTO queue_json (json_body, room_id) VALUES (?, ?)")
        .bind(json_body)
        .bind(room_id)
        .execute(executor)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn json_exists<'e, E>(executor: E, json_nid: i64) -> TesseraResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(i64,)> = sqlx::query_as("SELECT json_nid FROM queue_json WHERE json_nid = ?")
        .bind(json_nid)
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}

/// Fetch bodies by id, ordered by id.
pub async fn select_json<'e, E>(executor: E, json_nids: &[i64]) -> TesseraResult<Vec<(i64, String)>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT json_nid, json_body FROM queue_json WHERE json_nid IN (");
    let mut ids = qb.separated(", ");
    for nid in json_nids {
        ids.push_bind(*nid);
    }
    ids.push_unseparated(") ORDER BY json_nid ASC");

    let rows = qb.build_query_as::<(i64, String)>().fetch_all(executor).await?;
    Ok(rows)
}

/// Ids of every body queued for `room_id`.
pub async fn select_json_nids_for_room<'e, E>(executor: E, room_id: &str) -> TesseraResult<Vec<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT json_nid FROM queue_json WHERE room_id = ?")
        .bind(room_id)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(|(nid,)| nid).collect())
}

/// Delete those of `json_nids` that no destination references any more.
pub async fn delete_unreferenced_json<'e, E>(executor: E, json_nids: &[i64]) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    if json_nids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        r#"
        DELETE FROM queue_json
        WHERE NOT EXISTS (SELECT 1 FROM queue_pdus p WHERE p.json_nid = queue_json.json_nid)
          AND NOT EXISTS (SELECT 1 FROM queue_edus e WHERE e.json_nid = queue_json.json_nid)
          AND json_nid IN ("#,
    );
    let mut ids = qb.separated(", ");
    for nid in json_nids {
        ids.push_bind(*nid);
    }
    ids.push_unseparated(")");

    let result = qb.build().execute(executor).await?;
    Ok(result.rows_affected())
}
