//! Notary key cache tables.
//!
//! `notary_server_keys_json` keeps each key document received for a server;
//! `notary_server_keys_metadata` points every (server, key id) at the document
//! with the latest validity that mentions it.

use sqlx::{Executor, FromRow, QueryBuilder, Sqlite};
use tessera_common::TesseraResult;

#[derive(Debug, Clone, FromRow)]
pub struct NotaryMetadata {
    pub key_id: String,
    pub notary_id: i64,
    pub valid_until: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct NotaryJson {
    pub notary_id: i64,
    pub response_json: String,
    pub valid_until: i64,
}

pub async fn insert_server_keys_json<'e, E>(
    executor: E,
    server_name: &str,
    response_json: &str,
    valid_until: i64,
) -> TesseraResult<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO notary_server_keys_json (server_name, response_json, valid_until)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(server_name)
    .bind(response_json)
    .bind(valid_until)
    .execute(executor)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Point `key_id` at `notary_id` unless the current document is valid for longer.
pub async fn upsert_server_keys_metadata<'e, E>(
    executor: E,
    server_name: &str,
    key_id: &str,
    notary_id: i64,
    valid_until: i64,
) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO notary_server_keys_metadata (server_name, key_id, notary_id, valid_until)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (server_name, key_id) DO UPDATE
        SET notary_id = excluded.notary_id,
            valid_until = excluded.valid_until
        WHERE excluded.valid_until >= notary_server_keys_metadata.valid_until
        "#,
    )
    .bind(server_name)
    .bind(key_id)
    .bind(notary_id)
    .bind(valid_until)
    .execute(executor)
    .await?;
    Ok(())
}

/// Remove documents for `server_name` that no key id points at any more.
pub async fn delete_unreferenced_server_keys_json<'e, E>(executor: E, server_name: &str) -> TesseraResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM notary_server_keys_json
        WHERE server_name = ?
          AND NOT EXISTS (
              SELECT 1 FROM notary_server_keys_metadata m
              WHERE m.notary_id = notary_server_keys_json.notary_id
          )
        "#,
    )
    .bind(server_name)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Metadata rows for `server_name`, restricted to `key_ids` unless it is empty.
pub async fn select_server_keys_metadata<'e, E>(
    executor: E,
    server_name: &str,
    key_ids: &[String],
) -> TesseraResult<Vec<NotaryMetadata>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT key_id, notary_id, valid_until FROM notary_server_keys_metadata WHERE server_name = ",
    );
    qb.push_bind(server_name);
    if !key_ids.is_empty() {
        qb.push(" AND key_id IN (");
        let mut ids = qb.separated(", ");
        for key_id in key_ids {
            ids.push_bind(key_id.as_str());
        }
        ids.push_unseparated(")");
    }
    qb.push(" ORDER BY key_id ASC");

    let rows = qb.build_query_as::<NotaryMetadata>().fetch_all(executor).await?;
    Ok(rows)
}

pub async fn select_server_keys_json<'e, E>(executor: E, notary_ids: &[i64]) -> TesseraResult<Vec<NotaryJson>>
where
    E: Executor<'e, Database = Sqlite>,
{
    if notary_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT notary_id, response_json, valid_until FROM notary_server_keys_json WHERE notary_id IN (",
    );
    let mut ids = qb.separated(", ");
    for id in notary_ids {
        ids.push_bind(*id);
    }
    ids.push_unseparated(") ORDER BY notary_id ASC");

    let rows = qb.build_query_as::<NotaryJson>().fetch_all(executor).await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn metadata_keeps_the_longest_validity() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = &db.pool;

        let newer = insert_server_keys_json(pool, "remote.org", "{}", 2_000).await.unwrap();
        upsert_server_keys_metadata(pool, "remote.org", "ed25519:a", newer, 2_000).await.unwrap();
        let older = insert_server_keys_json(pool, "remote.org", "{}", 1_000).await.unwrap();
        upsert_server_keys_metadata(pool, "remote.org", "ed25519:a", older, 1_000).await.unwrap();

        let rows = select_server_keys_metadata(pool, "remote.org", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notary_id, newer);

        assert_eq!(delete_unreferenced_server_keys_json(pool, "remote.org").await.unwrap(), 1);
        let docs = select_server_keys_json(pool, &[newer, older]).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].notary_id, newer);
    }
}
