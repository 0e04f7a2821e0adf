//! `blacklist`: destinations the delivery scheduler should not attempt.

use sqlx::{Executor, Sqlite};
use tessera_common::TesseraResult;

pub async fn insert_blacklist<'e, E>(executor: E, server_name: &str) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO blacklist (server_name) VALUES (?)")
        .bind(server_name)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn delete_blacklist<'e, E>(executor: E, server_name: &str) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM blacklist WHERE server_name = ?")
        .bind(server_name)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn delete_all_blacklist<'e, E>(executor: E) -> TesseraResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM blacklist").execute(executor).await?;
    Ok(())
}

pub async fn select_blacklist<'e, E>(executor: E, server_name: &str) -> TesseraResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT server_name FROM blacklist WHERE server_name = ?")
        .bind(server_name)
        .fetch_optional(executor)
        .await?;
    Ok(row.is_some())
}
