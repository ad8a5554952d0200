//! End-to-end temporal joins across two topics.

mod common;

use std::time::Duration;

use glassflow_etl::mapper::ColumnType;
use glassflow_etl::pipeline_config::Orientation;
use serde_json::json;

use common::*;

async fn ensure_joined_table(table: &str) -> anyhow::Result<()> {
    exec_ddl(&format!(
        "CREATE TABLE IF NOT EXISTS {table} \
         (name Nullable(String), email Nullable(String)) \
         ENGINE = MergeTree ORDER BY tuple()"
    ))
    .await
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct JoinedRow {
    name: Option<String>,
    email: Option<String>,
}

#[tokio::test]
async fn inner_join_pairs_matching_keys() -> anyhow::Result<()> {
    let _lock = lock();

    let pipeline_id = unique("innerjoin");
    let users_topic = unique("users");
    let emails_topic = unique("emails");
    let table = format!("it_{}", pipeline_id.replace('-', "_"));
    create_topics(vec![&users_topic, &emails_topic]).await?;
    ensure_joined_table(&table).await?;

    let manager = manager().await;
    manager
        .create(join_pipeline(
            &pipeline_id,
            topic_spec(&users_topic),
            topic_spec(&emails_topic),
            "user_id",
            Duration::from_secs(3600),
            Orientation::Inner,
            sink_spec(
                &table,
                vec![
                    nullable_mapping(&users_topic, "name", "name", ColumnType::String),
                    nullable_mapping(&emails_topic, "email", "email", ColumnType::String),
                ],
            ),
        ))
        .await?;

    produce_json(&users_topic, vec![json!({"user_id": 123, "name": "John"})]).await?;
    produce_json(&emails_topic, vec![json!({"user_id": 123, "email": "j@x"})]).await?;

    // Left-only key: inner orientation must never emit it.
    produce_json(&users_topic, vec![json!({"user_id": 789, "name": "Ghost"})]).await?;

    let joined = wait_until(Duration::from_secs(30), || async {
        count_rows(&table).await.map(|n| n == 1).unwrap_or(false)
    })
    .await;
    assert!(joined, "expected exactly one joined row");

    let row: JoinedRow = clickhouse_client()
        .query(&format!("SELECT name, email FROM {table}"))
        .fetch_one()
        .await?;
    assert_eq!(row.name.as_deref(), Some("John"));
    assert_eq!(row.email.as_deref(), Some("j@x"));

    manager.terminate(&pipeline_id).await?;
    Ok(())
}

#[tokio::test]
async fn left_join_emits_unpaired_after_expiry() -> anyhow::Result<()> {
    let _lock = lock();

    let pipeline_id = unique("leftjoin");
    let users_topic = unique("users");
    let emails_topic = unique("emails");
    let table = format!("it_{}", pipeline_id.replace('-', "_"));
    create_topics(vec![&users_topic, &emails_topic]).await?;
    ensure_joined_table(&table).await?;

    let manager = manager().await;
    manager
        .create(join_pipeline(
            &pipeline_id,
            topic_spec(&users_topic),
            topic_spec(&emails_topic),
            "user_id",
            // Short window so expiry happens within the test.
            Duration::from_secs(2),
            Orientation::Left,
            sink_spec(
                &table,
                vec![
                    nullable_mapping(&users_topic, "name", "name", ColumnType::String),
                    nullable_mapping(&emails_topic, "email", "email", ColumnType::String),
                ],
            ),
        ))
        .await?;

    produce_json(&users_topic, vec![json!({"user_id": 1, "name": "Alone"})]).await?;

    let emitted = wait_until(Duration::from_secs(30), || async {
        count_rows(&table).await.map(|n| n == 1).unwrap_or(false)
    })
    .await;
    assert!(emitted, "left orientation must emit the unpaired row");

    let row: JoinedRow = clickhouse_client()
        .query(&format!("SELECT name, email FROM {table}"))
        .fetch_one()
        .await?;
    assert_eq!(row.name.as_deref(), Some("Alone"));
    assert_eq!(row.email, None);

    manager.terminate(&pipeline_id).await?;
    Ok(())
}
