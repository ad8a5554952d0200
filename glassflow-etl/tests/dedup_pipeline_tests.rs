//! End-to-end deduplication: Kafka topic through the dedup operator into
//! ClickHouse, first-wins per key within the window.

mod common;

use std::time::Duration;

use glassflow_etl::mapper::ColumnType;
use serde_json::json;

use common::*;

async fn ensure_table(table: &str) -> anyhow::Result<()> {
    exec_ddl(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (event_id String, value Int64) \
         ENGINE = MergeTree ORDER BY event_id"
    ))
    .await
}

#[tokio::test]
async fn first_wins_within_the_window() -> anyhow::Result<()> {
    let _lock = lock();

    let pipeline_id = unique("dedup");
    let topic = unique("users");
    let table = format!("it_{}", pipeline_id.replace('-', "_"));
    create_topics(vec![&topic]).await?;
    ensure_table(&table).await?;

    let mut topic_config = topic_spec(&topic);
    topic_config.deduplication = Some(dedup_spec("event_id", Duration::from_secs(3600)));

    let manager = manager().await;
    manager
        .create(single_topic_pipeline(
            &pipeline_id,
            topic_config,
            sink_spec(
                &table,
                vec![
                    mapping(&topic, "event_id", "event_id", ColumnType::String),
                    mapping(&topic, "value", "value", ColumnType::Int64),
                ],
            ),
        ))
        .await?;

    // A, A, B: the second A is a duplicate within the window.
    produce_json(
        &topic,
        vec![
            json!({"event_id": "A", "value": 1}),
            json!({"event_id": "A", "value": 2}),
            json!({"event_id": "B", "value": 3}),
        ],
    )
    .await?;

    let deduped = wait_until(Duration::from_secs(30), || async {
        count_rows(&table).await.map(|n| n == 2).unwrap_or(false)
    })
    .await;
    assert!(deduped, "expected exactly A(first) and B in ClickHouse");

    // Give late duplicates a chance to appear, then re-check.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(count_rows(&table).await?, 2);

    manager.terminate(&pipeline_id).await?;
    Ok(())
}

#[tokio::test]
async fn key_reopens_after_the_window_elapses() -> anyhow::Result<()> {
    let _lock = lock();

    let pipeline_id = unique("dedupwin");
    let topic = unique("events");
    let table = format!("it_{}", pipeline_id.replace('-', "_"));
    create_topics(vec![&topic]).await?;
    ensure_table(&table).await?;

    let mut topic_config = topic_spec(&topic);
    // Short window so the test can outlive it.
    topic_config.deduplication = Some(dedup_spec("event_id", Duration::from_secs(2)));

    let manager = manager().await;
    manager
        .create(single_topic_pipeline(
            &pipeline_id,
            topic_config,
            sink_spec(
                &table,
                vec![
                    mapping(&topic, "event_id", "event_id", ColumnType::String),
                    mapping(&topic, "value", "value", ColumnType::Int64),
                ],
            ),
        ))
        .await?;

    produce_json(&topic, vec![json!({"event_id": "A", "value": 1})]).await?;
    let first = wait_until(Duration::from_secs(30), || async {
        count_rows(&table).await.map(|n| n == 1).unwrap_or(false)
    })
    .await;
    assert!(first);

    // Past the window: the same key is first again.
    tokio::time::sleep(Duration::from_secs(3)).await;
    produce_json(&topic, vec![json!({"event_id": "A", "value": 2})]).await?;

    let second = wait_until(Duration::from_secs(30), || async {
        count_rows(&table).await.map(|n| n == 2).unwrap_or(false)
    })
    .await;
    assert!(second, "a new window should re-emit the key");

    manager.terminate(&pipeline_id).await?;
    Ok(())
}

#[tokio::test]
async fn batching_flushes_a_trickle_after_the_delay() -> anyhow::Result<()> {
    let _lock = lock();

    let pipeline_id = unique("batch");
    let topic = unique("events");
    let table = format!("it_{}", pipeline_id.replace('-', "_"));
    create_topics(vec![&topic]).await?;
    ensure_table(&table).await?;

    let manager = manager().await;
    // max_batch_size 1000, max_delay_time 1s: ten records are far below the
    // size trigger and must arrive via the delay trigger.
    manager
        .create(single_topic_pipeline(
            &pipeline_id,
            topic_spec(&topic),
            sink_spec(
                &table,
                vec![
                    mapping(&topic, "event_id", "event_id", ColumnType::String),
                    mapping(&topic, "value", "value", ColumnType::Int64),
                ],
            ),
        ))
        .await?;

    let trickle: Vec<_> = (0..10)
        .map(|i| json!({"event_id": format!("e{i}"), "value": i}))
        .collect();
    produce_json(&topic, trickle).await?;

    let flushed = wait_until(Duration::from_secs(15), || async {
        count_rows(&table).await.map(|n| n == 10).unwrap_or(false)
    })
    .await;
    assert!(flushed, "trickle should flush on the delay trigger");

    manager.terminate(&pipeline_id).await?;
    Ok(())
}
