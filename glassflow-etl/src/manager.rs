//! Process-wide pipeline registry.
//!
//! The manager owns every pipeline instance and serializes lifecycle
//! mutations behind one async mutex; status reads only take the registry
//! read lock. Configs and the last stable lifecycle state are persisted in
//! the bus's key-value bucket, so a restarted process rebuilds its
//! pipelines and the durable consumers resume where they left off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::LivenessRegistry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use async_nats::jetstream::consumer::DeliverPolicy;

use crate::bus::{KvStore, MessageBus};
use crate::clickhouse::ClickHouseInserter;
use crate::config::Config;
use crate::dedup::DedupWorker;
use crate::dlq::DlqWriter;
use crate::error::PipelineError;
use crate::ingest::IngestorWorker;
use crate::join::{JoinSide, JoinWorker};
use crate::operator::{operator_channel, OperatorCommand, OperatorHandle, OperatorState};
use crate::pipeline_config::PipelineConfig;
use crate::sink::SinkWorker;
use crate::status::{
    aggregate, transition, LifecycleAction, PipelineState, StatusSnapshot,
};
use crate::streams;

#[derive(Serialize, Deserialize)]
struct PersistedPipeline {
    config: PipelineConfig,
    state: PipelineState,
}

struct PipelineRuntime {
    cancel: CancellationToken,
    operators: Vec<OperatorHandle>,
    tasks: Vec<JoinHandle<()>>,
}

struct PipelineEntry {
    config: PipelineConfig,
    state: PipelineState,
    runtime: Option<PipelineRuntime>,
    version: Arc<AtomicU64>,
}

/// Summary row for `list`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub name: String,
    pub state: PipelineState,
}

#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    bus: MessageBus,
    kv: KvStore,
    liveness: LivenessRegistry,
    pipelines: RwLock<HashMap<String, PipelineEntry>>,
    /// Serializes all lifecycle mutations.
    mutation: Mutex<()>,
}

impl PipelineManager {
    pub async fn new(
        config: Config,
        bus: MessageBus,
        liveness: LivenessRegistry,
    ) -> Result<Self, PipelineError> {
        let kv = bus.key_value(streams::PIPELINES_BUCKET).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bus,
                kv,
                liveness,
                pipelines: RwLock::new(HashMap::new()),
                mutation: Mutex::new(()),
            }),
        })
    }

    /// Validates, persists and starts a new pipeline. Refuses duplicates
    /// and, in single-active deployments, a second non-terminal pipeline.
    pub async fn create(&self, config: PipelineConfig) -> Result<String, PipelineError> {
        config.validate().map_err(PipelineError::Validation)?;
        let pipeline_id = config.pipeline_id.clone();

        let _guard = self.inner.mutation.lock().await;

        {
            let pipelines = self.inner.pipelines.read().await;
            if let Some(existing) = pipelines.get(&pipeline_id) {
                if existing.state != PipelineState::Deleted {
                    return Err(PipelineError::Conflict(pipeline_id));
                }
            }
            if self.inner.config.single_active_pipeline {
                if let Some((active_id, _)) = pipelines
                    .iter()
                    .find(|(_, entry)| entry.state.is_active())
                {
                    return Err(PipelineError::ResourceLimit(active_id.clone()));
                }
            }
        }

        self.inner.ensure_streams(&config).await?;
        let runtime = self.inner.spawn_workers(&config).await?;

        if let Err(err) = self.inner.persist(&config, PipelineState::Running).await {
            // Without the persisted record the pipeline would vanish on
            // restart; stop the workers and fail the create.
            runtime.cancel.cancel();
            return Err(err);
        }

        let mut pipelines = self.inner.pipelines.write().await;
        pipelines.insert(
            pipeline_id.clone(),
            PipelineEntry {
                config,
                state: PipelineState::Running,
                runtime: Some(runtime),
                version: Arc::new(AtomicU64::new(1)),
            },
        );

        info!(pipeline_id = %pipeline_id, "pipeline created");
        Ok(pipeline_id)
    }

    pub async fn get(&self, pipeline_id: &str) -> Result<(PipelineConfig, PipelineState), PipelineError> {
        let pipelines = self.inner.pipelines.read().await;
        let entry = pipelines
            .get(pipeline_id)
            .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
        Ok((entry.config.clone(), entry.state))
    }

    pub async fn list(&self) -> Vec<PipelineSummary> {
        let pipelines = self.inner.pipelines.read().await;
        let mut summaries: Vec<PipelineSummary> = pipelines
            .iter()
            .map(|(id, entry)| PipelineSummary {
                pipeline_id: id.clone(),
                name: entry.config.name.clone(),
                state: entry.state,
            })
            .collect();
        summaries.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        summaries
    }

    /// Soft-stops consumption. Completes once every operator reports
    /// Paused, or after the pause timeout with the pipeline left nominally
    /// Pausing and its stragglers surfaced in status.
    pub async fn pause(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let _guard = self.inner.mutation.lock().await;

        let handles = {
            let mut pipelines = self.inner.pipelines.write().await;
            let entry = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            match transition(entry.state, LifecycleAction::Pause) {
                None => {
                    return Err(PipelineError::IllegalTransition {
                        pipeline_id: pipeline_id.to_string(),
                        from: entry.state,
                        action: "pause",
                    })
                }
                Some(PipelineState::Paused) => return Ok(()), // already paused
                Some(next) => entry.state = next,
            }
            entry.version.fetch_add(1, Ordering::Relaxed);
            entry.operator_handles()
        };

        for handle in &handles {
            handle.send(OperatorCommand::Pause).await;
        }

        let all_paused = wait_for_all(
            handles,
            |state| matches!(state, OperatorState::Paused | OperatorState::Stopped),
            self.inner.config.pause_timeout(),
        )
        .await;

        if !all_paused {
            warn!(pipeline_id, "pause timed out; pipeline stays in Pausing");
            return Ok(());
        }

        self.inner
            .set_state(pipeline_id, PipelineState::Paused, true)
            .await?;
        info!(pipeline_id, "pipeline paused");
        Ok(())
    }

    pub async fn resume(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let _guard = self.inner.mutation.lock().await;

        let handles = {
            let mut pipelines = self.inner.pipelines.write().await;
            let entry = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            match transition(entry.state, LifecycleAction::Resume) {
                None => {
                    return Err(PipelineError::IllegalTransition {
                        pipeline_id: pipeline_id.to_string(),
                        from: entry.state,
                        action: "resume",
                    })
                }
                Some(PipelineState::Running) => return Ok(()), // already running
                Some(next) => entry.state = next,
            }
            entry.version.fetch_add(1, Ordering::Relaxed);
            entry.operator_handles()
        };

        for handle in &handles {
            handle.send(OperatorCommand::Resume).await;
        }

        let all_running = wait_for_all(
            handles,
            |state| state == OperatorState::Running,
            self.inner.config.pause_timeout(),
        )
        .await;

        if !all_running {
            warn!(pipeline_id, "resume timed out; pipeline stays in Resuming");
            return Ok(());
        }

        self.inner
            .set_state(pipeline_id, PipelineState::Running, true)
            .await?;
        info!(pipeline_id, "pipeline resumed");
        Ok(())
    }

    /// Hard stop: operators drain within the drain timeout, then the
    /// cancellation token fells whatever is left. In-flight batches are
    /// nak'd back to the bus for the next run.
    pub async fn terminate(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let _guard = self.inner.mutation.lock().await;

        let handles = {
            let mut pipelines = self.inner.pipelines.write().await;
            let entry = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            match transition(entry.state, LifecycleAction::Terminate) {
                None => {
                    return Err(PipelineError::IllegalTransition {
                        pipeline_id: pipeline_id.to_string(),
                        from: entry.state,
                        action: "terminate",
                    })
                }
                Some(next) => entry.state = next,
            }
            entry.version.fetch_add(1, Ordering::Relaxed);
            entry.operator_handles()
        };

        for handle in &handles {
            handle.send(OperatorCommand::Terminate).await;
        }
        wait_for_all(
            handles,
            |state| state == OperatorState::Stopped,
            self.inner.config.terminate_drain_timeout(),
        )
        .await;

        let runtime = {
            let mut pipelines = self.inner.pipelines.write().await;
            pipelines
                .get_mut(pipeline_id)
                .and_then(|entry| entry.runtime.take())
        };
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            for task in runtime.tasks {
                if let Err(err) =
                    tokio::time::timeout(Duration::from_secs(5), task).await
                {
                    warn!(pipeline_id, error = %err, "worker did not exit in time");
                }
            }
        }

        self.inner
            .set_state(pipeline_id, PipelineState::Terminated, true)
            .await?;
        info!(pipeline_id, "pipeline terminated");
        Ok(())
    }

    /// Removes a terminated pipeline: its streams and durable consumers go
    /// away with them; the DLQ stream is retained until explicitly purged.
    pub async fn delete(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let _guard = self.inner.mutation.lock().await;

        let config = {
            let mut pipelines = self.inner.pipelines.write().await;
            let entry = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            match transition(entry.state, LifecycleAction::Delete) {
                None => {
                    return Err(PipelineError::IllegalTransition {
                        pipeline_id: pipeline_id.to_string(),
                        from: entry.state,
                        action: "delete",
                    })
                }
                Some(next) => entry.state = next,
            }
            entry.version.fetch_add(1, Ordering::Relaxed);
            entry.config.clone()
        };

        for topic in &config.source.topics {
            let stream = streams::input_stream(pipeline_id, &topic.name);
            if let Err(err) = self.inner.bus.delete_stream(&stream).await {
                warn!(pipeline_id, stream, error = %err, "stream deletion failed");
            }
        }
        if config.join_active() {
            let stream = streams::joined_stream(pipeline_id);
            if let Err(err) = self.inner.bus.delete_stream(&stream).await {
                warn!(pipeline_id, stream, error = %err, "stream deletion failed");
            }
        }

        self.inner.kv.delete(pipeline_id).await?;
        info!(pipeline_id, "pipeline deleted");
        Ok(())
    }

    /// Drops all messages from the pipeline's DLQ. Returns how many were
    /// purged.
    pub async fn purge_dlq(&self, pipeline_id: &str) -> Result<u64, PipelineError> {
        {
            let pipelines = self.inner.pipelines.read().await;
            if !pipelines.contains_key(pipeline_id) {
                return Err(PipelineError::NotFound(pipeline_id.to_string()));
            }
        }
        let purged = self
            .inner
            .bus
            .purge(&streams::dlq_stream(pipeline_id), None)
            .await?;
        info!(pipeline_id, purged, "DLQ purged");
        Ok(purged)
    }

    pub async fn dlq_depth(&self, pipeline_id: &str) -> Result<u64, PipelineError> {
        Ok(self
            .inner
            .bus
            .count(&streams::dlq_stream(pipeline_id), None)
            .await?)
    }

    /// Point-in-time status snapshot with a monotonic version.
    pub async fn status(&self, pipeline_id: &str) -> Result<StatusSnapshot, PipelineError> {
        let (state, operators, version) = {
            let pipelines = self.inner.pipelines.read().await;
            let entry = pipelines
                .get(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            let operators = entry
                .runtime
                .as_ref()
                .map(|runtime| {
                    runtime
                        .operators
                        .iter()
                        .map(|handle| handle.report())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            (
                entry.state,
                operators,
                entry.version.fetch_add(1, Ordering::Relaxed) + 1,
            )
        };

        let dlq_depth = self.dlq_depth(pipeline_id).await.unwrap_or(0);
        let status = aggregate(state, &operators);

        Ok(StatusSnapshot {
            pipeline_id: pipeline_id.to_string(),
            state,
            status,
            operators,
            dlq_depth,
            version,
        })
    }

    /// Reloads persisted pipelines after a restart. Streams and consumers
    /// are re-ensured (idempotent) and workers resume from the durable
    /// consumer positions; unreadable or invalid configs park the pipeline
    /// as Failed instead of being retried.
    pub async fn recover(&self) -> Result<(), PipelineError> {
        let _guard = self.inner.mutation.lock().await;

        let keys = self.inner.kv.keys().await?;
        info!(count = keys.len(), "recovering persisted pipelines");

        for pipeline_id in keys {
            let Some(raw) = self.inner.kv.get(&pipeline_id).await? else {
                continue;
            };
            let persisted: PersistedPipeline = match serde_json::from_slice(&raw) {
                Ok(persisted) => persisted,
                Err(err) => {
                    error!(pipeline_id, error = %err, "persisted pipeline unreadable, skipping");
                    continue;
                }
            };

            let entry = self.inner.recover_one(&pipeline_id, persisted).await;
            self.inner
                .pipelines
                .write()
                .await
                .insert(pipeline_id, entry);
        }
        Ok(())
    }

    /// Stops all running workers without touching persisted state, so the
    /// next process start resumes every pipeline where it was.
    pub async fn shutdown(&self) {
        let runtimes: Vec<(String, PipelineRuntime)> = {
            let mut pipelines = self.inner.pipelines.write().await;
            pipelines
                .iter_mut()
                .filter_map(|(id, entry)| entry.runtime.take().map(|rt| (id.clone(), rt)))
                .collect()
        };

        for (pipeline_id, runtime) in runtimes {
            info!(pipeline_id = %pipeline_id, "stopping pipeline workers");
            for handle in &runtime.operators {
                handle.send(OperatorCommand::Terminate).await;
            }
            runtime.cancel.cancel();
            for task in runtime.tasks {
                if let Err(err) = tokio::time::timeout(Duration::from_secs(10), task).await {
                    warn!(pipeline_id = %pipeline_id, error = %err, "worker did not exit in time");
                }
            }
        }
    }
}

impl PipelineEntry {
    fn operator_handles(&self) -> Vec<OperatorHandle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.operators.clone())
            .unwrap_or_default()
    }
}

async fn wait_for_all(
    handles: Vec<OperatorHandle>,
    pred: fn(OperatorState) -> bool,
    timeout: Duration,
) -> bool {
    let mut all = true;
    for mut handle in handles {
        if !handle.wait_for_state(pred, timeout).await {
            warn!(operator = %handle.name, "operator did not reach the expected state in time");
            all = false;
        }
    }
    all
}

impl Inner {
    async fn persist(
        &self,
        config: &PipelineConfig,
        state: PipelineState,
    ) -> Result<(), PipelineError> {
        let persisted = PersistedPipeline {
            config: config.clone(),
            state,
        };
        let raw = serde_json::to_vec(&persisted)
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        self.kv.put(&config.pipeline_id, raw).await?;
        Ok(())
    }

    async fn set_state(
        &self,
        pipeline_id: &str,
        state: PipelineState,
        persist: bool,
    ) -> Result<(), PipelineError> {
        let config = {
            let mut pipelines = self.pipelines.write().await;
            let entry = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| PipelineError::NotFound(pipeline_id.to_string()))?;
            entry.state = state;
            entry.version.fetch_add(1, Ordering::Relaxed);
            entry.config.clone()
        };
        if persist {
            self.persist(&config, state).await?;
        }
        Ok(())
    }

    async fn ensure_streams(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        let id = &config.pipeline_id;
        let max_age = self.config.bus_stream_max_age();
        let max_bytes = self.config.bus_stream_max_bytes;

        for topic in &config.source.topics {
            self.bus
                .ensure_stream(
                    &streams::input_stream(id, &topic.name),
                    vec![
                        streams::input_subject(id, &topic.name),
                        streams::dedup_subject(id, &topic.name),
                    ],
                    max_age,
                    max_bytes,
                )
                .await?;
        }

        if config.join_active() {
            self.bus
                .ensure_stream(
                    &streams::joined_stream(id),
                    vec![streams::joined_subject(id)],
                    max_age,
                    max_bytes,
                )
                .await?;
        }

        self.bus
            .ensure_stream(
                &streams::dlq_stream(id),
                vec![streams::dlq_subject(id)],
                max_age,
                max_bytes,
            )
            .await?;
        Ok(())
    }

    /// Builds and spawns all workers of one pipeline, wired per the config:
    /// ingestor per topic, optional dedup per topic, optional joiner, one
    /// sink.
    async fn spawn_workers(
        &self,
        config: &PipelineConfig,
    ) -> Result<PipelineRuntime, PipelineError> {
        let id = &config.pipeline_id;
        let cancel = CancellationToken::new();
        let mut operators = Vec::new();
        let mut tasks = Vec::new();

        let dlq = DlqWriter::new(self.bus.clone(), id, self.config.bus_publish_retry());
        let liveness_deadline = self.config.liveness_deadline();

        for topic in &config.source.topics {
            let operator_name = format!("ingestor:{}", topic.name);
            let (handle, ctx) = operator_channel(&operator_name);
            let liveness = self
                .liveness
                .register(format!("{id}:{operator_name}"), liveness_deadline)
                .await;
            let worker = IngestorWorker::new(
                id,
                &topic.name,
                topic.initial_offset.into(),
                &config.source.connection,
                &self.config.kafka,
                self.bus.clone(),
                self.config.bus_publish_retry(),
                ctx,
                cancel.child_token(),
                liveness,
                liveness_deadline,
            )?;
            operators.push(handle);
            tasks.push(tokio::spawn(worker.run()));

            if let Some(dedup_config) = config.dedup_for(&topic.name) {
                let operator_name = format!("dedup:{}", topic.name);
                let (handle, ctx) = operator_channel(&operator_name);
                let liveness = self
                    .liveness
                    .register(format!("{id}:{operator_name}"), liveness_deadline)
                    .await;
                let consumer = self
                    .bus
                    .subscribe(
                        &streams::input_stream(id, &topic.name),
                        &streams::dedup_consumer(id, &topic.name),
                        DeliverPolicy::All,
                        &streams::input_subject(id, &topic.name),
                    )
                    .await?;
                let worker = DedupWorker::new(
                    id,
                    &topic.name,
                    dedup_config.clone(),
                    self.bus.clone(),
                    consumer,
                    dlq.clone(),
                    self.config.bus_publish_retry(),
                    self.config.dedup_shards,
                    self.config.bus_fetch_timeout(),
                    ctx,
                    cancel.child_token(),
                    liveness,
                    liveness_deadline,
                );
                operators.push(handle);
                tasks.push(tokio::spawn(worker.run()));
            }
        }

        if let Some(join) = config.join.as_ref().filter(|j| j.is_active()) {
            let (handle, ctx) = operator_channel("joiner");
            let liveness = self
                .liveness
                .register(format!("{id}:joiner"), liveness_deadline)
                .await;

            let left = self.join_side(config, &join.left().source_id, &join.left().join_key, streams::join_left_consumer(id)).await?;
            let right = self.join_side(config, &join.right().source_id, &join.right().join_key, streams::join_right_consumer(id)).await?;

            let worker = JoinWorker::new(
                id,
                left,
                right,
                join.window(),
                join.orientation(),
                self.bus.clone(),
                streams::joined_subject(id),
                dlq.clone(),
                self.config.bus_publish_retry(),
                self.config.join_buffer_limit,
                self.config.bus_fetch_timeout(),
                ctx,
                cancel.child_token(),
                liveness,
                liveness_deadline,
            );
            operators.push(handle);
            tasks.push(tokio::spawn(worker.run()));
        }

        // The sink consumes the joined stream when a join is active, and the
        // single topic's dedup or input subject otherwise.
        let (sink_stream, sink_subject) = if config.join_active() {
            (streams::joined_stream(id), streams::joined_subject(id))
        } else {
            let topic = &config.source.topics[0];
            let subject = if config.dedup_for(&topic.name).is_some() {
                streams::dedup_subject(id, &topic.name)
            } else {
                streams::input_subject(id, &topic.name)
            };
            (streams::input_stream(id, &topic.name), subject)
        };

        let (handle, ctx) = operator_channel("sink");
        let liveness = self
            .liveness
            .register(format!("{id}:sink"), liveness_deadline)
            .await;
        let consumer = self
            .bus
            .subscribe(
                &sink_stream,
                &streams::sink_consumer(id),
                DeliverPolicy::All,
                &sink_subject,
            )
            .await?;
        let worker = SinkWorker::new(
            id,
            consumer,
            config.sink.column_mappings.clone(),
            config.join_active(),
            ClickHouseInserter::from_config(&config.sink),
            config.sink.max_batch_size,
            config.sink.max_delay_time,
            self.config.sink_insert_timeout(),
            self.config.sink_retry(),
            dlq,
            sink_stream.clone(),
            self.config.bus_fetch_timeout(),
            ctx,
            cancel.child_token(),
            liveness,
            liveness_deadline,
        );
        operators.push(handle);
        tasks.push(tokio::spawn(worker.run()));

        Ok(PipelineRuntime {
            cancel,
            operators,
            tasks,
        })
    }

    async fn join_side(
        &self,
        config: &PipelineConfig,
        topic: &str,
        join_key: &str,
        durable_name: String,
    ) -> Result<JoinSide, PipelineError> {
        let id = &config.pipeline_id;
        let stream = streams::input_stream(id, topic);
        let subject = if config.dedup_for(topic).is_some() {
            streams::dedup_subject(id, topic)
        } else {
            streams::input_subject(id, topic)
        };
        let consumer = self
            .bus
            .subscribe(&stream, &durable_name, DeliverPolicy::All, &subject)
            .await?;
        Ok(JoinSide {
            topic: topic.to_string(),
            consumer,
            join_key: join_key.to_string(),
            source_stream: stream,
        })
    }

    /// Rebuilds one pipeline from its persisted record. Running pipelines
    /// restart their workers; paused ones restart paused; terminal and
    /// failed ones come back as inert entries.
    async fn recover_one(&self, pipeline_id: &str, persisted: PersistedPipeline) -> PipelineEntry {
        let PersistedPipeline { config, state } = persisted;

        if let Err(reason) = config.validate() {
            error!(pipeline_id, reason, "persisted config no longer valid");
            return PipelineEntry {
                config,
                state: PipelineState::Failed,
                runtime: None,
                version: Arc::new(AtomicU64::new(1)),
            };
        }

        match state {
            PipelineState::Running | PipelineState::Paused => {
                if let Err(err) = self.ensure_streams(&config).await {
                    error!(pipeline_id, error = %err, "stream recovery failed");
                    return PipelineEntry {
                        config,
                        state: PipelineState::Failed,
                        runtime: None,
                        version: Arc::new(AtomicU64::new(1)),
                    };
                }
                match self.spawn_workers(&config).await {
                    Ok(runtime) => {
                        if state == PipelineState::Paused {
                            for handle in &runtime.operators {
                                handle.send(OperatorCommand::Pause).await;
                            }
                        }
                        info!(pipeline_id, ?state, "pipeline recovered");
                        PipelineEntry {
                            config,
                            state,
                            runtime: Some(runtime),
                            version: Arc::new(AtomicU64::new(1)),
                        }
                    }
                    Err(err) => {
                        error!(pipeline_id, error = %err, "worker recovery failed");
                        PipelineEntry {
                            config,
                            state: PipelineState::Failed,
                            runtime: None,
                            version: Arc::new(AtomicU64::new(1)),
                        }
                    }
                }
            }
            other => PipelineEntry {
                config,
                state: other,
                runtime: None,
                version: Arc::new(AtomicU64::new(1)),
            },
        }
    }
}
