use thiserror::Error;

use crate::bus::BusError;
use crate::status::PipelineState;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Validation(String),

    #[error("pipeline {0} already exists")]
    Conflict(String),

    #[error("pipeline {0} not found")]
    NotFound(String),

    #[error("cannot {action} pipeline {pipeline_id} in state {from:?}")]
    IllegalTransition {
        pipeline_id: String,
        from: PipelineState,
        action: &'static str,
    },

    #[error("active pipeline limit reached: {0} is still active")]
    ResourceLimit(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("persisted pipeline state unreadable: {0}")]
    Persistence(String),
}
