//! Persistent priority queue of LLM maintenance tasks.
//!
//! Items survive restarts, drain in priority-then-FIFO order, and
//! dead-letter after repeated failures. Validation items are reserved for
//! the daily ceremony and never reach the worker.

pub mod store;
pub mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::TaskQueue;
pub use worker::QueueWorker;

/// Failures after which an item is dead-lettered.
pub const MAX_ATTEMPTS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FastScan,
    DetailUpdate,
    EiValidation,
    DescriptionRegen,
    ExposureAnalysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FastScan => "fast_scan",
            TaskType::DetailUpdate => "detail_update",
            TaskType::EiValidation => "ei_validation",
            TaskType::DescriptionRegen => "description_regen",
            TaskType::ExposureAnalysis => "exposure_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        match s {
            "fast_scan" => Some(TaskType::FastScan),
            "detail_update" => Some(TaskType::DetailUpdate),
            "ei_validation" => Some(TaskType::EiValidation),
            "description_regen" => Some(TaskType::DescriptionRegen),
            "exposure_analysis" => Some(TaskType::ExposureAnalysis),
            _ => None,
        }
    }
}

/// Dequeue order: high before normal before low, FIFO within each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(v: i64) -> Priority {
        match v {
            0 => Priority::High,
            2 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl QueueItem {
    /// Deserialize the payload into its typed form.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
