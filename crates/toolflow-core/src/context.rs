//! Run Context: state threaded through one pipeline execution
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::budget::{Budget, BudgetUsage, Scope};
use crate::stage::StagePatch;

/// One failed stage attempt. Never removed once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// Stage name, or "engine" for structural failures.
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    /// 1-based attempt number of the stage when it failed.
    pub attempt: u32,
}

impl RunError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
            retryable,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub tool_name: String,
    pub request_id: String,
    pub start_time: DateTime<Utc>,
    pub budget: Budget,
    pub scope: Scope,
    pub data: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
    pub errors: Vec<RunError>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub budget_used: BudgetUsage,
}

impl RunContext {
    pub fn new(tool_name: impl Into<String>, request: Value, budget: Budget, scope: Scope) -> Self {
        let mut data = BTreeMap::new();
        data.insert("request".to_string(), request);
        Self {
            tool_name: tool_name.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            budget,
            scope,
            data,
            metadata: BTreeMap::new(),
            errors: Vec::new(),
            retry_count: 0,
            max_retries: 2,
            budget_used: BudgetUsage::default(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The original request payload.
    pub fn request(&self) -> &Value {
        self.data.get("request").unwrap_or(&Value::Null)
    }

    /// A string field of the request payload.
    pub fn request_str(&self, field: &str) -> Option<&str> {
        self.request().get(field).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deserializes a data entry written by an earlier stage.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn remaining(&self) -> Budget {
        self.budget.remaining(&self.budget_used)
    }

    /// Scales a list limit down by half for every retry already consumed
    /// in this run, never below one.
    pub fn narrowed(&self, limit: usize) -> usize {
        let shift = self.retry_count.min(usize::BITS - 1);
        (limit >> shift).max(1)
    }

    /// A fresh context with the patch's data and metadata shallow-merged
    /// over this one. `self` is left untouched.
    pub fn merged(&self, patch: &StagePatch) -> Self {
        let mut next = self.clone();
        for (key, value) in &patch.data {
            next.data.insert(key.clone(), value.clone());
        }
        for (key, value) in &patch.metadata {
            next.metadata.insert(key.clone(), value.clone());
        }
        next.budget_used.absorb(&patch.usage);
        next
    }

    pub(crate) fn record_error(&mut self, error: RunError) {
        self.errors.push(error);
    }

    /// blake3 digest of the data map, for stage traces.
    pub fn data_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.data).unwrap_or_default();
        format!("blake3:{}", blake3::hash(&bytes))
    }
}
