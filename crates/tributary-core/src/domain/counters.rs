//! Flow execution progress counters and duplicate-delivery audit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::ids::{FlowExecId, FlowId, MessageId, StepId};

/// Duplicate audit rows are kept for this many days
pub const DUPLICATE_RETENTION_DAYS: i64 = 7;

/// Default page size for duplicate audit queries
pub const DEFAULT_DUPLICATE_LIMIT: usize = 100;

/// Per-step tallies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCounter {
    /// Deliveries accepted for the step
    #[serde(rename = "in", default)]
    pub inbound: u64,

    /// Step-state notifications received from the step
    #[serde(default)]
    pub out: u64,

    /// Errors reported by the step
    #[serde(default)]
    pub errors: u64,

    /// Last accepted message id
    #[serde(default)]
    pub message_id: Option<MessageId>,

    /// When the last message was accepted
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Progress tallies of one flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExecutionCounters {
    /// Unique key
    pub flow_exec_id: FlowExecId,

    /// Flow the execution belongs to
    #[serde(default)]
    pub flow_id: Option<FlowId>,

    /// Owning tenant
    #[serde(default)]
    pub tenant: Option<String>,

    /// Steps started
    pub started: i64,

    /// Steps succeeded
    pub succeeded: i64,

    /// Errors reported across all steps
    pub errors: u64,

    /// Per-step tallies
    #[serde(default)]
    pub step_counters: HashMap<StepId, StepCounter>,

    /// Started node markers, append-only
    #[serde(default)]
    pub started_nodes: Vec<StepId>,

    /// Succeeded node markers, append-only
    #[serde(default)]
    pub succeeded_nodes: Vec<StepId>,

    /// Row creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl FlowExecutionCounters {
    /// Empty row
    pub fn new(flow_exec_id: FlowExecId, flow_id: Option<FlowId>, now: DateTime<Utc>) -> Self {
        Self {
            flow_exec_id,
            flow_id,
            tenant: None,
            started: 0,
            succeeded: 0,
            errors: 0,
            step_counters: HashMap::new(),
            started_nodes: Vec::new(),
            succeeded_nodes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Every started step has succeeded
    pub fn is_complete(&self) -> bool {
        self.started == self.succeeded
    }

    /// Tallies of one step
    pub fn step_counter(&self, step_id: &StepId) -> Option<&StepCounter> {
        self.step_counters.get(step_id)
    }

    /// `message_id` is the last message accepted for `step_id`
    pub fn has_processed(&self, step_id: &StepId, message_id: &MessageId) -> bool {
        self.step_counters
            .get(step_id)
            .and_then(|counter| counter.message_id.as_ref())
            .map_or(false, |seen| seen == message_id)
    }

    /// Add to the execution-level started/succeeded tallies
    pub fn apply_counts(&mut self, started: i64, succeeded: i64, now: DateTime<Utc>) {
        self.started += started;
        self.succeeded += succeeded;
        self.updated_at = now;
    }

    /// Append node markers
    pub fn push_nodes(&mut self, started: &[StepId], succeeded: &[StepId], now: DateTime<Utc>) {
        self.started_nodes.extend_from_slice(started);
        self.succeeded_nodes.extend_from_slice(succeeded);
        self.updated_at = now;
    }

    /// Accept a delivery for `step_id`
    pub fn record_step_in(&mut self, step_id: &StepId, message_id: MessageId, now: DateTime<Utc>) {
        let counter = self.step_counters.entry(step_id.clone()).or_default();
        counter.inbound += 1;
        counter.message_id = Some(message_id);
        counter.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Count a step-state notification
    pub fn record_step_out(&mut self, step_id: &StepId, now: DateTime<Utc>) {
        self.step_counters.entry(step_id.clone()).or_default().out += 1;
        self.updated_at = now;
    }

    /// Count an error against the execution and the step
    pub fn record_error(&mut self, step_id: &StepId, now: DateTime<Utc>) {
        self.errors += 1;
        self.step_counters.entry(step_id.clone()).or_default().errors += 1;
        self.updated_at = now;
    }
}

/// Audit row of a rejected duplicate delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMessageRecord {
    /// Flow execution
    pub flow_exec_id: FlowExecId,

    /// Step
    pub step_id: StepId,

    /// Rejected message id
    pub message_id: MessageId,

    /// Payload of the rejected delivery
    pub original_message: Value,

    /// Detection time
    pub detected_at: DateTime<Utc>,
}

impl DuplicateMessageRecord {
    /// Audit rows are unique on this key
    pub fn key(&self) -> (FlowExecId, StepId, MessageId) {
        (
            self.flow_exec_id.clone(),
            self.step_id.clone(),
            self.message_id.clone(),
        )
    }
}

/// Duplicate deliveries grouped per flow execution and step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMessageStats {
    /// Flow execution
    pub flow_exec_id: FlowExecId,

    /// Step
    pub step_id: StepId,

    /// Number of rejected deliveries
    pub count: u64,

    /// Earliest detection
    pub first_occurrence: DateTime<Utc>,

    /// Latest detection
    pub last_occurrence: DateTime<Utc>,

    /// Milliseconds between first and last detection
    pub time_span_ms: i64,
}

/// Group audit rows detected within `[from, to]`, most frequent first
pub fn duplicate_message_stats<'a, I>(
    records: I,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<DuplicateMessageStats>
where
    I: IntoIterator<Item = &'a DuplicateMessageRecord>,
{
    let mut groups: BTreeMap<(FlowExecId, StepId), (u64, DateTime<Utc>, DateTime<Utc>)> =
        BTreeMap::new();

    for record in records {
        if record.detected_at < from || record.detected_at > to {
            continue;
        }
        let key = (record.flow_exec_id.clone(), record.step_id.clone());
        groups
            .entry(key)
            .and_modify(|(count, first, last)| {
                *count += 1;
                *first = (*first).min(record.detected_at);
                *last = (*last).max(record.detected_at);
            })
            .or_insert((1, record.detected_at, record.detected_at));
    }

    let mut stats: Vec<DuplicateMessageStats> = groups
        .into_iter()
        .map(|((flow_exec_id, step_id), (count, first, last))| DuplicateMessageStats {
            flow_exec_id,
            step_id,
            count,
            first_occurrence: first,
            last_occurrence: last,
            time_span_ms: (last - first).num_milliseconds(),
        })
        .collect();
    stats.sort_by(|a, b| b.count.cmp(&a.count));
    stats
}
