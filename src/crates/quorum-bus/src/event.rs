//! Bus event shape.
//!
//! Grounded on the teacher's `ExecutionEvent` tagged-enum idiom, expanded to
//! the full event-name surface a workflow publishes (workflow_*, phase_*,
//! task_*, agent_event, log, kanban_*, plus the SSE gateway's `connected`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event published on the bus. The `type` tag is what SSE clients see
/// as the `event:` line name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        error_code: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowPaused {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        phase: String,
        timestamp: DateTime<Utc>,
    },
    PhaseCompleted {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        phase: String,
        timestamp: DateTime<Utc>,
    },
    PhaseAwaitingReview {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        phase: String,
        timestamp: DateTime<Utc>,
    },
    TaskCreated {
        workflow_id: String,
        task_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        workflow_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskProgress {
        workflow_id: String,
        task_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    TaskRetry {
        workflow_id: String,
        task_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        workflow_id: String,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        workflow_id: String,
        task_id: String,
        error_code: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskSkipped {
        workflow_id: String,
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    AgentEvent {
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        agent: String,
        event_type: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Log {
        level: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    KanbanColumnChanged {
        workflow_id: String,
        column: String,
        timestamp: DateTime<Utc>,
    },
    Connected {
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Tag name, matching the `event:` line an SSE client sees.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::WorkflowStarted { .. } => "workflow_started",
            Event::WorkflowCompleted { .. } => "workflow_completed",
            Event::WorkflowFailed { .. } => "workflow_failed",
            Event::WorkflowCancelled { .. } => "workflow_cancelled",
            Event::WorkflowPaused { .. } => "workflow_paused",
            Event::WorkflowResumed { .. } => "workflow_resumed",
            Event::PhaseStarted { .. } => "phase_started",
            Event::PhaseCompleted { .. } => "phase_completed",
            Event::PhaseAwaitingReview { .. } => "phase_awaiting_review",
            Event::TaskCreated { .. } => "task_created",
            Event::TaskStarted { .. } => "task_started",
            Event::TaskProgress { .. } => "task_progress",
            Event::TaskRetry { .. } => "task_retry",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskSkipped { .. } => "task_skipped",
            Event::AgentEvent { .. } => "agent_event",
            Event::Log { .. } => "log",
            Event::KanbanColumnChanged { .. } => "kanban_column_changed",
            Event::Connected { .. } => "connected",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::WorkflowStarted { timestamp, .. }
            | Event::WorkflowCompleted { timestamp, .. }
            | Event::WorkflowFailed { timestamp, .. }
            | Event::WorkflowCancelled { timestamp, .. }
            | Event::WorkflowPaused { timestamp, .. }
            | Event::WorkflowResumed { timestamp, .. }
            | Event::PhaseStarted { timestamp, .. }
            | Event::PhaseCompleted { timestamp, .. }
            | Event::PhaseAwaitingReview { timestamp, .. }
            | Event::TaskCreated { timestamp, .. }
            | Event::TaskStarted { timestamp, .. }
            | Event::TaskProgress { timestamp, .. }
            | Event::TaskRetry { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::AgentEvent { timestamp, .. }
            | Event::Log { timestamp, .. }
            | Event::KanbanColumnChanged { timestamp, .. }
            | Event::Connected { timestamp } => *timestamp,
        }
    }

    /// `project_id` used by the SSE gateway's `?project=` filter. Only
    /// workflow/phase-level events carry one; task/agent/log events are
    /// always delivered (they're rare enough that per-project filtering
    /// isn't load-bearing for them).
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Event::WorkflowStarted { project_id, .. }
            | Event::WorkflowCompleted { project_id, .. }
            | Event::WorkflowFailed { project_id, .. }
            | Event::WorkflowCancelled { project_id, .. }
            | Event::WorkflowPaused { project_id, .. }
            | Event::WorkflowResumed { project_id, .. }
            | Event::PhaseStarted { project_id, .. }
            | Event::PhaseCompleted { project_id, .. }
            | Event::PhaseAwaitingReview { project_id, .. } => project_id.as_deref(),
            _ => None,
        }
    }

    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Event::WorkflowStarted { workflow_id, .. }
            | Event::WorkflowCompleted { workflow_id, .. }
            | Event::WorkflowFailed { workflow_id, .. }
            | Event::WorkflowCancelled { workflow_id, .. }
            | Event::WorkflowPaused { workflow_id, .. }
            | Event::WorkflowResumed { workflow_id, .. }
            | Event::PhaseStarted { workflow_id, .. }
            | Event::PhaseCompleted { workflow_id, .. }
            | Event::PhaseAwaitingReview { workflow_id, .. }
            | Event::TaskCreated { workflow_id, .. }
            | Event::TaskStarted { workflow_id, .. }
            | Event::TaskProgress { workflow_id, .. }
            | Event::TaskRetry { workflow_id, .. }
            | Event::TaskCompleted { workflow_id, .. }
            | Event::TaskFailed { workflow_id, .. }
            | Event::TaskSkipped { workflow_id, .. }
            | Event::AgentEvent { workflow_id, .. }
            | Event::KanbanColumnChanged { workflow_id, .. } => Some(workflow_id),
            Event::Log { workflow_id, .. } => workflow_id.as_deref(),
            Event::Connected { .. } => None,
        }
    }

    /// Render as an SSE wire frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_tag() {
        let e = Event::Connected { timestamp: Utc::now() };
        assert_eq!(e.event_type(), "connected");
    }

    #[test]
    fn sse_frame_has_event_and_data_lines() {
        let e = Event::TaskStarted {
            workflow_id: "wf-1".into(),
            task_id: "t-1".into(),
            timestamp: Utc::now(),
        };
        let frame = e.to_sse_frame();
        assert!(frame.starts_with("event: task_started\n"));
        assert!(frame.contains("\"task_id\":\"t-1\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn project_filter_only_applies_to_workflow_level_events() {
        let e = Event::TaskCompleted {
            workflow_id: "wf-1".into(),
            task_id: "t-1".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(e.project_id(), None);
    }
}
