use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

/// Lifecycle status of a run as reported by the workflow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    /// `completed` and `failed` end the logical stream for a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the engine's workflows a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Profiling,
    JobSearch,
}

/// Position of a node inside its workflow, for progress steppers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Step {
    pub workflow: Workflow,
    /// Zero-based position in execution order.
    pub index: usize,
    pub total: usize,
}

/// Processing stage that emitted an event.
///
/// Labels the engine may add later are kept verbatim in `Other` instead of
/// failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowNode {
    UserInput,
    CvProcessing,
    Profiling,
    ProfileRetrieval,
    Discovery,
    Matching,
    Research,
    Fabrication,
    Completion,
    Delivery,
    Other(String),
}

const PROFILING_ORDER: &[&str] = &["UserInputNode", "CVProcessingNode"];
const JOB_SEARCH_ORDER: &[&str] = &[
    "ProfileRetrievalNode",
    "DiscoveryNode",
    "MatchingNode",
    "ResearchNode",
    "FabricationNode",
    "CompletionNode",
    "DeliveryNode",
];

impl WorkflowNode {
    pub fn label(&self) -> &str {
        match self {
            WorkflowNode::UserInput => "UserInputNode",
            WorkflowNode::CvProcessing => "CVProcessingNode",
            WorkflowNode::Profiling => "ProfilingNode",
            WorkflowNode::ProfileRetrieval => "ProfileRetrievalNode",
            WorkflowNode::Discovery => "DiscoveryNode",
            WorkflowNode::Matching => "MatchingNode",
            WorkflowNode::Research => "ResearchNode",
            WorkflowNode::Fabrication => "FabricationNode",
            WorkflowNode::Completion => "CompletionNode",
            WorkflowNode::Delivery => "DeliveryNode",
            WorkflowNode::Other(label) => label,
        }
    }

    /// Where this node sits in its workflow. `None` for nodes that are not
    /// sequenced by either workflow.
    pub fn step(&self) -> Option<Step> {
        let label = self.label();
        for (workflow, order) in [
            (Workflow::Profiling, PROFILING_ORDER),
            (Workflow::JobSearch, JOB_SEARCH_ORDER),
        ] {
            if let Some(index) = order.iter().position(|n| *n == label) {
                return Some(Step { workflow, index, total: order.len() });
            }
        }
        None
    }
}

impl From<String> for WorkflowNode {
    fn from(label: String) -> Self {
        match label.as_str() {
            "UserInputNode" => WorkflowNode::UserInput,
            "CVProcessingNode" => WorkflowNode::CvProcessing,
            "ProfilingNode" => WorkflowNode::Profiling,
            "ProfileRetrievalNode" => WorkflowNode::ProfileRetrieval,
            "DiscoveryNode" => WorkflowNode::Discovery,
            "MatchingNode" => WorkflowNode::Matching,
            "ResearchNode" => WorkflowNode::Research,
            "FabricationNode" => WorkflowNode::Fabrication,
            "CompletionNode" => WorkflowNode::Completion,
            "DeliveryNode" => WorkflowNode::Delivery,
            _ => WorkflowNode::Other(label),
        }
    }
}

impl From<WorkflowNode> for String {
    fn from(node: WorkflowNode) -> Self {
        match node {
            WorkflowNode::Other(label) => label,
            known => known.label().to_string(),
        }
    }
}

impl FromStr for WorkflowNode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(WorkflowNode::from(s.to_string()))
    }
}

impl fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One status frame. `status` is mandatory, everything else is additive.
///
/// An optional field of the wrong shape reads as absent, so it can never cost
/// the frame its `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub node: Option<WorkflowNode>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// ISO-8601 as sent by the engine, kept verbatim. See [`parse_timestamp`].
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn lenient<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Reads an engine timestamp. A value without an offset is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl StatusEvent {
    pub fn new(status: RunStatus) -> Self {
        Self { status, node: None, message: None, completed_at: None, error_message: None }
    }

    pub fn processing(node: WorkflowNode, message: impl Into<String>) -> Self {
        Self { node: Some(node), message: Some(message.into()), ..Self::new(RunStatus::Processing) }
    }

    pub fn completed(at: DateTime<Utc>) -> Self {
        Self { completed_at: Some(format_timestamp(at)), ..Self::new(RunStatus::Completed) }
    }

    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(format_timestamp(at)),
            error_message: Some(error.into()),
            ..Self::new(RunStatus::Failed)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn completed_at_utc(&self) -> Option<DateTime<Utc>> {
        self.completed_at.as_deref().and_then(parse_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn decodes_minimal_frame() {
        let evt: StatusEvent = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(evt, StatusEvent::new(RunStatus::Pending));
    }

    #[test]
    fn missing_status_is_rejected() {
        assert!(serde_json::from_str::<StatusEvent>(r#"{"node":"MatchingNode"}"#).is_err());
        assert!(serde_json::from_str::<StatusEvent>(r#"{"status":"exploded"}"#).is_err());
    }

    #[test]
    fn unknown_node_label_is_preserved() {
        let evt: StatusEvent =
            serde_json::from_str(r#"{"status":"processing","node":"ScreeningNode"}"#).unwrap();
        assert_eq!(evt.node, Some(WorkflowNode::Other("ScreeningNode".into())));
        assert_eq!(evt.node.as_ref().unwrap().step(), None);
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let json = serde_json::to_string(&StatusEvent::processing(WorkflowNode::CvProcessing, "parsing")).unwrap();
        assert_eq!(json, r#"{"status":"processing","node":"CVProcessingNode","message":"parsing"}"#);
    }

    #[test]
    fn completed_at_passes_through_verbatim() {
        let evt: StatusEvent =
            serde_json::from_str(r#"{"status":"completed","completed_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["completed_at"], "2024-01-01T00:00:00Z");
        assert_eq!(evt, StatusEvent::completed("2024-01-01T00:00:00Z".parse().unwrap()));
    }

    #[test]
    fn timestamp_without_offset_is_read_as_utc() {
        let evt: StatusEvent =
            serde_json::from_str(r#"{"status":"completed","completed_at":"2024-01-01T12:30:00.250000"}"#).unwrap();
        assert_eq!(evt.completed_at.as_deref(), Some("2024-01-01T12:30:00.250000"));
        let at = evt.completed_at_utc().unwrap();
        assert_eq!(format_timestamp(at), "2024-01-01T12:30:00.250Z");

        assert_eq!(parse_timestamp("2024-01-01T02:00:00+02:00"), parse_timestamp("2024-01-01T00:00:00"));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn bad_optional_field_does_not_hide_status() {
        let evt: StatusEvent = serde_json::from_str(
            r#"{"status":"failed","completed_at":1704067200,"node":null,"message":["x"],"error_message":"boom"}"#,
        )
        .unwrap();
        assert_eq!(evt.status, RunStatus::Failed);
        assert_eq!(evt.completed_at, None);
        assert_eq!(evt.node, None);
        assert_eq!(evt.message, None);
        assert_eq!(evt.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn node_steps_follow_workflow_order() {
        let step = WorkflowNode::CvProcessing.step().unwrap();
        assert_eq!(step, Step { workflow: Workflow::Profiling, index: 1, total: 2 });

        let step = WorkflowNode::Delivery.step().unwrap();
        assert_eq!(step.workflow, Workflow::JobSearch);
        assert_eq!(step.index, 6);
        assert_eq!(step.total, 7);

        assert_eq!(WorkflowNode::Profiling.step(), None);
    }
}
