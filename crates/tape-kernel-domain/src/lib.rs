#![forbid(unsafe_code)]

//! Core data model for TapeKernel: the append-only `Tape` of `Step`s with
//! lineage metadata, the transient `StepResult` produced by agent phases,
//! and the observer sink injected into the tool pipeline and cycle driver.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TapeId(pub Ulid);

impl TapeId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StepId(pub Ulid);

impl StepId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thought,
    Action,
    Observation,
}

impl StepType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Thought => "thought",
            StepType::Action => "action",
            StepType::Observation => "observation",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step payload, as a closed union over the shapes the system produces:
/// free text, a structured record, an LLM tool choice, or a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepContent {
    Text {
        text: String,
    },
    Data {
        value: Value,
    },
    ToolCall {
        tool_name: String,
        arguments: Value,
        #[serde(default)]
        reasoning: Option<String>,
    },
    ToolResult {
        tool_name: String,
        args: Value,
        result: Value,
    },
}

impl StepContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn data(value: Value) -> Self {
        Self::Data { value }
    }

    /// Serialize the content to its tagged JSON form. Infallible in practice;
    /// a serialization failure degrades to `null` rather than panicking.
    #[must_use]
    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The value handed to `think` when this content seeds a thought phase.
    /// `Data` passes its record through; `Text` is wrapped so the context is
    /// always a JSON value the phase can inspect.
    #[must_use]
    pub fn context_value(&self) -> Value {
        match self {
            StepContent::Data { value } => value.clone(),
            StepContent::Text { text } => json!({ "text": text }),
            other => other.as_value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMetadata {
    pub agent: String,
    pub node: String,
    #[serde(default)]
    pub prompt_id: Option<String>,
    pub recorded_at: DateTimeUtc,
    pub id: Ulid,
}

impl StepMetadata {
    /// `id` and `recorded_at` are generated here and never mutated afterwards.
    #[must_use]
    pub fn new(agent: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            node: node.into(),
            prompt_id: None,
            recorded_at: now_utc(),
            id: Ulid::new(),
        }
    }

    #[must_use]
    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub content: StepContent,
    pub metadata: StepMetadata,
    pub step_id: StepId,
}

impl Step {
    #[must_use]
    pub fn new(step_type: StepType, content: StepContent, metadata: StepMetadata) -> Self {
        Self {
            step_type,
            content,
            metadata,
            step_id: StepId::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TapeMetadata {
    pub author: String,
    #[serde(default)]
    pub parent_id: Option<TapeId>,
    pub created_at: DateTimeUtc,
    pub tape_id: TapeId,
}

impl TapeMetadata {
    #[must_use]
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            parent_id: None,
            created_at: now_utc(),
            tape_id: TapeId::new(),
        }
    }
}

/// Append-only ordered log of steps. Insertion order is the ground truth of
/// execution order; steps are never reordered or removed once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tape {
    steps: Vec<Step>,
    pub metadata: TapeMetadata,
}

impl Tape {
    #[must_use]
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            metadata: TapeMetadata::new(author),
        }
    }

    /// Reconstruct a tape from previously persisted parts. The store is the
    /// only expected caller; it must supply steps in their original order.
    #[must_use]
    pub fn from_parts(metadata: TapeMetadata, steps: Vec<Step>) -> Self {
        Self { steps, metadata }
    }

    pub fn append(&mut self, step: Step) {
        self.steps.push(step);
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn steps_by_type(&self, step_type: StepType) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.step_type == step_type)
            .collect()
    }

    #[must_use]
    pub fn steps_by_agent(&self, agent_name: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.metadata.agent == agent_name)
            .collect()
    }

    #[must_use]
    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Fork this tape into a continuation: a deep copy of the current step
    /// sequence under fresh metadata, with `parent_id` pointing back here.
    /// Appends to the fork never affect the source tape.
    #[must_use]
    pub fn fork(&self) -> Tape {
        let mut metadata = TapeMetadata::new(self.metadata.author.clone());
        metadata.parent_id = Some(self.metadata.tape_id);
        Tape {
            steps: self.steps.clone(),
            metadata,
        }
    }
}

impl Default for Tape {
    fn default() -> Self {
        Self::new("root")
    }
}

/// Transient outcome of one agent phase. Not persisted directly; the cycle
/// driver translates successful results into steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub output: Option<StepContent>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StepResult {
    #[must_use]
    pub fn success(output: StepContent) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Observability sink injected into the tool pipeline and the cycle driver.
/// Hooks default to no-ops so implementations opt into what they care about.
pub trait ExecutionObserver: Send + Sync {
    fn step_appended(&self, _tape_id: TapeId, _step: &Step) {}

    fn tool_retry(&self, _tool_name: &str, _retry: u32, _max_retries: u32, _error: &str) {}

    fn phase_failed(&self, _agent: &str, _phase: &str, _error: &str) {}
}

/// Forwards observer events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn step_appended(&self, tape_id: TapeId, step: &Step) {
        tracing::debug!(
            tape_id = %tape_id,
            step_id = %step.step_id,
            step_type = step.step_type.as_str(),
            agent = %step.metadata.agent,
            node = %step.metadata.node,
            "step appended",
        );
    }

    fn tool_retry(&self, tool_name: &str, retry: u32, max_retries: u32, error: &str) {
        tracing::warn!(tool = tool_name, retry, max_retries, error, "tool attempt failed");
    }

    fn phase_failed(&self, agent: &str, phase: &str, error: &str) {
        tracing::warn!(agent, phase, error, "agent phase failed");
    }
}

/// Discards all observer events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow::anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        hash_json, Step, StepContent, StepMetadata, StepResult, StepType, Tape,
    };
    use serde_json::json;

    fn step(step_type: StepType, agent: &str, node: &str, text: &str) -> Step {
        Step::new(
            step_type,
            StepContent::text(text),
            StepMetadata::new(agent, node),
        )
    }

    fn sample_tape() -> Tape {
        let mut tape = Tape::default();
        tape.append(step(StepType::Thought, "test_agent", "test_node", "Test thought"));
        tape.append(step(StepType::Action, "test_agent", "test_node", "Test action"));
        tape
    }

    #[test]
    fn new_tape_is_empty_with_root_author() {
        let tape = Tape::default();
        assert!(tape.is_empty());
        assert_eq!(tape.metadata.author, "root");
        assert!(tape.metadata.parent_id.is_none());
    }

    #[test]
    fn append_preserves_call_order() {
        let mut tape = Tape::default();
        for i in 0..10 {
            tape.append(step(
                StepType::Thought,
                "agent",
                "node",
                &format!("thought {i}"),
            ));
        }
        let texts: Vec<String> = tape
            .steps()
            .iter()
            .map(|s| match &s.content {
                StepContent::Text { text } => text.clone(),
                _ => String::new(),
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("thought {i}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn filters_are_pure_and_ordered() {
        let mut tape = sample_tape();
        tape.append(step(StepType::Thought, "other_agent", "elsewhere", "noise"));

        let thoughts = tape.steps_by_type(StepType::Thought);
        assert_eq!(thoughts.len(), 2);
        let by_agent = tape.steps_by_agent("test_agent");
        assert_eq!(by_agent.len(), 2);
        let observations = tape.steps_by_type(StepType::Observation);
        assert!(observations.is_empty());
        // Filtering never mutates the tape.
        assert_eq!(tape.len(), 3);
    }

    #[test]
    fn last_step_none_on_empty_tape() {
        let tape = Tape::default();
        assert!(tape.last_step().is_none());

        let tape = sample_tape();
        let last = tape.last_step().map(|s| s.step_type);
        assert_eq!(last, Some(StepType::Action));
    }

    #[test]
    fn fork_links_lineage_and_snapshots_steps() {
        let parent = sample_tape();
        let mut child = parent.fork();

        assert_eq!(child.metadata.parent_id, Some(parent.metadata.tape_id));
        assert_ne!(child.metadata.tape_id, parent.metadata.tape_id);
        assert_eq!(child.metadata.author, parent.metadata.author);
        assert_eq!(child.len(), parent.len());

        child.append(step(StepType::Observation, "test_agent", "obs", "later"));
        assert_eq!(child.len(), 3);
        assert_eq!(parent.len(), 2);
    }

    #[test]
    fn step_ids_are_distinct_from_metadata_ids() {
        let s = step(StepType::Thought, "a", "n", "t");
        assert_ne!(s.step_id.0, s.metadata.id);
    }

    #[test]
    fn tape_round_trips_through_json() {
        let tape = sample_tape();
        let doc = serde_json::to_value(&tape).unwrap_or_else(|err| panic!("serialize: {err}"));
        let restored: Tape =
            serde_json::from_value(doc).unwrap_or_else(|err| panic!("deserialize: {err}"));
        assert_eq!(restored, tape);
    }

    #[test]
    fn content_union_serializes_with_kind_tag() {
        let call = StepContent::ToolCall {
            tool_name: "search".to_string(),
            arguments: json!({"query": "tapes"}),
            reasoning: Some("need data".to_string()),
        };
        let value = call.as_value();
        assert_eq!(value["kind"], "tool_call");
        assert_eq!(value["tool_name"], "search");

        let context = StepContent::text("plain").context_value();
        assert_eq!(context["text"], "plain");
    }

    #[test]
    fn step_result_constructors() {
        let ok = StepResult::success(StepContent::text("done"))
            .with_metadata("phase", json!("think"));
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert_eq!(ok.metadata["phase"], "think");

        let failed = StepResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.output.is_none());
    }

    #[test]
    fn hash_json_is_stable() {
        let first = hash_json(&json!({"a": 1, "b": [1, 2]}))
            .unwrap_or_else(|err| panic!("hash: {err}"));
        let second = hash_json(&json!({"a": 1, "b": [1, 2]}))
            .unwrap_or_else(|err| panic!("hash: {err}"));
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
