#![forbid(unsafe_code)]

//! The think/act/observe state machine. An [`Agent`] binds one tape at a
//! time, dispatches phases through `execute_step`, and converts phase
//! failures into structured [`StepResult`]s instead of faults. The
//! [`CycleDriver`] runs full cycles and appends each phase's output to the
//! bound tape.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tape_kernel_domain::{
    ExecutionObserver, NullObserver, Step, StepContent, StepMetadata, StepResult, StepType, Tape,
};
use tape_kernel_provider::{LlmProvider, ProviderError};
use tape_kernel_tools::{RunContext, Tool, ToolError, ToolTransport};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent was asked to execute a step with no tape bound. This is a
    /// caller bug, never retried and never recorded.
    #[error("agent '{0}' has no active tape bound")]
    NoActiveTape(String),
}

/// An agent owns at most one active tape and three overridable phases.
/// `execute_step` is the invariant dispatch contract; implementations
/// normally override only the phases.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    fn bind_tape(&mut self, tape: Tape);

    fn take_tape(&mut self) -> Option<Tape>;

    fn current_tape(&self) -> Option<&Tape>;

    fn current_tape_mut(&mut self) -> Option<&mut Tape>;

    /// Reason about a context value and produce the next thought.
    ///
    /// # Errors
    /// Phase failures; callers go through `execute_step`, which converts
    /// them into failed results.
    async fn think(&mut self, context: &Value) -> anyhow::Result<StepResult>;

    /// Carry out the action described by the step.
    ///
    /// # Errors
    /// Phase failures, as for `think`.
    async fn act(&mut self, step: &Step) -> anyhow::Result<StepResult>;

    /// Summarize the outcome of an action step.
    ///
    /// # Errors
    /// Phase failures, as for `think`.
    async fn observe(&mut self, step: &Step) -> anyhow::Result<StepResult>;

    /// Dispatch one step to its phase. Requires a bound tape. Any phase
    /// error comes back as a failed [`StepResult`] tagged with the phase
    /// and the failure kind; the only hard error is [`AgentError`].
    ///
    /// # Errors
    /// [`AgentError::NoActiveTape`] when no tape is bound.
    async fn execute_step(&mut self, step: &Step) -> Result<StepResult, AgentError> {
        if self.current_tape().is_none() {
            return Err(AgentError::NoActiveTape(self.name().to_string()));
        }
        let (phase, outcome) = match step.step_type {
            StepType::Thought => ("think", self.think(&step.content.context_value()).await),
            StepType::Action => ("act", self.act(step).await),
            StepType::Observation => ("observe", self.observe(step).await),
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::debug!(agent = self.name(), phase, error = %err, "phase error");
                Ok(StepResult::failure(err.to_string())
                    .with_metadata("exception_kind", json!(exception_kind(&err)))
                    .with_metadata("phase", json!(phase)))
            }
        }
    }
}

fn exception_kind(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<ToolError>().is_some() {
        "tool"
    } else if err.downcast_ref::<ProviderError>().is_some() {
        "provider"
    } else {
        "internal"
    }
}

/// Minimal reference agent: free-text phases with no collaborators.
pub struct SimpleAgent {
    name: String,
    tape: Option<Tape>,
}

impl SimpleAgent {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tape: None,
        }
    }
}

#[async_trait]
impl Agent for SimpleAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_tape(&mut self, tape: Tape) {
        self.tape = Some(tape);
    }

    fn take_tape(&mut self) -> Option<Tape> {
        self.tape.take()
    }

    fn current_tape(&self) -> Option<&Tape> {
        self.tape.as_ref()
    }

    fn current_tape_mut(&mut self) -> Option<&mut Tape> {
        self.tape.as_mut()
    }

    async fn think(&mut self, context: &Value) -> anyhow::Result<StepResult> {
        let summary = context.as_object().map_or_else(
            || context.to_string(),
            |map| map.keys().cloned().collect::<Vec<_>>().join(", "),
        );
        Ok(StepResult::success(StepContent::text(format!(
            "Thinking about: {summary}"
        ))))
    }

    async fn act(&mut self, step: &Step) -> anyhow::Result<StepResult> {
        Ok(StepResult::success(StepContent::data(json!({
            "action": "process",
            "input": step.content.as_value(),
        }))))
    }

    async fn observe(&mut self, step: &Step) -> anyhow::Result<StepResult> {
        Ok(StepResult::success(StepContent::text(format!(
            "Observed: {}",
            step.content.as_value()
        ))))
    }
}

/// The JSON tool choice an LLM is asked to produce during `think`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolChoice {
    tool_name: String,
    #[serde(default = "empty_object")]
    parameters: Value,
    #[serde(default)]
    reasoning: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// LLM-driven agent over a set of schema-validated tools. Tools come from
/// a [`ToolTransport`] discovered at connect time plus any locally
/// registered ones; every invocation runs through the full
/// validation/retry/recording pipeline.
pub struct ToolAgent<D> {
    name: String,
    tape: Option<Tape>,
    deps: D,
    provider: Arc<dyn LlmProvider>,
    tools: BTreeMap<String, Tool<D>>,
    observer: Arc<dyn ExecutionObserver>,
}

impl<D: Clone + Send + Sync + 'static> ToolAgent<D> {
    /// Connect the transport, discover its tools and wrap each one in the
    /// pipeline.
    ///
    /// # Errors
    /// Returns an error when the transport cannot connect or advertises a
    /// malformed schema.
    pub async fn connect(
        name: impl Into<String>,
        deps: D,
        provider: Arc<dyn LlmProvider>,
        mut transport: Box<dyn ToolTransport>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> anyhow::Result<Self> {
        transport.connect().await?;
        let transport: Arc<dyn ToolTransport> = Arc::from(transport);
        let mut tools = BTreeMap::new();
        for (tool_name, definition) in transport.list_tools() {
            let tool = Tool::from_transport(&definition, Arc::clone(&transport))?
                .with_observer(Arc::clone(&observer));
            tools.insert(tool_name, tool);
        }
        Ok(Self {
            name: name.into(),
            tape: None,
            deps,
            provider,
            tools,
            observer,
        })
    }

    /// Add a locally implemented tool alongside the discovered ones.
    pub fn register_tool(&mut self, tool: Tool<D>) {
        let tool = tool.with_observer(Arc::clone(&self.observer));
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Apply one retry budget to every tool currently registered.
    pub fn set_max_retries(&mut self, max_retries: u32) {
        let tools = std::mem::take(&mut self.tools);
        self.tools = tools
            .into_iter()
            .map(|(name, tool)| (name, tool.with_max_retries(max_retries)))
            .collect();
    }

    #[must_use]
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    fn tool_prompt(&self, context: &Value) -> String {
        let definitions: Vec<Value> = self
            .tools
            .values()
            .map(|tool| serde_json::to_value(tool.definition()).unwrap_or(Value::Null))
            .collect();
        format!(
            "You are agent '{}'.\nContext: {context}\nAvailable tools: {}\n\
             Reply with exactly one JSON object of the form \
             {{\"tool_name\": ..., \"parameters\": {{...}}, \"reasoning\": ...}}.",
            self.name,
            Value::Array(definitions),
        )
    }

    fn parse_choice(text: &str) -> Option<ToolChoice> {
        if let Ok(choice) = serde_json::from_str::<ToolChoice>(text) {
            return Some(choice);
        }
        // Providers often wrap the JSON in prose; take the outermost braces.
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        serde_json::from_str(text.get(start..=end)?).ok()
    }

    fn choice_from_step(step: &Step) -> anyhow::Result<ToolChoice> {
        match &step.content {
            StepContent::ToolCall {
                tool_name,
                arguments,
                reasoning,
            } => Ok(ToolChoice {
                tool_name: tool_name.clone(),
                parameters: arguments.clone(),
                reasoning: reasoning.clone(),
            }),
            StepContent::Text { text } => Self::parse_choice(text)
                .ok_or_else(|| anyhow::anyhow!("thought content carries no tool choice: {text}")),
            other => Err(anyhow::anyhow!(
                "cannot derive a tool choice from {} content",
                other.as_value()["kind"]
            )),
        }
    }
}

#[async_trait]
impl<D: Clone + Send + Sync + 'static> Agent for ToolAgent<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind_tape(&mut self, tape: Tape) {
        self.tape = Some(tape);
    }

    fn take_tape(&mut self) -> Option<Tape> {
        self.tape.take()
    }

    fn current_tape(&self) -> Option<&Tape> {
        self.tape.as_ref()
    }

    fn current_tape_mut(&mut self) -> Option<&mut Tape> {
        self.tape.as_mut()
    }

    async fn think(&mut self, context: &Value) -> anyhow::Result<StepResult> {
        let prompt = self.tool_prompt(context);
        let response = self.provider.generate(&prompt).await?;
        Ok(StepResult::success(StepContent::text(response.text))
            .with_metadata("model", json!(response.model))
            .with_metadata("total_tokens", json!(response.usage.total())))
    }

    async fn act(&mut self, step: &Step) -> anyhow::Result<StepResult> {
        let choice = Self::choice_from_step(step)?;
        let tool = self
            .tools
            .get(&choice.tool_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown tool '{}'", choice.tool_name))?;
        let deps = self.deps.clone();
        let prompt = choice.reasoning.clone().unwrap_or_default();
        let tape = self
            .tape
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no active tape"))?;

        let mut ctx = RunContext::new(deps, prompt, tape);
        let result = tool.execute_with_retry(&choice.parameters, &mut ctx).await?;
        let usage = ctx.usage;
        Ok(StepResult::success(StepContent::ToolResult {
            tool_name: choice.tool_name,
            args: choice.parameters,
            result,
        })
        .with_metadata("usage", json!(usage)))
    }

    async fn observe(&mut self, step: &Step) -> anyhow::Result<StepResult> {
        let summary = match &step.content {
            StepContent::ToolResult {
                tool_name, result, ..
            } => format!("Tool '{tool_name}' returned: {result}"),
            other => format!("Observed: {}", other.as_value()),
        };
        Ok(StepResult::success(StepContent::text(summary)))
    }
}

/// Outcome of one full cycle. Phases after the first failure are `None`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub think: StepResult,
    pub act: Option<StepResult>,
    pub observe: Option<StepResult>,
}

impl CycleReport {
    #[must_use]
    pub fn completed(&self) -> bool {
        self.think.success
            && self.act.as_ref().is_some_and(|r| r.success)
            && self.observe.as_ref().is_some_and(|r| r.success)
    }
}

/// Runs think → act → observe strictly in order, appending each successful
/// phase's output to the agent's bound tape and stopping at the first
/// failed phase.
pub struct CycleDriver {
    observer: Arc<dyn ExecutionObserver>,
}

impl Default for CycleDriver {
    fn default() -> Self {
        Self {
            observer: Arc::new(NullObserver),
        }
    }
}

impl CycleDriver {
    #[must_use]
    pub fn new(observer: Arc<dyn ExecutionObserver>) -> Self {
        Self { observer }
    }

    /// Run one full cycle seeded from a context value.
    ///
    /// # Errors
    /// [`AgentError::NoActiveTape`] when the agent has no bound tape.
    pub async fn run_cycle<A: Agent + ?Sized>(
        &self,
        agent: &mut A,
        context: &Value,
    ) -> Result<CycleReport, AgentError> {
        let seed = Step::new(
            StepType::Thought,
            StepContent::data(context.clone()),
            StepMetadata::new(agent.name().to_string(), "think"),
        );
        let think = agent.execute_step(&seed).await?;
        if !think.success {
            self.report_failure(agent.name(), "think", &think);
            return Ok(CycleReport {
                think,
                act: None,
                observe: None,
            });
        }
        let thought_content = think
            .output
            .clone()
            .unwrap_or_else(|| StepContent::data(context.clone()));
        let thought_step = self.append_phase(agent, StepType::Thought, "think", thought_content)?;

        let action_input = Step::new(
            StepType::Action,
            thought_step.content.clone(),
            StepMetadata::new(agent.name().to_string(), "act"),
        );
        let act = agent.execute_step(&action_input).await?;
        if !act.success {
            self.report_failure(agent.name(), "act", &act);
            return Ok(CycleReport {
                think,
                act: Some(act),
                observe: None,
            });
        }
        let action_content = act
            .output
            .clone()
            .unwrap_or_else(|| action_input.content.clone());
        let action_step = self.append_phase(agent, StepType::Action, "act", action_content)?;

        let observe_input = Step::new(
            StepType::Observation,
            action_step.content.clone(),
            StepMetadata::new(agent.name().to_string(), "observe"),
        );
        let observe = agent.execute_step(&observe_input).await?;
        if observe.success {
            let observation_content = observe
                .output
                .clone()
                .unwrap_or_else(|| observe_input.content.clone());
            self.append_phase(agent, StepType::Observation, "observe", observation_content)?;
        } else {
            self.report_failure(agent.name(), "observe", &observe);
        }

        Ok(CycleReport {
            think,
            act: Some(act),
            observe: Some(observe),
        })
    }

    fn report_failure(&self, agent: &str, phase: &str, result: &StepResult) {
        let error = result.error.as_deref().unwrap_or("unknown failure");
        self.observer.phase_failed(agent, phase, error);
    }

    fn append_phase<A: Agent + ?Sized>(
        &self,
        agent: &mut A,
        step_type: StepType,
        node: &str,
        content: StepContent,
    ) -> Result<Step, AgentError> {
        let metadata = StepMetadata::new(agent.name().to_string(), node);
        let step = Step::new(step_type, content, metadata);
        let name = agent.name().to_string();
        let tape = agent
            .current_tape_mut()
            .ok_or(AgentError::NoActiveTape(name))?;
        self.observer.step_appended(tape.metadata.tape_id, &step);
        tape.append(step.clone());
        Ok(step)
    }
}
