#![forbid(unsafe_code)]

//! Tool pipeline: explicit parameter schemas with validation, sync/async
//! tool backends behind one dispatch path, the bounded-retry executor that
//! records every failed attempt on the tape, and the transport seam used to
//! import tool registries discovered at runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tape_kernel_domain::{
    ExecutionObserver, NullObserver, Step, StepContent, StepMetadata, StepType, Tape,
};
use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments rejected before the backend ran. Never retried and never
    /// recorded on the tape; the message names every offending field.
    #[error("invalid arguments for tool '{tool}': {}", field_errors.join("; "))]
    Validation {
        tool: String,
        field_errors: Vec<String>,
    },
    /// A backend failure within the retry budget. The attempt has already
    /// been recorded on the tape as a THOUGHT step.
    #[error("tool '{tool}' failed: {message} (retry {retry}/{max_retries})")]
    Retryable {
        tool: String,
        retry: u32,
        max_retries: u32,
        message: String,
    },
    /// The retry budget is spent. Nothing further is written to the tape.
    #[error("tool '{tool}' exhausted retries after {attempts} attempt(s): {message}")]
    Exhausted {
        tool: String,
        attempts: u32,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Accepts any JSON value; emitted as an untyped property.
    Any,
}

impl ParamType {
    #[must_use]
    pub fn json_type(self) -> Option<&'static str> {
        match self {
            ParamType::String => Some("string"),
            ParamType::Integer => Some("integer"),
            ParamType::Number => Some("number"),
            ParamType::Boolean => Some("boolean"),
            ParamType::Array => Some("array"),
            ParamType::Object => Some("object"),
            ParamType::Any => None,
        }
    }

    #[must_use]
    pub fn from_json_type(name: &str) -> Self {
        match name {
            "string" => ParamType::String,
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "boolean" => ParamType::Boolean,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            _ => ParamType::Any,
        }
    }

    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// Declared parameter set of a tool. Built explicitly through the builder;
/// nothing is inferred from function signatures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    params: Vec<ParamSpec>,
}

impl ToolSchema {
    #[must_use]
    pub fn builder() -> ToolSchemaBuilder {
        ToolSchemaBuilder { params: Vec::new() }
    }

    /// Schema of a zero-parameter tool: only `{}` validates against it.
    #[must_use]
    pub fn empty() -> Self {
        Self { params: Vec::new() }
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Render as a JSON Schema object suitable for an LLM tool declaration.
    /// Properties keep their declaration order.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = Map::new();
            if let Some(json_type) = param.param_type.json_type() {
                prop.insert("type".to_string(), json!(json_type));
            }
            prop.insert("description".to_string(), json!(param.description));
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Reconstruct a schema from a JSON Schema object, as produced by
    /// [`ToolSchema::to_json_schema`] or shipped by an external registry.
    /// Unknown property types degrade to [`ParamType::Any`].
    ///
    /// # Errors
    /// Returns an error when the value is not a JSON Schema `object` shape.
    pub fn from_json_schema(schema: &Value) -> anyhow::Result<Self> {
        let Some(root) = schema.as_object() else {
            return Err(anyhow::anyhow!("tool schema MUST be a JSON object"));
        };
        if let Some(kind) = root.get("type") {
            if kind != "object" {
                return Err(anyhow::anyhow!(
                    "tool schema MUST have type 'object', got {kind}"
                ));
            }
        }
        let required: Vec<&str> = root
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut params = Vec::new();
        if let Some(properties) = root.get("properties").and_then(Value::as_object) {
            for (name, prop) in properties {
                let param_type = prop
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(ParamType::Any, ParamType::from_json_type);
                let description = prop
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                params.push(ParamSpec {
                    name: name.clone(),
                    param_type,
                    description,
                    required: required.contains(&name.as_str()),
                    default: prop.get("default").cloned(),
                });
            }
        }
        Ok(Self { params })
    }

    /// Validate arguments against the declared parameters. Collects every
    /// violation (missing required, wrong type, unknown key) before failing.
    ///
    /// # Errors
    /// Returns [`ToolError::Validation`] naming each offending field.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<(), ToolError> {
        let Some(map) = args.as_object() else {
            return Err(ToolError::Validation {
                tool: tool.to_string(),
                field_errors: vec!["arguments: expected a JSON object".to_string()],
            });
        };
        let mut field_errors = Vec::new();
        for param in &self.params {
            match map.get(&param.name) {
                None if param.required => {
                    field_errors.push(format!("{}: missing required argument", param.name));
                }
                Some(value) if !param.param_type.matches(value) => {
                    field_errors.push(format!(
                        "{}: expected {:?} value",
                        param.name, param.param_type
                    ));
                }
                _ => {}
            }
        }
        for key in map.keys() {
            if !self.params.iter().any(|param| param.name == *key) {
                field_errors.push(format!("{key}: unexpected argument"));
            }
        }
        if field_errors.is_empty() {
            Ok(())
        } else {
            Err(ToolError::Validation {
                tool: tool.to_string(),
                field_errors,
            })
        }
    }
}

#[derive(Debug)]
pub struct ToolSchemaBuilder {
    params: Vec<ParamSpec>,
}

impl ToolSchemaBuilder {
    #[must_use]
    pub fn required(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        });
        self
    }

    #[must_use]
    pub fn optional(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
        default: Value,
    ) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            param_type,
            description: description.into(),
            required: false,
            default: Some(default),
        });
        self
    }

    #[must_use]
    pub fn build(self) -> ToolSchema {
        ToolSchema {
            params: self.params,
        }
    }
}

/// Wire form of a tool declaration: what an LLM provider or an external
/// registry sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_json_schema: Value,
    /// When set, validated arguments are nested under this key before the
    /// call reaches the backend. Some registries declare single-object
    /// tools this way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_key: Option<String>,
}

/// Mutable execution state threaded through one agent run. The pipeline is
/// the only component that writes to the tape through this context; tools
/// themselves only see the read-only [`ToolContext`] view.
pub struct RunContext<'t, D> {
    pub deps: D,
    /// Count of successful tool executions in this run.
    pub usage: u32,
    pub prompt: String,
    pub tape: &'t mut Tape,
    pub tool_name: Option<String>,
    /// Failures recorded for the current invocation. Reset when a new
    /// invocation starts, never across attempts of the same one.
    pub retry: u32,
}

impl<'t, D> RunContext<'t, D> {
    pub fn new(deps: D, prompt: impl Into<String>, tape: &'t mut Tape) -> Self {
        Self {
            deps,
            usage: 0,
            prompt: prompt.into(),
            tape,
            tool_name: None,
            retry: 0,
        }
    }

    /// Start a fresh invocation: bind the tool name and zero the counter.
    pub fn begin_invocation(&mut self, tool_name: &str) {
        self.tool_name = Some(tool_name.to_string());
        self.retry = 0;
    }

    fn tool_view(&self) -> ToolContext<'_, D> {
        ToolContext {
            deps: &self.deps,
            usage: self.usage,
            prompt: &self.prompt,
            tool_name: self.tool_name.as_deref(),
            retry: self.retry,
        }
    }
}

/// What a tool backend is allowed to see: shared dependencies and run
/// bookkeeping, but no tape access.
pub struct ToolContext<'c, D> {
    pub deps: &'c D,
    pub usage: u32,
    pub prompt: &'c str,
    pub tool_name: Option<&'c str>,
    pub retry: u32,
}

pub type SyncToolFn<D> = dyn Fn(ToolContext<'_, D>, &Value) -> anyhow::Result<Value> + Send + Sync;
pub type AsyncToolFn<D> = dyn for<'c> Fn(ToolContext<'c, D>, Value) -> BoxFuture<'c, anyhow::Result<Value>>
    + Send
    + Sync;

enum ToolBackend<D> {
    Sync(Arc<SyncToolFn<D>>),
    Async(Arc<AsyncToolFn<D>>),
}

impl<D> Clone for ToolBackend<D> {
    fn clone(&self) -> Self {
        match self {
            ToolBackend::Sync(f) => ToolBackend::Sync(Arc::clone(f)),
            ToolBackend::Async(f) => ToolBackend::Async(Arc::clone(f)),
        }
    }
}

/// A named, schema-validated callable. Sync and async backends share the
/// same execution path; callers cannot tell them apart.
pub struct Tool<D> {
    name: String,
    description: String,
    schema: ToolSchema,
    max_retries: u32,
    backend: ToolBackend<D>,
    observer: Arc<dyn ExecutionObserver>,
}

impl<D> Clone for Tool<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.clone(),
            max_retries: self.max_retries,
            backend: self.backend.clone(),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<D> Tool<D> {
    pub fn new_sync(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        function: impl Fn(ToolContext<'_, D>, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            max_retries: DEFAULT_MAX_RETRIES,
            backend: ToolBackend::Sync(Arc::new(function)),
            observer: Arc::new(NullObserver),
        }
    }

    pub fn new_async(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        function: impl for<'c> Fn(ToolContext<'c, D>, Value) -> BoxFuture<'c, anyhow::Result<Value>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            max_retries: DEFAULT_MAX_RETRIES,
            backend: ToolBackend::Async(Arc::new(function)),
            observer: Arc::new(NullObserver),
        }
    }

    /// Wrap a remotely declared tool so it runs through the same validation
    /// and retry pipeline as local ones. Invocations are forwarded to the
    /// transport by name.
    ///
    /// # Errors
    /// Returns an error when the declared parameter schema is malformed.
    pub fn from_transport(
        definition: &ToolDefinition,
        transport: Arc<dyn ToolTransport>,
    ) -> anyhow::Result<Self> {
        let schema = ToolSchema::from_json_schema(&definition.parameters_json_schema)?;
        let invoke_name = definition.name.clone();
        let outer_key = definition.outer_key.clone();
        let backend: Arc<AsyncToolFn<D>> = Arc::new(move |_ctx, args| {
            let transport = Arc::clone(&transport);
            let name = invoke_name.clone();
            let args = match &outer_key {
                Some(key) => {
                    let mut wrapped = Map::new();
                    wrapped.insert(key.clone(), args);
                    Value::Object(wrapped)
                }
                None => args,
            };
            Box::pin(async move { transport.invoke(&name, &args).await })
        });
        Ok(Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            schema,
            max_retries: DEFAULT_MAX_RETRIES,
            backend: ToolBackend::Async(backend),
            observer: Arc::new(NullObserver),
        })
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_json_schema: self.schema.to_json_schema(),
            outer_key: None,
        }
    }

    /// Run one attempt. On success the result is appended to the tape as an
    /// ACTION step and `ctx.usage` is incremented. On backend failure the
    /// counter advances and, while budget remains, the attempt is recorded
    /// as a THOUGHT step and [`ToolError::Retryable`] returned; past the
    /// budget nothing is recorded and the error is [`ToolError::Exhausted`].
    ///
    /// # Errors
    /// [`ToolError::Validation`], [`ToolError::Retryable`] or
    /// [`ToolError::Exhausted`] as described above.
    pub async fn execute(
        &self,
        args: &Value,
        ctx: &mut RunContext<'_, D>,
    ) -> Result<Value, ToolError> {
        ctx.tool_name = Some(self.name.clone());
        self.schema.validate(&self.name, args)?;

        let outcome = match &self.backend {
            ToolBackend::Sync(function) => function(ctx.tool_view(), args),
            ToolBackend::Async(function) => function(ctx.tool_view(), args.clone()).await,
        };

        match outcome {
            Ok(result) => {
                ctx.usage += 1;
                let step = Step::new(
                    StepType::Action,
                    StepContent::ToolResult {
                        tool_name: self.name.clone(),
                        args: args.clone(),
                        result: result.clone(),
                    },
                    StepMetadata::new(ctx.tape.metadata.author.clone(), self.name.clone()),
                );
                self.observer.step_appended(ctx.tape.metadata.tape_id, &step);
                ctx.tape.append(step);
                Ok(result)
            }
            Err(err) => {
                ctx.retry += 1;
                let message = err.to_string();
                if ctx.retry > self.max_retries {
                    return Err(ToolError::Exhausted {
                        tool: self.name.clone(),
                        attempts: ctx.retry,
                        message,
                    });
                }
                self.observer
                    .tool_retry(&self.name, ctx.retry, self.max_retries, &message);
                let step = Step::new(
                    StepType::Thought,
                    StepContent::text(format!(
                        "Tool execution failed: {message}. Retry {}/{}",
                        ctx.retry, self.max_retries
                    )),
                    StepMetadata::new(ctx.tape.metadata.author.clone(), self.name.clone()),
                );
                self.observer.step_appended(ctx.tape.metadata.tape_id, &step);
                ctx.tape.append(step);
                Err(ToolError::Retryable {
                    tool: self.name.clone(),
                    retry: ctx.retry,
                    max_retries: self.max_retries,
                    message,
                })
            }
        }
    }

    /// Drive [`Tool::execute`] until success or a terminal error. A tool
    /// with `max_retries = 0` gets exactly one attempt and fails terminally
    /// without leaving a retry trail.
    ///
    /// # Errors
    /// [`ToolError::Validation`] or [`ToolError::Exhausted`].
    pub async fn execute_with_retry(
        &self,
        args: &Value,
        ctx: &mut RunContext<'_, D>,
    ) -> Result<Value, ToolError> {
        ctx.begin_invocation(&self.name);
        loop {
            match self.execute(args, ctx).await {
                Err(ToolError::Retryable { .. }) => {}
                terminal => return terminal,
            }
        }
    }
}

/// Transport seam for tool registries that live outside the process. The
/// kernel only depends on this contract; concrete transports (an in-process
/// registry, a subprocess speaking a tool protocol) plug in underneath.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Establish the connection. In-process transports are no-ops.
    ///
    /// # Errors
    /// Returns an error when the transport cannot be reached.
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Tool declarations available on this transport, keyed by name.
    fn list_tools(&self) -> BTreeMap<String, ToolDefinition>;

    /// Invoke a named tool with already-validated arguments.
    ///
    /// # Errors
    /// Returns an error when the tool is unknown or the call fails.
    async fn invoke(&self, name: &str, args: &Value) -> anyhow::Result<Value>;

    /// Release transport resources.
    ///
    /// # Errors
    /// Returns an error when teardown fails.
    async fn cleanup(&mut self) -> anyhow::Result<()>;
}

pub type TransportHandler = dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync;

/// Registry-backed transport running in the current process. Used by the
/// CLI for built-in tools and by tests as a stand-in for remote registries.
#[derive(Default)]
pub struct InProcessToolTransport {
    tools: BTreeMap<String, (ToolDefinition, Arc<TransportHandler>)>,
}

impl InProcessToolTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: impl Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) {
        self.tools
            .insert(definition.name.clone(), (definition, Arc::new(handler)));
    }
}

#[async_trait]
impl ToolTransport for InProcessToolTransport {
    async fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn list_tools(&self) -> BTreeMap<String, ToolDefinition> {
        self.tools
            .iter()
            .map(|(name, (definition, _))| (name.clone(), definition.clone()))
            .collect()
    }

    async fn invoke(&self, name: &str, args: &Value) -> anyhow::Result<Value> {
        let (_, handler) = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool '{name}'"))?;
        handler(args)
    }

    async fn cleanup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tape_kernel_domain::{StepContent, StepType, Tape};

    use super::{
        InProcessToolTransport, ParamType, RunContext, Tool, ToolDefinition, ToolError,
        ToolSchema, ToolTransport,
    };

    fn echo_tool() -> Tool<()> {
        Tool::new_sync(
            "echo",
            "Echo the message back",
            ToolSchema::builder()
                .required("message", ParamType::String, "Text to echo")
                .build(),
            |_ctx, args| Ok(json!({ "echoed": args["message"] })),
        )
    }

    fn flaky_tool(failures: u32) -> Tool<()> {
        let remaining = Arc::new(AtomicU32::new(failures));
        Tool::new_sync(
            "flaky",
            "Fails a fixed number of times, then succeeds",
            ToolSchema::empty(),
            move |_ctx, _args| {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(anyhow::anyhow!("transient failure"))
                } else {
                    Ok(json!({ "ok": true }))
                }
            },
        )
    }

    #[test]
    fn schema_renders_json_schema_with_required_list() {
        let schema = ToolSchema::builder()
            .required("query", ParamType::String, "Search query")
            .optional("limit", ParamType::Integer, "Max results", json!(10))
            .build();
        let rendered = schema.to_json_schema();
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["required"], json!(["query"]));
        assert_eq!(rendered["properties"]["query"]["type"], "string");
        assert_eq!(rendered["properties"]["limit"]["default"], 10);

        let restored = ToolSchema::from_json_schema(&rendered)
            .unwrap_or_else(|err| panic!("from_json_schema: {err}"));
        assert_eq!(restored, schema);
    }

    #[test]
    fn empty_schema_accepts_only_empty_object() {
        let schema = ToolSchema::empty();
        assert!(schema.validate("t", &json!({})).is_ok());
        assert!(schema.validate("t", &json!({ "extra": 1 })).is_err());
        assert!(schema.validate("t", &json!([1, 2])).is_err());
    }

    #[test]
    fn validation_names_every_offending_field() {
        let schema = ToolSchema::builder()
            .required("query", ParamType::String, "Search query")
            .required("limit", ParamType::Integer, "Max results")
            .build();
        let err = schema
            .validate("search", &json!({ "limit": "ten", "bogus": true }))
            .err()
            .unwrap_or_else(|| panic!("expected validation failure"));
        let message = err.to_string();
        assert!(message.contains("query: missing required argument"), "{message}");
        assert!(message.contains("limit: expected"), "{message}");
        assert!(message.contains("bogus: unexpected argument"), "{message}");
    }

    #[tokio::test]
    async fn invalid_arguments_fail_fast_without_tape_trail() {
        let tool = echo_tool();
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool.execute(&json!({}), &mut ctx).await;
        assert!(matches!(result, Err(ToolError::Validation { .. })));
        assert_eq!(ctx.retry, 0);
        assert!(tape.is_empty());
    }

    #[tokio::test]
    async fn success_records_action_step_and_usage() {
        let tool = echo_tool();
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool
            .execute_with_retry(&json!({ "message": "hi" }), &mut ctx)
            .await
            .unwrap_or_else(|err| panic!("execute: {err}"));
        assert_eq!(result, json!({ "echoed": "hi" }));
        assert_eq!(ctx.usage, 1);

        assert_eq!(tape.len(), 1);
        let step = &tape.steps()[0];
        assert_eq!(step.step_type, StepType::Action);
        assert_eq!(step.metadata.node, "echo");
        match &step.content {
            StepContent::ToolResult { tool_name, result, .. } => {
                assert_eq!(tool_name, "echo");
                assert_eq!(result["echoed"], "hi");
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn async_backend_shares_the_same_pipeline() {
        let tool: Tool<()> = Tool::new_async(
            "delayed",
            "Returns asynchronously",
            ToolSchema::empty(),
            |_ctx, _args| Box::pin(async { Ok(json!("later")) }),
        );
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool
            .execute_with_retry(&json!({}), &mut ctx)
            .await
            .unwrap_or_else(|err| panic!("execute: {err}"));
        assert_eq!(result, json!("later"));
        assert_eq!(tape.steps_by_type(StepType::Action).len(), 1);
    }

    #[tokio::test]
    async fn failures_leave_thought_trail_then_action() {
        let tool = flaky_tool(2).with_max_retries(3);
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool.execute_with_retry(&json!({}), &mut ctx).await;
        assert!(result.is_ok());

        let kinds: Vec<StepType> = tape.steps().iter().map(|s| s.step_type).collect();
        assert_eq!(
            kinds,
            vec![StepType::Thought, StepType::Thought, StepType::Action]
        );
        match &tape.steps()[0].content {
            StepContent::Text { text } => {
                assert!(text.starts_with("Tool execution failed:"), "{text}");
                assert!(text.ends_with("Retry 1/3"), "{text}");
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_stops_after_budget_with_no_extra_steps() {
        let tool = flaky_tool(u32::MAX).with_max_retries(1);
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool.execute_with_retry(&json!({}), &mut ctx).await;
        match result {
            Err(ToolError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(tape.steps_by_type(StepType::Thought).len(), 1);
        assert!(tape.steps_by_type(StepType::Action).is_empty());
    }

    #[tokio::test]
    async fn zero_retries_means_one_silent_attempt() {
        let tool = flaky_tool(u32::MAX).with_max_retries(0);
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool.execute_with_retry(&json!({}), &mut ctx).await;
        assert!(matches!(result, Err(ToolError::Exhausted { .. })));
        assert!(tape.is_empty());
    }

    #[tokio::test]
    async fn retry_counter_resets_between_invocations() {
        let tool = flaky_tool(1).with_max_retries(3);
        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        tool.execute_with_retry(&json!({}), &mut ctx)
            .await
            .unwrap_or_else(|err| panic!("first invocation: {err}"));
        assert_eq!(ctx.retry, 1);

        tool.execute_with_retry(&json!({}), &mut ctx)
            .await
            .unwrap_or_else(|err| panic!("second invocation: {err}"));
        assert_eq!(ctx.retry, 0);
        assert_eq!(ctx.usage, 2);
    }

    #[tokio::test]
    async fn transport_tools_run_through_the_pipeline() {
        let mut transport = InProcessToolTransport::new();
        transport.register(
            ToolDefinition {
                name: "get_data".to_string(),
                description: "Fetch a record".to_string(),
                outer_key: None,
                parameters_json_schema: json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string", "description": "Record key" }
                    },
                    "required": ["key"],
                }),
            },
            |args| Ok(json!({ "key": args["key"], "value": 42 })),
        );
        let transport: Arc<dyn ToolTransport> = Arc::new(transport);

        let definitions = transport.list_tools();
        assert_eq!(definitions.len(), 1);
        let definition = &definitions["get_data"];
        let tool: Tool<()> = Tool::from_transport(definition, Arc::clone(&transport))
            .unwrap_or_else(|err| panic!("from_transport: {err}"));

        let mut tape = Tape::default();
        let mut ctx = RunContext::new((), "prompt", &mut tape);
        let result = tool
            .execute_with_retry(&json!({ "key": "alpha" }), &mut ctx)
            .await
            .unwrap_or_else(|err| panic!("execute: {err}"));
        assert_eq!(result["value"], 42);
        assert_eq!(ctx.tape.steps_by_type(StepType::Action).len(), 1);

        // Wrong argument shapes are rejected locally, before the transport.
        let denied = tool.execute(&json!({ "key": 5 }), &mut ctx).await;
        assert!(matches!(denied, Err(ToolError::Validation { .. })));
    }

    #[tokio::test]
    async fn unknown_transport_tool_is_an_invoke_error() {
        let transport = InProcessToolTransport::new();
        let err = transport
            .invoke("missing", &Value::Null)
            .await
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert!(err.to_string().contains("missing"));
    }
}
