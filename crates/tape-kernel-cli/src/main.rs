#![forbid(unsafe_code)]

//! `tape-kernel` CLI: run agent cycles from a YAML agent definition and
//! inspect or export the tapes they leave behind. All commands print one
//! JSON document to stdout; logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tape_kernel_agents::{Agent, CycleDriver, SimpleAgent, ToolAgent};
use tape_kernel_domain::{hash_json, now_utc, ExecutionObserver, Tape, TapeId, TracingObserver};
use tape_kernel_provider::{provider_from_config, LlmConfig};
use tape_kernel_store_core::{TapeSearch, TapeStore};
use tape_kernel_store_sqlite::SqliteTapeStore;
use tape_kernel_tools::{InProcessToolTransport, ToolDefinition};
use time::format_description::well_known::Rfc3339;
use ulid::Ulid;

#[derive(Parser)]
#[command(name = "tape-kernel", version, about = "Tape-structured agent execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run think/act/observe cycles from a YAML agent definition.
    Run {
        #[arg(long)]
        agent_config: PathBuf,
        #[arg(long)]
        tape_db: PathBuf,
        /// JSON context value seeding each cycle.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Fork a saved tape and continue on the fork.
        #[arg(long)]
        parent_tape: Option<String>,
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },
    /// Inspect stored tapes.
    #[command(subcommand)]
    Tape(TapeCommand),
    /// Write a tape document with a content-hash manifest.
    Export {
        #[arg(long)]
        tape_db: PathBuf,
        #[arg(long)]
        tape_id: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum TapeCommand {
    /// All stored tape ids, newest first.
    List {
        #[arg(long)]
        tape_db: PathBuf,
    },
    /// Full step sequence and metadata of one tape.
    Show {
        #[arg(long)]
        tape_db: PathBuf,
        #[arg(long)]
        tape_id: String,
    },
    /// Fork lineage of a tape, child first.
    History {
        #[arg(long)]
        tape_db: PathBuf,
        #[arg(long)]
        tape_id: String,
    },
    /// Tapes with steps matching an agent and/or node filter.
    Search {
        #[arg(long)]
        tape_db: PathBuf,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        node: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    agent: AgentSection,
    #[serde(default)]
    provider: Option<LlmConfig>,
    /// Built-in tools to expose to a tool agent.
    #[serde(default = "default_builtins")]
    tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    name: String,
    kind: AgentKind,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AgentKind {
    Simple,
    Tool,
}

fn default_builtins() -> Vec<String> {
    vec!["echo".to_string(), "utc_now".to_string()]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = match cli.command {
        Command::Run {
            agent_config,
            tape_db,
            context,
            parent_tape,
            cycles,
        } => {
            let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
            runtime.block_on(cmd_run(
                &agent_config,
                &tape_db,
                &context,
                parent_tape.as_deref(),
                cycles,
            ))?
        }
        Command::Tape(command) => cmd_tape(command)?,
        Command::Export {
            tape_db,
            tape_id,
            out,
        } => cmd_export(&tape_db, &tape_id, &out)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_run(
    agent_config: &Path,
    tape_db: &Path,
    context: &str,
    parent_tape: Option<&str>,
    cycles: u32,
) -> Result<Value> {
    let raw = fs::read_to_string(agent_config)
        .with_context(|| format!("read agent config {}", agent_config.display()))?;
    let config: AgentConfig = serde_yaml::from_str(&raw).context("parse agent config")?;
    let context: Value = serde_json::from_str(context).context("parse --context JSON")?;
    let store = SqliteTapeStore::open(tape_db)?;

    let tape = match parent_tape {
        Some(id) => store.load_tape(parse_tape_id(id)?)?.fork(),
        None => Tape::new(
            config
                .agent
                .author
                .clone()
                .unwrap_or_else(|| "root".to_string()),
        ),
    };

    let observer: Arc<dyn ExecutionObserver> = Arc::new(TracingObserver);
    let mut agent: Box<dyn Agent> = match config.agent.kind {
        AgentKind::Simple => Box::new(SimpleAgent::new(config.agent.name.clone())),
        AgentKind::Tool => {
            let provider_config = config
                .provider
                .clone()
                .ok_or_else(|| anyhow!("tool agents require a provider section"))?;
            let provider = provider_from_config(&provider_config)?;
            let transport = builtin_transport(&config.tools)?;
            let mut agent = ToolAgent::connect(
                config.agent.name.clone(),
                (),
                provider,
                Box::new(transport),
                Arc::clone(&observer),
            )
            .await?;
            if let Some(max_retries) = config.agent.max_retries {
                agent.set_max_retries(max_retries);
            }
            Box::new(agent)
        }
    };
    agent.bind_tape(tape);

    let driver = CycleDriver::new(observer);
    let mut completed = 0u32;
    let mut last_error = None;
    for _ in 0..cycles {
        let report = driver.run_cycle(&mut *agent, &context).await?;
        if report.completed() {
            completed += 1;
        } else {
            last_error = [&report.observe, &report.act]
                .into_iter()
                .flatten()
                .chain(std::iter::once(&report.think))
                .find_map(|result| result.error.clone());
            break;
        }
    }

    let tape = agent
        .take_tape()
        .ok_or_else(|| anyhow!("agent lost its tape"))?;
    let tape_id = store.save_tape(&tape)?;
    Ok(json!({
        "agent": config.agent.name,
        "tape_id": tape_id.to_string(),
        "steps": tape.len(),
        "cycles_requested": cycles,
        "cycles_completed": completed,
        "error": last_error,
    }))
}

fn cmd_tape(command: TapeCommand) -> Result<Value> {
    match command {
        TapeCommand::List { tape_db } => {
            let store = SqliteTapeStore::open(tape_db)?;
            Ok(json!({ "tapes": id_strings(store.list_tapes()?) }))
        }
        TapeCommand::Show { tape_db, tape_id } => {
            let store = SqliteTapeStore::open(tape_db)?;
            let tape = store.load_tape(parse_tape_id(&tape_id)?)?;
            Ok(serde_json::to_value(&tape)?)
        }
        TapeCommand::History { tape_db, tape_id } => {
            let store = SqliteTapeStore::open(tape_db)?;
            let history = store.get_tape_history(parse_tape_id(&tape_id)?)?;
            Ok(json!({ "history": id_strings(history) }))
        }
        TapeCommand::Search {
            tape_db,
            agent,
            node,
        } => {
            let store = SqliteTapeStore::open(tape_db)?;
            let found = store.search_tapes(&TapeSearch { agent, node })?;
            Ok(json!({ "tapes": id_strings(found) }))
        }
    }
}

fn cmd_export(tape_db: &Path, tape_id: &str, out: &Path) -> Result<Value> {
    let store = SqliteTapeStore::open(tape_db)?;
    let tape_id = parse_tape_id(tape_id)?;
    let tape = store.load_tape(tape_id)?;
    let tape_value = serde_json::to_value(&tape)?;
    let document = json!({
        "tape": tape_value,
        "manifest": {
            "steps": tape.len(),
            "content_hash": hash_json(&tape_value)?,
            "exported_at": now_utc().format(&Rfc3339)?,
        },
    });
    fs::write(out, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("write export to {}", out.display()))?;
    Ok(json!({
        "tape_id": tape_id.to_string(),
        "exported": out.display().to_string(),
    }))
}

/// In-process registry of the CLI's built-in tools.
fn builtin_transport(names: &[String]) -> Result<InProcessToolTransport> {
    let mut transport = InProcessToolTransport::new();
    for name in names {
        match name.as_str() {
            "echo" => transport.register(
                ToolDefinition {
                    name: "echo".to_string(),
                    description: "Echo the message back".to_string(),
                    outer_key: None,
                    parameters_json_schema: json!({
                        "type": "object",
                        "properties": {
                            "message": { "type": "string", "description": "Text to echo" }
                        },
                        "required": ["message"],
                    }),
                },
                |args| Ok(json!({ "echoed": args["message"] })),
            ),
            "utc_now" => transport.register(
                ToolDefinition {
                    name: "utc_now".to_string(),
                    description: "Current UTC time, RFC 3339".to_string(),
                    outer_key: None,
                    parameters_json_schema: json!({
                        "type": "object",
                        "properties": {},
                        "required": [],
                    }),
                },
                |_args| Ok(json!({ "utc": now_utc().format(&Rfc3339)? })),
            ),
            other => return Err(anyhow!("unknown built-in tool '{other}'")),
        }
    }
    Ok(transport)
}

fn parse_tape_id(raw: &str) -> Result<TapeId> {
    Ulid::from_string(raw)
        .map(TapeId)
        .map_err(|err| anyhow!("invalid tape id '{raw}': {err}"))
}

fn id_strings(ids: Vec<TapeId>) -> Vec<String> {
    ids.into_iter().map(|id| id.to_string()).collect()
}
