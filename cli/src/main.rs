//! Capsule CLI.
//!
//! The CLI is intentionally thin: it parses arguments, loads YAML, and
//! delegates to the core crates. Exit codes are stable:
//!
//!   0  run completed (policy denials included)
//!   2  at least one tool error in the run
//!   3  unrecoverable error (bad plan/policy, storage failure)
//!   4  replay hash mismatch
//!   5  run not found

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use capsule_contracts::{CallStatus, CapsuleError, CapsuleResult, Plan, Policy};
use capsule_core::{
    build_report, validate_answer, AgentConfig, AgentLoop, PlanRunner, ReplayEngine, RunOptions,
    ScriptedPlanner,
};
use capsule_store::CapsuleStore;
use capsule_tools::default_registry;

// ── Exit codes ────────────────────────────────────────────────────────────────

const EXIT_OK: u8 = 0;
const EXIT_TOOL_ERROR: u8 = 2;
const EXIT_FATAL: u8 = 3;
const EXIT_REPLAY_MISMATCH: u8 = 4;
const EXIT_RUN_NOT_FOUND: u8 = 5;

// ── CLI definition ────────────────────────────────────────────────────────────

/// Capsule — execute agent tool calls under strict policy controls, with
/// a tamper-evident audit log and deterministic replay.
#[derive(Parser)]
#[command(name = "capsule", version, about)]
struct Cli {
    /// Enable verbose diagnostics (equivalent to RUST_LOG=debug).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a plan under policy constraints.
    Run {
        /// Path to the plan YAML file.
        plan: PathBuf,
        /// Path to the policy YAML file.
        #[arg(long, short)]
        policy: PathBuf,
        /// Path to the SQLite audit database.
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
        /// Emit the run report as JSON instead of text.
        #[arg(long)]
        json: bool,
        /// Continue past denied or failed steps.
        #[arg(long)]
        no_fail_fast: bool,
    },

    /// Replay a previous run from stored results.
    Replay {
        /// The run id to replay.
        run_id: String,
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
        /// Also verify the stored plan hash before replaying.
        #[arg(long)]
        verify: bool,
        #[arg(long)]
        json: bool,
    },

    /// Generate a report for a completed run.
    Report {
        run_id: String,
        /// Output format: console or json.
        #[arg(long, short, default_value = "console")]
        format: String,
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
    },

    /// List recorded runs.
    ListRuns {
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Show details of one run.
    ShowRun {
        run_id: String,
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Planner-driven agent sessions.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Run a task through the policy-gated agent loop.
    Run {
        /// The task description handed to the planner.
        task: String,
        #[arg(long, short)]
        policy: PathBuf,
        /// Planner to use: `scripted:<file.json>`.
        #[arg(long)]
        planner: String,
        #[arg(long, default_value_t = 20)]
        max_iterations: u32,
        #[arg(long, default_value = "capsule.db")]
        db: PathBuf,
        #[arg(long)]
        json: bool,
        /// Warn about paths in the final answer that were never accessed.
        #[arg(long)]
        validate_answer: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match dispatch(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error [{}]: {}", e.code(), e);
            let code = match e {
                CapsuleError::RunNotFound { .. } => EXIT_RUN_NOT_FOUND,
                CapsuleError::Replay { .. } => EXIT_REPLAY_MISMATCH,
                _ => EXIT_FATAL,
            };
            ExitCode::from(code)
        }
    }
}

fn dispatch(command: Command) -> CapsuleResult<u8> {
    match command {
        Command::Run { plan, policy, db, json, no_fail_fast } => {
            cmd_run(&plan, &policy, &db, json, !no_fail_fast)
        }
        Command::Replay { run_id, db, verify, json } => cmd_replay(&run_id, &db, verify, json),
        Command::Report { run_id, format, db } => cmd_report(&run_id, &format, &db),
        Command::ListRuns { db, json } => cmd_list_runs(&db, json),
        Command::ShowRun { run_id, db, json } => cmd_show_run(&run_id, &db, json),
        Command::Agent { command } => match command {
            AgentCommand::Run { task, policy, planner, max_iterations, db, json, validate_answer } => {
                cmd_agent_run(&task, &policy, &planner, max_iterations, &db, json, validate_answer)
            }
        },
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_run(
    plan_path: &PathBuf,
    policy_path: &PathBuf,
    db_path: &PathBuf,
    json: bool,
    fail_fast: bool,
) -> CapsuleResult<u8> {
    let plan = Plan::from_file(plan_path)?;
    let policy = Policy::from_file(policy_path)?;
    let store = CapsuleStore::open(db_path)?;
    let registry = default_registry();
    let working_dir = std::env::current_dir()
        .map_err(|e| CapsuleError::storage("cwd", e))?;

    let runner = PlanRunner::new(&store, &registry, working_dir);
    let outcome = runner.run(&plan, &policy, &RunOptions { fail_fast })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&build_report(&store, &outcome.run_id)?)
            .expect("report is serializable"));
    } else {
        println!("run {}: {}", outcome.run_id, outcome.status.as_str());
        for step in &outcome.steps {
            let detail = match step.status {
                CallStatus::Success => step
                    .output
                    .as_ref()
                    .map(|o| truncate(&o.to_string(), 60))
                    .unwrap_or_default(),
                CallStatus::Denied => step.decision.reason.clone(),
                CallStatus::Error => step.error.clone().unwrap_or_default(),
            };
            println!(
                "  {:>2}  {:<12} {:<8} {}",
                step.step_index,
                step.tool_name,
                step.status.as_str(),
                truncate(&detail, 80)
            );
        }
        println!(
            "total: {} | completed: {} | denied: {} | failed: {} | {} ms",
            outcome.total_steps,
            outcome.counts.completed,
            outcome.counts.denied,
            outcome.counts.failed,
            outcome.duration_ms
        );
    }

    if outcome.counts.failed > 0 {
        Ok(EXIT_TOOL_ERROR)
    } else {
        Ok(EXIT_OK)
    }
}

fn cmd_replay(run_id: &str, db_path: &PathBuf, verify: bool, json: bool) -> CapsuleResult<u8> {
    let store = CapsuleStore::open(db_path)?;
    let outcome = ReplayEngine::new(&store).replay(run_id, verify)?;

    if json {
        let value = serde_json::json!({
            "replay_run_id": outcome.replay_run_id,
            "origin_run_id": outcome.origin_run_id,
            "status": outcome.status.as_str(),
            "plan_verified": outcome.plan_verified,
            "total_steps": outcome.steps.len(),
            "mismatches": outcome.mismatches,
        });
        println!("{}", serde_json::to_string_pretty(&value).expect("serializable"));
    } else {
        println!(
            "replay {} of {}: {} ({} steps)",
            outcome.replay_run_id,
            outcome.origin_run_id,
            outcome.status.as_str(),
            outcome.steps.len()
        );
        for mismatch in &outcome.mismatches {
            println!("  mismatch: {}", mismatch);
        }
    }

    if outcome.mismatches.is_empty() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_REPLAY_MISMATCH)
    }
}

fn cmd_report(run_id: &str, format: &str, db_path: &PathBuf) -> CapsuleResult<u8> {
    let store = CapsuleStore::open(db_path)?;
    let report = build_report(&store, run_id)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report).expect("serializable"));
        }
        // The rich console renderer is not part of the core; the console
        // format prints a compact text digest of the same document.
        _ => {
            println!(
                "run {} [{}] {}",
                report["run"]["run_id"].as_str().unwrap_or("?"),
                report["run"]["mode"].as_str().unwrap_or("?"),
                report["run"]["status"].as_str().unwrap_or("?")
            );
            if let Some(steps) = report["steps"].as_array() {
                for step in steps {
                    println!(
                        "  {:>2}  {:<12} {}",
                        step["step_index"],
                        step["tool_name"].as_str().unwrap_or("?"),
                        step["result"]["status"].as_str().unwrap_or("pending"),
                    );
                }
            }
            println!(
                "summary: {}",
                serde_json::to_string(&report["summary"]).expect("serializable")
            );
        }
    }
    Ok(EXIT_OK)
}

fn cmd_list_runs(db_path: &PathBuf, json: bool) -> CapsuleResult<u8> {
    let store = CapsuleStore::open(db_path)?;
    let runs = store.list_runs(100)?;

    if json {
        let value: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id,
                    "created_at": r.created_at.to_rfc3339(),
                    "mode": r.mode.as_str(),
                    "status": r.status.as_str(),
                    "total_steps": r.total_steps,
                    "completed_steps": r.completed_steps,
                    "denied_steps": r.denied_steps,
                    "failed_steps": r.failed_steps,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value).expect("serializable"));
    } else if runs.is_empty() {
        println!("no runs recorded");
    } else {
        println!("{:<10} {:<26} {:<7} {:<10} steps", "run", "created", "mode", "status");
        for run in &runs {
            println!(
                "{:<10} {:<26} {:<7} {:<10} {}/{} ({} denied, {} failed)",
                run.run_id,
                run.created_at.to_rfc3339(),
                run.mode.as_str(),
                run.status.as_str(),
                run.completed_steps,
                run.total_steps,
                run.denied_steps,
                run.failed_steps
            );
        }
    }
    Ok(EXIT_OK)
}

fn cmd_show_run(run_id: &str, db_path: &PathBuf, json: bool) -> CapsuleResult<u8> {
    let store = CapsuleStore::open(db_path)?;
    let Some(summary) = store.run_summary(run_id)? else {
        eprintln!("run not found: {}", run_id);
        return Ok(EXIT_RUN_NOT_FOUND);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary).expect("serializable"));
    } else {
        println!(
            "run {} [{}] {} ({} steps)",
            run_id,
            summary["mode"].as_str().unwrap_or("?"),
            summary["status"].as_str().unwrap_or("?"),
            summary["total_steps"]
        );
        if let Some(steps) = summary["steps"].as_array() {
            for step in steps {
                let reason = step["policy_reason"].as_str().unwrap_or("");
                println!(
                    "  {:>2}  {:<12} {:<8} {}",
                    step["step_index"],
                    step["tool"].as_str().unwrap_or("?"),
                    step["status"].as_str().unwrap_or("?"),
                    truncate(reason, 80)
                );
            }
        }
    }
    Ok(EXIT_OK)
}

fn cmd_agent_run(
    task: &str,
    policy_path: &PathBuf,
    planner_spec: &str,
    max_iterations: u32,
    db_path: &PathBuf,
    json: bool,
    validate: bool,
) -> CapsuleResult<u8> {
    let policy = Policy::from_file(policy_path)?;
    let store = CapsuleStore::open(db_path)?;
    let registry = default_registry();
    let working_dir = std::env::current_dir()
        .map_err(|e| CapsuleError::storage("cwd", e))?;

    // Planner backends are external; the built-in `scripted:` planner
    // replays a fixed proposal list from a JSON file.
    let mut planner = match planner_spec.split_once(':') {
        Some(("scripted", path)) => ScriptedPlanner::from_file(&PathBuf::from(path))?,
        _ => {
            return Err(CapsuleError::PlanValidation {
                reason: format!(
                    "unknown planner '{}' (expected scripted:<file.json>)",
                    planner_spec
                ),
            });
        }
    };

    let config = AgentConfig { max_iterations, ..AgentConfig::default() };
    let agent = AgentLoop::new(&store, &registry, policy, working_dir, config);
    let outcome = agent.run(&mut planner, task)?;

    let validation = match (&outcome.final_output, validate) {
        (Some(output), true) => Some(validate_answer(output, &outcome.accessed_paths)),
        _ => None,
    };

    if json {
        let value = serde_json::json!({
            "run_id": outcome.run_id,
            "task": outcome.task,
            "status": outcome.status.as_str(),
            "iterations": outcome.iterations.len(),
            "completed": outcome.counts.completed,
            "denied": outcome.counts.denied,
            "failed": outcome.counts.failed,
            "final_output": outcome.final_output,
            "error": outcome.error_message,
            "duration_ms": outcome.duration_ms,
            "hallucinated_paths": validation.as_ref().map(|v| v.hallucinated_paths.clone()),
        });
        println!("{}", serde_json::to_string_pretty(&value).expect("serializable"));
    } else {
        println!("agent run {}: {}", outcome.run_id, outcome.status.as_str());
        println!(
            "iterations: {} | completed: {} | denied: {} | failed: {}",
            outcome.iterations.len(),
            outcome.counts.completed,
            outcome.counts.denied,
            outcome.counts.failed
        );
        if let Some(output) = &outcome.final_output {
            println!("final output: {}", truncate(&output.to_string(), 400));
        }
        if let Some(message) = &outcome.error_message {
            println!("error: {}", message);
        }
        if let Some(validation) = &validation {
            for path in &validation.hallucinated_paths {
                println!("warning: answer references path never accessed: {}", path);
            }
        }
    }

    if outcome.error_message.is_some() {
        Ok(EXIT_FATAL)
    } else if outcome.counts.failed > 0 {
        Ok(EXIT_TOOL_ERROR)
    } else {
        Ok(EXIT_OK)
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i < limit.saturating_sub(3))
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...", &text[..cut])
}
