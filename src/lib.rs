//! # planforge
//!
//! Compiles and executes a declarative plan graph — a DAG of side-effecting
//! tool invocations — with static semantic checks, deadline-aware scheduling,
//! and a transactional runtime.
//!
//! This crate provides:
//! - A tool registry with effect and resource inference ([`registry`])
//! - Plan IR construction and semantic consistency checking ([`checker`])
//! - HEFT-style deadline-aware scheduling with advisory penalty scoring ([`compiler`])
//! - A concurrent executor with locking, rate limiting, circuit breaking,
//!   retries, and saga-style compensation ([`executor`])
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use planforge::{build_plan_ir, compile, CompilerConfig, Executor, ExecutorConfig, ToolRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = Arc::new(ToolRegistry::new());
//! // registry.register(...) real tools here
//! let ir = build_plan_ir(vec![], &registry)?;
//! let compiled = compile(ir, &registry, &CompilerConfig::default())?;
//! let executor = Executor::new(registry, ExecutorConfig::default());
//! let result = executor.execute(&compiled).await;
//! println!("ran in {}ms", result.duration_ms);
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod checker;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod ir;
pub mod registry;
pub mod value;

// Re-export main types for convenience
pub use checker::{build_plan_ir, check_semantic_consistency, IdentityTypeChecker, TypeChecker};
pub use compiler::{compile, CompiledPlan, Schedule};
pub use config::{CompilerConfig, ExecutorConfig};
pub use error::{CompileError, CompileResult, ExecError, ExecResult, IrError, IrResult};
pub use executor::{ExecutionResult, Executor};
pub use ir::{
    AccessMode, Compensation, EffectType, Environment, Fallback, NodeId, PlanIr, PlanNode,
    ResourceAccess, RetryPolicy, SideEffect, Skill, SkillStatus, Tool, ToolExecutor, ToolFailure,
    ToolMetadata, ToolOutcome,
};
pub use registry::ToolRegistry;
pub use value::{RefTarget, ResolvedParams, Value};

use std::sync::Arc;

/// Build, compile, and execute a plan in one call — the common path for a
/// caller that doesn't need to inspect the IR or compiled schedule on their own.
pub async fn run_plan(
    nodes: Vec<PlanNode>,
    registry: Arc<ToolRegistry>,
    compiler_config: &CompilerConfig,
    executor_config: ExecutorConfig,
) -> anyhow::Result<ExecutionResult> {
    let ir = build_plan_ir(nodes, &registry)?;
    let compiled = compile(ir, &registry, compiler_config)?;
    let executor = Executor::new(registry, executor_config);
    Ok(executor.execute(&compiled).await)
}
