//! 前向链式规则推理内核
//!
//! 对事实存储反复执行 匹配 → 冲突消解 → 执行 循环，直到没有规则匹配、
//! 规则主动返回或达到循环上限。支持：
//! - JSON 规则定义，注册时编译并校验条件树
//! - 变量捕获与合一
//! - 优先级、特异度、近期性冲突消解
//! - 首匹配 / 全匹配两种触发模式
//! - 宿主注册的自定义操作符和 `$call` 函数

pub mod actions;
pub mod cli;
pub mod compiler;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod facts;
pub mod matcher;
pub mod models;
pub mod operators;
pub mod registry;
pub mod store;
pub mod template;
pub mod trace;

pub use compiler::{CompiledRule, RuleCompiler};
pub use conflict::{ActivityLedger, ConflictResolver, RecencyPolicy, StandardResolver};
pub use engine::{Engine, EngineConfig, EngineState, FiringMode, HaltReason, RunOptions, RunOutcome};
pub use error::{Result, RuleError};
pub use facts::{FactSnapshot, FactStore, FieldPath};
pub use matcher::{MatchOutcome, MatchResult, RuleMatcher};
pub use models::{Action, Bindings, Condition, LogicalGroup, Negation, Rule, RuleNode};
pub use operators::{LogicalOperator, Operator};
pub use registry::{CustomOperator, FunctionRegistry, HostFunction, OperatorRegistry};
pub use store::{BatchReport, RuleBase};
pub use trace::{CycleEvent, FiredRule, MemorySink, NoopSink, TraceSink, TracingSink};
