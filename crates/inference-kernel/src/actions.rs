//! 动作执行
//!
//! 按顺序执行一条规则的动作列表。事实修改先写入 [`ChangeSet`]，由引擎在
//! 动作列表结束后统一提交；某个动作失败时后续动作不再执行，已缓冲的修改
//! 照常提交（不回滚）。

use crate::compiler::{CompiledAction, CompiledRule};
use crate::error::{Result, RuleError};
use crate::facts::ChangeSet;
use crate::models::Bindings;
use crate::registry::FunctionRegistry;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::debug;

/// 单个动作的执行记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedAction {
    pub kind: String,
    pub detail: String,
    pub succeeded: bool,
}

/// 一条规则动作列表的执行结果
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub changes: ChangeSet,
    pub applied: Vec<AppliedAction>,
    /// `$return` 的返回值
    pub returned: Option<Value>,
    /// 导致动作列表中止的错误
    pub error: Option<RuleError>,
    /// 执行结束时的绑定（包含 `$compute` / `$call` 写入的输出变量）
    pub bindings: Bindings,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

enum Step {
    Continue,
    Return(Value),
}

/// 动作执行器
pub struct ActionExecutor<'a> {
    functions: &'a FunctionRegistry,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self { functions }
    }

    /// 执行规则的动作列表
    pub fn execute(&self, rule: &CompiledRule, bindings: Bindings) -> ExecutionReport {
        let mut report = ExecutionReport {
            bindings,
            ..ExecutionReport::default()
        };

        for action in &rule.actions {
            let step = self.apply(rule, action, &mut report);
            report.applied.push(AppliedAction {
                kind: action.kind().to_string(),
                detail: action.describe(),
                succeeded: step.is_ok(),
            });

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Return(value)) => {
                    report.returned = Some(value);
                    break;
                }
                Err(err) => {
                    debug!(rule_id = %rule.id(), action = action.kind(), error = %err, "动作执行失败");
                    report.error = Some(err);
                    break;
                }
            }
        }

        report
    }

    fn apply(&self, rule: &CompiledRule, action: &CompiledAction, report: &mut ExecutionReport) -> Result<Step> {
        let failed = |message: String| RuleError::ActionExecution {
            rule_id: rule.id().to_string(),
            action: action.kind().to_string(),
            message,
        };

        match action {
            CompiledAction::Set { target, value } => {
                let value = value.render(&report.bindings).map_err(|e| failed(e.to_string()))?;
                report
                    .changes
                    .set(target, value)
                    .map_err(|e| failed(e.to_string()))?;
            }
            CompiledAction::Compute {
                expression,
                target,
                bind,
            } => {
                let value = expression
                    .evaluate(&report.bindings)
                    .map_err(|e| failed(format!("'{}': {}", expression.source(), e)))?;
                if let Some(target) = target {
                    report
                        .changes
                        .set(target, value.clone())
                        .map_err(|e| failed(e.to_string()))?;
                }
                if let Some(var) = bind {
                    report.bindings.insert(var.clone(), value);
                }
            }
            CompiledAction::Call { function, output } => {
                let host = self.functions.get(function).ok_or_else(|| RuleError::UnknownAction {
                    rule_id: rule.id().to_string(),
                    function: function.clone(),
                })?;

                let bindings = &report.bindings;
                let value = match catch_unwind(AssertUnwindSafe(|| host.call(bindings))) {
                    Ok(Ok(value)) => value,
                    Ok(Err(err)) => return Err(failed(format!("{}: {:#}", function, err))),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        return Err(failed(format!("{} panicked: {}", function, message)));
                    }
                };

                if let Some(var) = output {
                    report.bindings.insert(var.clone(), value.unwrap_or(Value::Null));
                }
            }
            CompiledAction::Remove { target } => report.changes.remove(target),
            CompiledAction::Return { value } => {
                let value = value.render(&report.bindings).map_err(|e| failed(e.to_string()))?;
                return Ok(Step::Return(value));
            }
        }

        Ok(Step::Continue)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
