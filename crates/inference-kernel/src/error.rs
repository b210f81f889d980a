//! 推理内核错误类型

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RuleError {
    #[error("规则解析失败: {0}")]
    ParseError(String),

    /// 未知操作符或条件树结构错误，在规则注册时抛出
    #[error("条件语法错误: 规则 {rule_id} 的 {path}: {message}")]
    ConditionSyntax {
        rule_id: String,
        path: String,
        message: String,
    },

    #[error("动作语法错误: 规则 {rule_id} 的 actions[{index}]: {message}")]
    ActionSyntax {
        rule_id: String,
        index: usize,
        message: String,
    },

    #[error("规则已存在: {0}")]
    DuplicateRule(String),

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    /// 引用了从未捕获的变量
    #[error("变量未绑定: ${0}")]
    UnboundVariable(String),

    /// $call 调用了未注册的函数
    #[error("未注册的动作函数: 规则 {rule_id} 调用 {function}")]
    UnknownAction { rule_id: String, function: String },

    #[error("动作执行失败: 规则 {rule_id} 的 {action}: {message}")]
    ActionExecution {
        rule_id: String,
        action: String,
        message: String,
    },

    #[error("超过最大循环次数: {limit}")]
    IterationLimitExceeded { limit: u64 },

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("配置无效: {0}")]
    InvalidConfig(String),
}

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "PARSE_ERROR",
            Self::ConditionSyntax { .. } => "CONDITION_SYNTAX_ERROR",
            Self::ActionSyntax { .. } => "ACTION_SYNTAX_ERROR",
            Self::DuplicateRule(_) => "DUPLICATE_RULE",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::UnboundVariable(_) => "UNBOUND_VARIABLE",
            Self::UnknownAction { .. } => "UNKNOWN_ACTION",
            Self::ActionExecution { .. } => "ACTION_EXECUTION_ERROR",
            Self::IterationLimitExceeded { .. } => "ITERATION_LIMIT_EXCEEDED",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// 是否为规则注册阶段的错误
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::ParseError(_)
                | Self::ConditionSyntax { .. }
                | Self::ActionSyntax { .. }
                | Self::DuplicateRule(_)
        )
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = RuleError::UnknownAction {
            rule_id: "r1".to_string(),
            function: "doThing".to_string(),
        };
        assert_eq!(err.code(), "UNKNOWN_ACTION");
        assert!(err.to_string().contains("doThing"));
    }

    #[test]
    fn test_registration_errors() {
        let syntax = RuleError::ConditionSyntax {
            rule_id: "r1".to_string(),
            path: "root.children[0]".to_string(),
            message: "未知操作符".to_string(),
        };
        assert!(syntax.is_registration_error());
        assert!(syntax.to_string().contains("root.children[0]"));

        assert!(!RuleError::UnboundVariable("minAge".to_string()).is_registration_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: RuleError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn test_serialize() {
        let err = RuleError::IterationLimitExceeded { limit: 10 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "iteration_limit_exceeded");
        assert_eq!(json["detail"]["limit"], 10);

        let json = serde_json::to_value(RuleError::UnboundVariable("x".to_string())).unwrap();
        assert_eq!(json["detail"], "x");
    }
}
