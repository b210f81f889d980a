//! 规则定义模型
//!
//! 持久化协作方提供的规则采用这里的 serde 结构，JSON 为规范序列化形式。
//! 这些结构只描述规则，注册时由 [`crate::compiler::RuleCompiler`] 编译成执行树。

use crate::operators::LogicalOperator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 变量绑定：变量名 -> 首次绑定的值
///
/// 使用有序映射，保证追踪输出和序列化结果稳定。
pub type Bindings = BTreeMap<String, Value>;

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    pub condition: RuleNode,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn new(id: impl Into<String>, condition: RuleNode) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            priority: 0,
            condition,
            actions: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// 显示名称，未设置时使用规则 ID
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// 条件树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleNode {
    Condition(Condition),
    Group(LogicalGroup),
    Not(Negation),
}

impl RuleNode {
    pub fn leaf(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Condition(Condition::new(field, operator, value))
    }

    pub fn and(children: Vec<RuleNode>) -> Self {
        Self::Group(LogicalGroup::and(children))
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        Self::Group(LogicalGroup::or(children))
    }

    pub fn not(child: RuleNode) -> Self {
        Self::Not(Negation {
            child: Box::new(child),
        })
    }
}

/// 叶子条件
///
/// `value` 可以是字面量，也可以是变量引用（`"$name"` 或 `{"$var": "name"}`）。
/// `bind` 在条件成立时把字段值捕获到变量中；变量已绑定时要求字段值与之相等。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
            bind: None,
        }
    }

    /// 捕获字段值到变量
    pub fn bind(mut self, variable: impl Into<String>) -> Self {
        self.bind = Some(variable.into());
        self
    }
}

impl From<Condition> for RuleNode {
    fn from(cond: Condition) -> Self {
        Self::Condition(cond)
    }
}

/// 逻辑组节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalGroup {
    pub operator: LogicalOperator,
    pub children: Vec<RuleNode>,
}

impl LogicalGroup {
    pub fn new(operator: LogicalOperator, children: Vec<RuleNode>) -> Self {
        Self { operator, children }
    }

    pub fn and(children: Vec<RuleNode>) -> Self {
        Self::new(LogicalOperator::And, children)
    }

    pub fn or(children: Vec<RuleNode>) -> Self {
        Self::new(LogicalOperator::Or, children)
    }
}

/// 取反节点，子树中的绑定不会向外传播
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Negation {
    pub child: Box<RuleNode>,
}

/// 规则动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// 写入事实属性，值中的变量会被替换
    #[serde(rename = "$set")]
    Set { target: String, value: Value },

    /// 对绑定变量求值受限表达式，结果写入事实和/或绑定到变量
    #[serde(rename = "$compute")]
    Compute {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// 调用宿主注册的函数
    #[serde(rename = "$call")]
    Call {
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// 删除整条事实或某个属性
    #[serde(rename = "$remove")]
    Remove { target: String },

    /// 立即终止整个引擎循环并返回结果
    #[serde(rename = "$return")]
    Return {
        #[serde(default)]
        value: Value,
    },
}

impl Action {
    pub fn set(target: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            target: target.into(),
            value: value.into(),
        }
    }

    pub fn compute(target: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::Compute {
            expr: expr.into(),
            target: Some(target.into()),
            bind: None,
        }
    }

    pub fn call(function: impl Into<String>) -> Self {
        Self::Call {
            function: function.into(),
            output: None,
        }
    }

    pub fn remove(target: impl Into<String>) -> Self {
        Self::Remove {
            target: target.into(),
        }
    }

    pub fn ret(value: impl Into<Value>) -> Self {
        Self::Return {
            value: value.into(),
        }
    }

    /// 动作名称（用于追踪和错误信息）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "$set",
            Self::Compute { .. } => "$compute",
            Self::Call { .. } => "$call",
            Self::Remove { .. } => "$remove",
            Self::Return { .. } => "$return",
        }
    }
}
