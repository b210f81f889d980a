//! 规则编译器
//!
//! 将 JSON 规则校验并编译成内存中的条件树和动作列表。所有语法错误
//! （未知操作符、非法正则、空逻辑组等）都在注册时抛出，并带上规则 ID
//! 和出错节点路径，运行期不会再遇到。

use crate::error::{Result, RuleError};
use crate::expression::Expression;
use crate::facts::FieldPath;
use crate::models::{Action, Condition, Rule, RuleNode};
use crate::operators::{LogicalOperator, Operator, ValueType};
use crate::registry::{CustomOperator, OperatorRegistry};
use crate::template::{Template, is_variable_name};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// 叶子条件的比较方式
#[derive(Clone)]
pub enum LeafTest {
    Builtin(Operator),
    /// 注册时预编译的正则
    Regex(Regex),
    /// 注册时解析好的类型名
    Type(ValueType),
    Custom {
        name: String,
        operator: Arc<dyn CustomOperator>,
    },
}

impl LeafTest {
    pub fn name(&self) -> String {
        match self {
            Self::Builtin(op) => op.to_string(),
            Self::Regex(_) => Operator::Regex.to_string(),
            Self::Type(_) => Operator::Type.to_string(),
            Self::Custom { name, .. } => name.clone(),
        }
    }
}

impl fmt::Debug for LeafTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(op) => write!(f, "Builtin({})", op),
            Self::Regex(re) => write!(f, "Regex({})", re.as_str()),
            Self::Type(ty) => write!(f, "Type({:?})", ty),
            Self::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

/// 编译后的叶子条件
#[derive(Debug, Clone)]
pub struct CompiledLeaf {
    /// 节点路径，如 `root.children[1]`
    pub path: String,
    pub field: FieldPath,
    pub test: LeafTest,
    pub operand: Template,
    pub bind: Option<String>,
}

/// 编译后的条件树
#[derive(Debug, Clone)]
pub enum CompiledCondition {
    Leaf(CompiledLeaf),
    All(Vec<CompiledCondition>),
    Any(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
}

impl CompiledCondition {
    /// 叶子条件数量
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::All(children) | Self::Any(children) => {
                children.iter().map(CompiledCondition::leaf_count).sum()
            }
            Self::Not(child) => child.leaf_count(),
        }
    }

    fn collect_fields(&self, fields: &mut BTreeSet<String>, facts: &mut BTreeSet<String>) {
        match self {
            Self::Leaf(leaf) => {
                fields.insert(leaf.field.as_str().to_string());
                facts.insert(leaf.field.fact().to_string());
            }
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_fields(fields, facts);
                }
            }
            Self::Not(child) => child.collect_fields(fields, facts),
        }
    }
}

/// 编译后的动作
#[derive(Debug, Clone)]
pub enum CompiledAction {
    Set {
        target: FieldPath,
        value: Template,
    },
    Compute {
        expression: Expression,
        target: Option<FieldPath>,
        bind: Option<String>,
    },
    Call {
        function: String,
        output: Option<String>,
    },
    Remove {
        target: FieldPath,
    },
    Return {
        value: Template,
    },
}

impl CompiledAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "$set",
            Self::Compute { .. } => "$compute",
            Self::Call { .. } => "$call",
            Self::Remove { .. } => "$remove",
            Self::Return { .. } => "$return",
        }
    }

    /// 动作的简短描述（用于追踪）
    pub fn describe(&self) -> String {
        match self {
            Self::Set { target, .. } => format!("$set {}", target),
            Self::Compute {
                expression,
                target,
                bind,
            } => {
                let mut out = format!("$compute '{}'", expression.source());
                if let Some(target) = target {
                    out.push_str(&format!(" -> {}", target));
                }
                if let Some(bind) = bind {
                    out.push_str(&format!(" -> ${}", bind));
                }
                out
            }
            Self::Call { function, .. } => format!("$call {}", function),
            Self::Remove { target } => format!("$remove {}", target),
            Self::Return { .. } => "$return".to_string(),
        }
    }
}

/// 编译后的规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// 原始规则
    pub rule: Rule,
    pub condition: CompiledCondition,
    pub actions: Vec<CompiledAction>,
    /// 规则中使用的所有字段路径
    pub required_fields: BTreeSet<String>,
    /// 规则依赖的事实键（用于匹配结果缓存失效）
    pub fact_keys: BTreeSet<String>,
    /// 静态特异度：叶子条件数
    pub specificity: usize,
    /// 注册序号，决定 `all()` 的稳定顺序
    pub sequence: u64,
}

impl CompiledRule {
    /// 获取规则 ID
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    /// 获取规则名称
    pub fn name(&self) -> &str {
        self.rule.display_name()
    }

    pub fn priority(&self) -> i64 {
        self.rule.priority
    }

    /// 这些事实键的变更是否会影响本规则的匹配
    pub fn depends_on(&self, changed: &BTreeSet<String>) -> bool {
        self.fact_keys.iter().any(|key| changed.contains(key))
    }
}

/// 规则编译器
#[derive(Debug, Default)]
pub struct RuleCompiler {
    operators: OperatorRegistry,
    sequence: u64,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用宿主注册的自定义操作符
    pub fn with_operators(operators: OperatorRegistry) -> Self {
        Self {
            operators,
            sequence: 0,
        }
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    /// 从 JSON 字符串编译规则
    pub fn compile_from_json(&mut self, json: &str) -> Result<CompiledRule> {
        let rule: Rule = serde_json::from_str(json)?;
        self.compile(rule)
    }

    /// 编译规则
    pub fn compile(&mut self, rule: Rule) -> Result<CompiledRule> {
        if rule.id.trim().is_empty() {
            return Err(RuleError::ParseError("规则 ID 不能为空".to_string()));
        }

        let condition = self.compile_node(&rule.id, &rule.condition, "root")?;
        let actions = rule
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| compile_action(&rule.id, index, action))
            .collect::<Result<Vec<_>>>()?;

        let mut required_fields = BTreeSet::new();
        let mut fact_keys = BTreeSet::new();
        condition.collect_fields(&mut required_fields, &mut fact_keys);
        let specificity = condition.leaf_count();

        self.sequence += 1;

        Ok(CompiledRule {
            rule,
            condition,
            actions,
            required_fields,
            fact_keys,
            specificity,
            sequence: self.sequence,
        })
    }

    /// 编译规则节点
    fn compile_node(&self, rule_id: &str, node: &RuleNode, path: &str) -> Result<CompiledCondition> {
        match node {
            RuleNode::Condition(cond) => self
                .compile_condition(rule_id, cond, path)
                .map(CompiledCondition::Leaf),
            RuleNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(syntax(rule_id, path, format!("逻辑组 {} 不能为空", group.operator)));
                }

                let children = group
                    .children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| {
                        let child_path = format!("{}.children[{}]", path, i);
                        self.compile_node(rule_id, child, &child_path)
                    })
                    .collect::<Result<Vec<_>>>()?;

                Ok(match group.operator {
                    LogicalOperator::And => CompiledCondition::All(children),
                    LogicalOperator::Or => CompiledCondition::Any(children),
                })
            }
            RuleNode::Not(negation) => {
                let child_path = format!("{}.child", path);
                let child = self.compile_node(rule_id, &negation.child, &child_path)?;
                Ok(CompiledCondition::Not(Box::new(child)))
            }
        }
    }

    /// 编译叶子条件
    fn compile_condition(&self, rule_id: &str, cond: &Condition, path: &str) -> Result<CompiledLeaf> {
        let field = FieldPath::parse(&cond.field)
            .ok_or_else(|| syntax(rule_id, path, format!("字段路径 '{}' 无效", cond.field)))?;

        if let Some(var) = &cond.bind
            && !is_variable_name(var)
        {
            return Err(syntax(rule_id, path, format!("变量名 '{}' 无效", var)));
        }

        let operand = Template::compile(&cond.value);
        let test = match Operator::parse(&cond.operator) {
            Some(op) => self.builtin_test(rule_id, path, op, &operand)?,
            None => {
                let operator = self.operators.get(&cond.operator).ok_or_else(|| {
                    syntax(rule_id, path, format!("未知操作符 '{}'", cond.operator))
                })?;
                LeafTest::Custom {
                    name: cond.operator.clone(),
                    operator,
                }
            }
        };

        Ok(CompiledLeaf {
            path: path.to_string(),
            field,
            test,
            operand,
            bind: cond.bind.clone(),
        })
    }

    /// 验证操作符和操作数的兼容性
    fn builtin_test(&self, rule_id: &str, path: &str, op: Operator, operand: &Template) -> Result<LeafTest> {
        match op {
            Operator::Between => match operand {
                Template::Literal(Value::Array(arr)) if arr.len() == 2 => {}
                Template::Array(items) if items.len() == 2 => {}
                Template::Var(_) => {}
                _ => {
                    return Err(syntax(rule_id, path, "between 操作符需要 [min, max] 数组"));
                }
            },
            Operator::In | Operator::NotIn | Operator::ContainsAny | Operator::ContainsAll => {
                match operand {
                    Template::Literal(Value::Array(_)) | Template::Array(_) | Template::Var(_) => {}
                    _ => {
                        return Err(syntax(rule_id, path, format!("{} 操作符需要数组值", op)));
                    }
                }
            }
            Operator::Regex => {
                let Some(Value::String(pattern)) = operand.as_literal() else {
                    return Err(syntax(rule_id, path, "regex 操作符需要字符串字面量"));
                };
                let regex = Regex::new(pattern)
                    .map_err(|e| syntax(rule_id, path, format!("正则表达式无效: {}", e)))?;
                return Ok(LeafTest::Regex(regex));
            }
            Operator::Type => {
                let Some(Value::String(name)) = operand.as_literal() else {
                    return Err(syntax(rule_id, path, "type 操作符需要类型名称字符串"));
                };
                let ty = ValueType::parse(name)
                    .ok_or_else(|| syntax(rule_id, path, format!("未知的类型名称 '{}'", name)))?;
                return Ok(LeafTest::Type(ty));
            }
            _ => {}
        }

        Ok(LeafTest::Builtin(op))
    }
}

fn compile_action(rule_id: &str, index: usize, action: &Action) -> Result<CompiledAction> {
    let invalid = |message: String| RuleError::ActionSyntax {
        rule_id: rule_id.to_string(),
        index,
        message,
    };
    let target_path = |target: &str| {
        FieldPath::parse(target).ok_or_else(|| invalid(format!("目标路径 '{}' 无效", target)))
    };
    let check_var = |var: &Option<String>| match var {
        Some(name) if !is_variable_name(name) => Err(invalid(format!("变量名 '{}' 无效", name))),
        _ => Ok(()),
    };

    let compiled = match action {
        Action::Set { target, value } => CompiledAction::Set {
            target: target_path(target)?,
            value: Template::compile(value),
        },
        Action::Compute { expr, target, bind } => {
            if target.is_none() && bind.is_none() {
                return Err(invalid("$compute 需要 target 或 bind".to_string()));
            }
            check_var(bind)?;
            let expression = Expression::parse(expr).map_err(|e| invalid(e.to_string()))?;
            CompiledAction::Compute {
                expression,
                target: target.as_deref().map(target_path).transpose()?,
                bind: bind.clone(),
            }
        }
        Action::Call { function, output } => {
            if function.trim().is_empty() {
                return Err(invalid("$call 的函数名不能为空".to_string()));
            }
            check_var(output)?;
            CompiledAction::Call {
                function: function.clone(),
                output: output.clone(),
            }
        }
        Action::Remove { target } => CompiledAction::Remove {
            target: target_path(target)?,
        },
        Action::Return { value } => CompiledAction::Return {
            value: Template::compile(value),
        },
    };

    Ok(compiled)
}

fn syntax(rule_id: &str, path: &str, message: impl Into<String>) -> RuleError {
    RuleError::ConditionSyntax {
        rule_id: rule_id.to_string(),
        path: path.to_string(),
        message: message.into(),
    }
}
