//! 宿主扩展点
//!
//! - [`OperatorRegistry`]：自定义比较操作符，只在规则编译时查询
//! - [`FunctionRegistry`]：`$call` 动作可调用的宿主函数，执行时查询

use crate::error::{Result, RuleError};
use crate::models::Bindings;
use crate::operators::Operator;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 自定义比较操作符，必须是输入的纯函数
pub trait CustomOperator: Send + Sync {
    fn evaluate(&self, field: Option<&Value>, operand: &Value) -> Result<bool>;
}

impl<F> CustomOperator for F
where
    F: Fn(Option<&Value>, &Value) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, field: Option<&Value>, operand: &Value) -> Result<bool> {
        self(field, operand)
    }
}

/// `$call` 目标：绑定变量进，单个值或空出
pub trait HostFunction: Send + Sync {
    fn call(&self, bindings: &Bindings) -> anyhow::Result<Option<Value>>;
}

impl<F> HostFunction for F
where
    F: Fn(&Bindings) -> anyhow::Result<Option<Value>> + Send + Sync,
{
    fn call(&self, bindings: &Bindings) -> anyhow::Result<Option<Value>> {
        self(bindings)
    }
}

/// 自定义操作符注册表
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn CustomOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册自定义操作符，不允许覆盖内置操作符
    pub fn register(&mut self, name: impl Into<String>, operator: Arc<dyn CustomOperator>) -> Result<()> {
        let name = name.into();
        if Operator::parse(&name).is_some() {
            return Err(RuleError::InvalidConfig(format!(
                "自定义操作符 '{}' 与内置操作符重名",
                name
            )));
        }
        self.operators.insert(name, operator);
        Ok(())
    }

    /// 以闭包注册自定义操作符
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Option<&Value>, &Value) -> Result<bool> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomOperator>> {
        self.operators.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.operators.keys().collect();
        names.sort();
        f.debug_struct("OperatorRegistry").field("operators", &names).finish()
    }
}

/// 宿主函数注册表
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn HostFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册函数，同名函数会被替换
    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn HostFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// 以闭包注册函数
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Bindings) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HostFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}
