//! 变量替换模板
//!
//! 条件操作数和动作值在注册时编译成模板，执行时用绑定变量渲染：
//! - 纯占位符 `"$name"` / `"${name}"` 直接返回变量值，保留原始类型
//! - 混合字符串中的 `${name}` 按文本替换
//! - `{"$var": "name"}` 等价于 `"$name"`，`{"$literal": ...}` 原样保留内容
//!
//! 不符合变量名规则的 `$` 文本（如 `"$5"`）按字面量处理。

use crate::error::{Result, RuleError};
use crate::models::Bindings;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// 判断是否为合法变量名
pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Var(String),
}

/// 编译后的值模板
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Literal(Value),
    Var(String),
    Interpolated(Vec<Segment>),
    Array(Vec<Template>),
    Object(Vec<(String, Template)>),
}

impl Template {
    /// 编译模板，不含变量的子树折叠为字面量
    pub fn compile(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::compile_str(s),
            Value::Array(items) => {
                let items: Vec<Template> = items.iter().map(Self::compile).collect();
                if items.iter().all(Template::is_literal) {
                    Self::Literal(value.clone())
                } else {
                    Self::Array(items)
                }
            }
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(inner) = map.get("$literal") {
                        return Self::Literal(inner.clone());
                    }
                    if let Some(Value::String(name)) = map.get("$var")
                        && is_variable_name(name)
                    {
                        return Self::Var(name.clone());
                    }
                }

                let entries: Vec<(String, Template)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::compile(v)))
                    .collect();
                if entries.iter().all(|(_, t)| t.is_literal()) {
                    Self::Literal(value.clone())
                } else {
                    Self::Object(entries)
                }
            }
            other => Self::Literal(other.clone()),
        }
    }

    fn compile_str(s: &str) -> Self {
        if let Some(name) = s.strip_prefix('$') {
            if is_variable_name(name) {
                return Self::Var(name.to_string());
            }
            if let Some(inner) = name.strip_prefix('{').and_then(|n| n.strip_suffix('}'))
                && is_variable_name(inner)
            {
                return Self::Var(inner.to_string());
            }
        }

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) if is_variable_name(&after[..end]) => {
                    text.push_str(&rest[..start]);
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Var(after[..end].to_string()));
                    rest = &after[end + 1..];
                }
                // 不合法的占位符保留原文
                _ => {
                    text.push_str(&rest[..start + 2]);
                    rest = after;
                }
            }
        }
        text.push_str(rest);

        if segments.is_empty() {
            return Self::Literal(Value::String(text));
        }
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Self::Interpolated(segments)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// 字面量内容（用于注册时校验）
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// 模板引用的所有变量
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.collect_vars(&mut vars);
        vars
    }

    fn collect_vars(&self, vars: &mut BTreeSet<String>) {
        match self {
            Self::Literal(_) => {}
            Self::Var(name) => {
                vars.insert(name.clone());
            }
            Self::Interpolated(segments) => {
                for segment in segments {
                    if let Segment::Var(name) = segment {
                        vars.insert(name.clone());
                    }
                }
            }
            Self::Array(items) => items.iter().for_each(|t| t.collect_vars(vars)),
            Self::Object(entries) => entries.iter().for_each(|(_, t)| t.collect_vars(vars)),
        }
    }

    /// 用绑定变量渲染，引用未绑定变量时返回 `UnboundVariable`
    pub fn render(&self, bindings: &Bindings) -> Result<Value> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Var(name) => lookup(bindings, name).cloned(),
            Self::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Var(name) => match lookup(bindings, name)? {
                            Value::String(s) => out.push_str(s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
            Self::Array(items) => items
                .iter()
                .map(|t| t.render(bindings))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Self::Object(entries) => {
                let mut map = Map::new();
                for (key, template) in entries {
                    map.insert(key.clone(), template.render(bindings)?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

fn lookup<'a>(bindings: &'a Bindings, name: &str) -> Result<&'a Value> {
    bindings
        .get(name)
        .ok_or_else(|| RuleError::UnboundVariable(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.insert("amount".to_string(), json!(1500));
        b.insert("user".to_string(), json!("ada"));
        b
    }

    #[test]
    fn test_pure_placeholder_keeps_type() {
        assert_eq!(Template::compile(&json!("$amount")).render(&bindings()).unwrap(), json!(1500));
        assert_eq!(Template::compile(&json!("${amount}")).render(&bindings()).unwrap(), json!(1500));
        assert_eq!(
            Template::compile(&json!({"$var": "user"})).render(&bindings()).unwrap(),
            json!("ada")
        );
    }

    #[test]
    fn test_mixed_string_interpolation() {
        let template = Template::compile(&json!("user ${user} spent ${amount}!"));
        assert_eq!(template.render(&bindings()).unwrap(), json!("user ada spent 1500!"));
    }

    #[test]
    fn test_nested_structures() {
        let template = Template::compile(&json!({
            "who": "$user",
            "items": [1, "$amount", {"note": "n=${amount}"}],
            "fixed": {"a": 1}
        }));
        assert_eq!(
            template.render(&bindings()).unwrap(),
            json!({"who": "ada", "items": [1, 1500, {"note": "n=1500"}], "fixed": {"a": 1}})
        );
        assert_eq!(
            template.variables().into_iter().collect::<Vec<_>>(),
            vec!["amount".to_string(), "user".to_string()]
        );
    }

    #[test]
    fn test_literals_are_folded() {
        assert!(Template::compile(&json!([1, 2, {"a": "b"}])).is_literal());
        assert!(Template::compile(&json!("$5 off")).is_literal());
        assert!(Template::compile(&json!("broken ${ placeholder")).is_literal());
        assert_eq!(
            Template::compile(&json!({"$literal": "$amount"})).as_literal(),
            Some(&json!("$amount"))
        );
    }

    #[test]
    fn test_unbound_variable() {
        let result = Template::compile(&json!("$minAge")).render(&bindings());
        assert!(matches!(result, Err(RuleError::UnboundVariable(name)) if name == "minAge"));
    }

    #[test]
    fn test_variable_names() {
        assert!(is_variable_name("minAge"));
        assert!(is_variable_name("_x1"));
        assert!(!is_variable_name("1x"));
        assert!(!is_variable_name(""));
        assert!(!is_variable_name("a-b"));
    }
}
