//! 叶子条件评估器
//!
//! 实现内置操作符对单个字段值的比较语义。这里的错误都是类型不匹配，
//! 由 [`crate::matcher`] 转成该叶子的 `NoMatch`，不会中断整轮匹配。

use crate::error::{Result, RuleError};
use crate::operators::{Operator, ValueType, type_name};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `field_value` - 从事实中取出的字段值，字段不存在时为 None
    /// * `operator` - 操作符
    /// * `expected` - 右侧操作数（字面量或已解析的变量值）
    pub fn evaluate(field_value: Option<&Value>, operator: Operator, expected: &Value) -> Result<bool> {
        match operator {
            Operator::Exists => return Ok(field_value.is_some()),
            Operator::IsEmpty => return Ok(Self::is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!Self::is_empty(field_value)),
            _ => {}
        }

        // 字段不存在时，其余操作一律不成立
        let Some(field) = field_value else {
            return Ok(false);
        };

        match operator {
            Operator::Eq => Ok(Self::values_equal(field, expected)),
            Operator::Neq => Ok(!Self::values_equal(field, expected)),
            Operator::Gt => Self::compare(field, expected).map(Ordering::is_gt),
            Operator::Gte => Self::compare(field, expected).map(Ordering::is_ge),
            Operator::Lt => Self::compare(field, expected).map(Ordering::is_lt),
            Operator::Lte => Self::compare(field, expected).map(Ordering::is_le),
            Operator::Between => Self::between(field, expected),
            Operator::In => Self::in_list(field, expected),
            Operator::NotIn => Self::in_list(field, expected).map(|r| !r),
            Operator::Contains => Self::contains(field, expected),
            Operator::ContainsAny => {
                let (have, want) = (Self::expect_array(field)?, Self::expect_array(expected)?);
                Ok(want.iter().any(|w| have.iter().any(|h| Self::values_equal(h, w))))
            }
            Operator::ContainsAll => {
                let (have, want) = (Self::expect_array(field)?, Self::expect_array(expected)?);
                Ok(want.iter().all(|w| have.iter().any(|h| Self::values_equal(h, w))))
            }
            Operator::StartsWith => {
                Ok(Self::expect_str(field)?.starts_with(Self::expect_str(expected)?))
            }
            Operator::EndsWith => Ok(Self::expect_str(field)?.ends_with(Self::expect_str(expected)?)),
            Operator::Regex => {
                let pattern = Self::expect_str(expected)?;
                let regex = Regex::new(pattern).map_err(|e| {
                    RuleError::ParseError(format!("无效的正则表达式 '{}': {}", pattern, e))
                })?;
                Self::regex_match(field, &regex)
            }
            Operator::Before => {
                Ok(Self::parse_datetime(field)? < Self::parse_datetime(expected)?)
            }
            Operator::After => Ok(Self::parse_datetime(field)? > Self::parse_datetime(expected)?),
            Operator::Type => {
                let name = Self::expect_str(expected)?;
                let ty = ValueType::parse(name).ok_or_else(|| {
                    RuleError::ParseError(format!("未知的类型名称: '{}'", name))
                })?;
                Ok(ty.matches(field))
            }
            Operator::Exists | Operator::IsEmpty | Operator::IsNotEmpty => unreachable!(),
        }
    }

    /// 使用预编译的正则表达式匹配
    pub fn regex_match(field: &Value, regex: &Regex) -> Result<bool> {
        Ok(regex.is_match(Self::expect_str(field)?))
    }

    /// 值相等判断，变量合一也使用这个判断
    ///
    /// 两侧都是整数时精确比较；任一侧是浮点数时按浮点精确比较（100 == 100.0）。
    /// 数组和对象逐元素递归比较。
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => match (Self::as_integer(x), Self::as_integer(y)) {
                (Some(x), Some(y)) => x == y,
                _ => match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(x, y)| Self::values_equal(x, y))
            }
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter()
                        .all(|(k, v)| y.get(k).is_some_and(|w| Self::values_equal(v, w)))
            }
            _ => a == b,
        }
    }

    /// 整数（i64 或 u64）统一成 i128，浮点数返回 None
    fn as_integer(n: &Number) -> Option<i128> {
        n.as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
    }

    /// 判断值是否为空
    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        }
    }

    /// 有序比较：数值之间按数值比较，字符串之间按字典序比较
    fn compare(field: &Value, expected: &Value) -> Result<Ordering> {
        if let (Value::String(a), Value::String(b)) = (field, expected)
            && (a.parse::<f64>().is_err() || b.parse::<f64>().is_err())
        {
            return Ok(a.cmp(b));
        }

        if let (Value::Number(a), Value::Number(b)) = (field, expected)
            && let (Some(a), Some(b)) = (Self::as_integer(a), Self::as_integer(b))
        {
            return Ok(a.cmp(&b));
        }

        let a = Self::expect_number(field)?;
        let b = Self::expect_number(expected)?;
        a.partial_cmp(&b).ok_or_else(|| RuleError::TypeMismatch {
            expected: "comparable number".to_string(),
            actual: "NaN".to_string(),
        })
    }

    /// 范围比较，expected 为 [min, max] 闭区间
    fn between(field: &Value, expected: &Value) -> Result<bool> {
        let bounds = Self::expect_array(expected)?;
        let [min, max] = bounds else {
            return Err(RuleError::TypeMismatch {
                expected: "array [min, max]".to_string(),
                actual: format!("array of {}", bounds.len()),
            });
        };

        let value = Self::expect_number(field)?;
        Ok(value >= Self::expect_number(min)? && value <= Self::expect_number(max)?)
    }

    fn in_list(field: &Value, expected: &Value) -> Result<bool> {
        Ok(Self::expect_array(expected)?
            .iter()
            .any(|item| Self::values_equal(field, item)))
    }

    /// 字符串包含子串，或数组包含元素
    fn contains(field: &Value, expected: &Value) -> Result<bool> {
        match field {
            Value::String(s) => Ok(s.contains(Self::expect_str(expected)?)),
            Value::Array(arr) => Ok(arr.iter().any(|item| Self::values_equal(item, expected))),
            _ => Err(RuleError::TypeMismatch {
                expected: "string or array".to_string(),
                actual: type_name(field).to_string(),
            }),
        }
    }

    /// 解析日期时间，支持 RFC 3339 与纯日期
    fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
        let s = Self::expect_str(value)?;

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }

        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or_else(|| RuleError::ParseError(format!("无法解析日期时间: '{}'", s)))
    }

    fn expect_number(value: &Value) -> Result<f64> {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        number.ok_or_else(|| Self::mismatch("number", value))
    }

    fn expect_str(value: &Value) -> Result<&str> {
        value.as_str().ok_or_else(|| Self::mismatch("string", value))
    }

    fn expect_array(value: &Value) -> Result<&[Value]> {
        value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| Self::mismatch("array", value))
    }

    fn mismatch(expected: &str, actual: &Value) -> RuleError {
        RuleError::TypeMismatch {
            expected: expected.to_string(),
            actual: type_name(actual).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(field: Value, operator: &str, expected: Value) -> bool {
        ConditionEvaluator::evaluate(Some(&field), Operator::parse(operator).unwrap(), &expected)
            .unwrap()
    }

    #[test]
    fn test_eq_numbers() {
        assert!(eval(json!(100), "eq", json!(100)));
        assert!(eval(json!(100.0), "eq", json!(100)));
        assert!(eval(json!(3), "neq", json!(4)));
    }

    #[test]
    fn test_eq_distinguishes_close_numbers() {
        // 普朗克常数与电子质量，数量级都远小于 f64::EPSILON
        assert!(!eval(json!(6.626e-34), "eq", json!(9.109e-31)));
        assert!(eval(json!(6.626e-34), "neq", json!(9.109e-31)));
        assert!(eval(json!(6.626e-34), "eq", json!(6.626e-34)));

        // 超过 2^53 的整数不能经过浮点比较
        assert!(!eval(json!(9007199254740992_i64), "eq", json!(9007199254740993_i64)));
        assert!(eval(json!(u64::MAX), "eq", json!(u64::MAX)));
        assert!(!eval(json!(u64::MAX), "eq", json!(-1)));
        assert!(eval(json!(9007199254740993_i64), "gt", json!(9007199254740992_i64)));

        assert!(!eval(json!(1e-20), "in", json!([2e-20, 3e-20])));
        assert!(eval(json!([1, {"a": 2.0}]), "eq", json!([1.0, {"a": 2}])));
    }

    #[test]
    fn test_eq_strings() {
        assert!(eval(json!("hello"), "eq", json!("hello")));
        assert!(!eval(json!("hello"), "eq", json!("world")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval(json!(105), "gt", json!(100)));
        assert!(eval(json!(100), "gte", json!(100)));
        assert!(eval(json!(50), "lt", json!(100)));
        assert!(eval(json!(100), "lte", json!(100)));
        assert!(!eval(json!(100), "gt", json!(100)));
    }

    #[test]
    fn test_string_ordering() {
        assert!(eval(json!("beta"), "gt", json!("alpha")));
        // 数字字符串按数值比较
        assert!(eval(json!("10"), "gt", json!(9)));
    }

    #[test]
    fn test_comparison_type_mismatch_is_error() {
        let result = ConditionEvaluator::evaluate(Some(&json!(true)), Operator::Gt, &json!(1));
        assert!(matches!(result, Err(RuleError::TypeMismatch { .. })));
    }

    #[test]
    fn test_between() {
        assert!(eval(json!(50), "between", json!([0, 100])));
        assert!(!eval(json!(150), "between", json!([0, 100])));
        assert!(ConditionEvaluator::evaluate(Some(&json!(5)), Operator::Between, &json!([1])).is_err());
    }

    #[test]
    fn test_set_membership() {
        assert!(eval(json!("a"), "in", json!(["a", "b", "c"])));
        assert!(!eval(json!("d"), "in", json!(["a", "b", "c"])));
        assert!(eval(json!("d"), "not_in", json!(["a", "b", "c"])));
        assert!(eval(json!(2.0), "in", json!([1, 2, 3])));
    }

    #[test]
    fn test_contains_family() {
        assert!(eval(json!("hello world"), "contains", json!("world")));
        assert!(eval(json!(["a", "b", "c"]), "contains", json!("b")));
        assert!(eval(json!(["a", "b", "c"]), "contains_any", json!(["b", "d"])));
        assert!(!eval(json!(["a", "b", "c"]), "contains_any", json!(["x", "y"])));
        assert!(eval(json!(["a", "b", "c"]), "contains_all", json!(["a", "b"])));
        assert!(!eval(json!(["a", "b", "c"]), "contains_all", json!(["a", "d"])));
    }

    #[test]
    fn test_string_affixes() {
        assert!(eval(json!("hello world"), "starts_with", json!("hello")));
        assert!(eval(json!("hello world"), "ends_with", json!("world")));
    }

    #[test]
    fn test_regex() {
        assert!(eval(json!("user@example.com"), "regex", json!(r"^[\w.-]+@[\w.-]+\.\w+$")));
        assert!(!eval(json!("not-an-email"), "regex", json!(r"^[\w.-]+@[\w.-]+\.\w+$")));
    }

    #[test]
    fn test_type_check() {
        assert!(eval(json!(3), "type", json!("integer")));
        assert!(eval(json!({"a": 1}), "type", json!("object")));
        assert!(!eval(json!("3"), "type", json!("number")));
    }

    #[test]
    fn test_existence_and_emptiness() {
        assert!(ConditionEvaluator::evaluate(Some(&json!(null)), Operator::Exists, &json!(null)).unwrap());
        assert!(!ConditionEvaluator::evaluate(None, Operator::Exists, &json!(null)).unwrap());
        assert!(ConditionEvaluator::evaluate(None, Operator::IsEmpty, &json!(null)).unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&json!([])), Operator::IsEmpty, &json!(null)).unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&json!("x")), Operator::IsNotEmpty, &json!(null)).unwrap());
    }

    #[test]
    fn test_time_comparison() {
        assert!(eval(json!("2024-01-15T10:00:00Z"), "before", json!("2024-01-20T10:00:00Z")));
        assert!(eval(json!("2024-01-20"), "after", json!("2024-01-15T10:00:00Z")));
    }

    #[test]
    fn test_missing_field() {
        assert!(!ConditionEvaluator::evaluate(None, Operator::Eq, &json!("test")).unwrap());
        assert!(!ConditionEvaluator::evaluate(None, Operator::Neq, &json!("test")).unwrap());
    }
}
