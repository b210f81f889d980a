//! `$compute` 受限表达式
//!
//! 表达式在规则注册时解析成语法树，执行时只读绑定变量，不访问事实存储，
//! 也不能调用任何宿主代码。语法（优先级从低到高）：
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := equality ( "&&" equality )*
//! equality:= compare ( ("==" | "!=") compare )*
//! compare := additive ( ("<" | "<=" | ">" | ">=") additive )*
//! additive:= term ( ("+" | "-") term )*
//! term    := unary ( ("*" | "/" | "%") unary )*
//! unary   := ("-" | "!") unary | primary
//! primary := number | string | true | false | null | $var | func "(" args ")" | "(" or ")"
//! number  := digits ( "." digits )? ( ("e" | "E") ("+" | "-")? digits )?
//! ```
//!
//! 内置函数：`min max abs round floor ceil len upper lower concat`。

use crate::evaluator::ConditionEvaluator;
use crate::models::Bindings;
use crate::operators::type_name;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1};
use nom::character::complete::{char as pchar, digit1, multispace0, one_of};
use nom::combinator::{all_consuming, map, opt, recognize, value};
use nom::error::{ErrorKind, ParseError};
use nom::multi::{fold_many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, tuple};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use thiserror::Error;

/// 表达式错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("表达式语法错误 (位置 {position}): {message}")]
    Syntax { position: usize, message: String },

    #[error("变量未绑定: ${0}")]
    UnboundVariable(String),

    #[error("类型错误: {0}")]
    Type(String),

    #[error("除数为零")]
    DivisionByZero,
}

type ExprResult<T> = std::result::Result<T, ExpressionError>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Min,
    Max,
    Abs,
    Round,
    Floor,
    Ceil,
    Len,
    Upper,
    Lower,
    Concat,
}

impl Function {
    fn parse(name: &str) -> Option<Self> {
        let func = match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "len" => Self::Len,
            "upper" => Self::Upper,
            "lower" => Self::Lower,
            "concat" => Self::Concat,
            _ => return None,
        };
        Some(func)
    }

    /// 参数个数范围 (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Min | Self::Max | Self::Concat => (1, usize::MAX),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

/// 已解析的表达式
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// 解析表达式
    pub fn parse(source: &str) -> ExprResult<Self> {
        let root = match all_consuming(or_expr)(source) {
            Ok((_, root)) => root,
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
                return Err(syntax(source.len() - e.input.len(), e.message));
            }
            Err(nom::Err::Incomplete(_)) => return Err(syntax(source.len(), "表达式意外结束")),
        };
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 表达式引用的所有变量
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        collect_vars(&self.root, &mut vars);
        vars
    }

    /// 基于绑定变量求值
    pub fn evaluate(&self, bindings: &Bindings) -> ExprResult<Value> {
        eval(&self.root, bindings)
    }
}

fn collect_vars(expr: &Expr, vars: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Var(name) => {
            vars.insert(name.clone());
        }
        Expr::Unary(_, inner) => collect_vars(inner, vars),
        Expr::Binary(_, lhs, rhs) => {
            collect_vars(lhs, vars);
            collect_vars(rhs, vars);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_vars(a, vars)),
    }
}

// ==================== 语法分析 ====================

fn syntax(position: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        position,
        message: message.into(),
    }
}

/// 解析失败的剩余输入和原因
#[derive(Debug)]
struct SyntaxError<'a> {
    input: &'a str,
    message: String,
}

impl<'a> SyntaxError<'a> {
    fn new(input: &'a str, message: impl Into<String>) -> Self {
        Self {
            input,
            message: message.into(),
        }
    }
}

impl<'a> ParseError<&'a str> for SyntaxError<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        let snippet: String = input.trim_start().chars().take(16).collect();
        let message = if snippet.is_empty() {
            "表达式意外结束".to_string()
        } else if kind == ErrorKind::Eof {
            format!("多余的内容 '{}'", snippet)
        } else {
            format!("无法识别的内容 '{}'", snippet)
        };
        Self::new(input, message)
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type PResult<'a, O> = IResult<&'a str, O, SyntaxError<'a>>;

fn failure<'a>(input: &'a str, message: impl Into<String>) -> nom::Err<SyntaxError<'a>> {
    nom::Err::Failure(SyntaxError::new(input, message))
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

/// 失败即终止，不再回溯到其它分支
fn expect<'a, F, O>(mut parser: F, message: impl Into<String>) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    let message = message.into();
    move |input| {
        parser(input).map_err(|err| match err {
            nom::Err::Error(e) => failure(e.input, message.clone()),
            other => other,
        })
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(take_while1(is_ident_start), take_while(is_ident_char)))(input)
}

/// 左结合的二元运算层
fn binary_level<'a, P>(
    input: &'a str,
    operator: P,
    operand: fn(&'a str) -> PResult<'a, Expr>,
) -> PResult<'a, Expr>
where
    P: FnMut(&'a str) -> PResult<'a, BinaryOp>,
{
    let (input, first) = operand(input)?;
    fold_many0(
        pair(ws(operator), expect(operand, "运算符后缺少操作数")),
        move || first.clone(),
        |lhs, (op, rhs)| Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
    )(input)
}

fn or_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(input, value(BinaryOp::Or, tag("||")), and_expr)
}

fn and_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(input, value(BinaryOp::And, tag("&&")), equality_expr)
}

fn equality_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        alt((value(BinaryOp::Eq, tag("==")), value(BinaryOp::Ne, tag("!=")))),
        compare_expr,
    )
}

fn compare_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
        )),
        additive_expr,
    )
}

fn additive_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        alt((value(BinaryOp::Add, tag("+")), value(BinaryOp::Sub, tag("-")))),
        term_expr,
    )
}

fn term_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        alt((
            value(BinaryOp::Mul, tag("*")),
            value(BinaryOp::Div, tag("/")),
            value(BinaryOp::Rem, tag("%")),
        )),
        unary_expr,
    )
}

fn unary_expr(input: &str) -> PResult<'_, Expr> {
    preceded(
        multispace0,
        alt((
            map(preceded(pchar('-'), expect(unary_expr, "'-' 后缺少操作数")), |e| {
                Expr::Unary(UnaryOp::Neg, Box::new(e))
            }),
            map(preceded(pchar('!'), expect(unary_expr, "'!' 后缺少操作数")), |e| {
                Expr::Unary(UnaryOp::Not, Box::new(e))
            }),
            primary,
        )),
    )(input)
}

fn primary(input: &str) -> PResult<'_, Expr> {
    ws(alt((
        number_literal,
        map(alt((single_quoted, double_quoted)), |s| Expr::Literal(Value::String(s))),
        variable,
        keyword_or_call,
        parenthesized,
    )))(input)
}

/// 整数、小数和科学计数法（如 `6.626e-34`）
fn number_literal(input: &str) -> PResult<'_, Expr> {
    let parsed: PResult<'_, &str> = recognize(tuple((
        digit1,
        opt(pair(pchar('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input);
    let (rest, text) = parsed?;

    let literal = if text.contains(|c: char| matches!(c, '.' | 'e' | 'E')) {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
    } else {
        text.parse::<i64>().ok().map(Value::from)
    };

    match literal {
        Some(value) => Ok((rest, Expr::Literal(value))),
        None => Err(failure(input, format!("无效的数字 '{}'", text))),
    }
}

fn escape_char(input: &str) -> PResult<'_, &'static str> {
    alt((
        value("\n", pchar('n')),
        value("\t", pchar('t')),
        value("\\", pchar('\\')),
        value("'", pchar('\'')),
        value("\"", pchar('"')),
    ))(input)
}

fn single_quoted(input: &str) -> PResult<'_, String> {
    delimited(
        pchar('\''),
        map(opt(escaped_transform(is_not("\\'"), '\\', escape_char)), Option::unwrap_or_default),
        expect(pchar('\''), "字符串未闭合"),
    )(input)
}

fn double_quoted(input: &str) -> PResult<'_, String> {
    delimited(
        pchar('"'),
        map(opt(escaped_transform(is_not("\\\""), '\\', escape_char)), Option::unwrap_or_default),
        expect(pchar('"'), "字符串未闭合"),
    )(input)
}

fn variable(input: &str) -> PResult<'_, Expr> {
    map(
        preceded(pchar('$'), expect(identifier, "'$' 后需要变量名")),
        |name: &str| Expr::Var(name.to_string()),
    )(input)
}

fn keyword_or_call(input: &str) -> PResult<'_, Expr> {
    let (rest, name) = identifier(input)?;
    let keyword = match name {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => None,
    };
    if let Some(literal) = keyword {
        return Ok((rest, Expr::Literal(literal)));
    }

    let Some(func) = Function::parse(name) else {
        return Err(failure(input, format!("未知函数 '{}'", name)));
    };

    let parsed: PResult<'_, Vec<Expr>> = delimited(
        expect(ws(pchar('(')), format!("函数 '{}' 后需要 '('", name)),
        separated_list0(ws(pchar(',')), or_expr),
        expect(ws(pchar(')')), format!("函数 '{}' 参数列表未闭合", name)),
    )(rest);
    let (rest, args) = parsed?;

    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        return Err(failure(
            input,
            format!("函数 '{}' 参数个数错误: {}", name, args.len()),
        ));
    }

    Ok((rest, Expr::Call(func, args)))
}

fn parenthesized(input: &str) -> PResult<'_, Expr> {
    delimited(ws(pchar('(')), or_expr, expect(ws(pchar(')')), "缺少右括号"))(input)
}

// ==================== 求值 ====================

fn number(n: f64) -> ExprResult<Value> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("非有限数值: {}", n)))
}

fn type_error(op: &str, lhs: &Value, rhs: &Value) -> ExpressionError {
    ExpressionError::Type(format!(
        "{} 不支持 {} 与 {}",
        op,
        type_name(lhs),
        type_name(rhs)
    ))
}

fn as_bool(value: &Value, op: &str) -> ExprResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| ExpressionError::Type(format!("{} 需要布尔值, 实际 {}", op, type_name(value))))
}

fn as_f64(value: &Value, op: &str) -> ExprResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("{} 需要数值, 实际 {}", op, type_name(value))))
}

/// 字符串拼接时的文本形式，字符串本身不带引号
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 浮点结果恰好是整数时还原为整数
fn integral(n: f64) -> ExprResult<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(Value::from(n as i64))
    } else {
        number(n)
    }
}

fn eval(expr: &Expr, bindings: &Bindings) -> ExprResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnboundVariable(name.clone())),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let value = eval(inner, bindings)?;
            match value.as_i64() {
                Some(n) => n
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| ExpressionError::Type("整数溢出".to_string())),
                None => number(-as_f64(&value, "-")?),
            }
        }
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!as_bool(&eval(inner, bindings)?, "!")?)),
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !as_bool(&eval(lhs, bindings)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, bindings)?, "&&")?))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if as_bool(&eval(lhs, bindings)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, bindings)?, "||")?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            binary(*op, &lhs, &rhs)
        }
        Expr::Call(func, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, bindings))
                .collect::<ExprResult<Vec<_>>>()?;
            call(*func, &args)
        }
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> ExprResult<Value> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(ConditionEvaluator::values_equal(lhs, rhs))),
        BinaryOp::Ne => return Ok(Value::Bool(!ConditionEvaluator::values_equal(lhs, rhs))),
        BinaryOp::Add if lhs.is_string() || rhs.is_string() => {
            return Ok(Value::String(format!("{}{}", text(lhs), text(rhs))));
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (Value::Number(_), Value::Number(_)) => {
                    as_f64(lhs, "比较")?.partial_cmp(&as_f64(rhs, "比较")?)
                }
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| type_error("比较", lhs, rhs))?;
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if !lhs.is_number() || !rhs.is_number() {
        return Err(type_error("算术运算", lhs, rhs));
    }

    // 两侧都是整数时优先使用整数运算
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(ExpressionError::DivisionByZero),
            BinaryOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Div => return number(a as f64 / b as f64),
            _ => a.checked_rem(b),
        };
        if let Some(n) = result {
            return Ok(Value::from(n));
        }
    }

    let (a, b) = (as_f64(lhs, "算术运算")?, as_f64(rhs, "算术运算")?);
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    number(result)
}

fn call(func: Function, args: &[Value]) -> ExprResult<Value> {
    match func {
        Function::Min | Function::Max => {
            let mut best = &args[0];
            as_f64(best, "min/max")?;
            for candidate in &args[1..] {
                let (b, c) = (as_f64(best, "min/max")?, as_f64(candidate, "min/max")?);
                let replace = if func == Function::Min { c < b } else { c > b };
                if replace {
                    best = candidate;
                }
            }
            Ok(best.clone())
        }
        Function::Abs => match args[0].as_i64() {
            Some(n) => n
                .checked_abs()
                .map(Value::from)
                .ok_or_else(|| ExpressionError::Type("整数溢出".to_string())),
            None => number(as_f64(&args[0], "abs")?.abs()),
        },
        Function::Round => integral(as_f64(&args[0], "round")?.round()),
        Function::Floor => integral(as_f64(&args[0], "floor")?.floor()),
        Function::Ceil => integral(as_f64(&args[0], "ceil")?.ceil()),
        Function::Len => match &args[0] {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            other => Err(ExpressionError::Type(format!("len 不支持 {}", type_name(other)))),
        },
        Function::Upper | Function::Lower => {
            let s = args[0].as_str().ok_or_else(|| {
                ExpressionError::Type(format!("upper/lower 需要字符串, 实际 {}", type_name(&args[0])))
            })?;
            Ok(Value::String(if func == Function::Upper {
                s.to_uppercase()
            } else {
                s.to_lowercase()
            }))
        }
        Function::Concat => Ok(Value::String(args.iter().map(text).collect())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.insert("temp".to_string(), json!(105));
        b.insert("ratio".to_string(), json!(0.5));
        b.insert("name".to_string(), json!("Ada"));
        b.insert("tags".to_string(), json!(["a", "b"]));
        b
    }

    fn eval_str(source: &str) -> ExprResult<Value> {
        Expression::parse(source)?.evaluate(&bindings())
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval_str("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval_str("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval_str("$temp - 100").unwrap(), json!(5));
        assert_eq!(eval_str("-$temp + 5").unwrap(), json!(-100));
        assert_eq!(eval_str("10 % 4").unwrap(), json!(2));
    }

    #[test]
    fn test_division() {
        assert_eq!(eval_str("10 / 2").unwrap(), json!(5));
        assert_eq!(eval_str("7 / 2").unwrap(), json!(3.5));
        assert_eq!(eval_str("$ratio * 4").unwrap(), json!(2.0));
        assert_eq!(eval_str("1 / 0"), Err(ExpressionError::DivisionByZero));
        assert_eq!(eval_str("1.5 / 0"), Err(ExpressionError::DivisionByZero));
    }

    #[test]
    fn test_strings() {
        assert_eq!(eval_str("'Dr. ' + $name").unwrap(), json!("Dr. Ada"));
        assert_eq!(eval_str("\"t=\" + $temp").unwrap(), json!("t=105"));
        assert_eq!(eval_str("upper($name)").unwrap(), json!("ADA"));
        assert_eq!(eval_str("concat($name, '-', 1)").unwrap(), json!("Ada-1"));
        assert_eq!(eval_str("len($tags)").unwrap(), json!(2));
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(eval_str("$temp > 100 && $name == 'Ada'").unwrap(), json!(true));
        assert_eq!(eval_str("!($temp >= 200) || false").unwrap(), json!(true));
        assert_eq!(eval_str("$temp != 105.0").unwrap(), json!(false));
        // 短路：右侧未绑定变量不会被求值
        assert_eq!(eval_str("false && $missing").unwrap(), json!(false));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_str("min(3, $temp, -2)").unwrap(), json!(-2));
        assert_eq!(eval_str("max(3, $temp)").unwrap(), json!(105));
        assert_eq!(eval_str("abs(-4)").unwrap(), json!(4));
        assert_eq!(eval_str("round(2.5)").unwrap(), json!(3));
        assert_eq!(eval_str("floor(2.7)").unwrap(), json!(2));
        assert_eq!(eval_str("ceil(2.1)").unwrap(), json!(3));
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(eval_str("6.626e-34").unwrap(), json!(6.626e-34));
        assert_eq!(eval_str("1E3 + 1").unwrap(), json!(1001.0));
        assert_eq!(eval_str("2.5e+2 * 2").unwrap(), json!(500.0));
        assert_eq!(eval_str("9.109e-31 > 6.626e-34").unwrap(), json!(true));
    }

    #[test]
    fn test_abs_overflow() {
        let mut b = Bindings::new();
        b.insert("n".to_string(), json!(i64::MIN));
        let expr = Expression::parse("abs($n)").unwrap();
        assert!(matches!(expr.evaluate(&b), Err(ExpressionError::Type(_))));

        let neg = Expression::parse("-$n").unwrap();
        assert!(matches!(neg.evaluate(&b), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(
            eval_str("$missing + 1"),
            Err(ExpressionError::UnboundVariable("missing".to_string()))
        );
        assert!(matches!(eval_str("$name * 2"), Err(ExpressionError::Type(_))));
        assert!(matches!(eval_str("!$temp"), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn test_syntax_errors() {
        for source in [
            "1 +", "(1 + 2", "foo(1)", "min()", "1 2", "'open", "$", "1 # 2", "abs(1, 2)", "2.5e", "1e400", "",
        ] {
            assert!(
                matches!(Expression::parse(source), Err(ExpressionError::Syntax { .. })),
                "expected syntax error for {:?}",
                source
            );
        }
    }

    #[test]
    fn test_syntax_error_position() {
        match Expression::parse("$a + foo(1)") {
            Err(ExpressionError::Syntax { position, message }) => {
                assert_eq!(position, 5);
                assert!(message.contains("foo"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_variables() {
        let expr = Expression::parse("$a + max($b, $a) * 2").unwrap();
        let vars: Vec<String> = expr.variables().into_iter().collect();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(expr.source(), "$a + max($b, $a) * 2");
    }
}
