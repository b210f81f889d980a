//! 事实存储（工作内存）
//!
//! 事实以键标识，内容是属性 -> 值的记录（JSON 对象），属性可以嵌套对象或数组。
//! 存储内部使用 `Arc` 写时复制，[`FactStore::snapshot`] 只是一次引用计数，
//! 评估期间看到的视图不会被后续修改影响。

use crate::error::{Result, RuleError};
use crate::operators::type_name;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// 单条事实记录
pub type Fact = Map<String, Value>;

/// 字段路径：`<事实键>.<属性>[.<嵌套属性>...]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    fact: String,
    attributes: Vec<String>,
}

impl FieldPath {
    /// 解析点号分隔的路径，空路径或空段返回 None
    pub fn parse(raw: &str) -> Option<Self> {
        let mut segments = raw.split('.');
        let fact = segments.next()?.trim();
        if fact.is_empty() {
            return None;
        }

        let attributes: Vec<String> = segments.map(|s| s.trim().to_string()).collect();
        if attributes.iter().any(String::is_empty) {
            return None;
        }

        Some(Self {
            raw: raw.to_string(),
            fact: fact.to_string(),
            attributes,
        })
    }

    /// 路径引用的事实键
    pub fn fact(&self) -> &str {
        &self.fact
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 只读快照，单轮评估使用
#[derive(Debug, Clone, Default)]
pub struct FactSnapshot {
    facts: Arc<BTreeMap<String, Value>>,
}

impl FactSnapshot {
    /// 获取字段值（支持数组索引访问，如 "order.items.0.name"）
    pub fn get_field(&self, path: &FieldPath) -> Option<&Value> {
        let mut current = self.facts.get(path.fact())?;

        for part in path.attributes() {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }

    pub fn get(&self, key: &str) -> Option<&Fact> {
        self.facts.get(key).and_then(Value::as_object)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.facts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// 缓冲中的一次事实修改
#[derive(Debug, Clone, PartialEq)]
pub enum FactChange {
    Set {
        key: String,
        attributes: Vec<String>,
        value: Value,
    },
    Remove {
        key: String,
        attributes: Vec<String>,
    },
}

impl FactChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Remove { key, .. } => key,
        }
    }
}

/// 一条规则动作列表产生的修改缓冲，动作列表结束后统一提交
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<FactChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &FieldPath, value: Value) -> Result<()> {
        if path.attributes().is_empty() && !value.is_object() {
            return Err(RuleError::TypeMismatch {
                expected: format!("object for fact '{}'", path.fact()),
                actual: type_name(&value).to_string(),
            });
        }

        self.changes.push(FactChange::Set {
            key: path.fact().to_string(),
            attributes: path.attributes().to_vec(),
            value,
        });
        Ok(())
    }

    pub fn remove(&mut self, path: &FieldPath) {
        self.changes.push(FactChange::Remove {
            key: path.fact().to_string(),
            attributes: path.attributes().to_vec(),
        });
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[FactChange] {
        &self.changes
    }

    /// 缓冲中涉及的全部事实键
    pub fn keys(&self) -> BTreeSet<String> {
        self.changes.iter().map(|c| c.key().to_string()).collect()
    }
}

/// 事实存储
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactStore {
    facts: Arc<BTreeMap<String, Value>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 对象创建，每个顶层值必须是对象
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(RuleError::TypeMismatch {
                expected: "object of facts".to_string(),
                actual: type_name(&value).to_string(),
            });
        };

        let mut facts = BTreeMap::new();
        for (key, fact) in map {
            if !fact.is_object() {
                return Err(RuleError::TypeMismatch {
                    expected: format!("object for fact '{}'", key),
                    actual: type_name(&fact).to_string(),
                });
            }
            facts.insert(key, fact);
        }

        Ok(Self {
            facts: Arc::new(facts),
        })
    }

    /// 从 JSON 字符串创建
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn get(&self, key: &str) -> Option<&Fact> {
        self.facts.get(key).and_then(Value::as_object)
    }

    /// 写入属性，`attribute` 为点号分隔的嵌套路径；事实不存在时自动创建
    pub fn set(&mut self, key: &str, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let raw = if attribute.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", key, attribute)
        };
        let path = FieldPath::parse(&raw)
            .ok_or_else(|| RuleError::ParseError(format!("无效的字段路径: '{}'", raw)))?;

        let mut changes = ChangeSet::new();
        changes.set(&path, value.into())?;
        self.apply(&changes)?;
        Ok(())
    }

    /// 删除整条事实（attribute 为 None）或某个属性，返回是否有内容被删除
    pub fn remove(&mut self, key: &str, attribute: Option<&str>) -> bool {
        let attributes: Vec<String> = attribute
            .map(|a| a.split('.').map(str::to_string).collect())
            .unwrap_or_default();
        remove_entry(Arc::make_mut(&mut self.facts), key, &attributes)
    }

    /// 获取只读快照
    pub fn snapshot(&self) -> FactSnapshot {
        FactSnapshot {
            facts: Arc::clone(&self.facts),
        }
    }

    /// 提交修改缓冲，返回内容发生变化的事实键
    ///
    /// 遇到无法写入的修改时停止并返回错误，此前的修改保留。
    pub fn apply(&mut self, changes: &ChangeSet) -> Result<BTreeSet<String>> {
        let mut touched = BTreeSet::new();
        if changes.is_empty() {
            return Ok(touched);
        }

        let facts = Arc::make_mut(&mut self.facts);
        for change in changes.changes() {
            let changed = match change {
                FactChange::Set {
                    key,
                    attributes,
                    value,
                } => {
                    let slot = facts
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    set_path(slot, attributes, value.clone())?
                }
                FactChange::Remove { key, attributes } => remove_entry(facts, key, attributes),
            };

            if changed {
                touched.insert(change.key().to_string());
            }
        }

        Ok(touched)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.facts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// 转换为 JSON 对象
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.facts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Serialize for FactStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.facts.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FactStore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// 按路径写入，返回值是否发生变化
///
/// 数组只接受已有下标或末尾追加（下标等于长度），其余下标报类型错误。
fn set_path(target: &mut Value, path: &[String], value: Value) -> Result<bool> {
    let Some((head, rest)) = path.split_first() else {
        if *target == value {
            return Ok(false);
        }
        *target = value;
        return Ok(true);
    };

    if let Value::Array(items) = target {
        let index = head
            .parse::<usize>()
            .ok()
            .filter(|i| *i <= items.len())
            .ok_or_else(|| RuleError::TypeMismatch {
                expected: format!("array index in 0..={}", items.len()),
                actual: format!("'{}'", head),
            })?;
        let appended = index == items.len();
        if appended {
            items.push(Value::Null);
        }
        let changed = set_path(&mut items[index], rest, value)?;
        return Ok(changed || appended);
    }

    // 中间节点是标量时替换为对象
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    match target {
        Value::Object(map) => {
            let existed = map.contains_key(head);
            let slot = map.entry(head.clone()).or_insert(Value::Null);
            Ok(set_path(slot, rest, value)? || !existed)
        }
        _ => Ok(false),
    }
}

fn remove_entry(facts: &mut BTreeMap<String, Value>, key: &str, attributes: &[String]) -> bool {
    let Some((last, parents)) = attributes.split_last() else {
        return facts.remove(key).is_some();
    };

    let Some(mut current) = facts.get_mut(key) else {
        return false;
    };

    for part in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(part),
            Value::Array(arr) => part.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return false,
        }
    }

    match current {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(arr) => match last.parse::<usize>() {
            Ok(index) if index < arr.len() => {
                arr.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> FieldPath {
        FieldPath::parse(raw).unwrap()
    }

    fn sample_store() -> FactStore {
        FactStore::from_value(json!({
            "patient": {
                "temperature": 105,
                "tags": ["icu", "adult"],
                "vitals": {"pulse": 90}
            },
            "ward": {"name": "east"}
        }))
        .unwrap()
    }

    #[test]
    fn test_field_path_parse() {
        let p = path("patient.vitals.pulse");
        assert_eq!(p.fact(), "patient");
        assert_eq!(p.attributes(), &["vitals".to_string(), "pulse".to_string()]);

        assert!(FieldPath::parse("").is_none());
        assert!(FieldPath::parse("patient..pulse").is_none());
        assert!(FieldPath::parse(".pulse").is_none());
    }

    #[test]
    fn test_snapshot_lookup() {
        let store = sample_store();
        let snapshot = store.snapshot();

        assert_eq!(snapshot.get_field(&path("patient.temperature")), Some(&json!(105)));
        assert_eq!(snapshot.get_field(&path("patient.tags.1")), Some(&json!("adult")));
        assert_eq!(snapshot.get_field(&path("patient.vitals.pulse")), Some(&json!(90)));
        assert!(snapshot.get_field(&path("patient")).is_some());
        assert_eq!(snapshot.get_field(&path("patient.missing")), None);
        assert_eq!(snapshot.get_field(&path("nobody.temperature")), None);
    }

    #[test]
    fn test_snapshot_isolated_from_later_mutation() {
        let mut store = sample_store();
        let snapshot = store.snapshot();

        store.set("patient", "temperature", 98).unwrap();

        assert_eq!(snapshot.get_field(&path("patient.temperature")), Some(&json!(105)));
        assert_eq!(store.get("patient").unwrap()["temperature"], json!(98));
    }

    #[test]
    fn test_set_creates_nested_records() {
        let mut store = FactStore::new();
        store.set("sensor", "reading.celsius", 21.5).unwrap();

        assert_eq!(store.get("sensor").unwrap()["reading"]["celsius"], json!(21.5));
    }

    #[test]
    fn test_set_whole_fact_requires_object() {
        let mut store = FactStore::new();
        assert!(store.set("sensor", "", 3).is_err());
        store.set("sensor", "", json!({"on": true})).unwrap();
        assert_eq!(store.get("sensor").unwrap()["on"], json!(true));
    }

    #[test]
    fn test_remove_attribute_and_fact() {
        let mut store = sample_store();

        assert!(store.remove("patient", Some("vitals.pulse")));
        assert!(store.get("patient").unwrap()["vitals"].as_object().unwrap().is_empty());
        assert!(store.remove("patient", Some("tags.0")));
        assert_eq!(store.get("patient").unwrap()["tags"], json!(["adult"]));
        assert!(!store.remove("patient", Some("unknown")));

        assert!(store.remove("ward", None));
        assert!(store.get("ward").is_none());
        assert!(!store.remove("ward", None));
    }

    #[test]
    fn test_apply_reports_changed_keys_only() {
        let mut store = sample_store();
        let mut changes = ChangeSet::new();
        changes.set(&path("patient.temperature"), json!(105)).unwrap();
        changes.set(&path("ward.name"), json!("west")).unwrap();
        changes.remove(&path("nobody.flag"));

        let touched = store.apply(&changes).unwrap();

        assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec!["ward".to_string()]);
    }

    #[test]
    fn test_set_array_index_appends_or_rejects() {
        let mut store = sample_store();

        store.set("patient", "tags.1", "senior").unwrap();
        store.set("patient", "tags.2", "fall-risk").unwrap();
        assert_eq!(
            store.get("patient").unwrap()["tags"],
            json!(["icu", "senior", "fall-risk"])
        );

        // 越界或非数字下标不能把数组改写成对象
        let err = store.set("patient", "tags.5", "x").unwrap_err();
        assert!(matches!(err, RuleError::TypeMismatch { .. }));
        assert!(store.set("patient", "tags.first", "x").is_err());
        assert_eq!(
            store.get("patient").unwrap()["tags"],
            json!(["icu", "senior", "fall-risk"])
        );
    }

    #[test]
    fn test_apply_stops_at_failing_change() {
        let mut store = sample_store();
        let mut changes = ChangeSet::new();
        changes.set(&path("ward.name"), json!("west")).unwrap();
        changes.set(&path("patient.tags.9"), json!("x")).unwrap();
        changes.set(&path("ward.beds"), json!(12)).unwrap();

        assert!(store.apply(&changes).is_err());
        assert_eq!(store.get("ward").unwrap()["name"], json!("west"));
        assert!(store.get("ward").unwrap().get("beds").is_none());
        assert_eq!(
            changes.keys().into_iter().collect::<Vec<_>>(),
            vec!["patient".to_string(), "ward".to_string()]
        );
    }

    #[test]
    fn test_from_value_rejects_scalar_fact() {
        assert!(FactStore::from_value(json!({"temperature": 105})).is_err());
        assert!(FactStore::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let store = sample_store();
        let json = serde_json::to_string(&store).unwrap();
        let parsed: FactStore = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, store);
    }
}
