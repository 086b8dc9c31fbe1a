use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 执行策略：基于节点属性的布尔规则树
///
/// 只有策略接受的节点才会收到该作业的任务包。属性缺失时叶子规则返回 `false`。
///
/// ```rust
/// use std::collections::HashMap;
/// use taskgrid_core::models::ExecutionPolicy;
///
/// let policy = ExecutionPolicy::And(vec![
///     ExecutionPolicy::AtLeast { property: "node.threads".into(), value: 4.0 },
///     ExecutionPolicy::Not(Box::new(ExecutionPolicy::Equal {
///         property: "os".into(),
///         value: "windows".into(),
///     })),
/// ]);
///
/// let mut props = HashMap::new();
/// props.insert("node.threads".to_string(), "8".to_string());
/// props.insert("os".to_string(), "linux".to_string());
/// assert!(policy.accepts(&props));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// 属性值等于给定字符串（忽略大小写）
    Equal { property: String, value: String },
    /// 属性值包含给定子串
    Contains { property: String, value: String },
    /// 属性值为数字且不小于给定值
    AtLeast { property: String, value: f64 },
    /// 属性值为数字且不大于给定值
    AtMost { property: String, value: f64 },
    /// 属性值属于给定集合
    OneOf { property: String, values: Vec<String> },
    And(Vec<ExecutionPolicy>),
    Or(Vec<ExecutionPolicy>),
    Not(Box<ExecutionPolicy>),
}

impl ExecutionPolicy {
    pub fn accepts(&self, properties: &HashMap<String, String>) -> bool {
        match self {
            ExecutionPolicy::Equal { property, value } => properties
                .get(property)
                .is_some_and(|v| v.eq_ignore_ascii_case(value)),
            ExecutionPolicy::Contains { property, value } => properties
                .get(property)
                .is_some_and(|v| v.contains(value.as_str())),
            ExecutionPolicy::AtLeast { property, value } => {
                numeric(properties, property).is_some_and(|v| v >= *value)
            }
            ExecutionPolicy::AtMost { property, value } => {
                numeric(properties, property).is_some_and(|v| v <= *value)
            }
            ExecutionPolicy::OneOf { property, values } => properties
                .get(property)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            ExecutionPolicy::And(rules) => rules.iter().all(|r| r.accepts(properties)),
            ExecutionPolicy::Or(rules) => rules.iter().any(|r| r.accepts(properties)),
            ExecutionPolicy::Not(rule) => !rule.accepts(properties),
        }
    }
}

fn numeric(properties: &HashMap<String, String>, property: &str) -> Option<f64> {
    properties.get(property)?.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_leaf_rules() {
        let p = props(&[("node.threads", "4"), ("host", "gpu-box-1")]);

        assert!(ExecutionPolicy::AtLeast { property: "node.threads".into(), value: 4.0 }.accepts(&p));
        assert!(!ExecutionPolicy::AtMost { property: "node.threads".into(), value: 2.0 }.accepts(&p));
        assert!(ExecutionPolicy::Contains { property: "host".into(), value: "gpu".into() }.accepts(&p));
        assert!(ExecutionPolicy::Equal { property: "host".into(), value: "GPU-BOX-1".into() }.accepts(&p));
        assert!(!ExecutionPolicy::Equal { property: "missing".into(), value: "x".into() }.accepts(&p));
    }

    #[test]
    fn test_non_numeric_property() {
        let p = props(&[("node.threads", "many")]);
        assert!(!ExecutionPolicy::AtLeast { property: "node.threads".into(), value: 1.0 }.accepts(&p));
    }

    #[test]
    fn test_combinators_and_serde() {
        let policy = ExecutionPolicy::Or(vec![
            ExecutionPolicy::OneOf { property: "zone".into(), values: vec!["a".into(), "b".into()] },
            ExecutionPolicy::Not(Box::new(ExecutionPolicy::Equal {
                property: "zone".into(),
                value: "c".into(),
            })),
        ]);
        assert!(policy.accepts(&props(&[("zone", "a")])));
        assert!(!policy.accepts(&props(&[("zone", "c")])));

        let json = serde_json::to_string(&policy).unwrap();
        let decoded: ExecutionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, policy);
    }
}
