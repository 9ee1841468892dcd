pub mod condition_matching;
pub mod evaluator;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::features::{null_as_default, FeatureState};

pub const SEMVER_SUFFIX: &str = ":semver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum RuleType {
    #[serde(rename = "ALL")]
    All,
    #[serde(rename = "ANY")]
    Any,
    #[serde(rename = "NONE")]
    None,
}

/// Segment condition operators. Operators this client doesn't know about are kept
/// as `Unknown` so that newer environment documents still parse; they never match.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanInclusive,
    LessThan,
    LessThanInclusive,
    Contains,
    NotContains,
    Regex,
    PercentageSplit,
    Modulo,
    IsSet,
    IsNotSet,
    In,
    Unknown(String),
}

impl ConditionOperator {
    pub fn as_str(&self) -> &str {
        match self {
            ConditionOperator::Equal => "EQUAL",
            ConditionOperator::NotEqual => "NOT_EQUAL",
            ConditionOperator::GreaterThan => "GREATER_THAN",
            ConditionOperator::GreaterThanInclusive => "GREATER_THAN_INCLUSIVE",
            ConditionOperator::LessThan => "LESS_THAN",
            ConditionOperator::LessThanInclusive => "LESS_THAN_INCLUSIVE",
            ConditionOperator::Contains => "CONTAINS",
            ConditionOperator::NotContains => "NOT_CONTAINS",
            ConditionOperator::Regex => "REGEX",
            ConditionOperator::PercentageSplit => "PERCENTAGE_SPLIT",
            ConditionOperator::Modulo => "MODULO",
            ConditionOperator::IsSet => "IS_SET",
            ConditionOperator::IsNotSet => "IS_NOT_SET",
            ConditionOperator::In => "IN",
            ConditionOperator::Unknown(operator) => operator,
        }
    }
}

impl From<String> for ConditionOperator {
    fn from(value: String) -> Self {
        match value.as_str() {
            "EQUAL" => ConditionOperator::Equal,
            "NOT_EQUAL" => ConditionOperator::NotEqual,
            "GREATER_THAN" => ConditionOperator::GreaterThan,
            "GREATER_THAN_INCLUSIVE" => ConditionOperator::GreaterThanInclusive,
            "LESS_THAN" => ConditionOperator::LessThan,
            "LESS_THAN_INCLUSIVE" => ConditionOperator::LessThanInclusive,
            "CONTAINS" => ConditionOperator::Contains,
            "NOT_CONTAINS" => ConditionOperator::NotContains,
            "REGEX" => ConditionOperator::Regex,
            "PERCENTAGE_SPLIT" => ConditionOperator::PercentageSplit,
            "MODULO" => ConditionOperator::Modulo,
            "IS_SET" => ConditionOperator::IsSet,
            "IS_NOT_SET" => ConditionOperator::IsNotSet,
            "IN" => ConditionOperator::In,
            _ => ConditionOperator::Unknown(value),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(value: ConditionOperator) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentCondition {
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    // percentage splits don't target a trait
    #[serde(rename = "property_", alias = "property", default)]
    pub property: Option<String>,
}

impl SegmentCondition {
    pub fn new(operator: ConditionOperator, value: Value, property: Option<&str>) -> Self {
        SegmentCondition {
            operator,
            value,
            property: property.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default, deserialize_with = "null_as_default")]
    pub conditions: Vec<SegmentCondition>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<SegmentRule>,
}

impl SegmentRule {
    pub fn new(rule_type: RuleType, conditions: Vec<SegmentCondition>) -> Self {
        SegmentRule {
            rule_type,
            conditions,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<SegmentRule>) -> Self {
        self.rules = rules;
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Segment {
    pub id: u32,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<SegmentRule>,
    /// Overrides applied to members of this segment.
    #[serde(default, deserialize_with = "null_as_default")]
    pub feature_states: Vec<FeatureState>,
}
