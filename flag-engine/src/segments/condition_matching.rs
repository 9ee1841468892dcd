use std::cmp::Ordering;

use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::identities::TraitValue;
use crate::segments::{ConditionOperator, SegmentCondition, SEMVER_SUFFIX};

const TRUTHY_STRINGS: [&str; 4] = ["true", "True", "TRUE", "1"];

pub fn to_string_representation(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Matches a single trait value against a condition literal.
///
/// The literal is coerced to the type of the trait value before comparing. A null
/// trait value never matches, and neither does an operator the trait type doesn't
/// support.
pub fn match_trait_value(condition: &SegmentCondition, trait_value: &TraitValue) -> bool {
    if trait_value.is_null() {
        return false;
    }

    if let Value::String(literal) = &condition.value {
        if let Some(version) = literal.strip_suffix(SEMVER_SUFFIX) {
            return match_semver(&condition.operator, trait_value, version);
        }
    }

    match condition.operator {
        ConditionOperator::In => match_in(&condition.value, trait_value),
        ConditionOperator::Modulo => match_modulo(&condition.value, trait_value),
        ConditionOperator::Regex => match_regex(&condition.value, trait_value),
        _ => match_typed(&condition.operator, &condition.value, trait_value),
    }
}

fn match_typed(operator: &ConditionOperator, literal: &Value, trait_value: &TraitValue) -> bool {
    match trait_value {
        TraitValue::String(s) => match_string(operator, s, &to_string_representation(literal)),
        TraitValue::Integer(i) => match coerce_integer(literal) {
            Some(CoercedNumber::Integer(other)) => compare(operator, i.cmp(&other)),
            Some(CoercedNumber::Float(other)) => {
                compare_partial(operator, (*i as f64).partial_cmp(&other))
            }
            None => uncoercible(operator),
        },
        TraitValue::Float(f) => match coerce_float(literal) {
            Some(other) => compare_partial(operator, f.partial_cmp(&other)),
            None => uncoercible(operator),
        },
        TraitValue::Bool(b) => match operator {
            ConditionOperator::Equal => *b == is_truthy(literal),
            ConditionOperator::NotEqual => *b != is_truthy(literal),
            _ => false,
        },
        TraitValue::Null => false,
    }
}

fn match_string(operator: &ConditionOperator, trait_value: &str, literal: &str) -> bool {
    match operator {
        ConditionOperator::Equal => trait_value == literal,
        ConditionOperator::NotEqual => trait_value != literal,
        ConditionOperator::Contains => trait_value.contains(literal),
        ConditionOperator::NotContains => !trait_value.contains(literal),
        _ => false,
    }
}

fn compare(operator: &ConditionOperator, ordering: Ordering) -> bool {
    match operator {
        ConditionOperator::Equal => ordering == Ordering::Equal,
        ConditionOperator::NotEqual => ordering != Ordering::Equal,
        ConditionOperator::GreaterThan => ordering == Ordering::Greater,
        ConditionOperator::GreaterThanInclusive => ordering != Ordering::Less,
        ConditionOperator::LessThan => ordering == Ordering::Less,
        ConditionOperator::LessThanInclusive => ordering != Ordering::Greater,
        _ => false,
    }
}

fn compare_partial(operator: &ConditionOperator, ordering: Option<Ordering>) -> bool {
    match ordering {
        Some(ordering) => compare(operator, ordering),
        // NaN on either side only differs
        None => matches!(operator, ConditionOperator::NotEqual),
    }
}

fn uncoercible(operator: &ConditionOperator) -> bool {
    matches!(operator, ConditionOperator::NotEqual)
}

enum CoercedNumber {
    Integer(i64),
    Float(f64),
}

fn coerce_integer(literal: &Value) -> Option<CoercedNumber> {
    match literal {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(CoercedNumber::Integer(i)),
            None => n.as_f64().map(CoercedNumber::Float),
        },
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(i) => Some(CoercedNumber::Integer(i)),
            Err(_) => s.trim().parse::<f64>().ok().map(CoercedNumber::Float),
        },
        _ => None,
    }
}

fn coerce_float(literal: &Value) -> Option<f64> {
    match literal {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_truthy(literal: &Value) -> bool {
    match literal {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => TRUTHY_STRINGS.contains(&s.as_str()),
        _ => false,
    }
}

fn match_semver(operator: &ConditionOperator, trait_value: &TraitValue, literal: &str) -> bool {
    let trait_string = trait_value.to_string();
    let trait_version = trait_string
        .strip_suffix(SEMVER_SUFFIX)
        .unwrap_or(&trait_string);

    match (Version::parse(trait_version), Version::parse(literal)) {
        (Ok(trait_version), Ok(literal_version)) => {
            compare(operator, trait_version.cmp(&literal_version))
        }
        _ => false,
    }
}

fn match_in(literal: &Value, trait_value: &TraitValue) -> bool {
    // floats serialize differently across platforms, so only strings and integers are supported
    let needle = match trait_value {
        TraitValue::String(s) => s.clone(),
        TraitValue::Integer(i) => i.to_string(),
        _ => return false,
    };

    match literal {
        Value::Array(values) => contains_string_form(values, &needle),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(values)) => contains_string_form(&values, &needle),
            _ => s.split(',').any(|candidate| candidate == needle),
        },
        other => to_string_representation(other)
            .split(',')
            .any(|candidate| candidate == needle),
    }
}

fn contains_string_form(values: &[Value], needle: &str) -> bool {
    values
        .iter()
        .any(|value| to_string_representation(value) == needle)
}

fn match_modulo(literal: &Value, trait_value: &TraitValue) -> bool {
    let Some(dividend) = trait_value.as_f64() else {
        return false;
    };

    let literal = to_string_representation(literal);
    let Some((divisor, remainder)) = literal.split_once('|') else {
        return false;
    };

    match (divisor.trim().parse::<f64>(), remainder.trim().parse::<f64>()) {
        (Ok(divisor), Ok(remainder)) => floored_modulo(dividend, divisor) == remainder,
        _ => false,
    }
}

// The result takes the sign of the divisor.
fn floored_modulo(dividend: f64, divisor: f64) -> f64 {
    let remainder = dividend % divisor;
    if remainder != 0.0 && (remainder < 0.0) != (divisor < 0.0) {
        remainder + divisor
    } else {
        remainder
    }
}

fn match_regex(literal: &Value, trait_value: &TraitValue) -> bool {
    let pattern = to_string_representation(literal);
    match Regex::new(&pattern) {
        Ok(regex) => regex.is_match(&trait_value.to_string()),
        Err(e) => {
            tracing::debug!(pattern = %pattern, error = %e, "Invalid regex in segment condition");
            false
        }
    }
}
