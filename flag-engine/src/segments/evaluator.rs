use serde_json::Value;

use crate::environments::Environment;
use crate::hashing::hashed_percentage_for_object_ids;
use crate::identities::{Identity, Trait};
use crate::segments::condition_matching::match_trait_value;
use crate::segments::{ConditionOperator, RuleType, Segment, SegmentCondition, SegmentRule};

/// Returns every segment of the environment's project the identity belongs to.
pub fn get_identity_segments<'a>(
    environment: &'a Environment,
    identity: &Identity,
    override_traits: Option<&[Trait]>,
) -> Vec<&'a Segment> {
    environment
        .project
        .segments
        .iter()
        .filter(|segment| evaluate_identity_in_segment(identity, segment, override_traits))
        .collect()
}

/// An identity is in a segment when the segment has rules and every one of them matches.
/// `override_traits` replace the identity's own traits when given.
pub fn evaluate_identity_in_segment(
    identity: &Identity,
    segment: &Segment,
    override_traits: Option<&[Trait]>,
) -> bool {
    let traits = override_traits.unwrap_or(&identity.identity_traits);
    let bucketing_id = identity.bucketing_id();

    !segment.rules.is_empty()
        && segment
            .rules
            .iter()
            .all(|rule| traits_match_segment_rule(traits, rule, segment.id, &bucketing_id))
}

pub fn traits_match_segment_rule(
    traits: &[Trait],
    rule: &SegmentRule,
    segment_id: u32,
    bucketing_id: &str,
) -> bool {
    let mut condition_results = rule
        .conditions
        .iter()
        .map(|condition| traits_match_segment_condition(traits, condition, segment_id, bucketing_id));

    // an empty ANY matches nothing, an empty ALL or NONE matches everything
    let conditions_match = match rule.rule_type {
        RuleType::All => condition_results.all(|matched| matched),
        RuleType::Any => condition_results.any(|matched| matched),
        RuleType::None => !condition_results.any(|matched| matched),
    };

    conditions_match
        && rule
            .rules
            .iter()
            .all(|nested| traits_match_segment_rule(traits, nested, segment_id, bucketing_id))
}

pub fn traits_match_segment_condition(
    traits: &[Trait],
    condition: &SegmentCondition,
    segment_id: u32,
    bucketing_id: &str,
) -> bool {
    if condition.operator == ConditionOperator::PercentageSplit {
        let Some(threshold) = percentage_threshold(&condition.value) else {
            return false;
        };
        let segment_id = segment_id.to_string();
        return hashed_percentage_for_object_ids(&[segment_id.as_str(), bucketing_id])
            <= threshold;
    }

    let Some(property) = condition.property.as_deref() else {
        return false;
    };
    let trait_value = traits
        .iter()
        .find(|t| t.trait_key == property)
        .map(|t| &t.trait_value)
        .filter(|value| !value.is_null());

    match (&condition.operator, trait_value) {
        (ConditionOperator::IsSet, value) => value.is_some(),
        (ConditionOperator::IsNotSet, value) => value.is_none(),
        (_, Some(value)) => match_trait_value(condition, value),
        (_, None) => false,
    }
}

fn percentage_threshold(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
