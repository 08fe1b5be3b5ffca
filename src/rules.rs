// src/rules.rs
//
// Change evaluator - decides whether a fresh reading warrants publication.
//
// Rules compose with OR: a publication is due as soon as any configured rule
// triggers. Thresholds are edge-triggered against the previous reading, so a
// sensor sitting out of band publishes once per crossing instead of on every
// tick. The `change` rule compares against the last sent value, which the
// state machine advances at publication time.

use std::time::Duration;

use crate::error::RuleError;
use crate::registry::{PublishRules, Value};

/// Evaluator verdict for one reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Publish,
    Hold,
}

/// Evaluate the rule set for a fresh reading.
///
/// * `new` - the value just read from the slave
/// * `previous` - the prior reading, for threshold edge detection
/// * `sent` - the last published value, for the change rule
/// * `elapsed` - time since the last publication, `None` if never published
pub fn evaluate(
    rules: &PublishRules,
    new: &Value,
    previous: Option<&Value>,
    sent: Option<&Value>,
    elapsed: Option<Duration>,
) -> Result<Decision, RuleError> {
    // Threshold rules only make sense on numeric kinds
    let new_num = new.as_f64();
    if rules.has_threshold() && new_num.is_none() {
        return Err(RuleError::ThresholdNotNumeric);
    }

    if let Some(secs) = rules.time_sec {
        let due = match elapsed {
            Some(e) => e >= Duration::from_secs(secs),
            // Never published: due immediately
            None => true,
        };
        if due {
            return Ok(Decision::Publish);
        }
    }

    if rules.change && sent.map_or(true, |s| s != new) {
        return Ok(Decision::Publish);
    }

    if let (Some(bound), Some(v)) = (rules.upper_threshold, new_num) {
        let was_below = previous
            .and_then(|p| p.as_f64())
            .map_or(true, |p| p < bound);
        if v >= bound && was_below {
            return Ok(Decision::Publish);
        }
    }

    if let (Some(bound), Some(v)) = (rules.lower_threshold, new_num) {
        let was_above = previous
            .and_then(|p| p.as_f64())
            .map_or(true, |p| p > bound);
        if v <= bound && was_above {
            return Ok(Decision::Publish);
        }
    }

    Ok(Decision::Hold)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a reading sequence through the evaluator the way the poll task
    /// does: previous advances every tick, sent advances on publication.
    fn run_sequence(rules: &PublishRules, seed_sent: Option<Value>, seq: &[Value]) -> Vec<Value> {
        let mut previous: Option<Value> = None;
        let mut sent = seed_sent;
        let mut published = Vec::new();
        for v in seq {
            let decision =
                evaluate(rules, v, previous.as_ref(), sent.as_ref(), None).expect("valid rules");
            previous = Some(*v);
            if decision == Decision::Publish {
                sent = Some(*v);
                published.push(*v);
            }
        }
        published
    }

    #[test]
    fn test_upper_threshold_publishes_once_per_crossing() {
        let rules = PublishRules {
            upper_threshold: Some(100.0),
            ..Default::default()
        };
        let seq: Vec<Value> = [0, 80, 90, 100, 90, 80, 110]
            .iter()
            .map(|v| Value::Int(*v))
            .collect();
        let published = run_sequence(&rules, Some(Value::Int(0)), &seq);
        assert_eq!(published, vec![Value::Int(100), Value::Int(110)]);
    }

    #[test]
    fn test_lower_threshold_edge_triggered() {
        let rules = PublishRules {
            lower_threshold: Some(5.0),
            ..Default::default()
        };
        let seq: Vec<Value> = [10, 5, 4, 3, 8, 2]
            .iter()
            .map(|v| Value::Int(*v))
            .collect();
        let published = run_sequence(&rules, Some(Value::Int(10)), &seq);
        // Fires on the 10->5 crossing, stays quiet in band, fires again on 8->2
        assert_eq!(published, vec![Value::Int(5), Value::Int(2)]);
    }

    #[test]
    fn test_change_rule_fires_on_edge_only() {
        let rules = PublishRules {
            change: true,
            ..Default::default()
        };
        let seq: Vec<Value> = [10, 10, 10, 11, 11].iter().map(|v| Value::Int(*v)).collect();
        // Sent seeded by the online snapshot publication
        let published = run_sequence(&rules, Some(Value::Int(10)), &seq);
        assert_eq!(published, vec![Value::Int(11)]);
    }

    #[test]
    fn test_change_rule_with_no_sent_value_publishes() {
        let rules = PublishRules {
            change: true,
            ..Default::default()
        };
        let d = evaluate(&rules, &Value::Int(10), None, None, None).unwrap();
        assert_eq!(d, Decision::Publish);
    }

    #[test]
    fn test_time_rule_gates_on_elapsed() {
        let rules = PublishRules {
            time_sec: Some(30),
            ..Default::default()
        };
        let v = Value::Float(1.0);
        let held = evaluate(&rules, &v, None, None, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(held, Decision::Hold);
        let due = evaluate(&rules, &v, None, None, Some(Duration::from_secs(31))).unwrap();
        assert_eq!(due, Decision::Publish);
        // Never published counts as due
        let first = evaluate(&rules, &v, None, None, None).unwrap();
        assert_eq!(first, Decision::Publish);
    }

    #[test]
    fn test_threshold_on_bool_is_invalid() {
        let rules = PublishRules {
            upper_threshold: Some(1.0),
            ..Default::default()
        };
        let err = evaluate(&rules, &Value::Bool(true), None, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_rule_set_holds() {
        let rules = PublishRules::default();
        let d = evaluate(&rules, &Value::Int(5), None, None, None).unwrap();
        assert_eq!(d, Decision::Hold);
    }

    #[test]
    fn test_change_is_additive_to_thresholds() {
        let rules = PublishRules {
            change: true,
            upper_threshold: Some(100.0),
            ..Default::default()
        };
        // In band but different from sent: change triggers even though the
        // threshold does not
        let d = evaluate(
            &rules,
            &Value::Int(50),
            Some(&Value::Int(40)),
            Some(&Value::Int(40)),
            None,
        )
        .unwrap();
        assert_eq!(d, Decision::Publish);
    }
}
