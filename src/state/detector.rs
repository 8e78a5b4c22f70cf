//! Change detection against persisted state.
//!
//! Each tracked key moves through `Unknown -> Stable | ChangedPending ->
//! ChangedReported`. Evaluation never writes; it hands back the write that
//! reporting the change requires. Trackers apply it as soon as the message
//! is built, so a key is recorded before the run prints its messages.

use super::{StateError, StateMap, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info};

/// What to do with a key that has no persisted value yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstObservation {
    /// Report it as a change and persist it.
    #[default]
    Report,
    /// Stay silent and leave the store untouched.
    Suppress,
}

/// How a new value is compared with the persisted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChangeRule {
    /// Equal values are stable. Otherwise the change is suppressed when
    /// `|new - old| < threshold`, comparing the scalar value itself or the
    /// member named by `field` for record values. Values that cannot be
    /// compared numerically are treated as changed.
    Threshold {
        threshold: f64,
        #[serde(default)]
        field: Option<String>,
    },
    /// Any structural difference is a change.
    Equality,
}

impl ChangeRule {
    pub fn threshold(threshold: f64) -> Self {
        Self::Threshold {
            threshold,
            field: None,
        }
    }

    pub fn threshold_on(field: &str, threshold: f64) -> Self {
        Self::Threshold {
            threshold,
            field: Some(field.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Unknown,
    Stable,
    ChangedPending,
    ChangedReported,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyState::Unknown => "unknown",
            KeyState::Stable => "stable",
            KeyState::ChangedPending => "changed (pending)",
            KeyState::ChangedReported => "changed (reported)",
        };
        write!(f, "{}", s)
    }
}

/// Instruction to persist `value` under `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub key: String,
    pub value: Value,
}

/// Result of comparing one key's new value with its persisted value.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub key: String,
    /// Classification before any write.
    pub state: KeyState,
    pub previous: Option<Value>,
    /// Absolute numeric change, when the rule could compute one.
    pub delta: Option<f64>,
    /// Present exactly when the change should be reported.
    pub write: Option<StateWrite>,
}

impl Evaluation {
    pub fn should_report(&self) -> bool {
        self.write.is_some()
    }
}

/// Classify `new` against `previous`. Returns the state and the numeric
/// change when one was computed.
pub fn classify(previous: Option<&Value>, new: &Value, rule: &ChangeRule) -> (KeyState, Option<f64>) {
    let Some(previous) = previous else {
        return (KeyState::Unknown, None);
    };

    if values_equal(previous, new) {
        return (KeyState::Stable, Some(0.0));
    }

    match rule {
        ChangeRule::Equality => (KeyState::ChangedPending, None),
        ChangeRule::Threshold { threshold, field } => {
            let delta = numeric_member(previous, field.as_deref())
                .zip(numeric_member(new, field.as_deref()))
                .map(|(old, new)| (new - old).abs());
            match delta {
                Some(d) if d < *threshold => (KeyState::Stable, Some(d)),
                other => (KeyState::ChangedPending, other),
            }
        }
    }
}

fn numeric_member(value: &Value, field: Option<&str>) -> Option<f64> {
    match field {
        Some(name) => value.get(name)?.as_f64(),
        None => value.as_f64(),
    }
}

/// Structural equality that treats `55` and `55.0` as the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Per-run view of the persisted state.
///
/// The whole store is read once when the run starts; a failed read aborts
/// the run instead of treating every key as new.
pub struct NotificationState<'s, S: StateStore + ?Sized> {
    store: &'s mut S,
    snapshot: StateMap,
}

impl<'s, S: StateStore + ?Sized> NotificationState<'s, S> {
    pub fn load(store: &'s mut S) -> Result<Self, StateError> {
        let snapshot = store.read_all()?;
        debug!("Loaded {} state keys", snapshot.len());
        Ok(Self { store, snapshot })
    }

    pub fn previous(&self, key: &str) -> Option<&Value> {
        self.snapshot.get(key)
    }

    /// Compare `value` with the persisted value of `key`. Does not write.
    pub fn evaluate(
        &self,
        key: &str,
        value: Value,
        rule: &ChangeRule,
        first_observation: FirstObservation,
    ) -> Evaluation {
        let previous = self.snapshot.get(key).cloned();
        let (state, delta) = classify(previous.as_ref(), &value, rule);

        let report = match state {
            KeyState::Unknown => first_observation == FirstObservation::Report,
            KeyState::ChangedPending => true,
            KeyState::Stable | KeyState::ChangedReported => false,
        };
        debug!("State key '{}': {} (report: {})", key, state, report);

        Evaluation {
            key: key.to_string(),
            state,
            previous,
            delta,
            write: report.then(|| StateWrite {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Persist the write carried by `evaluation`, if any.
    ///
    /// Only the evaluated key is touched. A failure leaves the key pending
    /// and does not affect other keys.
    pub fn commit(&mut self, evaluation: &Evaluation) -> Result<KeyState, StateError> {
        let Some(ref write) = evaluation.write else {
            return Ok(evaluation.state);
        };
        self.store.write(&write.key, &write.value)?;
        self.snapshot.insert(write.key.clone(), write.value.clone());
        info!("Recorded new value for '{}'", write.key);
        Ok(KeyState::ChangedReported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use serde_json::json;

    fn store_with(entries: &[(&str, Value)]) -> MemoryStore {
        MemoryStore::with_entries(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_equal_record_is_suppressed_without_write() {
        let mut store = store_with(&[("senate", json!({"probD": 55}))]);
        {
            let mut state = NotificationState::load(&mut store).unwrap();
            let eval = state.evaluate(
                "senate",
                json!({"probD": 55}),
                &ChangeRule::threshold_on("probD", 0.0),
                FirstObservation::Report,
            );
            assert_eq!(eval.state, KeyState::Stable);
            assert!(!eval.should_report());
            assert_eq!(state.commit(&eval).unwrap(), KeyState::Stable);
        }
        assert_eq!(store.write_count, 0);
    }

    #[test]
    fn test_integer_and_float_compare_equal() {
        let (state, _) = classify(Some(&json!(55)), &json!(55.0), &ChangeRule::Equality);
        assert_eq!(state, KeyState::Stable);
    }

    #[test]
    fn test_threshold_rule_on_scalar() {
        let rule = ChangeRule::threshold(0.5);
        let (state, delta) = classify(Some(&json!(2.0)), &json!(2.3), &rule);
        assert_eq!(state, KeyState::Stable);
        assert!((delta.unwrap() - 0.3).abs() < 1e-9);

        let (state, _) = classify(Some(&json!(2.0)), &json!(2.5), &rule);
        assert_eq!(state, KeyState::ChangedPending);
    }

    #[test]
    fn test_threshold_is_monotone() {
        let previous = json!({"probD": 50, "probR": 50});
        let new = json!({"probD": 53, "probR": 47});
        let suppressed_at = |t: f64| {
            classify(Some(&previous), &new, &ChangeRule::threshold_on("probD", t)).0
                == KeyState::Stable
        };
        assert!(!suppressed_at(2.0));
        assert!(!suppressed_at(3.0));
        assert!(suppressed_at(3.5));
        assert!(suppressed_at(10.0));
    }

    #[test]
    fn test_threshold_field_missing_counts_as_change() {
        let (state, delta) = classify(
            Some(&json!({"probR": 40})),
            &json!({"probD": 60}),
            &ChangeRule::threshold_on("probD", 100.0),
        );
        assert_eq!(state, KeyState::ChangedPending);
        assert_eq!(delta, None);
    }

    #[test]
    fn test_equality_rule_reports_any_difference() {
        let (state, _) = classify(
            Some(&json!("Acme +1.0")),
            &json!("Acme +1.5"),
            &ChangeRule::Equality,
        );
        assert_eq!(state, KeyState::ChangedPending);
    }

    #[test]
    fn test_first_observation_policies() {
        let mut store = MemoryStore::new();
        let mut state = NotificationState::load(&mut store).unwrap();

        let eval = state.evaluate("house", json!(1), &ChangeRule::Equality, FirstObservation::Suppress);
        assert_eq!(eval.state, KeyState::Unknown);
        assert!(!eval.should_report());
        assert_eq!(state.commit(&eval).unwrap(), KeyState::Unknown);
        assert!(state.previous("house").is_none());

        let eval = state.evaluate("house", json!(1), &ChangeRule::Equality, FirstObservation::Report);
        assert!(eval.should_report());
        assert_eq!(state.commit(&eval).unwrap(), KeyState::ChangedReported);
        assert_eq!(state.previous("house"), Some(&json!(1)));
    }

    #[test]
    fn test_change_is_written_and_then_stable() {
        let mut store = store_with(&[("gcb_average", json!(2.0))]);
        {
            let mut state = NotificationState::load(&mut store).unwrap();
            let rule = ChangeRule::threshold(0.5);
            let eval = state.evaluate("gcb_average", json!(3.0), &rule, FirstObservation::Report);
            assert_eq!(eval.previous, Some(json!(2.0)));
            assert_eq!(state.commit(&eval).unwrap(), KeyState::ChangedReported);

            let again = state.evaluate("gcb_average", json!(3.0), &rule, FirstObservation::Report);
            assert_eq!(again.state, KeyState::Stable);
        }
        assert_eq!(store.get("gcb_average"), Some(&json!(3.0)));
        assert_eq!(store.write_count, 1);
    }

    #[test]
    fn test_failed_write_leaves_key_pending() {
        let mut store = store_with(&[("senate", json!({"probD": 50}))]);
        store.fail_on_write = true;
        let mut state = NotificationState::load(&mut store).unwrap();

        let eval = state.evaluate(
            "senate",
            json!({"probD": 60}),
            &ChangeRule::threshold_on("probD", 1.0),
            FirstObservation::Report,
        );
        assert!(state.commit(&eval).is_err());
        assert_eq!(state.previous("senate"), Some(&json!({"probD": 50})));

        let eval = state.evaluate(
            "senate",
            json!({"probD": 60}),
            &ChangeRule::threshold_on("probD", 1.0),
            FirstObservation::Report,
        );
        assert_eq!(eval.state, KeyState::ChangedPending);
    }

    #[test]
    fn test_unreadable_store_fails_load() {
        let mut store = MemoryStore::new();
        store.fail_on_read = true;
        assert!(NotificationState::load(&mut store).is_err());
    }

    #[test]
    fn test_rule_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            rule: ChangeRule,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [rule]
            mode = "threshold"
            threshold = 1.0
            field = "probD"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.rule, ChangeRule::threshold_on("probD", 1.0));
    }
}
