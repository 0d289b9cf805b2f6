//! The observable parameter store.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use super::model::{
    default_param_specs, DirectionPattern, ParamDomain, ParamValue, QuantizeMode,
};
use crate::events::StateChange;

/// Handle returned by [`State::add_listener`], used to unregister.
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Inner {
    domains: HashMap<String, ParamDomain>,
    values: HashMap<String, ParamValue>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
}

/// Central parameter store with change notifications.
///
/// One mutex protects all reads and writes. Listeners run after the
/// lock is released, once per changed key in write order, so a
/// listener may itself call back into the store. A listener that
/// panics is logged and skipped; the remaining listeners still fire.
pub struct State {
    inner: Mutex<Inner>,
}

impl State {
    /// Create a store populated with the default parameter table.
    ///
    /// `n_scales` is the length of the configured scale list and
    /// bounds `scale_index`.
    pub fn new(n_scales: usize) -> Self {
        let mut domains = HashMap::new();
        let mut values = HashMap::new();
        for spec in default_param_specs(n_scales) {
            domains.insert(spec.name.to_string(), spec.domain);
            if let Some(default) = spec.default {
                values.insert(spec.name.to_string(), default);
            }
        }
        Self {
            inner: Mutex::new(Inner {
                domains,
                values,
                listeners: Vec::new(),
                next_listener: 0,
            }),
        }
    }

    /// Get a parameter value. None for unknown keys and unset optional
    /// parameters.
    pub fn get(&self, key: &str) -> Option<ParamValue> {
        self.inner.lock().unwrap().values.get(key).cloned()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_direction(&self, key: &str) -> Option<DirectionPattern> {
        self.get(key).and_then(|v| v.as_direction())
    }

    pub fn get_quantize(&self, key: &str) -> Option<QuantizeMode> {
        self.get(key).and_then(|v| v.as_quantize())
    }

    pub fn get_float_list(&self, key: &str) -> Option<Vec<f64>> {
        self.get(key).and_then(|v| match v {
            ParamValue::FloatList(list) => Some(list),
            _ => None,
        })
    }

    pub fn get_bool_list(&self, key: &str) -> Option<Vec<bool>> {
        self.get(key).and_then(|v| match v {
            ParamValue::BoolList(list) => Some(list),
            _ => None,
        })
    }

    /// Validate, clamp, and store a value. Returns true iff the stored
    /// value changed; listeners fire only in that case.
    pub fn set(&self, key: &str, value: ParamValue, source: &str) -> bool {
        let (changes, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            let changes = apply_one(&mut inner, key, value, source);
            let listeners = if changes.is_empty() {
                Vec::new()
            } else {
                inner.listeners.clone()
            };
            (changes, listeners)
        };

        for change in &changes {
            notify(&listeners, change);
        }
        !changes.is_empty()
    }

    /// Apply several writes under a single lock acquisition. Listeners
    /// fire after the lock is released, once per changed key in the
    /// order given. Returns the keys whose stored value changed.
    pub fn update_multiple(&self, updates: &[(&str, ParamValue)], source: &str) -> Vec<String> {
        let (changes, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            let mut changes = Vec::new();
            for (key, value) in updates {
                changes.extend(apply_one(&mut inner, key, value.clone(), source));
            }
            let listeners = if changes.is_empty() {
                Vec::new()
            } else {
                inner.listeners.clone()
            };
            (changes, listeners)
        };

        for change in &changes {
            notify(&listeners, change);
        }
        changes.into_iter().map(|c| c.parameter).collect()
    }

    /// Register a change listener. Listeners are invoked in
    /// registration order.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns false if the id is unknown.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Copy of every currently-set parameter, for diagnostics.
    pub fn snapshot(&self) -> HashMap<String, ParamValue> {
        self.inner.lock().unwrap().values.clone()
    }
}

/// Validate and store one write. Returns the resulting changes: the
/// write itself, plus any list resizes forced by a `sequence_length`
/// change.
fn apply_one(inner: &mut Inner, key: &str, value: ParamValue, source: &str) -> Vec<StateChange> {
    let Some(domain) = inner.domains.get(key).copied() else {
        log::warn!("state_set_rejected param={key} reason=unknown_parameter");
        return Vec::new();
    };

    let seq_len = inner
        .values
        .get("sequence_length")
        .and_then(|v| v.as_i64())
        .unwrap_or(8) as usize;
    let note_prob = inner
        .values
        .get("note_probability")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.9);

    let Some(validated) = validate(domain, value, seq_len, note_prob) else {
        log::warn!("state_set_rejected param={key} reason=invalid_value");
        return Vec::new();
    };

    let old = inner.values.get(key).cloned();
    if old.as_ref() == Some(&validated) {
        return Vec::new();
    }

    inner.values.insert(key.to_string(), validated.clone());
    log::debug!("state_change param={key} source={source}");

    let mut changes = vec![StateChange {
        parameter: key.to_string(),
        old_value: old,
        new_value: validated.clone(),
        source: source.to_string(),
    }];

    // A new sequence length re-fits the per-step lists so their length
    // invariant holds.
    if key == "sequence_length" {
        let new_len = validated.as_i64().unwrap_or(8) as usize;
        changes.extend(resize_list(inner, "step_probabilities", new_len, source));
        changes.extend(resize_list(inner, "step_pattern", new_len, source));
    }

    changes
}

fn resize_list(inner: &mut Inner, key: &str, new_len: usize, source: &str) -> Vec<StateChange> {
    let Some(current) = inner.values.get(key).cloned() else {
        return Vec::new();
    };

    let note_prob = inner
        .values
        .get("note_probability")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.9);

    let resized = match &current {
        ParamValue::FloatList(list) if list.len() != new_len => {
            let mut list = list.clone();
            list.resize(new_len, note_prob);
            Some(ParamValue::FloatList(list))
        }
        ParamValue::BoolList(list) if list.len() != new_len => {
            let mut list = list.clone();
            list.resize(new_len, true);
            Some(ParamValue::BoolList(list))
        }
        _ => None,
    };

    match resized {
        Some(new_value) => {
            inner.values.insert(key.to_string(), new_value.clone());
            vec![StateChange {
                parameter: key.to_string(),
                old_value: Some(current),
                new_value,
                source: source.to_string(),
            }]
        }
        None => Vec::new(),
    }
}

/// Coerce a value into a domain. Numeric values clamp (ints round when
/// written to float parameters and vice versa); enums and booleans
/// reject mismatched variants; lists clamp per element and are
/// truncated or padded to the current sequence length.
fn validate(
    domain: ParamDomain,
    value: ParamValue,
    seq_len: usize,
    note_prob: f64,
) -> Option<ParamValue> {
    match domain {
        ParamDomain::Float { min, max } => value.as_f64().map(|v| ParamValue::Float(v.clamp(min, max))),
        ParamDomain::Int { min, max } => value.as_i64().map(|v| ParamValue::Int(v.clamp(min, max))),
        ParamDomain::Bool => value.as_bool().map(ParamValue::Bool),
        ParamDomain::Direction => value.as_direction().map(ParamValue::Direction),
        ParamDomain::Quantize => value.as_quantize().map(ParamValue::Quantize),
        ParamDomain::FloatList { min, max } => match value {
            ParamValue::FloatList(list) => {
                let mut list: Vec<f64> = list.into_iter().map(|v| v.clamp(min, max)).collect();
                list.resize(seq_len, note_prob.clamp(min, max));
                Some(ParamValue::FloatList(list))
            }
            _ => None,
        },
        ParamDomain::BoolList => match value {
            ParamValue::BoolList(list) => {
                let mut list = list;
                list.resize(seq_len, true);
                Some(ParamValue::BoolList(list))
            }
            _ => None,
        },
    }
}

fn notify(listeners: &[(ListenerId, Listener)], change: &StateChange) {
    for (id, listener) in listeners {
        let result = catch_unwind(AssertUnwindSafe(|| listener(change)));
        if result.is_err() {
            log::error!(
                "state_listener_panicked listener={id} param={}",
                change.parameter
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> State {
        State::new(9)
    }

    #[test]
    fn test_defaults_present() {
        let s = state();
        assert_eq!(s.get_f64("bpm"), Some(110.0));
        assert_eq!(s.get_i64("sequence_length"), Some(8));
        assert_eq!(s.get_direction("direction_pattern"), Some(DirectionPattern::Forward));
        assert_eq!(s.get("step_probabilities"), None);
    }

    #[test]
    fn test_numeric_clamping() {
        let s = state();
        assert!(s.set("bpm", ParamValue::Float(500.0), "test"));
        assert_eq!(s.get_f64("bpm"), Some(300.0));
        assert!(s.set("bpm", ParamValue::Float(0.0), "test"));
        assert_eq!(s.get_f64("bpm"), Some(1.0));
        assert!(s.set("root_note", ParamValue::Int(200), "test"));
        assert_eq!(s.get_i64("root_note"), Some(127));
    }

    #[test]
    fn test_float_write_to_int_param_rounds() {
        let s = state();
        assert!(s.set("root_note", ParamValue::Float(61.7), "mutation"));
        assert_eq!(s.get_i64("root_note"), Some(62));
    }

    #[test]
    fn test_enum_rejects_wrong_variant() {
        let s = state();
        assert!(!s.set("direction_pattern", ParamValue::Int(3), "test"));
        assert_eq!(s.get_direction("direction_pattern"), Some(DirectionPattern::Forward));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let s = state();
        assert!(!s.set("warp_factor", ParamValue::Float(9.0), "test"));
        assert_eq!(s.get("warp_factor"), None);
    }

    #[test]
    fn test_set_same_value_is_a_no_op() {
        let s = state();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        s.add_listener(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!s.set("bpm", ParamValue::Float(110.0), "test"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(s.set("bpm", ParamValue::Float(120.0), "test"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_sees_old_and_new() {
        let s = state();
        let seen: Arc<Mutex<Vec<(Option<f64>, f64, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.add_listener(move |change| {
            sink.lock().unwrap().push((
                change.old_value.as_ref().and_then(|v| v.as_f64()),
                change.new_value.as_f64().unwrap(),
                change.source.clone(),
            ));
        });

        s.set("density", ParamValue::Float(0.5), "midi");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Some(0.85), 0.5, "midi".to_string()));
    }

    #[test]
    fn test_remove_listener() {
        let s = state();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let id = s.add_listener(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(s.remove_listener(id));
        assert!(!s.remove_listener(id));
        s.set("density", ParamValue::Float(0.1), "test");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_list_truncate_and_pad() {
        let s = state();
        // Too long: truncated to sequence_length (8).
        s.set(
            "step_probabilities",
            ParamValue::FloatList(vec![0.5; 12]),
            "test",
        );
        assert_eq!(s.get_float_list("step_probabilities").unwrap().len(), 8);

        // Too short: padded with note_probability (0.9).
        s.set(
            "step_probabilities",
            ParamValue::FloatList(vec![0.2, 0.3]),
            "test",
        );
        let probs = s.get_float_list("step_probabilities").unwrap();
        assert_eq!(probs.len(), 8);
        assert!((probs[0] - 0.2).abs() < 1e-9);
        assert!((probs[7] - 0.9).abs() < 1e-9);

        // Bool pattern pads with true.
        s.set("step_pattern", ParamValue::BoolList(vec![false, false]), "test");
        let pattern = s.get_bool_list("step_pattern").unwrap();
        assert_eq!(pattern.len(), 8);
        assert!(!pattern[0]);
        assert!(pattern[7]);
    }

    #[test]
    fn test_list_elements_clamped() {
        let s = state();
        s.set(
            "step_probabilities",
            ParamValue::FloatList(vec![-0.5, 1.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5]),
            "test",
        );
        let probs = s.get_float_list("step_probabilities").unwrap();
        assert!((probs[0] - 0.0).abs() < 1e-9);
        assert!((probs[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sequence_length_resizes_lists() {
        let s = state();
        s.set("step_pattern", ParamValue::BoolList(vec![false; 8]), "test");
        s.set("step_probabilities", ParamValue::FloatList(vec![0.5; 8]), "test");

        s.set("sequence_length", ParamValue::Int(4), "test");
        assert_eq!(s.get_bool_list("step_pattern").unwrap().len(), 4);
        assert_eq!(s.get_float_list("step_probabilities").unwrap().len(), 4);

        s.set("sequence_length", ParamValue::Int(6), "test");
        let pattern = s.get_bool_list("step_pattern").unwrap();
        assert_eq!(pattern.len(), 6);
        assert!(pattern[5]);
        let probs = s.get_float_list("step_probabilities").unwrap();
        assert!((probs[5] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_update_multiple_reports_changed_keys() {
        let s = state();
        let changed = s.update_multiple(
            &[
                ("bpm", ParamValue::Float(120.0)),
                ("density", ParamValue::Float(0.85)), // unchanged
                ("swing", ParamValue::Float(0.2)),
            ],
            "config",
        );
        assert_eq!(changed, vec!["bpm".to_string(), "swing".to_string()]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let s = state();
        s.add_listener(|_| panic!("listener bug"));
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        s.add_listener(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert!(s.set("swing", ParamValue::Float(0.3), "test"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_reenter_store() {
        let s = Arc::new(state());
        let inner = s.clone();
        s.add_listener(move |change| {
            if change.parameter == "density" {
                inner.set("swing", ParamValue::Float(0.25), "chained");
            }
        });
        s.set("density", ParamValue::Float(0.4), "test");
        assert_eq!(s.get_f64("swing"), Some(0.25));
    }
}
