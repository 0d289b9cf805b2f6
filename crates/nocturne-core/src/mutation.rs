//! Scheduled parameter mutation.
//!
//! While the system is idle (and `chaos_lock` is off), the mutation
//! engine periodically nudges a weighted selection of parameters by
//! bounded deltas. The state validator clamps every application, and a
//! bounded history keeps the last hundred mutations for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MutationConfig;
use crate::engine::join_with_timeout;
use crate::idle::IdleGate;
use crate::state::{ParamValue, State};

/// How a parameter may drift.
#[derive(Clone, Debug)]
pub struct MutationRule {
    pub parameter: String,
    /// Selection weight; higher is likelier.
    pub weight: f64,
    pub delta_range: (f64, f64),
    pub delta_scale: f64,
    pub description: String,
}

impl MutationRule {
    pub fn new(
        parameter: &str,
        weight: f64,
        delta_range: (f64, f64),
        description: &str,
    ) -> Self {
        Self {
            parameter: parameter.to_string(),
            weight,
            delta_range,
            delta_scale: 1.0,
            description: description.to_string(),
        }
    }

    fn draw_delta(&self, rng: &mut StdRng) -> f64 {
        let (lo, hi) = self.delta_range;
        if (hi - lo).abs() < f64::EPSILON {
            return lo * self.delta_scale;
        }
        self.delta_scale * rng.gen_range(lo..hi)
    }
}

/// One applied mutation.
#[derive(Clone, Debug)]
pub struct MutationEvent {
    pub timestamp: Instant,
    pub parameter: String,
    pub old_value: f64,
    pub new_value: f64,
    pub delta: f64,
    pub description: String,
}

const HISTORY_CAP: usize = 100;

/// The built-in rule set, used when the config lists none.
pub fn default_rules() -> Vec<MutationRule> {
    vec![
        MutationRule::new("bpm", 2.0, (-5.0, 5.0), "tempo drift"),
        MutationRule::new("swing", 1.5, (-0.05, 0.05), "swing adjustment"),
        MutationRule::new("density", 3.0, (-0.1, 0.1), "density variation"),
        MutationRule::new("note_probability", 2.5, (-0.05, 0.05), "note probability shift"),
        MutationRule::new("root_note", 1.0, (-2.0, 2.0), "root note shift"),
        MutationRule::new("filter_cutoff", 2.0, (-10.0, 10.0), "filter cutoff drift"),
        MutationRule::new("reverb_mix", 1.5, (-5.0, 5.0), "reverb mix adjustment"),
        MutationRule::new("sequence_length", 1.0, (-2.0, 2.0), "sequence length change"),
        MutationRule::new("drift", 1.5, (-0.05, 0.05), "bpm drift envelope"),
    ]
}

/// Periodic bounded-delta parameter mutator, gated on idle state.
pub struct MutationEngine {
    state: Arc<State>,
    gate: Arc<dyn IdleGate>,
    rules: Vec<MutationRule>,
    interval: (f64, f64),
    max_changes: usize,
    enabled: AtomicBool,
    history: Mutex<VecDeque<MutationEvent>>,
    rng: Mutex<StdRng>,
    next_cycle: Mutex<Instant>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MutationEngine {
    pub fn new(
        config: &MutationConfig,
        state: Arc<State>,
        gate: Arc<dyn IdleGate>,
        seed: u64,
    ) -> Self {
        let rules = if config.rules.is_empty() {
            default_rules()
        } else {
            config
                .rules
                .iter()
                .map(|r| MutationRule {
                    parameter: r.parameter.clone(),
                    weight: r.weight,
                    delta_range: r.delta_range,
                    delta_scale: r.delta_scale,
                    description: r.description.clone(),
                })
                .collect()
        };
        log::info!(
            "mutation_engine_init rules={} interval={}..{}s max_changes={}",
            rules.len(),
            config.interval_min_s,
            config.interval_max_s,
            config.max_changes_per_cycle
        );
        Self {
            state,
            gate,
            rules,
            interval: (config.interval_min_s, config.interval_max_s),
            max_changes: config.max_changes_per_cycle,
            enabled: AtomicBool::new(true),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            next_cycle: Mutex::new(Instant::now()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start the mutation thread.
    pub fn start(engine: &Arc<MutationEngine>) {
        if engine.running.swap(true, Ordering::SeqCst) {
            return;
        }
        engine.schedule_next();

        let worker = engine.clone();
        let running = engine.running.clone();
        let handle = std::thread::Builder::new()
            .name("nocturne-mutation".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let due = *worker.next_cycle.lock().unwrap() <= Instant::now();
                    if due {
                        worker.run_cycle();
                        worker.schedule_next();
                    }
                    std::thread::sleep(Duration::from_millis(1000));
                }
            })
            .expect("failed to spawn mutation thread");
        *engine.worker.lock().unwrap() = Some(handle);
        log::info!("mutation_engine_started");
    }

    /// Stop the mutation thread; drains within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            join_with_timeout(handle, Duration::from_secs(3), "mutation engine");
        }
        log::info!("mutation_engine_stopped");
    }

    /// Master enable independent of idle state.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        log::info!("mutations_{}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Run one cycle immediately. The idle/chaos gate still applies.
    pub fn force_mutation(&self) {
        self.run_cycle();
    }

    /// The most recent mutations, oldest first.
    pub fn history(&self) -> Vec<MutationEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    fn schedule_next(&self) {
        let interval = {
            let mut rng = self.rng.lock().unwrap();
            if (self.interval.1 - self.interval.0).abs() < f64::EPSILON {
                self.interval.0
            } else {
                rng.gen_range(self.interval.0..self.interval.1)
            }
        };
        *self.next_cycle.lock().unwrap() = Instant::now() + Duration::from_secs_f64(interval);
        log::debug!("mutation_scheduled interval={interval:.1}s");
    }

    fn gate_open(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if self.state.get_bool("chaos_lock").unwrap_or(false) {
            log::debug!("mutation_cycle_skipped reason=chaos_lock");
            return false;
        }
        if !self.gate.mutations_allowed() {
            log::debug!("mutation_cycle_skipped reason=not_idle");
            return false;
        }
        true
    }

    fn run_cycle(&self) {
        if !self.gate_open() {
            return;
        }

        let selected = self.select_rules();
        if selected.is_empty() {
            log::debug!("mutation_cycle_skipped reason=no_selection");
            return;
        }

        let mut applied = 0;
        for rule in &selected {
            if self.apply_rule(rule) {
                applied += 1;
            }
        }
        log::info!(
            "mutation_cycle_complete selected={} applied={applied}",
            selected.len()
        );
    }

    /// Weighted selection without replacement; rules whose parameter
    /// is absent from state are not candidates.
    fn select_rules(&self) -> Vec<MutationRule> {
        let mut available: Vec<MutationRule> = self
            .rules
            .iter()
            .filter(|rule| self.state.get(&rule.parameter).is_some())
            .cloned()
            .collect();

        let mut rng = self.rng.lock().unwrap();
        let mut selected = Vec::new();
        for _ in 0..self.max_changes.min(available.len()) {
            let total: f64 = available.iter().map(|r| r.weight).sum();
            if total <= 0.0 {
                break;
            }
            let target = rng.gen_range(0.0..total);
            let mut cumulative = 0.0;
            let mut pick = available.len() - 1;
            for (i, rule) in available.iter().enumerate() {
                cumulative += rule.weight;
                if cumulative >= target {
                    pick = i;
                    break;
                }
            }
            selected.push(available.remove(pick));
        }
        selected
    }

    fn apply_rule(&self, rule: &MutationRule) -> bool {
        let Some(current) = self.state.get(&rule.parameter).and_then(|v| v.as_f64()) else {
            log::warn!("mutation_skipped parameter={} reason=not_numeric", rule.parameter);
            return false;
        };

        let delta = rule.draw_delta(&mut self.rng.lock().unwrap());
        let proposed = current + delta;

        if !self
            .state
            .set(&rule.parameter, ParamValue::Float(proposed), "mutation")
        {
            log::debug!("mutation_no_change parameter={}", rule.parameter);
            return false;
        }

        let new_value = self
            .state
            .get(&rule.parameter)
            .and_then(|v| v.as_f64())
            .unwrap_or(proposed);
        log::info!(
            "mutation_applied parameter={} old={current:.3} new={new_value:.3} delta={delta:.3}",
            rule.parameter
        );

        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(MutationEvent {
            timestamp: Instant::now(),
            parameter: rule.parameter.clone(),
            old_value: current,
            new_value,
            delta,
            description: rule.description.clone(),
        });
        true
    }
}
