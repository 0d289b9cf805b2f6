//! Step sequencer.
//!
//! The sequencer consumes clock ticks, advances the step position
//! according to the configured direction pattern, runs the gate chain
//! (pattern gate, step probability, density), and emits [`NoteEvent`]s
//! to its registered callback. In fugue mode the gate chain is
//! replaced by the fugue voice timelines.
//!
//! The clock thread is the only caller of [`Sequencer::on_tick`];
//! manual triggers arrive from the input thread. Both paths serialize
//! on the internal core mutex.

use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::events::NoteEvent;
use crate::fugue::{FugueParams, FuguePlayback};
use crate::scale::ScaleMapper;
use crate::state::{DirectionPattern, ParamValue, QuantizeMode, State};
use crate::timing::TickEvent;

/// Callback receiving every produced note.
pub type NoteCallback = Arc<dyn Fn(NoteEvent) + Send + Sync>;

struct SeqCore {
    running: bool,
    current_step: usize,
    ping_pong_dir: i32,
    /// Deferred (scale_index, root_note) waiting for the bar boundary.
    pending_scale: Option<(usize, u8)>,
    mapper: ScaleMapper,
    rng: StdRng,
    fugue: FuguePlayback,
}

/// Step sequencer and fugue host.
pub struct Sequencer {
    state: Arc<State>,
    scales: Vec<String>,
    ticks_per_step: u64,
    inner: Mutex<SeqCore>,
    note_callback: RwLock<Option<NoteCallback>>,
}

impl Sequencer {
    /// Create a sequencer over `state`, playing the given scale list.
    /// `seed` drives every probabilistic decision, including fugue
    /// rendering.
    pub fn new(state: Arc<State>, scales: Vec<String>, ppq: u32, seed: u64) -> Self {
        let mut mapper = ScaleMapper::new();
        let scale_index = state.get_i64("scale_index").unwrap_or(0) as usize;
        let root_note = state.get_i64("root_note").unwrap_or(60) as u8;
        if let Some(name) = scales.get(scale_index) {
            mapper.set_scale(name, root_note);
        }

        Self {
            state,
            scales,
            ticks_per_step: (ppq / 4).max(1) as u64,
            inner: Mutex::new(SeqCore {
                running: false,
                current_step: 0,
                ping_pong_dir: 1,
                pending_scale: None,
                mapper,
                rng: StdRng::seed_from_u64(seed),
                fugue: FuguePlayback::new(seed),
            }),
            note_callback: RwLock::new(None),
        }
    }

    pub fn set_note_callback(&self, callback: NoteCallback) {
        *self.note_callback.write().unwrap() = Some(callback);
    }

    pub fn start(&self) {
        self.inner.lock().unwrap().running = true;
        log::info!("sequencer_started");
    }

    /// Ticks arriving after stop are dropped silently.
    pub fn stop(&self) {
        self.inner.lock().unwrap().running = false;
        log::info!("sequencer_stopped");
    }

    pub fn current_step(&self) -> usize {
        self.inner.lock().unwrap().current_step
    }

    /// Clock tick entry point; fires the step handler on every
    /// 16th-note boundary.
    pub fn on_tick(&self, tick: &TickEvent) {
        if tick.tick % self.ticks_per_step != 0 {
            return;
        }
        let mut core = self.inner.lock().unwrap();
        if !core.running {
            return;
        }
        self.advance(&mut core, tick.bpm);
    }

    /// Manually advance one step and sound it, bypassing the gate
    /// chain. `value` steers velocity within the configured envelope;
    /// `override_note` replaces the scale-mapped pitch.
    pub fn trigger_step(&self, value: u8, override_note: Option<u8>) -> Option<NoteEvent> {
        let bpm = self.state.get_f64("bpm").unwrap_or(110.0);
        let mut core = self.inner.lock().unwrap();

        let length = self.sequence_length();
        let step = self.next_step(&mut core, length);
        core.current_step = step;
        if step == 0 {
            self.apply_pending_scale(&mut core);
        }

        let base = self.state.get_i64("base_velocity").unwrap_or(80) as f64;
        let range = self.state.get_i64("velocity_range").unwrap_or(0) as f64;
        let velocity =
            (base + ((value as f64 / 127.0 - 0.5) * range).round()).clamp(1.0, 127.0) as u8;
        let pitch = override_note.unwrap_or_else(|| core.mapper.note_at(step as i32, 0));
        let event = NoteEvent::new(pitch, velocity, self.step_duration(bpm), step);
        drop(core);

        self.state
            .set("step_position", ParamValue::Int(step as i64), "sequencer");
        self.emit(event);
        log::debug!("manual_trigger step={step} note={pitch} velocity={velocity}");
        Some(event)
    }

    /// Pick up a scale/root change from state, honoring the configured
    /// quantize mode.
    pub fn refresh_scale(&self) {
        let scale_index = self.state.get_i64("scale_index").unwrap_or(0) as usize;
        let root_note = self.state.get_i64("root_note").unwrap_or(60) as u8;
        let mode = self
            .state
            .get_quantize("quantize_scale_changes")
            .unwrap_or(QuantizeMode::Bar);

        let mut core = self.inner.lock().unwrap();
        match mode {
            QuantizeMode::Immediate => {
                self.apply_scale(&mut core, scale_index, root_note);
            }
            QuantizeMode::Bar => {
                core.pending_scale = Some((scale_index, root_note));
                log::debug!("scale_change_pending index={scale_index} root={root_note}");
            }
        }
    }

    /// Reset per-direction bookkeeping when the pattern changes.
    pub fn on_direction_changed(&self, direction: DirectionPattern) {
        let mut core = self.inner.lock().unwrap();
        core.ping_pong_dir = match direction {
            DirectionPattern::Backward => -1,
            _ => 1,
        };
        if direction != DirectionPattern::Fugue {
            core.fugue.reset();
        }
        log::debug!("direction_changed pattern={direction}");
    }

    /// Write a named pattern preset into state. Returns false for
    /// unknown names.
    pub fn apply_pattern_preset(&self, name: &str) -> bool {
        match pattern_preset(name) {
            Some(pattern) => {
                self.state
                    .set("step_pattern", ParamValue::BoolList(pattern), "sequencer");
                true
            }
            None => {
                log::warn!("unknown_pattern_preset name={name}");
                false
            }
        }
    }

    /// Write a named probability preset into state. Returns false for
    /// unknown names.
    pub fn apply_probability_preset(&self, name: &str) -> bool {
        let length = self.sequence_length();
        let mut core = self.inner.lock().unwrap();
        match probability_preset(name, length, &mut core.rng) {
            Some(probs) => {
                drop(core);
                self.state
                    .set("step_probabilities", ParamValue::FloatList(probs), "sequencer");
                true
            }
            None => {
                log::warn!("unknown_probability_preset name={name}");
                false
            }
        }
    }

    fn sequence_length(&self) -> usize {
        self.state.get_i64("sequence_length").unwrap_or(8).max(1) as usize
    }

    fn step_duration(&self, bpm: f64) -> f64 {
        let gate = self.state.get_f64("gate_length").unwrap_or(0.8);
        gate * 60.0 / (bpm.max(1.0) * 4.0)
    }

    fn apply_scale(&self, core: &mut SeqCore, scale_index: usize, root_note: u8) {
        match self.scales.get(scale_index) {
            Some(name) => {
                if core.mapper.set_scale(name, root_note) {
                    log::info!("scale_set name={name} root={root_note}");
                }
            }
            None => log::warn!(
                "scale_index_out_of_range index={scale_index} max={}",
                self.scales.len().saturating_sub(1)
            ),
        }
        core.pending_scale = None;
    }

    fn apply_pending_scale(&self, core: &mut SeqCore) {
        if let Some((scale_index, root_note)) = core.pending_scale.take() {
            self.apply_scale(core, scale_index, root_note);
        }
    }

    /// Next step position under the current direction pattern.
    fn next_step(&self, core: &mut SeqCore, length: usize) -> usize {
        if core.current_step >= length {
            core.current_step %= length;
        }
        let current = core.current_step;
        let direction = self
            .state
            .get_direction("direction_pattern")
            .unwrap_or(DirectionPattern::Forward);

        match direction {
            DirectionPattern::Forward => (current + 1) % length,
            DirectionPattern::Backward => (current + length - 1) % length,
            DirectionPattern::PingPong => {
                if length == 1 {
                    return 0;
                }
                let mut next = current as i64 + core.ping_pong_dir as i64;
                if next >= length as i64 {
                    core.ping_pong_dir = -1;
                    next = length as i64 - 2;
                } else if next < 0 {
                    core.ping_pong_dir = 1;
                    next = 1;
                }
                next.clamp(0, length as i64 - 1) as usize
            }
            DirectionPattern::Random => {
                if length == 1 {
                    return 0;
                }
                // Uniform over every step but the current one.
                let pick = core.rng.gen_range(0..length - 1);
                if pick >= current {
                    pick + 1
                } else {
                    pick
                }
            }
            // Fugue keeps its own timeline; the step counter follows
            // the elapsed-quarter index instead.
            DirectionPattern::Fugue => (core.fugue.quarter_index() as usize) % length,
        }
    }

    fn advance(&self, core: &mut SeqCore, bpm: f64) {
        let length = self.sequence_length();
        let direction = self
            .state
            .get_direction("direction_pattern")
            .unwrap_or(DirectionPattern::Forward);

        if direction == DirectionPattern::Fugue {
            self.advance_fugue(core, length, bpm);
            return;
        }

        let step = self.next_step(core, length);
        core.current_step = step;
        if step == 0 {
            self.apply_pending_scale(core);
        }

        let event = self.generate_note(core, step, bpm);
        self.state
            .set("step_position", ParamValue::Int(step as i64), "sequencer");
        if let Some(event) = event {
            log::debug!(
                "note_generated step={} note={:?} velocity={}",
                event.step_index,
                event.pitch,
                event.velocity
            );
            self.emit(event);
        }
    }

    fn advance_fugue(&self, core: &mut SeqCore, length: usize, bpm: f64) {
        let params = FugueParams {
            n_voices: self.state.get_i64("voices").unwrap_or(3).clamp(1, 4) as usize,
            key_root: self.state.get_i64("root_note").unwrap_or(60) as i32,
            stretto_overlap: FugueParams::stretto_from_density(
                self.state.get_f64("density").unwrap_or(0.5),
            ),
            ..FugueParams::default()
        };

        let SeqCore { fugue, mapper, .. } = core;
        let due = fugue.on_step(mapper, &params, bpm);
        let step = (core.fugue.quarter_index() as usize) % length;
        core.current_step = step;
        if step == 0 {
            self.apply_pending_scale(core);
        }

        self.state
            .set("step_position", ParamValue::Int(step as i64), "sequencer");
        for voice_note in due {
            self.emit(
                NoteEvent::new(
                    voice_note.pitch,
                    voice_note.velocity,
                    voice_note.duration_seconds,
                    step,
                )
                .with_voice(voice_note.voice_index),
            );
        }
    }

    /// Gate chain: pattern gate, step probability, density gate. Any
    /// failed gate yields silence for this step.
    fn generate_note(&self, core: &mut SeqCore, step: usize, bpm: f64) -> Option<NoteEvent> {
        if let Some(pattern) = self.state.get_bool_list("step_pattern") {
            if !pattern.get(step % pattern.len().max(1)).copied().unwrap_or(true) {
                return None;
            }
        }

        let probability = match self.state.get_float_list("step_probabilities") {
            Some(probs) => probs.get(step % probs.len().max(1)).copied().unwrap_or(0.9),
            None => self.state.get_f64("note_probability").unwrap_or(0.9),
        };
        if core.rng.gen::<f64>() >= probability {
            return None;
        }

        let density = self.state.get_f64("density").unwrap_or(0.85);
        if core.rng.gen::<f64>() >= density {
            return None;
        }

        let pitch = core.mapper.note_at(step as i32, 0);
        let base = self.state.get_i64("base_velocity").unwrap_or(80) as f64;
        let range = self.state.get_i64("velocity_range").unwrap_or(0) as f64;
        let jitter = core.rng.gen_range(-2i64..=2) as f64;
        let velocity = (base + ((probability - 0.5) * range).round() + jitter).clamp(1.0, 127.0);

        Some(NoteEvent::new(
            pitch,
            velocity as u8,
            self.step_duration(bpm),
            step,
        ))
    }

    fn emit(&self, event: NoteEvent) {
        let callback = self.note_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

// --- Presets ------------------------------------------------------------

/// Pattern preset names in CC bucket order.
pub const PATTERN_PRESETS: [&str; 8] = [
    "four_on_floor",
    "offbeat",
    "every_other",
    "syncopated",
    "dense",
    "sparse",
    "all_on",
    "all_off",
];

/// Probability preset names in CC bucket order.
pub const PROBABILITY_PRESETS: [&str; 8] = [
    "uniform",
    "crescendo",
    "diminuendo",
    "peaks",
    "valleys",
    "alternating",
    "random_low",
    "random_high",
];

/// Named 8-step gate patterns.
pub fn pattern_preset(name: &str) -> Option<Vec<bool>> {
    const T: bool = true;
    const F: bool = false;
    let pattern: [bool; 8] = match name {
        "four_on_floor" => [T, F, F, F, T, F, F, F],
        "offbeat" => [F, T, F, T, F, T, F, T],
        "every_other" => [T, F, T, F, T, F, T, F],
        "syncopated" => [T, F, T, T, F, T, F, F],
        "dense" => [T, T, F, T, T, F, T, T],
        "sparse" => [T, F, F, F, F, F, T, F],
        "all_on" => [T; 8],
        "all_off" => [F; 8],
        _ => return None,
    };
    Some(pattern.to_vec())
}

/// Named probability curves of the requested length. The random
/// presets draw from the caller's RNG stream.
pub fn probability_preset(name: &str, length: usize, rng: &mut StdRng) -> Option<Vec<f64>> {
    let length = length.max(1);
    let ramp = |i: usize| {
        if length == 1 {
            0.0
        } else {
            i as f64 * 0.6 / (length - 1) as f64
        }
    };
    let probs = match name {
        "uniform" => vec![0.9; length],
        "crescendo" => (0..length).map(|i| 0.3 + ramp(i)).collect(),
        "diminuendo" => (0..length).map(|i| 0.9 - ramp(i)).collect(),
        "peaks" => (0..length)
            .map(|i| if i % 4 == 0 { 0.9 } else { 0.4 })
            .collect(),
        "valleys" => (0..length)
            .map(|i| if i % 4 == 0 { 0.3 } else { 0.8 })
            .collect(),
        "alternating" => (0..length)
            .map(|i| if i % 2 == 0 { 0.9 } else { 0.3 })
            .collect(),
        "random_low" => (0..length).map(|_| rng.gen_range(0.2..0.6)).collect(),
        "random_high" => (0..length).map(|_| rng.gen_range(0.6..1.0)).collect(),
        _ => return None,
    };
    Some(probs)
}

/// Validate a direction preset name.
pub fn direction_preset(name: &str) -> Option<DirectionPattern> {
    DirectionPattern::from_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn tick(n: u64, bpm: f64) -> TickEvent {
        TickEvent {
            tick: n,
            timestamp: Instant::now(),
            bpm,
            swing: 0.0,
            swing_applied: false,
        }
    }

    fn always_on(state: &State) {
        state.set("density", ParamValue::Float(1.0), "test");
        state.set("note_probability", ParamValue::Float(1.0), "test");
    }

    fn collect_notes(sequencer: &Sequencer) -> Arc<StdMutex<Vec<NoteEvent>>> {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink = collected.clone();
        sequencer.set_note_callback(Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        }));
        collected
    }

    fn scales() -> Vec<String> {
        vec!["major".to_string(), "minor".to_string(), "pentatonic_major".to_string()]
    }

    fn run_steps(sequencer: &Sequencer, steps: u64) {
        for n in 0..steps {
            sequencer.on_tick(&tick(n * 6, 120.0));
        }
    }

    #[test]
    fn test_only_sixteenth_ticks_fire() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();

        for n in 0..6 {
            sequencer.on_tick(&tick(n, 120.0));
        }
        // Only tick 0 is a step boundary.
        assert_eq!(notes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ticks_after_stop_are_dropped() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        sequencer.on_tick(&tick(0, 120.0));
        sequencer.stop();
        sequencer.on_tick(&tick(6, 120.0));
        assert_eq!(notes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_forward_wraps_and_updates_state() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("sequence_length", ParamValue::Int(4), "test");
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        collect_notes(&sequencer);
        sequencer.start();

        let mut positions = Vec::new();
        for n in 0..8 {
            sequencer.on_tick(&tick(n * 6, 120.0));
            positions.push(state.get_i64("step_position").unwrap());
        }
        assert_eq!(positions, vec![1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_ping_pong_reflects_without_repeating_endpoints() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("sequence_length", ParamValue::Int(4), "test");
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::PingPong),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        collect_notes(&sequencer);
        sequencer.start();

        let mut positions = Vec::new();
        for n in 0..8 {
            sequencer.on_tick(&tick(n * 6, 120.0));
            positions.push(state.get_i64("step_position").unwrap());
        }
        assert_eq!(positions, vec![1, 2, 3, 2, 1, 0, 1, 2]);
    }

    #[test]
    fn test_ping_pong_visits_both_ends() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("sequence_length", ParamValue::Int(6), "test");
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::PingPong),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        collect_notes(&sequencer);
        sequencer.start();

        let mut positions = Vec::new();
        for n in 0..10 {
            sequencer.on_tick(&tick(n * 6, 120.0));
            positions.push(state.get_i64("step_position").unwrap());
        }
        assert!(positions.contains(&0));
        assert!(positions.contains(&5));
    }

    #[test]
    fn test_random_never_repeats_consecutively() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::Random),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 99);
        collect_notes(&sequencer);
        sequencer.start();

        let mut last = state.get_i64("step_position").unwrap();
        for n in 0..200 {
            sequencer.on_tick(&tick(n * 6, 120.0));
            let position = state.get_i64("step_position").unwrap();
            assert_ne!(position, last, "repeated step at iteration {n}");
            last = position;
        }
    }

    #[test]
    fn test_random_with_length_one_stays_put() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("sequence_length", ParamValue::Int(1), "test");
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::Random),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 7);
        collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 10);
        assert_eq!(state.get_i64("step_position").unwrap(), 0);
    }

    #[test]
    fn test_zero_density_silences_everything() {
        let state = Arc::new(State::new(3));
        state.set("density", ParamValue::Float(0.0), "test");
        state.set("note_probability", ParamValue::Float(1.0), "test");
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 64);
        assert!(notes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pattern_gate_blocks_steps() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set(
            "step_pattern",
            ParamValue::BoolList(vec![true, false, true, false, true, false, true, false]),
            "test",
        );
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 32);

        for event in notes.lock().unwrap().iter() {
            assert_eq!(event.step_index % 2, 0, "odd step sounded");
        }
    }

    #[test]
    fn test_step_probability_zero_blocks_step() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        let mut probs = vec![1.0; 8];
        probs[3] = 0.0;
        state.set("step_probabilities", ParamValue::FloatList(probs), "test");
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 64);

        let notes = notes.lock().unwrap();
        assert!(!notes.is_empty());
        assert!(notes.iter().all(|event| event.step_index != 3));
    }

    #[test]
    fn test_velocity_envelope_with_zero_range() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("velocity_range", ParamValue::Int(0), "test");
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 16);

        for event in notes.lock().unwrap().iter() {
            // base_velocity 80 plus jitter of at most +/-2.
            assert!((78..=82).contains(&event.velocity), "velocity {}", event.velocity);
        }
    }

    #[test]
    fn test_gate_length_sets_duration() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("gate_length", ParamValue::Float(0.5), "test");
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        sequencer.on_tick(&tick(0, 120.0));

        let notes = notes.lock().unwrap();
        // Step interval at 120 BPM is 0.125 s; gate 0.5 halves it.
        assert!((notes[0].duration_seconds - 0.0625).abs() < 1e-9);
    }

    #[test]
    fn test_bar_quantized_scale_change() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set("sequence_length", ParamValue::Int(4), "test");
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();

        // Move to minor, quantized to the bar.
        state.set("scale_index", ParamValue::Int(1), "test");
        sequencer.refresh_scale();

        let mut steps_and_pitches = Vec::new();
        for n in 0..8 {
            sequencer.on_tick(&tick(n * 6, 120.0));
            let position = state.get_i64("step_position").unwrap();
            let pitch = notes.lock().unwrap().last().map(|e| e.pitch.unwrap());
            steps_and_pitches.push((position, pitch));
        }

        // Steps 1..3 still major (E above C = 64); after the wrap to 0
        // the third degree is minor (E flat = 63).
        let major_third = steps_and_pitches
            .iter()
            .find(|(p, _)| *p == 2)
            .unwrap()
            .1
            .unwrap();
        assert_eq!(major_third, 64);
        let minor_third = steps_and_pitches
            .iter()
            .rev()
            .find(|(p, _)| *p == 2)
            .unwrap()
            .1
            .unwrap();
        assert_eq!(minor_third, 63);
    }

    #[test]
    fn test_immediate_scale_change() {
        let state = Arc::new(State::new(3));
        always_on(&state);
        state.set(
            "quantize_scale_changes",
            ParamValue::Quantize(QuantizeMode::Immediate),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        let notes = collect_notes(&sequencer);
        sequencer.start();

        state.set("scale_index", ParamValue::Int(1), "test");
        sequencer.refresh_scale();
        // Step 2 is the third scale degree.
        sequencer.on_tick(&tick(0, 120.0));
        sequencer.on_tick(&tick(6, 120.0));

        let notes = notes.lock().unwrap();
        assert_eq!(notes[1].step_index, 2);
        assert_eq!(notes[1].pitch, Some(63));
    }

    #[test]
    fn test_trigger_step_uses_override_and_envelope() {
        let state = Arc::new(State::new(3));
        state.set("velocity_range", ParamValue::Int(0), "test");
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        let notes = collect_notes(&sequencer);

        let event = sequencer.trigger_step(100, Some(60)).unwrap();
        assert_eq!(event.pitch, Some(60));
        // Zero range collapses to base_velocity.
        assert_eq!(event.velocity, 80);
        assert_eq!(event.step_index, 1);
        assert_eq!(state.get_i64("step_position").unwrap(), 1);
        assert_eq!(notes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_step_velocity_range_scales_with_value() {
        let state = Arc::new(State::new(3));
        state.set("velocity_range", ParamValue::Int(40), "test");
        let sequencer = Sequencer::new(state, scales(), 24, 1);
        collect_notes(&sequencer);

        let quiet = sequencer.trigger_step(0, Some(60)).unwrap();
        let loud = sequencer.trigger_step(127, Some(60)).unwrap();
        assert!(quiet.velocity < loud.velocity);
        assert_eq!(quiet.velocity, 60);
        assert_eq!(loud.velocity, 100);
    }

    #[test]
    fn test_fugue_mode_bypasses_density() {
        let state = Arc::new(State::new(3));
        state.set("density", ParamValue::Float(0.0), "test");
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::Fugue),
            "test",
        );
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 42);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 64);

        assert!(
            !notes.lock().unwrap().is_empty(),
            "fugue mode must ignore the density gate"
        );
    }

    #[test]
    fn test_fugue_mode_emits_multiple_voices() {
        let state = Arc::new(State::new(3));
        state.set(
            "direction_pattern",
            ParamValue::Direction(DirectionPattern::Fugue),
            "test",
        );
        let sequencer = Sequencer::new(state, scales(), 24, 42);
        let notes = collect_notes(&sequencer);
        sequencer.start();
        run_steps(&sequencer, 512);

        let voices: std::collections::HashSet<usize> = notes
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.voice_index)
            .collect();
        assert!(voices.len() >= 2, "only voices {voices:?} sounded");
    }

    #[test]
    fn test_pattern_preset_table() {
        assert_eq!(
            pattern_preset("four_on_floor").unwrap(),
            vec![true, false, false, false, true, false, false, false]
        );
        assert_eq!(pattern_preset("all_off").unwrap(), vec![false; 8]);
        assert!(pattern_preset("nope").is_none());
        for name in PATTERN_PRESETS {
            assert!(pattern_preset(name).is_some());
        }
    }

    #[test]
    fn test_probability_presets() {
        let mut rng = StdRng::seed_from_u64(5);
        let crescendo = probability_preset("crescendo", 8, &mut rng).unwrap();
        assert!((crescendo[0] - 0.3).abs() < 1e-9);
        assert!((crescendo[7] - 0.9).abs() < 1e-9);
        for pair in crescendo.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        let low = probability_preset("random_low", 16, &mut rng).unwrap();
        assert!(low.iter().all(|p| (0.2..0.6).contains(p)));

        assert!(probability_preset("nope", 8, &mut rng).is_none());
        for name in PROBABILITY_PRESETS {
            assert!(probability_preset(name, 8, &mut rng).is_some());
        }
    }

    #[test]
    fn test_preset_application_writes_state() {
        let state = Arc::new(State::new(3));
        let sequencer = Sequencer::new(state.clone(), scales(), 24, 1);
        assert!(sequencer.apply_pattern_preset("offbeat"));
        assert_eq!(
            state.get_bool_list("step_pattern").unwrap(),
            vec![false, true, false, true, false, true, false, true]
        );
        assert!(sequencer.apply_probability_preset("valleys"));
        assert_eq!(state.get_float_list("step_probabilities").unwrap().len(), 8);
        assert!(!sequencer.apply_pattern_preset("bogus"));
    }
}
