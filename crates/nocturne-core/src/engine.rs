//! Engine composition root.
//!
//! [`Engine`] owns every component, wires the data path
//! (clock -> sequencer -> note scheduler -> sink), connects state
//! listeners to the clock and sequencer, and tears everything down in
//! a fixed order on shutdown so no note is left hanging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::actions::ActionHandler;
use crate::config::Config;
use crate::error::Result;
use crate::events::SemanticEvent;
use crate::idle::{IdleGate, IdleManager, InteractionSink};
use crate::mutation::MutationEngine;
use crate::output::MidiSink;
use crate::scheduler::NoteScheduler;
use crate::sequencer::Sequencer;
use crate::state::State;
use crate::timing::{HighResClock, DEFAULT_PPQ};

/// Join a worker, abandoning it with a warning if it does not finish
/// within the timeout. (std has no timed join; poll `is_finished`.)
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("thread_abandoned name={name} timeout_ms={}", timeout.as_millis());
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}

/// The running engine.
pub struct Engine {
    state: Arc<State>,
    clock: Arc<Mutex<HighResClock>>,
    sequencer: Arc<Sequencer>,
    note_scheduler: Arc<NoteScheduler>,
    idle: Arc<IdleManager>,
    mutation: Arc<MutationEngine>,
    actions: Arc<ActionHandler>,
    sink: Arc<dyn MidiSink>,
    output_channel: u8,
    fade_in: Duration,
    fade_out: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    /// Build an engine from a validated config. The seed is drawn from
    /// the wall clock; use [`Engine::with_seed`] for reproducibility.
    pub fn new(config: Config, sink: Arc<dyn MidiSink>) -> Result<Self> {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(config, sink, seed)
    }

    /// Build an engine with an explicit PRNG seed.
    pub fn with_seed(config: Config, sink: Arc<dyn MidiSink>, seed: u64) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(State::new(config.scales.len()));
        state.update_multiple(&config.state_defaults(), "config");

        let sequencer = Arc::new(Sequencer::new(
            state.clone(),
            config.scales.clone(),
            DEFAULT_PPQ,
            seed,
        ));
        let note_scheduler = Arc::new(NoteScheduler::new(sink.clone()));
        let idle = Arc::new(IdleManager::new(&config.idle, state.clone()));
        let mutation = Arc::new(MutationEngine::new(
            &config.mutation,
            state.clone(),
            idle.clone() as Arc<dyn IdleGate>,
            seed.wrapping_add(1),
        ));
        let actions = Arc::new(ActionHandler::new(
            state.clone(),
            sequencer.clone(),
            idle.clone() as Arc<dyn InteractionSink>,
            config.cc_out.clone(),
            config.midi.output_channel,
            config.scales.len(),
        ));

        let clock = Arc::new(Mutex::new(HighResClock::new(
            state.get_f64("bpm").unwrap_or(110.0),
            DEFAULT_PPQ,
            state.get_f64("swing").unwrap_or(0.0),
        )));

        log::info!(
            "engine_built scales={} seed={seed} bpm={}",
            config.scales.len(),
            state.get_f64("bpm").unwrap_or(0.0)
        );

        Ok(Self {
            state,
            clock,
            sequencer,
            note_scheduler,
            idle,
            mutation,
            actions,
            sink,
            output_channel: config.midi.output_channel,
            fade_in: Duration::from_millis(config.idle.fade_in_ms),
            fade_out: Duration::from_millis(config.idle.fade_out_ms),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn action_handler(&self) -> Arc<ActionHandler> {
        self.actions.clone()
    }

    pub fn mutation_engine(&self) -> Arc<MutationEngine> {
        self.mutation.clone()
    }

    pub fn idle_manager(&self) -> Arc<IdleManager> {
        self.idle.clone()
    }

    /// Deliver one inbound event (called from the input thread).
    pub fn handle_event(&self, event: &SemanticEvent) {
        self.actions.handle(event);
    }

    /// Wire the callbacks and start every thread.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Notes flow through the scheduler so every on gets its off.
        let scheduler = self.note_scheduler.clone();
        let channel = self.output_channel;
        self.sequencer.set_note_callback(Arc::new(move |event| {
            if let Some(pitch) = event.pitch {
                if event.duration_seconds > 0.0 {
                    scheduler.schedule_note(pitch, event.velocity, channel, event.duration_seconds);
                }
            }
        }));

        let sink = self.sink.clone();
        self.actions.set_cc_callback(Arc::new(move |cc| {
            sink.control_change(cc.controller, cc.value, cc.channel);
        }));

        // State listeners keep the clock and sequencer in sync with
        // parameter writes, wherever they come from.
        let clock = self.clock.clone();
        let sequencer = self.sequencer.clone();
        let (fade_in, fade_out) = (self.fade_in, self.fade_out);
        self.state.add_listener(move |change| {
            match change.parameter.as_str() {
                "bpm" => {
                    let clock = clock.lock().unwrap();
                    let target = change.new_value.as_f64().unwrap_or(110.0);
                    // Idle transitions fade; everything else snaps.
                    let fade = match change.source.as_str() {
                        "idle" => Some(fade_in),
                        "idle_restore" => Some(fade_out),
                        _ => None,
                    };
                    match fade {
                        Some(fade) if !fade.is_zero() => {
                            let from = clock.bpm();
                            clock.start_bpm_transition(from, target, fade.as_secs_f64());
                        }
                        _ => clock.set_bpm(target),
                    }
                }
                "swing" => {
                    clock
                        .lock()
                        .unwrap()
                        .set_swing(change.new_value.as_f64().unwrap_or(0.0));
                }
                "drift" => {
                    clock
                        .lock()
                        .unwrap()
                        .set_drift(change.new_value.as_f64().unwrap_or(0.0));
                }
                "scale_index" | "root_note" => sequencer.refresh_scale(),
                "direction_pattern" => {
                    if let Some(direction) = change.new_value.as_direction() {
                        sequencer.on_direction_changed(direction);
                    }
                }
                _ => {}
            }
        });

        self.note_scheduler.start();
        IdleManager::start(&self.idle);
        MutationEngine::start(&self.mutation);
        self.sequencer.start();

        let sequencer = self.sequencer.clone();
        self.clock
            .lock()
            .unwrap()
            .start(move |tick| sequencer.on_tick(&tick));

        log::info!("engine_started");
    }

    /// Ordered teardown: clock first (no new ticks), then mutation and
    /// idle, then the note scheduler drains every outstanding off, and
    /// finally the sink closes. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("engine_shutdown_begin");

        self.clock.lock().unwrap().stop();
        self.sequencer.stop();
        self.mutation.stop();
        self.idle.stop();
        self.note_scheduler.shutdown();
        self.sink.close();

        log::info!("engine_shutdown_complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
