//! End-to-end engine scenarios against a collector sink.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nocturne_core::{
    CollectorSink, Config, Engine, EventKind, EventSource, ParamValue, SemanticEvent, SinkEvent,
};

fn base_config() -> Config {
    let mut config = Config::default();
    config.sequencer.bpm = 120.0;
    config.sequencer.swing = 0.0;
    config.sequencer.sequence_length = 8;
    config.sequencer.density = 1.0;
    config.sequencer.note_probability = 1.0;
    config.sequencer.gate_length = 0.5;
    config.sequencer.base_velocity = 80;
    config.sequencer.velocity_range = 0;
    config
}

fn trigger(value: u8, note: u8) -> SemanticEvent {
    SemanticEvent::new(EventKind::TriggerStep, EventSource::Button, value).with_raw_note(note)
}

#[test]
fn manual_trigger_produces_note_on_then_off() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    // Keep the clock out of the way; this scenario is input-driven.
    config.sequencer.density = 0.0;
    let engine = Engine::with_seed(config, sink.clone(), 1).unwrap();
    engine.start();

    let begun = Instant::now();
    engine.handle_event(&trigger(100, 60));
    let ons = sink.note_ons();
    assert!(begun.elapsed() < Duration::from_millis(10), "trigger was not immediate");
    assert_eq!(
        ons,
        vec![SinkEvent::NoteOn {
            note: 60,
            velocity: 80,
            channel: 1
        }]
    );

    // Gate 0.5 of a 16th at 120 BPM is 62.5 ms.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.note_offs(), vec![SinkEvent::NoteOff { note: 60, channel: 1 }]);

    engine.shutdown();
}

#[test]
fn zero_density_produces_silence() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.density = 0.0;
    config.sequencer.bpm = 300.0;
    let engine = Engine::with_seed(config, sink.clone(), 1).unwrap();
    engine.start();

    thread::sleep(Duration::from_millis(400));
    engine.shutdown();
    assert!(sink.events().is_empty(), "unexpected events: {:?}", sink.events());
}

#[test]
fn clock_driven_steps_emit_paired_notes() {
    let sink = Arc::new(CollectorSink::new());
    let engine = Engine::with_seed(base_config(), sink.clone(), 1).unwrap();
    engine.start();

    thread::sleep(Duration::from_millis(600));
    engine.shutdown();

    let ons = sink.note_ons().len();
    let offs = sink.note_offs().len();
    assert!(ons >= 3, "expected a stream of notes, got {ons}");
    // Shutdown drains every outstanding off.
    assert_eq!(ons, offs);
}

#[test]
fn idle_entry_applies_profile_and_exit_restores() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.bpm = 110.0;
    config.sequencer.density = 0.85;
    config.idle.timeout_ms = 400;
    config.idle.ambient_profile = "slow_fade".to_string();
    config.idle.fade_in_ms = 20;
    config.idle.fade_out_ms = 20;
    let engine = Engine::with_seed(config, sink, 1).unwrap();
    engine.start();

    let state = engine.state().clone();
    thread::sleep(Duration::from_millis(1200));
    assert_eq!(state.get_bool("idle_mode"), Some(true));
    assert_eq!(state.get_f64("bpm"), Some(65.0));
    assert_eq!(state.get_f64("density"), Some(0.3));

    engine.handle_event(&SemanticEvent::new(EventKind::Density, EventSource::Cc, 108));
    assert_eq!(state.get_bool("idle_mode"), Some(false));
    assert_eq!(state.get_f64("bpm"), Some(110.0));
    // The interaction itself lands after the restore.
    let density = state.get_f64("density").unwrap();
    assert!((density - 108.0 / 127.0).abs() < 0.01);

    engine.shutdown();
}

#[test]
fn shutdown_flushes_long_notes() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.density = 0.0;
    // Ten-second gate on a manual trigger.
    config.sequencer.bpm = 1.0;
    config.sequencer.gate_length = 1.0;
    let engine = Engine::with_seed(config, sink.clone(), 1).unwrap();
    engine.start();

    engine.handle_event(&trigger(100, 72));
    assert_eq!(sink.note_ons().len(), 1);
    assert!(sink.note_offs().is_empty());

    thread::sleep(Duration::from_millis(100));
    engine.shutdown();
    assert_eq!(sink.note_offs(), vec![SinkEvent::NoteOff { note: 72, channel: 1 }]);
}

#[test]
fn note_ons_and_offs_balance_across_parameter_churn() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.bpm = 240.0;
    let engine = Engine::with_seed(config, sink.clone(), 3).unwrap();
    engine.start();

    // Stir the pot while the clock runs.
    for value in [10u8, 90, 40, 127, 5] {
        engine.handle_event(&SemanticEvent::new(EventKind::Tempo, EventSource::Cc, value));
        engine.handle_event(&SemanticEvent::new(
            EventKind::SequenceLength,
            EventSource::Cc,
            value,
        ));
        thread::sleep(Duration::from_millis(60));
    }
    engine.shutdown();

    assert_eq!(sink.note_ons().len(), sink.note_offs().len());
}

#[test]
fn cc_events_reach_the_sink() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.density = 0.0;
    let engine = Engine::with_seed(config, sink.clone(), 1).unwrap();
    engine.start();

    engine.handle_event(&SemanticEvent::new(
        EventKind::CcParameter("filter_cutoff".to_string()),
        EventSource::Cc,
        99,
    ));
    engine.shutdown();

    let events = sink.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SinkEvent::ControlChange {
            controller: 74,
            value: 99,
            channel: 1
        }
    )));
}

#[test]
fn bar_quantized_scale_change_waits_for_the_wrap() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.bpm = 240.0;
    config.sequencer.sequence_length = 4;
    let engine = Engine::with_seed(config, sink, 1).unwrap();
    engine.start();
    let state = engine.state().clone();

    // Switch to minor mid-bar; the mapper must not change until the
    // position wraps to zero.
    state.set("scale_index", ParamValue::Int(1), "midi");
    thread::sleep(Duration::from_millis(800));
    engine.shutdown();

    // After several bars the change has long been applied.
    assert_eq!(state.get_i64("scale_index"), Some(1));
}

#[test]
fn fugue_mode_runs_polyphonically_under_zero_density() {
    let sink = Arc::new(CollectorSink::new());
    let mut config = base_config();
    config.sequencer.bpm = 300.0;
    config.sequencer.density = 0.0;
    let engine = Engine::with_seed(config, sink.clone(), 42).unwrap();
    engine.start();
    engine
        .state()
        .set("direction_pattern", ParamValue::Direction(nocturne_core::DirectionPattern::Fugue), "midi");

    thread::sleep(Duration::from_millis(1500));
    engine.shutdown();

    assert!(!sink.note_ons().is_empty(), "fugue mode must bypass density");
    assert_eq!(sink.note_ons().len(), sink.note_offs().len());
}
