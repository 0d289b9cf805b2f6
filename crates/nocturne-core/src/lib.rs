//! Nocturne core - the generative MIDI engine.
//!
//! This crate is the timing and generative pipeline behind the
//! `nocturne` binary:
//!
//! - **State** - observable, domain-validated parameter store
//! - **Timing** - high-resolution tick clock with swing and drift
//!   correction
//! - **Sequencer** - step advancement, gate chain, direction patterns
//! - **Fugue** - contrapuntal multi-voice generation and playback
//! - **Scheduler** - guaranteed note-off delivery
//! - **Actions** - semantic event dispatch
//! - **Mutation** - idle-gated parameter drift
//! - **Idle** - ambient-profile management
//! - **Engine** - composition root and lifecycle
//!
//! # Architecture
//!
//! All runtime parameters live in the shared [`State`] store; change
//! listeners keep the clock and sequencer in sync with writes from the
//! controller, the mutation engine, and idle transitions. The clock
//! thread drives the sequencer, whose notes flow through the
//! [`NoteScheduler`] so that every note-on is paired with exactly one
//! note-off, shutdown included. MIDI I/O stays behind the [`MidiSink`]
//! trait; the binary provides the real ports.

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fugue;
pub mod idle;
pub mod mutation;
pub mod output;
pub mod scale;
pub mod scheduler;
pub mod sequencer;
pub mod state;
pub mod timing;

pub use actions::{ActionHandler, CcCallback};
pub use config::{Config, IdleConfig, MappingConfig, MidiConfig, MutationConfig, SequencerConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{ControlChangeEvent, EventKind, EventSource, NoteEvent, SemanticEvent, StateChange};
pub use fugue::{FugueEngine, FugueNote, FugueParams, FuguePlayback, Phrase, Score};
pub use idle::{ambient_profile, ambient_profile_names, IdleGate, IdleManager, InteractionSink};
pub use mutation::{MutationEngine, MutationEvent, MutationRule};
pub use output::{CollectorSink, MidiSink, NullSink, SinkEvent};
pub use scale::{scale_intervals, ScaleMapper, SCALES};
pub use scheduler::NoteScheduler;
pub use sequencer::{pattern_preset, probability_preset, Sequencer};
pub use state::{DirectionPattern, ParamValue, QuantizeMode, State};
pub use timing::{HighResClock, TickEvent, DEFAULT_PPQ};
