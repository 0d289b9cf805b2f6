//! Engine configuration.
//!
//! Configuration is TOML, loaded once at startup. Every section has
//! serde defaults so a partial file (or none at all) yields a playable
//! engine. Validation happens in [`Config::validate`]; the engine
//! refuses to start on a bad config rather than limping along.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::idle::ambient_profile_names;
use crate::scale::scale_intervals;
use crate::state::{DirectionPattern, ParamValue, QuantizeMode};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub midi: MidiConfig,
    pub sequencer: SequencerConfig,
    /// Ordered scale list; `scale_index` selects into it.
    pub scales: Vec<String>,
    pub mutation: MutationConfig,
    pub idle: IdleConfig,
    /// Raw note/CC to semantic-action routing, consumed by the input
    /// adapter.
    pub mapping: MappingConfig,
    /// Outbound CC routing: state parameter name to controller number.
    pub cc_out: HashMap<String, u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            midi: MidiConfig::default(),
            sequencer: SequencerConfig::default(),
            scales: default_scales(),
            mutation: MutationConfig::default(),
            idle: IdleConfig::default(),
            mapping: MappingConfig::default(),
            cc_out: default_cc_out(),
        }
    }
}

fn default_scales() -> Vec<String> {
    ["major", "minor", "pentatonic_major", "pentatonic_minor", "dorian"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cc_out() -> HashMap<String, u8> {
    let mut map = HashMap::new();
    map.insert("filter_cutoff".to_string(), 74);
    map.insert("reverb_mix".to_string(), 91);
    map.insert("master_volume".to_string(), 7);
    map
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from a file, falling back to defaults when it is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            return Err(Error::Config("at least one scale must be listed".to_string()));
        }
        for name in &self.scales {
            if scale_intervals(name).is_none() {
                return Err(Error::UnknownScale(name.clone()));
            }
        }

        if !ambient_profile_names().contains(&self.idle.ambient_profile.as_str()) {
            return Err(Error::UnknownAmbientProfile(self.idle.ambient_profile.clone()));
        }

        if self.mutation.interval_min_s <= 0.0
            || self.mutation.interval_max_s < self.mutation.interval_min_s
        {
            return Err(Error::Config(format!(
                "mutation interval range {}..{} is invalid",
                self.mutation.interval_min_s, self.mutation.interval_max_s
            )));
        }
        for rule in &self.mutation.rules {
            if rule.weight < 0.0 {
                return Err(Error::InvalidMutationRule {
                    parameter: rule.parameter.clone(),
                    reason: "weight must be >= 0".to_string(),
                });
            }
            if rule.delta_range.0 > rule.delta_range.1 {
                return Err(Error::InvalidMutationRule {
                    parameter: rule.parameter.clone(),
                    reason: "delta range is reversed".to_string(),
                });
            }
        }

        for action in self.mapping.buttons.values().chain(self.mapping.ccs.values()) {
            if crate::events::EventKind::from_action(action).is_none() {
                return Err(Error::Config(format!("unknown mapped action '{action}'")));
            }
        }

        Ok(())
    }

    /// The sequencer section as state writes, applied at startup with
    /// source `"config"`.
    pub fn state_defaults(&self) -> Vec<(&'static str, ParamValue)> {
        let seq = &self.sequencer;
        let mut updates = vec![
            ("bpm", ParamValue::Float(seq.bpm)),
            ("swing", ParamValue::Float(seq.swing)),
            ("density", ParamValue::Float(seq.density)),
            ("sequence_length", ParamValue::Int(seq.sequence_length as i64)),
            ("gate_length", ParamValue::Float(seq.gate_length)),
            ("base_velocity", ParamValue::Int(seq.base_velocity as i64)),
            ("velocity_range", ParamValue::Int(seq.velocity_range as i64)),
            ("note_probability", ParamValue::Float(seq.note_probability)),
            ("root_note", ParamValue::Int(seq.root_note as i64)),
            ("direction_pattern", ParamValue::Direction(seq.direction_pattern)),
            ("voices", ParamValue::Int(seq.voices as i64)),
            (
                "quantize_scale_changes",
                ParamValue::Quantize(seq.quantize_scale_changes),
            ),
        ];
        if let Some(probs) = &seq.step_probabilities {
            updates.push(("step_probabilities", ParamValue::FloatList(probs.clone())));
        }
        if let Some(pattern) = &seq.step_pattern {
            updates.push(("step_pattern", ParamValue::BoolList(pattern.clone())));
        }
        updates
    }
}

/// MIDI port configuration (used by the CLI adapters).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Input port name substring, "auto", or empty to disable input.
    pub input_port: String,
    /// Output port name substring, "auto", or empty to disable output.
    pub output_port: String,
    /// 1-based listen channel.
    pub input_channel: u8,
    /// 1-based emit channel.
    pub output_channel: u8,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            input_port: "auto".to_string(),
            output_port: String::new(),
            input_channel: 1,
            output_channel: 1,
        }
    }
}

/// Sequencer startup defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub bpm: f64,
    pub swing: f64,
    pub density: f64,
    pub sequence_length: u32,
    pub gate_length: f64,
    pub base_velocity: u8,
    pub velocity_range: u8,
    pub note_probability: f64,
    pub root_note: u8,
    pub step_probabilities: Option<Vec<f64>>,
    pub step_pattern: Option<Vec<bool>>,
    pub direction_pattern: DirectionPattern,
    pub voices: u32,
    pub quantize_scale_changes: QuantizeMode,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            bpm: 110.0,
            swing: 0.12,
            density: 0.85,
            sequence_length: 8,
            gate_length: 0.8,
            base_velocity: 80,
            velocity_range: 40,
            note_probability: 0.9,
            root_note: 60,
            step_probabilities: None,
            step_pattern: None,
            direction_pattern: DirectionPattern::Forward,
            voices: 3,
            quantize_scale_changes: QuantizeMode::Bar,
        }
    }
}

/// One configured mutation rule.
#[derive(Debug, Clone, Deserialize)]
pub struct MutationRuleConfig {
    pub parameter: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub delta_range: (f64, f64),
    #[serde(default = "default_delta_scale")]
    pub delta_scale: f64,
    #[serde(default)]
    pub description: String,
}

fn default_weight() -> f64 {
    1.0
}

fn default_delta_scale() -> f64 {
    1.0
}

/// Mutation engine configuration. An empty `rules` list means the
/// built-in rule set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub interval_min_s: f64,
    pub interval_max_s: f64,
    pub max_changes_per_cycle: usize,
    pub rules: Vec<MutationRuleConfig>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            interval_min_s: 120.0,
            interval_max_s: 240.0,
            max_changes_per_cycle: 2,
            rules: Vec::new(),
        }
    }
}

/// Idle mode configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub timeout_ms: u64,
    pub ambient_profile: String,
    /// BPM fade length entering idle.
    pub fade_in_ms: u64,
    /// BPM fade length leaving idle.
    pub fade_out_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            ambient_profile: "slow_fade".to_string(),
            fade_in_ms: 4_000,
            fade_out_ms: 800,
        }
    }
}

/// Raw-MIDI to semantic-action routing.
///
/// Button keys may be single notes (`"60"`) or ranges (`"60-69"`);
/// CC keys are single controller numbers. Values are action names
/// resolved through [`crate::events::EventKind::from_action`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub buttons: HashMap<String, String>,
    pub ccs: HashMap<String, String>,
}
