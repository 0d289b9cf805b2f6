//! Parameter value types, domains, and the default parameter table.

use serde::Deserialize;

/// Step advancement order for the sequencer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPattern {
    Forward,
    Backward,
    PingPong,
    Random,
    Fugue,
}

impl DirectionPattern {
    /// All patterns in bucket order, used for CC-value mapping.
    pub const ALL: [DirectionPattern; 5] = [
        DirectionPattern::Forward,
        DirectionPattern::Backward,
        DirectionPattern::PingPong,
        DirectionPattern::Random,
        DirectionPattern::Fugue,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "forward" => Some(DirectionPattern::Forward),
            "backward" => Some(DirectionPattern::Backward),
            "ping_pong" => Some(DirectionPattern::PingPong),
            "random" => Some(DirectionPattern::Random),
            "fugue" => Some(DirectionPattern::Fugue),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DirectionPattern::Forward => "forward",
            DirectionPattern::Backward => "backward",
            DirectionPattern::PingPong => "ping_pong",
            DirectionPattern::Random => "random",
            DirectionPattern::Fugue => "fugue",
        }
    }
}

impl std::fmt::Display for DirectionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// When scale and root changes take effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizeMode {
    /// Applied the moment the step position returns to 0.
    Bar,
    /// Applied before the next step.
    Immediate,
}

/// A typed parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Direction(DirectionPattern),
    Quantize(QuantizeMode),
    FloatList(Vec<f64>),
    BoolList(Vec<bool>),
}

impl ParamValue {
    /// Numeric view: floats as-is, ints widened. None for everything else.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(v.round() as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_direction(&self) -> Option<DirectionPattern> {
        match self {
            ParamValue::Direction(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_quantize(&self) -> Option<QuantizeMode> {
        match self {
            ParamValue::Quantize(q) => Some(*q),
            _ => None,
        }
    }

    pub fn as_float_list(&self) -> Option<&[f64]> {
        match self {
            ParamValue::FloatList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool_list(&self) -> Option<&[bool]> {
        match self {
            ParamValue::BoolList(v) => Some(v),
            _ => None,
        }
    }
}

/// The validated domain of a parameter.
#[derive(Clone, Copy, Debug)]
pub enum ParamDomain {
    /// Clamped to [min, max].
    Float { min: f64, max: f64 },
    /// Clamped to [min, max]; float writes are rounded.
    Int { min: i64, max: i64 },
    Bool,
    Direction,
    Quantize,
    /// Per-element clamp to [min, max]; length coupled to
    /// `sequence_length` (truncated, or padded with the current
    /// `note_probability`).
    FloatList { min: f64, max: f64 },
    /// Length coupled to `sequence_length` (padded with `true`).
    BoolList,
}

/// A parameter's domain plus its startup default. Optional parameters
/// (the per-step lists) have no default and start unset.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub domain: ParamDomain,
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    fn new(name: &'static str, domain: ParamDomain, default: ParamValue) -> Self {
        Self {
            name,
            domain,
            default: Some(default),
        }
    }

    fn optional(name: &'static str, domain: ParamDomain) -> Self {
        Self {
            name,
            domain,
            default: None,
        }
    }
}

/// The full parameter table.
///
/// `n_scales` bounds `scale_index`; it comes from the configured scale
/// list, so the table is built once at engine startup.
pub fn default_param_specs(n_scales: usize) -> Vec<ParamSpec> {
    use ParamDomain::*;
    use ParamValue as V;

    vec![
        ParamSpec::new("bpm", Float { min: 1.0, max: 300.0 }, V::Float(110.0)),
        ParamSpec::new("swing", Float { min: 0.0, max: 0.5 }, V::Float(0.12)),
        ParamSpec::new("density", Float { min: 0.0, max: 1.0 }, V::Float(0.85)),
        ParamSpec::new(
            "note_probability",
            Float { min: 0.0, max: 1.0 },
            V::Float(0.9),
        ),
        ParamSpec::new("sequence_length", Int { min: 1, max: 32 }, V::Int(8)),
        ParamSpec::new("step_position", Int { min: 0, max: 31 }, V::Int(0)),
        ParamSpec::new(
            "scale_index",
            Int {
                min: 0,
                max: n_scales.saturating_sub(1) as i64,
            },
            V::Int(0),
        ),
        ParamSpec::new("root_note", Int { min: 0, max: 127 }, V::Int(60)),
        ParamSpec::new("gate_length", Float { min: 0.05, max: 1.0 }, V::Float(0.8)),
        ParamSpec::new("base_velocity", Int { min: 1, max: 127 }, V::Int(80)),
        ParamSpec::new("velocity_range", Int { min: 0, max: 127 }, V::Int(40)),
        ParamSpec::optional("step_probabilities", FloatList { min: 0.0, max: 1.0 }),
        ParamSpec::optional("step_pattern", BoolList),
        ParamSpec::new(
            "direction_pattern",
            Direction,
            V::Direction(DirectionPattern::Forward),
        ),
        ParamSpec::new("voices", Int { min: 1, max: 4 }, V::Int(3)),
        ParamSpec::new(
            "quantize_scale_changes",
            Quantize,
            V::Quantize(QuantizeMode::Bar),
        ),
        ParamSpec::new("idle_mode", Bool, V::Bool(false)),
        ParamSpec::new("chaos_lock", Bool, V::Bool(false)),
        ParamSpec::new("drift", Float { min: -0.2, max: 0.2 }, V::Float(0.0)),
        ParamSpec::new("filter_cutoff", Int { min: 0, max: 127 }, V::Int(64)),
        ParamSpec::new("reverb_mix", Int { min: 0, max: 127 }, V::Int(32)),
        ParamSpec::new("master_volume", Int { min: 0, max: 127 }, V::Int(100)),
        ParamSpec::new("mode", Int { min: 0, max: 7 }, V::Int(0)),
        ParamSpec::new("palette", Int { min: 0, max: 7 }, V::Int(0)),
    ]
}
