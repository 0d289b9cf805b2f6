//! Observable parameter store.
//!
//! The state store is the single broadly-shared resource in the
//! engine. All runtime parameters live here as typed, domain-validated
//! values; every component reads through [`State::get`] and mutates
//! through [`State::set`] / [`State::update_multiple`], and change
//! listeners observe every accepted write.
//!
//! - [`ParamValue`] / [`ParamDomain`] - typed values and their domains
//! - [`State`] - the store itself
//! - [`DirectionPattern`] / [`QuantizeMode`] - enum-valued parameters

mod model;
mod store;

pub use model::{
    default_param_specs, DirectionPattern, ParamDomain, ParamSpec, ParamValue, QuantizeMode,
};
pub use store::{ListenerId, State};
