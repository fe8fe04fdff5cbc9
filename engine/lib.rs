#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod bootstrap;
pub mod config;
pub mod data;
pub mod history;
pub mod intervention;
pub mod model;
pub mod pool;
pub mod restriction;
pub mod risk;
pub mod sampler;
pub mod simulate;
pub mod spec;

pub use intervention::{Intervention, InterventionRule, TreatmentRule};
pub use model::FittedModels;
pub use pool::Pool;
pub use simulate::{Estimate, SimulationOutcome, Simulator, simulate};
pub use spec::SimulationSpec;
