pub mod config;
pub mod resource;
pub mod types;

pub use config::{CalculatorKind, SchedulerConfig};
pub use resource::{DefaultResourceCalculator, DominantResourceCalculator, ResourceCalculator};
pub use types::*;
