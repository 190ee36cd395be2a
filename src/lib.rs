pub mod audit;
pub mod config;
pub mod dataset;
pub mod fairness;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod process;
pub mod recipe;
pub mod security;
pub mod stages;
pub mod validation;

pub use pipeline::{PipelineExecutor, PipelineReport, StageRegistry, StageStatus};
pub use recipe::Recipe;
