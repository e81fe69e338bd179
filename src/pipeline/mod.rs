//! The Forge stage pipeline.
//!
//! A [`ForgeProject`] moves through the five [`Stage`]s strictly in order,
//! one quality-gated step at a time.

pub mod controller;
pub mod project;
pub mod stage;

pub use controller::{AdvanceFailure, AdvanceOutcome, PipelineSettings, StagePipeline};
pub use project::{
    ArtifactExport, ExportFormat, ExportedStage, ForgeProject, ProjectStatus, StageArtifact,
};
pub use stage::Stage;
