//! Bootline orchestrator
//!
//! This crate provides:
//! - The resumable stage `Pipeline` and its report
//! - Stage definitions for primary and secondary nodes
//! - First-boot detection
//! - The `bootline` command line

pub mod cli;
pub mod connector;
pub mod detect;
pub mod pipeline;
pub mod stages;

#[cfg(test)]
mod testing;

pub use cli::Cli;
pub use connector::{ClusterConnector, KubeconfigConnector, StaticConnector};
pub use detect::{detect, FirstBootStatus, MembershipProbe, NodeMembershipProbe, COMPLETION_STAGE};
pub use pipeline::{Pipeline, PipelineReport, Stage, StageAction, StageOutcome};
pub use stages::{build_stages, steps_for, StageContext, Step};
