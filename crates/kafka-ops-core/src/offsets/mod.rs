//! Consumer group offset management.
//!
//! Resetting a group's offsets takes three steps:
//! 1. [`build_plan`] resolves a strategy against live cluster state
//! 2. [`validate_plan`] clamps the plan to fresh partition watermarks
//! 3. [`apply_plan`] commits the plan as one batch for the group
//!
//! A dry run stops after step 2 and renders the plan with [`render_plan`].

pub mod apply;
pub mod lag;
pub mod plan;
pub mod render;
pub mod strategy;
pub mod validate;

pub use apply::{apply_plan, AppliedOffset, ApplyReport, OffsetApplier};
pub use lag::{describe_group_lag, GroupLagReport, PartitionLag};
pub use plan::{build_plan, OffsetPlan, OffsetPlanBuilder, PlanTarget, PlannedOffset};
pub use render::{render_plan, PlanFormat};
pub use strategy::{parse_duration, OffsetResetStrategy, WatermarkAnchor};
pub use validate::{
    validate_against, validate_plan, ClampBound, OffsetPlanValidator, PlanWarning, ValidatedPlan,
};
