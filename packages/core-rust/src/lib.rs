//! A-Cube SDK core -- queue model, role hierarchy, retry and conflict rules.
//!
//! This crate provides the foundation layer for the e-receipt SDK:
//!
//! - **Clock** ([`clock`]): injectable time source for deterministic tests
//! - **Types** ([`types`]): `QueueItem`, `Batch`, `TokenRecord`, `UserRecord`
//! - **Queue** ([`queue`]): bounded priority-ordered item index
//! - **Roles** ([`roles`]): hierarchy closure, primary-role selection, scope rules
//! - **Retry** ([`retry`]): backoff policies and error-code classification
//! - **Conflict** ([`conflict`]): conflict classes, merge rules, confidence scoring
//! - **Planner** ([`planner`]): grouping of ready items into batches

pub mod clock;
pub mod conflict;
pub mod planner;
pub mod queue;
pub mod retry;
pub mod roles;
pub mod types;

// Clock
pub use clock::{ClockSource, ManualClock, SystemClock};

// Conflict
pub use conflict::{
    classify_conflict, resolve, ConflictClass, ConflictReport, ConflictStrategy, DataSource,
    FieldRule, MergeInput, MergeRules, Resolution,
};

// Planner
pub use planner::{BatchPlanner, PlannerConfig};

// Queue
pub use queue::{EnqueueOutcome, QueueFull, QueueState, TransitionError};

// Retry
pub use retry::{classify_error_code, Backoff, ErrorDisposition, RetryPolicy};

// Roles
pub use roles::{
    auto_detect_role, can_switch_to, effective_roles, has_any_role, has_role, primary_role,
    Role, RoleContext,
};

// Types
pub use types::{
    Batch, BatchMode, BatchStatus, ItemStatus, OperationKind, Priority, QueueItem, Resource,
    TokenRecord, UserRecord,
};
