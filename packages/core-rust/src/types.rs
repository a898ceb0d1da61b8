//! Shared data model: queue items, batches, token and user records.
//!
//! Everything here is plain serde data. Persisted representations use
//! camelCase field names to stay byte-compatible with the JSON layout of the
//! original TypeScript SDK.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::ConflictStrategy;
use crate::roles::Role;

/// Resource a queue operation targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Resource {
    Receipt,
    Cashier,
    Merchant,
    CashRegister,
    PointOfSale,
    Pem,
}

impl Resource {
    /// Wire/storage name of the resource.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Receipt => "receipt",
            Resource::Cashier => "cashier",
            Resource::Merchant => "merchant",
            Resource::CashRegister => "cash-register",
            Resource::PointOfSale => "point-of-sale",
            Resource::Pem => "pem",
        }
    }

    /// All resources, in a fixed order. Used to size per-resource tables.
    pub const ALL: [Resource; 6] = [
        Resource::Receipt,
        Resource::Cashier,
        Resource::Merchant,
        Resource::CashRegister,
        Resource::PointOfSale,
        Resource::Pem,
    ];
}

/// Kind of write operation carried by a queue item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Custom,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Custom => "custom",
        }
    }
}

/// Dispatch priority. Declaration order defines rank: `Critical` dispatches
/// before `High`, and so on. Derived `Ord` relies on this order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank, 0 = most urgent.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub const ALL: [Priority; 4] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];
}

/// Lifecycle status of a queue item. Transitions are validated by
/// [`ItemStatus::can_transition`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
    Scheduled,
}

impl ItemStatus {
    /// A dead item is terminal and will never be dispatched again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Dead)
    }

    /// Valid edges of the status machine:
    /// `pending -> processing -> {completed, failed}`,
    /// `failed -> {pending, dead}`, `pending <-> scheduled`.
    #[must_use]
    pub fn can_transition(self, to: ItemStatus) -> bool {
        matches!(
            (self, to),
            (ItemStatus::Pending, ItemStatus::Processing)
                | (ItemStatus::Pending, ItemStatus::Scheduled)
                | (ItemStatus::Scheduled, ItemStatus::Pending)
                | (ItemStatus::Processing, ItemStatus::Completed)
                | (ItemStatus::Processing, ItemStatus::Failed)
                | (ItemStatus::Failed, ItemStatus::Pending)
                | (ItemStatus::Failed, ItemStatus::Dead)
                | (ItemStatus::Pending, ItemStatus::Dead)
        )
    }
}

/// A single queued write operation.
///
/// The `payload` is opaque to the queue; processors interpret it. Timestamps
/// are milliseconds since Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Globally unique, immutable id.
    pub id: String,
    pub operation: OperationKind,
    pub resource: Resource,
    pub payload: Value,
    pub priority: Priority,
    pub status: ItemStatus,
    pub created_at: i64,
    pub updated_at: i64,
    /// When set, the item is not ready before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Local id assigned optimistically before the server acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
    /// Ids of items that must complete before this one is dispatched.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Per-item override of the configured conflict strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_override: Option<ConflictStrategy>,
    /// Caller-supplied opaque metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl QueueItem {
    /// Dispatch-order key: priority rank first, then arrival time, then id as
    /// a tiebreaker so the ordering is total.
    #[must_use]
    pub fn order_key(&self) -> (u8, i64, String) {
        (self.priority.rank(), self.created_at, self.id.clone())
    }

    /// True when the item may be handed to a processor at `now`, ignoring
    /// dependency state (the queue checks dependencies separately).
    #[must_use]
    pub fn is_ready_at(&self, now: i64) -> bool {
        self.status == ItemStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// How the items of a batch are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchMode {
    /// One item at a time, in queue order.
    Sequential,
    /// Concurrently, never more than `max_concurrency` in flight.
    Parallel { max_concurrency: usize },
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A planned group of queue items dispatched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    /// Item ids in dispatch order.
    pub item_ids: Vec<String>,
    pub mode: BatchMode,
    pub status: BatchStatus,
    pub created_at: i64,
    /// Grouping key: `resource|priority|window`, with `*` for unused parts.
    pub group_key: String,
}

/// Authenticated user, as composed from the login JWT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Declared roles; effective roles are derived via the hierarchy closure.
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_of_sale_id: Option<String>,
    pub session_id: String,
    pub last_login: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub attributes: Value,
}

/// Persisted authentication material. Stored encrypted at rest when storage
/// encryption is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    /// May be empty when the server issued no refresh token.
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute expiry, milliseconds since epoch.
    pub expires_at: i64,
    pub token_type: String,
    pub user: UserRecord,
    pub device_id: String,
    pub encrypted_at: i64,
    /// Schema version of this record layout.
    pub version: String,
}

impl TokenRecord {
    /// Current schema version written by this SDK.
    pub const SCHEMA_VERSION: &'static str = "1.0.0";

    /// True when the access token is past its absolute expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}
