//! Role hierarchy and role-derived access rules.
//!
//! The hierarchy is a fixed DAG: each role grants a set of lesser roles, and a
//! user's *effective* roles are the transitive closure over their declared
//! roles. The *primary* role is the highest-priority role in the effective set
//! under a fixed ordering, which makes it deterministic regardless of the
//! order roles arrive from the server.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A role recognised by the e-receipt service.
///
/// Ordering follows privilege: `Admin` is the most privileged, `Cashier` the
/// least. Wire strings use the server's `ROLE_*` convention.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    /// Back-office administrator. Grants every other role.
    #[serde(rename = "ROLE_ADMIN")]
    Admin,
    /// Software supplier operating on behalf of merchants.
    #[serde(rename = "ROLE_SUPPLIER")]
    Supplier,
    /// Merchant owning one or more points of sale.
    #[serde(rename = "ROLE_MERCHANT")]
    Merchant,
    /// Cashier bound to a specific merchant and point of sale.
    #[serde(rename = "ROLE_CASHIER")]
    Cashier,
}

/// Fixed priority list used for primary-role selection, most privileged first.
const PRIORITY: [Role; 4] = [Role::Admin, Role::Supplier, Role::Merchant, Role::Cashier];

impl Role {
    /// Wire representation of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ROLE_ADMIN",
            Role::Supplier => "ROLE_SUPPLIER",
            Role::Merchant => "ROLE_MERCHANT",
            Role::Cashier => "ROLE_CASHIER",
        }
    }

    /// Parses a wire role string. Returns `None` for unknown strings; the
    /// caller decides the fallback (the auth layer defaults to `Cashier`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ROLE_ADMIN" => Some(Role::Admin),
            "ROLE_SUPPLIER" => Some(Role::Supplier),
            "ROLE_MERCHANT" => Some(Role::Merchant),
            "ROLE_CASHIER" => Some(Role::Cashier),
            _ => None,
        }
    }

    /// Roles directly granted by this role (one hierarchy step, not the closure).
    #[must_use]
    pub fn grants(self) -> &'static [Role] {
        match self {
            Role::Admin => &[Role::Supplier, Role::Merchant, Role::Cashier],
            Role::Supplier => &[Role::Merchant],
            Role::Merchant => &[Role::Cashier],
            Role::Cashier => &[],
        }
    }
}

/// Scope identifiers available when deciding which role applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleContext {
    pub merchant_id: Option<String>,
    pub cashier_id: Option<String>,
    pub point_of_sale_id: Option<String>,
}

/// Computes the transitive closure of `declared` under the hierarchy.
///
/// The closure is idempotent: `effective_roles(&effective_roles(r)) == effective_roles(r)`.
#[must_use]
pub fn effective_roles(declared: &BTreeSet<Role>) -> BTreeSet<Role> {
    let mut closed: BTreeSet<Role> = declared.clone();
    let mut frontier: Vec<Role> = declared.iter().copied().collect();

    while let Some(role) = frontier.pop() {
        for &granted in role.grants() {
            if closed.insert(granted) {
                frontier.push(granted);
            }
        }
    }

    closed
}

/// Returns true if `required` is in the effective set of `declared`.
#[must_use]
pub fn has_role(declared: &BTreeSet<Role>, required: Role) -> bool {
    effective_roles(declared).contains(&required)
}

/// Returns true if any of `required` is in the effective set of `declared`.
#[must_use]
pub fn has_any_role(declared: &BTreeSet<Role>, required: &[Role]) -> bool {
    let effective = effective_roles(declared);
    required.iter().any(|r| effective.contains(r))
}

/// Selects the primary role: the first entry of the fixed priority list that
/// appears in the effective set. Stable under reordering of the input.
#[must_use]
pub fn primary_role(declared: &BTreeSet<Role>) -> Option<Role> {
    let effective = effective_roles(declared);
    PRIORITY.iter().copied().find(|r| effective.contains(r))
}

/// Picks the highest-priority role consistent with the supplied scope ids.
///
/// Cashier and point-of-sale ids present means a cashier session; a merchant
/// id without a cashier id means a merchant session; otherwise the session is
/// attributed to a supplier.
#[must_use]
pub fn auto_detect_role(ctx: &RoleContext) -> Role {
    if ctx.cashier_id.is_some() && ctx.point_of_sale_id.is_some() {
        Role::Cashier
    } else if ctx.merchant_id.is_some() {
        Role::Merchant
    } else {
        Role::Supplier
    }
}

/// Checks whether a user holding `declared` may switch to `target` given the
/// scope ids in `ctx`.
///
/// Both conditions must hold: the target must be in the effective set, and the
/// context must carry the ids the target role operates under.
#[must_use]
pub fn can_switch_to(declared: &BTreeSet<Role>, target: Role, ctx: &RoleContext) -> bool {
    if !has_role(declared, target) {
        return false;
    }
    match target {
        Role::Cashier => ctx.cashier_id.is_some() && ctx.point_of_sale_id.is_some(),
        Role::Merchant => ctx.merchant_id.is_some(),
        Role::Supplier | Role::Admin => true,
    }
}
