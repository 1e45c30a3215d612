use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Role a card is issued for.
///
/// The role only selects a row of the [`RolePolicy`] table; it carries no
/// behaviour of its own so the policy can change without touching the type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    EnumIter,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Administrative staff.
    Admin,
    /// Long-term holders.
    Permanent,
    /// Contractors and short engagements.
    Temporary,
    /// Visitors.
    Guest,
}

/// One row of the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRule {
    /// Lifetime of a card when issuance does not specify one, in seconds.
    pub default_ttl: u64,
    /// Interval between secret rotations, in seconds.
    pub rotation_interval: u64,
}

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Per-role validity and rotation policy, kept as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePolicy {
    /// Rule for [`Role::Admin`].
    pub admin: RoleRule,
    /// Rule for [`Role::Permanent`].
    pub permanent: RoleRule,
    /// Rule for [`Role::Temporary`].
    pub temporary: RoleRule,
    /// Rule for [`Role::Guest`].
    pub guest: RoleRule,
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self {
            admin: RoleRule {
                default_ttl: 365 * DAY,
                rotation_interval: 7 * DAY,
            },
            permanent: RoleRule {
                default_ttl: 90 * DAY,
                rotation_interval: 30 * DAY,
            },
            temporary: RoleRule {
                default_ttl: 7 * DAY,
                rotation_interval: 3 * DAY,
            },
            guest: RoleRule {
                default_ttl: DAY,
                rotation_interval: 12 * HOUR,
            },
        }
    }
}

impl RolePolicy {
    /// Returns the rule for `role`.
    #[must_use]
    pub const fn rule(&self, role: Role) -> RoleRule {
        match role {
            Role::Admin => self.admin,
            Role::Permanent => self.permanent,
            Role::Temporary => self.temporary,
            Role::Guest => self.guest,
        }
    }

    /// Default card lifetime for `role`, in seconds.
    #[must_use]
    pub const fn default_ttl(&self, role: Role) -> u64 {
        self.rule(role).default_ttl
    }

    /// Rotation interval for `role`, in seconds.
    #[must_use]
    pub const fn rotation_interval(&self, role: Role) -> u64 {
        self.rule(role).rotation_interval
    }

    /// Next rotation deadline for a card of `role` rotated (or issued) at `now`.
    #[must_use]
    pub const fn next_rotation_at(&self, role: Role, now: u64) -> u64 {
        now.saturating_add(self.rotation_interval(role))
    }
}
