use serde::{Deserialize, Serialize};

use crate::auth::Role;

pub const ANONYMOUS_PREFIX: &str = "anon:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Registered,
    Anonymous,
}

/// The identity every mutation and subscription is evaluated against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub kind: ActorKind,
}

impl ActorIdentity {
    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            user_id: user_id.clone(),
            username: user_id,
            role: Role::User,
            kind: ActorKind::Registered,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// An identified but unauthenticated device. Returns `None` for a blank device id.
    pub fn anonymous(device_id: &str) -> Option<Self> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return None;
        }
        let user_id = format!("{ANONYMOUS_PREFIX}{device_id}");
        Some(Self {
            user_id: user_id.clone(),
            username: user_id,
            role: Role::Anonymous,
            kind: ActorKind::Anonymous,
        })
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == ActorKind::Anonymous
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    pub fn can_moderate(&self) -> bool {
        self.role.can_moderate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_identity_is_prefixed_and_unprivileged() {
        let actor = ActorIdentity::anonymous(" device-7 ").unwrap();
        assert_eq!(actor.user_id, "anon:device-7");
        assert!(actor.is_anonymous());
        assert!(!actor.can_moderate());
        assert!(ActorIdentity::anonymous("   ").is_none());
    }
}
