use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    User,
    Moderator,
    Admin,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anonymous" | "guest" => Some(Role::Anonymous),
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }

    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Moderator | Role::Admin | Role::System)
    }

    /// Administrative roles bypass per-user channel and row ownership checks.
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::System)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_guest_alias_and_ignores_case() {
        assert_eq!(Role::parse("Guest"), Some(Role::Anonymous));
        assert_eq!(Role::parse(" ADMIN "), Some(Role::Admin));
        assert_eq!(Role::parse("root"), None);
    }
}
