use serde::{Deserialize, Serialize};

/// A user's presence status within one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, PresenceStatus::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&PresenceStatus::Online).unwrap(),
            "\"online\""
        );
        let parsed: PresenceStatus = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(parsed, PresenceStatus::Busy);
    }

    #[test]
    fn test_is_online() {
        assert!(PresenceStatus::Online.is_online());
        assert!(PresenceStatus::Away.is_online());
        assert!(PresenceStatus::Busy.is_online());
        assert!(!PresenceStatus::Offline.is_online());
    }
}
