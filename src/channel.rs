//! Tenant-scoped channel names.
//!
//! Every channel name carries its tenant as a `tenant:` prefix. Qualification
//! happens once, at the subscribe/publish boundary; everything downstream
//! works with already-qualified [`ChannelName`] values, so cross-tenant
//! delivery cannot be expressed at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_CHANNEL_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel {channel:?} is not accessible from tenant {tenant:?}")]
    Forbidden { channel: String, tenant: String },

    #[error("Invalid channel name: {0}")]
    InvalidName(String),
}

/// A fully-qualified, tenant-prefixed channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Qualify a raw channel name against a connection's tenant.
    ///
    /// Bare names are prefixed with the tenant. A name that already carries
    /// a prefix is accepted only when the prefix matches the tenant; any
    /// other prefix is rejected without mutating state.
    pub fn qualify(raw: &str, tenant_id: &str) -> Result<Self, ChannelError> {
        if raw.is_empty() || raw.len() > MAX_CHANNEL_NAME_LEN {
            return Err(ChannelError::InvalidName(raw.to_string()));
        }
        if !is_valid_segment(tenant_id) {
            return Err(ChannelError::InvalidName(format!("tenant {tenant_id:?}")));
        }

        match raw.split_once(':') {
            Some((prefix, rest)) => {
                if rest.is_empty() || !rest.split(':').all(is_valid_segment) {
                    return Err(ChannelError::InvalidName(raw.to_string()));
                }
                if prefix == tenant_id {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(ChannelError::Forbidden {
                        channel: raw.to_string(),
                        tenant: tenant_id.to_string(),
                    })
                }
            }
            None => {
                if !is_valid_segment(raw) {
                    return Err(ChannelError::InvalidName(raw.to_string()));
                }
                Ok(Self(format!("{tenant_id}:{raw}")))
            }
        }
    }

    /// Parse an already-qualified name (server-side ingress, peer events).
    pub fn parse(full: &str) -> Result<Self, ChannelError> {
        let Some((tenant, _)) = full.split_once(':') else {
            return Err(ChannelError::InvalidName(full.to_string()));
        };
        Self::qualify(full, tenant)
    }

    /// The tenant segment of the name.
    pub fn tenant_id(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ChannelError> for crate::error::AppError {
    fn from(e: ChannelError) -> Self {
        match &e {
            ChannelError::Forbidden { .. } => crate::error::AppError::Forbidden(e.to_string()),
            ChannelError::InvalidName(_) => crate::error::AppError::Validation(e.to_string()),
        }
    }
}

/// A segment may contain alphanumerics, dash, underscore, and dot.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_is_prefixed() {
        let channel = ChannelName::qualify("metrics", "t1").unwrap();
        assert_eq!(channel.as_str(), "t1:metrics");
        assert_eq!(channel.tenant_id(), "t1");
    }

    #[test]
    fn test_own_tenant_prefix_is_kept() {
        let channel = ChannelName::qualify("t1:metrics", "t1").unwrap();
        assert_eq!(channel.as_str(), "t1:metrics");
    }

    #[test]
    fn test_foreign_tenant_prefix_is_forbidden() {
        let result = ChannelName::qualify("t1:metrics", "t2");
        assert!(matches!(result, Err(ChannelError::Forbidden { .. })));
    }

    #[test]
    fn test_nested_segments() {
        let channel = ChannelName::qualify("t1:line:7", "t1").unwrap();
        assert_eq!(channel.as_str(), "t1:line:7");
        assert_eq!(channel.tenant_id(), "t1");
    }

    #[test]
    fn test_invalid_names() {
        assert!(ChannelName::qualify("", "t1").is_err());
        assert!(ChannelName::qualify("has space", "t1").is_err());
        assert!(ChannelName::qualify("slash/path", "t1").is_err());
        assert!(ChannelName::qualify("t1:", "t1").is_err());
        assert!(ChannelName::qualify(&"a".repeat(129), "t1").is_err());
    }

    #[test]
    fn test_parse_qualified() {
        let channel = ChannelName::parse("t1:alerts").unwrap();
        assert_eq!(channel.tenant_id(), "t1");
        assert!(ChannelName::parse("bare-name").is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let channel = ChannelName::qualify("alerts", "t1").unwrap();
        let json = serde_json::to_string(&channel).unwrap();
        assert_eq!(json, "\"t1:alerts\"");

        let parsed: ChannelName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, channel);
    }
}
