//! Caller identity
//!
//! Authentication happens upstream; the gateway forwards the caller as
//! `X-Actor-Id` and `X-Actor-Role` headers.

use std::fmt;
use std::str::FromStr;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Operator,
    Approver,
    Admin,
    Governance,
    System,
}

impl ActorRole {
    pub fn can_override(self) -> bool {
        matches!(self, ActorRole::Admin | ActorRole::Governance)
    }

    pub fn can_approve(self) -> bool {
        matches!(
            self,
            ActorRole::Approver | ActorRole::Admin | ActorRole::Governance
        )
    }
}

impl FromStr for ActorRole {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operator" => Ok(ActorRole::Operator),
            "approver" => Ok(ActorRole::Approver),
            "admin" => Ok(ActorRole::Admin),
            "governance" => Ok(ActorRole::Governance),
            other => Err(EngineError::Unauthorized(format!("unknown role {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Identity used for engine-initiated work such as auto-release and polling.
    pub fn system() -> Self {
        Self::new("system", ActorRole::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let id = header(ACTOR_ID_HEADER)
            .ok_or_else(|| EngineError::Unauthorized("missing X-Actor-Id header".to_string()))?;
        let role = match header(ACTOR_ROLE_HEADER) {
            Some(role) => role.parse()?,
            None => ActorRole::Operator,
        };

        Ok(Actor::new(id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("Governance".parse::<ActorRole>().unwrap(), ActorRole::Governance);
        assert!("system".parse::<ActorRole>().is_err());
        assert!("root".parse::<ActorRole>().is_err());
    }

    #[test]
    fn only_admin_and_governance_override() {
        assert!(ActorRole::Admin.can_override());
        assert!(ActorRole::Governance.can_override());
        assert!(!ActorRole::Approver.can_override());
        assert!(!ActorRole::Operator.can_override());
        assert!(!ActorRole::System.can_override());
    }
}
