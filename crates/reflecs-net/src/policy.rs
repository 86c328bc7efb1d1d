//! Authority resolution for conflicting writes.

use std::fmt;

use reflecs_ecs::{Entity, TypeHandle};
use serde::{Deserialize, Serialize};

/// Which side of the connection this world plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetRole {
    #[default]
    Server,
    Client,
}

impl NetRole {
    /// Parse `server` or `client`, ignoring case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "server" => Some(Self::Server),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

impl fmt::Display for NetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// Outcome of an authority check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    AcceptRemote,
    KeepLocal,
}

/// A remote record for a component that was also written locally since
/// the last apply.
#[derive(Clone, Copy, Debug)]
pub struct Conflict<'a> {
    pub entity: Entity,
    pub handle: TypeHandle,
    pub type_path: &'a str,
    pub role: NetRole,
}

/// Decides who wins when local and remote writes collide.
pub trait AuthorityPolicy: Send + Sync {
    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution;
}

/// The server's value wins: a server keeps its own write, a client takes
/// the server's.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerAuthoritative;

impl AuthorityPolicy for ServerAuthoritative {
    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution {
        match conflict.role {
            NetRole::Server => Resolution::KeepLocal,
            NetRole::Client => Resolution::AcceptRemote,
        }
    }
}

/// Local writes always win (client-side prediction).
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferLocal;

impl AuthorityPolicy for PreferLocal {
    fn resolve(&self, _: &Conflict<'_>) -> Resolution {
        Resolution::KeepLocal
    }
}

/// Remote writes always win.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferRemote;

impl AuthorityPolicy for PreferRemote {
    fn resolve(&self, _: &Conflict<'_>) -> Resolution {
        Resolution::AcceptRemote
    }
}

impl<F> AuthorityPolicy for F
where
    F: Fn(&Conflict<'_>) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict<'_>) -> Resolution {
        self(conflict)
    }
}

/// Serializable choice among the built-in policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    #[default]
    ServerAuthoritative,
    PreferLocal,
    PreferRemote,
}

impl AuthorityMode {
    #[must_use]
    pub fn into_policy(self) -> Box<dyn AuthorityPolicy> {
        match self {
            Self::ServerAuthoritative => Box::new(ServerAuthoritative),
            Self::PreferLocal => Box::new(PreferLocal),
            Self::PreferRemote => Box::new(PreferRemote),
        }
    }
}

#[cfg(test)]
mod tests {
    use reflecs_ecs::Generation;

    use super::*;

    fn conflict(role: NetRole, type_path: &str) -> Conflict<'_> {
        Conflict {
            entity: Entity::new(0, Generation::new()),
            handle: TypeHandle::from_raw(1),
            type_path,
            role,
        }
    }

    #[test]
    fn test_server_authoritative() {
        let policy = ServerAuthoritative;
        assert_eq!(
            policy.resolve(&conflict(NetRole::Server, "Game.Health")),
            Resolution::KeepLocal
        );
        assert_eq!(
            policy.resolve(&conflict(NetRole::Client, "Game.Health")),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn test_closure_policy() {
        let predicted = |c: &Conflict<'_>| {
            if c.type_path == "Game.Position" {
                Resolution::KeepLocal
            } else {
                Resolution::AcceptRemote
            }
        };
        assert_eq!(
            predicted.resolve(&conflict(NetRole::Client, "Game.Position")),
            Resolution::KeepLocal
        );
        assert_eq!(
            predicted.resolve(&conflict(NetRole::Client, "Game.Health")),
            Resolution::AcceptRemote
        );
    }

    #[test]
    fn test_mode_from_json() {
        let mode: AuthorityMode = serde_json::from_str(r#""prefer_local""#).unwrap();
        assert_eq!(mode, AuthorityMode::PreferLocal);
        let policy = mode.into_policy();
        assert_eq!(
            policy.resolve(&conflict(NetRole::Server, "x")),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(NetRole::parse(" Client "), Some(NetRole::Client));
        assert_eq!(NetRole::parse("peer"), None);
        assert_eq!(NetRole::Server.to_string(), "server");
    }
}
