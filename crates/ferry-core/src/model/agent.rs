//! Agents, accounts and credentials.
//!
//! A *local agent* is a server hosted by the gateway, with *local accounts*
//! partners log in with. A *remote agent* is a partner's server, reached with
//! one of our *remote accounts* through a protocol *client*.

use serde::{Deserialize, Serialize};

/// Server hosted by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalAgent {
    /// Identifier
    pub id: i64,
    /// Name
    pub name: String,
    /// Protocol served
    pub protocol: String,
    /// Listen address
    #[serde(default)]
    pub address: String,
    /// Root of the server's directories
    #[serde(default)]
    pub root_dir: String,
    /// Directory of received files
    #[serde(default)]
    pub receive_dir: String,
    /// Directory of sent files
    #[serde(default)]
    pub send_dir: String,
    /// Directory of files being received
    #[serde(default)]
    pub tmp_receive_dir: String,
}

/// Partner account on a [`LocalAgent`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalAccount {
    /// Identifier
    pub id: i64,
    /// Owning server
    pub local_agent_id: i64,
    /// Login
    pub login: String,
}

/// Partner server
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAgent {
    /// Identifier
    pub id: i64,
    /// Name
    pub name: String,
    /// Protocol spoken
    pub protocol: String,
    /// Address (`host:port`, or a directory for the local protocol)
    pub address: String,
}

/// Our account on a [`RemoteAgent`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteAccount {
    /// Identifier
    pub id: i64,
    /// Partner server
    pub remote_agent_id: i64,
    /// Login
    pub login: String,
}

/// Local protocol client running client-side transfers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identifier
    pub id: i64,
    /// Name
    pub name: String,
    /// Protocol spoken
    pub protocol: String,
}

/// Record a credential belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum CredentialOwner {
    /// A local server
    LocalAgent(i64),
    /// A partner account on a local server
    LocalAccount(i64),
    /// A partner server
    RemoteAgent(i64),
    /// Our account on a partner server
    RemoteAccount(i64),
}

/// Authentication material
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Identifier
    pub id: i64,
    /// Owner
    pub owner: CredentialOwner,
    /// Kind ("password", "ssh_private_key", ...)
    pub kind: String,
    /// Value
    pub value: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_value() {
        let cred = Credential {
            id: 1,
            owner: CredentialOwner::RemoteAccount(3),
            kind: "password".to_string(),
            value: "hunter2".to_string(),
        };
        let debug = format!("{cred:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_owner_serde() {
        let json = serde_json::to_string(&CredentialOwner::LocalAgent(7)).unwrap();
        assert_eq!(json, r#"{"kind":"local-agent","id":7}"#);
    }
}
