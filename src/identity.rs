//! Node identities and address records.
//!
//! A node is identified by a fixed 32-byte [`Identity`] handed to us by the
//! discovery layer. [`NodeRecord`] couples an identity with the addressing
//! information the P2P server needs to dial the node. [`Topic`] names a
//! registration channel in topic discovery.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Fixed-width node identifier produced by the discovery layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque name of a discovery registration channel.
///
/// Peers announce themselves under topics and searches are scoped to one
/// topic. The pool never interprets the contents.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dialable address record for a discovered node.
///
/// Immutable once created; produced by the discovery layer and handed to the
/// P2P server for dialing. Serialized byte-for-byte into the peer cache.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Identity,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl NodeRecord {
    pub fn new(id: Identity, ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            id,
            ip,
            udp_port,
            tcp_port,
        }
    }

    /// Record with unspecified addressing, useful where only the identity
    /// matters.
    pub fn with_id(id: Identity) -> Self {
        Self {
            id,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 0,
            tcp_port: 0,
        }
    }
}

impl std::fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRecord")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("udp", &self.udp_port)
            .field("tcp", &self.tcp_port)
            .finish()
    }
}
