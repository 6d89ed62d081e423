//! Chat identifiers (`node@domain/resource`)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// A chat address such as `user1@proxy` or `room@conference.proxy/user1`.
///
/// Only the split into node, domain and resource is understood; no
/// stringprep or length validation is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid(String);

impl Jid {
    /// Parse a JID, rejecting empty domains.
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let s = s.trim();
        let without_resource = s.split('/').next().unwrap_or_default();
        let domain = match without_resource.split_once('@') {
            Some((_, domain)) => domain,
            None => without_resource,
        };
        if domain.is_empty() {
            return Err(TransportError::Stanza(format!("JID without domain: {:?}", s)));
        }
        Ok(Self(s.to_string()))
    }

    /// The `node` part before `@`, if any.
    pub fn node(&self) -> Option<&str> {
        let bare = self.bare_str();
        bare.split_once('@').map(|(node, _)| node)
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        let bare = self.bare_str();
        match bare.split_once('@') {
            Some((_, domain)) => domain,
            None => bare,
        }
    }

    /// The resource part after `/`, if any.
    ///
    /// For an in-room identifier this is the occupant's nickname.
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    /// The JID without its resource.
    pub fn bare(&self) -> Jid {
        Jid(self.bare_str().to_string())
    }

    /// Whether this JID carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource().is_none()
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn bare_str(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Jid {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Jid::parse(&value)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.0
    }
}

impl AsRef<str> for Jid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
