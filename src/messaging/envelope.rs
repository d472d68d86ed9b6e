use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use anyhow::{anyhow, bail};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

/// The dispatch tags that the framework itself reacts to. They are modeled as a closed
///  enum (rather than well-known strings) so that illegal registration of one of them
///  is rejected at the type boundary instead of by string comparison scattered through
///  the registry.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ReservedTag {
    RegisterClient,
    Logout,
    Ping,
    Pong,
    SetClientTags,
    AddClientTags,
    RemoveClientTags,
}

impl ReservedTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservedTag::RegisterClient => "REGISTER_CLIENT",
            ReservedTag::Logout => "LOGOUT",
            ReservedTag::Ping => "PING",
            ReservedTag::Pong => "PONG",
            ReservedTag::SetClientTags => "SET_CLIENT_TAGS",
            ReservedTag::AddClientTags => "ADD_CLIENT_TAGS",
            ReservedTag::RemoveClientTags => "REMOVE_CLIENT_TAGS",
        }
    }

    const ALL: [ReservedTag; 7] = [
        ReservedTag::RegisterClient,
        ReservedTag::Logout,
        ReservedTag::Ping,
        ReservedTag::Pong,
        ReservedTag::SetClientTags,
        ReservedTag::AddClientTags,
        ReservedTag::RemoveClientTags,
    ];

    pub fn parse(s: &str) -> Option<ReservedTag> {
        Self::ALL.iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
    }
}

/// A [DispatchTag] identifies the handler an envelope is routed to. Tags are matched
///  case-insensitively. A tag string that spells one of the [ReservedTag]s (in any case)
///  always parses to the `Reserved` variant, so a `Custom` tag never shadows a built-in.
#[derive(Clone, Eq)]
pub enum DispatchTag {
    Reserved(ReservedTag),
    Custom(String),
}

impl DispatchTag {
    /// Parse a tag from its wire spelling. The empty tag is an invariant violation
    ///  and is rejected here, so it cannot occur in a constructed envelope.
    pub fn parse(s: &str) -> anyhow::Result<DispatchTag> {
        if s.is_empty() {
            bail!("dispatch tag must not be empty");
        }
        match ReservedTag::parse(s) {
            Some(reserved) => Ok(DispatchTag::Reserved(reserved)),
            None => Ok(DispatchTag::Custom(s.to_string())),
        }
    }

    /// The original spelling - reserved tags have a canonical one.
    pub fn as_str(&self) -> &str {
        match self {
            DispatchTag::Reserved(r) => r.as_str(),
            DispatchTag::Custom(s) => s.as_str(),
        }
    }

    /// Lower-cased spelling, the registry's lookup key.
    pub fn normalized(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl PartialEq for DispatchTag {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DispatchTag::Reserved(a), DispatchTag::Reserved(b)) => a == b,
            (DispatchTag::Custom(a), DispatchTag::Custom(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl Hash for DispatchTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.as_str().bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl Debug for DispatchTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl Serialize for DispatchTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DispatchTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DispatchTag::parse(&s).map_err(D::Error::custom)
    }
}

/// The unit of exchange: a dispatch tag, an ordered list of message-specific arguments,
///  and an out-of-band sender identity that is attached once via [Envelope::sign] and
///  immutable afterwards.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    tag: DispatchTag,
    args: Vec<Value>,
    sender: Option<String>,
}

impl Envelope {
    pub fn new(tag: &str, args: Vec<Value>) -> anyhow::Result<Envelope> {
        Ok(Envelope {
            tag: DispatchTag::parse(tag)?,
            args,
            sender: None,
        })
    }

    pub fn reserved(tag: ReservedTag, args: Vec<Value>) -> Envelope {
        Envelope {
            tag: DispatchTag::Reserved(tag),
            args,
            sender: None,
        }
    }

    pub fn tag(&self) -> &DispatchTag {
        &self.tag
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Attach the sender identity. The identity is set exactly once; an attempt to
    ///  re-sign keeps the original identity.
    pub fn sign(&mut self, sender: &str) {
        if self.sender.is_some() {
            debug!("envelope is already signed - keeping the original sender");
            return;
        }
        self.sender = Some(sender.to_string());
    }

    pub fn arg_u64(&self, idx: usize) -> anyhow::Result<u64> {
        self.args.get(idx)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("envelope {:?}: argument {} is missing or not an integer", self.tag, idx))
    }

    pub fn arg_str(&self, idx: usize) -> anyhow::Result<&str> {
        self.args.get(idx)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("envelope {:?}: argument {} is missing or not a string", self.tag, idx))
    }

    /// The arguments interpreted as a flat list of label strings, as used by the
    ///  client-tag operations. Non-string arguments are skipped.
    pub fn string_args(&self) -> Vec<String> {
        self.args.iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect()
    }
}

impl Debug for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope{{tag:{:?}, args:{}, sender:{:?}}}", self.tag, self.args.len(), self.sender)
    }
}
