//! Content addresses and link endpoints

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address '{0}' has no language prefix")]
    MissingLanguage(String),

    #[error("address '{0}' has no content id")]
    MissingContent(String),

    #[error("invalid language id '{0}'")]
    InvalidLanguage(String),
}

/// A `(language, content)` pair naming one expression.
///
/// The language id selects the adapter namespace; the content id is opaque
/// to everything but that adapter. Canonical text form is
/// `language://content`, and the short form `language:content` parses to
/// the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    language: String,
    content: String,
}

impl Address {
    pub fn new(language: impl Into<String>, content: impl Into<String>) -> Result<Self, AddressError> {
        let language = language.into();
        let content = content.into();
        if language.is_empty() {
            return Err(AddressError::MissingLanguage(content));
        }
        if !is_language_id(&language) {
            return Err(AddressError::InvalidLanguage(language));
        }
        if content.is_empty() {
            return Err(AddressError::MissingContent(language));
        }
        Ok(Self { language, content })
    }

    /// Split a textual address into its namespace and content id.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if let Some((language, content)) = s.split_once("://") {
            if is_language_id(language) {
                return Self::new(language, content);
            }
        }
        // Short form; the content may carry its own `://`.
        let (language, content) = s
            .split_once(':')
            .ok_or_else(|| AddressError::MissingLanguage(s.to_string()))?;
        Self::new(language, content)
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

fn is_language_id(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c: char| c == ':' || c == '/' || c.is_whitespace())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.language, self.content)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Well-known link endpoints that are not addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sentinel {
    /// Entry point of a perspective's graph
    Root,
    /// The local agent
    Me,
}

impl Sentinel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Root => "root",
            Sentinel::Me => "self",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "root" => Some(Sentinel::Root),
            "self" => Some(Sentinel::Me),
            _ => None,
        }
    }
}

/// One end (or the predicate) of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Node {
    Sentinel(Sentinel),
    Address(Address),
}

impl Node {
    pub fn root() -> Self {
        Node::Sentinel(Sentinel::Root)
    }

    /// Shape check only: sentinel names or parseable addresses.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        match Sentinel::from_name(s) {
            Some(sentinel) => Ok(Node::Sentinel(sentinel)),
            None => Address::parse(s).map(Node::Address),
        }
    }

    pub fn as_address(&self) -> Option<&Address> {
        match self {
            Node::Address(address) => Some(address),
            Node::Sentinel(_) => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Node::Sentinel(_))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Sentinel(s) => f.write_str(s.as_str()),
            Node::Address(a) => a.fmt(f),
        }
    }
}

impl FromStr for Node {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Node {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Node> for String {
    fn from(node: Node) -> Self {
        node.to_string()
    }
}

impl From<Address> for Node {
    fn from(address: Address) -> Self {
        Node::Address(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_and_short_forms() {
        let long = Address::parse("L1://xyz").unwrap();
        let short = Address::parse("L1:xyz").unwrap();
        assert_eq!(long, short);
        assert_eq!(long.language(), "L1");
        assert_eq!(long.content(), "xyz");
        assert_eq!(long.to_string(), "L1://xyz");
    }

    #[test]
    fn test_did_splits_on_first_colon() {
        let did = Address::parse("did:key:z6MkhaXgBZD").unwrap();
        assert_eq!(did.language(), "did");
        assert_eq!(did.content(), "key:z6MkhaXgBZD");
    }

    #[test]
    fn test_short_form_content_may_hold_a_url() {
        let address = Address::parse("neighbourhood:https://x").unwrap();
        assert_eq!(address.language(), "neighbourhood");
        assert_eq!(address.content(), "https://x");
        assert_eq!(Address::parse(&address.to_string()), Ok(address));

        let nested = Address::parse("notes://a://b").unwrap();
        assert_eq!(nested.language(), "notes");
        assert_eq!(nested.content(), "a://b");
        assert!(matches!(Address::parse("bad lang:x://y"), Err(AddressError::InvalidLanguage(_))));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Address::parse(""), Err(AddressError::Empty));
        assert!(matches!(Address::parse("nocolon"), Err(AddressError::MissingLanguage(_))));
        assert!(matches!(Address::parse("L1://"), Err(AddressError::MissingContent(_))));
        assert!(matches!(Address::parse("://abc"), Err(AddressError::MissingLanguage(_))));
    }

    #[test]
    fn test_node_sentinels() {
        assert_eq!(Node::parse("root").unwrap(), Node::root());
        assert_eq!(Node::parse("self").unwrap(), Node::Sentinel(Sentinel::Me));
        assert!(Node::parse("lang://a").unwrap().as_address().is_some());
        assert!(Node::parse("garbage").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let node = Node::parse("notes://abc").unwrap();
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, "\"notes://abc\"");
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
        assert!(serde_json::from_str::<Node>("\"bogus\"").is_err());
    }
}
