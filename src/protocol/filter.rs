//! # Filters
//!
//! Predicates over `(packet, client)` that gate whether a handler sees a
//! packet. Filters are a closed set of variants; arbitrary logic goes through
//! [`Filter::Custom`]. Checking a filter never mutates anything.
//!
//! ## Specificity
//! Handlers with equal priority are ordered by how constraining their filters
//! are: a field filter counts one per rule, `All` sums its children, and every
//! other filter counts one.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::core::address::AddressPattern;
use crate::core::client::Client;
use crate::core::packet::Packet;
use crate::registry::api_key::ApiKeyStore;

/// Field used by [`Filter::api_key`] when no field name is given
pub const DEFAULT_API_KEY_FIELD: &str = "api_key";

type Predicate = dyn Fn(&Packet, &Client) -> bool + Send + Sync + 'static;

/// What a field filter requires of one key
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// Value must be exactly equal
    Equals(Value),
    /// Key must be present with any value
    Present,
}

impl FieldRule {
    fn check(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (FieldRule::Equals(expected), Some(actual)) => expected == actual,
            (FieldRule::Present, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Packet/client predicate
#[derive(Clone)]
pub enum Filter {
    /// Payload is a mapping and every rule holds; extra keys are ignored
    Fields(Vec<(String, FieldRule)>),
    /// Client address matches any of the patterns
    Address(Vec<AddressPattern>),
    /// `field` carries a key that is currently valid in `store`
    ApiKey {
        store: Arc<ApiKeyStore>,
        field: String,
    },
    /// User predicate
    Custom(Arc<Predicate>),
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Single `key == value` rule
    pub fn field(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Fields(vec![(key.into(), FieldRule::Equals(value.into()))])
    }

    /// Several `key == value` rules, all required
    pub fn fields<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Filter::Fields(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), FieldRule::Equals(v.into())))
                .collect(),
        )
    }

    /// Require that each key is present
    pub fn require<K, I>(keys: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = K>,
    {
        Filter::Fields(keys.into_iter().map(|k| (k.into(), FieldRule::Present)).collect())
    }

    pub fn address<I>(patterns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<AddressPattern>,
    {
        Filter::Address(patterns.into_iter().map(Into::into).collect())
    }

    /// API key carried in the `api_key` field
    pub fn api_key(store: Arc<ApiKeyStore>) -> Self {
        Self::api_key_field(store, DEFAULT_API_KEY_FIELD)
    }

    pub fn api_key_field(store: Arc<ApiKeyStore>, field: impl Into<String>) -> Self {
        Filter::ApiKey {
            store,
            field: field.into(),
        }
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Packet, &Client) -> bool + Send + Sync + 'static,
    {
        Filter::Custom(Arc::new(predicate))
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against a packet and its sender
    pub fn check(&self, packet: &Packet, client: &Client) -> bool {
        match self {
            Filter::Fields(rules) => match packet.value().as_object() {
                Some(map) => rules.iter().all(|(key, rule)| rule.check(map.get(key))),
                None => false,
            },
            Filter::Address(patterns) => {
                let ip = client.ip();
                patterns.iter().any(|p| p.matches(ip))
            }
            Filter::ApiKey { store, field } => packet
                .get_str(field)
                .is_some_and(|key| store.is_valid(key)),
            Filter::Custom(predicate) => predicate(packet, client),
            Filter::All(filters) => filters.iter().all(|f| f.check(packet, client)),
            Filter::Any(filters) => filters.iter().any(|f| f.check(packet, client)),
            Filter::Not(inner) => !inner.check(packet, client),
        }
    }

    /// Number of constraining predicates, used for dispatch ordering
    pub fn specificity(&self) -> usize {
        match self {
            Filter::Fields(rules) => rules.len(),
            Filter::All(filters) => filters.iter().map(Filter::specificity).sum(),
            _ => 1,
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Fields(rules) => f.debug_tuple("Fields").field(rules).finish(),
            Filter::Address(patterns) => f.debug_tuple("Address").field(patterns).finish(),
            Filter::ApiKey { field, .. } => f.debug_struct("ApiKey").field("field", field).finish(),
            Filter::Custom(_) => f.write_str("Custom(..)"),
            Filter::All(filters) => f.debug_tuple("All").field(filters).finish(),
            Filter::Any(filters) => f.debug_tuple("Any").field(filters).finish(),
            Filter::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}
