use std::collections::BTreeMap;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A map that is guaranteed to contain at least one entry. Decoding an empty
/// map into this type is an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<K, V>", into = "BTreeMap<K, V>")]
#[serde(bound(
    serialize = "K: Serialize + Ord + Clone, V: Serialize + Clone",
    deserialize = "K: serde::de::DeserializeOwned + Ord, V: serde::de::DeserializeOwned"
))]
pub struct NonEmptyMap<K: Ord + Clone, V: Clone>(BTreeMap<K, V>);

#[derive(Debug, Error)]
#[error("expected at least one entry")]
pub struct EmptyMapError;

impl<K: Ord + Clone, V: Clone> NonEmptyMap<K, V> {
    pub fn new(k: K, v: V) -> Self {
        let mut inner = BTreeMap::new();
        inner.insert(k, v);
        Self(inner)
    }

    pub fn maybe_new(m: BTreeMap<K, V>) -> Option<Self> {
        Self::try_from(m).ok()
    }

    pub fn insert(&mut self, k: K, v: V) -> Option<V> {
        self.0.insert(k, v)
    }

    pub fn into_inner(self) -> BTreeMap<K, V> {
        self.0
    }
}

impl<K: Ord + Clone, V: Clone> TryFrom<BTreeMap<K, V>> for NonEmptyMap<K, V> {
    type Error = EmptyMapError;

    fn try_from(m: BTreeMap<K, V>) -> Result<NonEmptyMap<K, V>, EmptyMapError> {
        if m.is_empty() {
            return Err(EmptyMapError);
        }
        Ok(NonEmptyMap(m))
    }
}

impl<K: Ord + Clone, V: Clone> From<NonEmptyMap<K, V>> for BTreeMap<K, V> {
    fn from(m: NonEmptyMap<K, V>) -> BTreeMap<K, V> {
        m.0
    }
}

impl<K: Ord + Clone, V: Clone> Deref for NonEmptyMap<K, V> {
    type Target = BTreeMap<K, V>;

    fn deref(&self) -> &BTreeMap<K, V> {
        &self.0
    }
}

impl<K: Ord + Clone, V: Clone> IntoIterator for NonEmptyMap<K, V> {
    type Item = (K, V);
    type IntoIter = std::collections::btree_map::IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn empty_map_rejected() {
        let bytes = cbor::to_vec(&BTreeMap::<String, u8>::new()).unwrap();
        assert!(cbor::from_slice::<NonEmptyMap<String, u8>>(&bytes).is_err());
    }
}
