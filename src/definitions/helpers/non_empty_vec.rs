use std::ops::Deref;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A vector that is guaranteed to contain at least one element. Decoding an
/// empty array into this type is an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
#[serde(bound(serialize = "T: Serialize + Clone", deserialize = "T: serde::de::DeserializeOwned"))]
pub struct NonEmptyVec<T: Clone>(Vec<T>);

#[derive(Debug, Error)]
#[error("expected at least one element")]
pub struct EmptyVecError;

impl<T: Clone> NonEmptyVec<T> {
    pub fn new(t: T) -> Self {
        Self(vec![t])
    }

    pub fn maybe_new(v: Vec<T>) -> Option<Self> {
        Self::try_from(v).ok()
    }

    pub fn push(&mut self, t: T) {
        self.0.push(t)
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T: Clone> TryFrom<Vec<T>> for NonEmptyVec<T> {
    type Error = EmptyVecError;

    fn try_from(v: Vec<T>) -> Result<NonEmptyVec<T>, EmptyVecError> {
        if v.is_empty() {
            return Err(EmptyVecError);
        }
        Ok(NonEmptyVec(v))
    }
}

impl<T: Clone> From<NonEmptyVec<T>> for Vec<T> {
    fn from(v: NonEmptyVec<T>) -> Vec<T> {
        v.0
    }
}

impl<T: Clone> AsRef<[T]> for NonEmptyVec<T> {
    fn as_ref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Clone> Deref for NonEmptyVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Clone> IntoIterator for NonEmptyVec<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn empty_array_rejected() {
        let bytes = cbor::to_vec(&Vec::<u8>::new()).unwrap();
        assert!(cbor::from_slice::<NonEmptyVec<u8>>(&bytes).is_err());
    }

    #[test]
    fn roundtrip() {
        let v = NonEmptyVec::try_from(vec![1u8, 2, 3]).unwrap();
        let bytes = cbor::to_vec(&v).unwrap();
        let back: NonEmptyVec<u8> = cbor::from_slice(&bytes).unwrap();
        assert_eq!(v, back);
    }
}
