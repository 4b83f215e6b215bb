//! Atomic reference: a replicated slot holding an opaque value.

use serde::{Deserialize, Serialize};

use super::{Applied, Replicas};
use crate::command::{AtomicRefOp, OpValue};
use crate::error::CpError;

/// Single value slot. The value is an opaque serialized blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicRef {
    value: Option<Vec<u8>>,
}

impl AtomicRef {
    pub fn get(&self) -> Option<Vec<u8>> {
        self.value.clone()
    }

    pub fn set(&mut self, value: Option<Vec<u8>>) {
        self.value = value;
    }

    pub fn get_and_set(&mut self, value: Option<Vec<u8>>) -> Option<Vec<u8>> {
        std::mem::replace(&mut self.value, value)
    }

    pub fn compare_and_set(&mut self, expected: &Option<Vec<u8>>, new: Option<Vec<u8>>) -> bool {
        if &self.value != expected {
            return false;
        }
        self.value = new;
        true
    }

    pub fn contains(&self, value: &Option<Vec<u8>>) -> bool {
        &self.value == value
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicRefService {
    refs: Replicas<AtomicRef>,
}

impl AtomicRefService {
    pub fn apply(&mut self, name: &str, op: AtomicRefOp) -> Applied {
        let value = match op {
            AtomicRefOp::Set { value } => {
                self.refs.get_or_create(name).set(value);
                OpValue::Unit
            }
            AtomicRefOp::GetAndSet { value } => {
                OpValue::Value(self.refs.get_or_create(name).get_and_set(value))
            }
            AtomicRefOp::CompareAndSet { expected, new } => {
                OpValue::Bool(self.refs.get_or_create(name).compare_and_set(&expected, new))
            }
            read => return self.query(name, &read).into(),
        };
        Applied::Done(Ok(value))
    }

    /// Read without creating the replica; a missing reference reads as null.
    pub fn query(&self, name: &str, op: &AtomicRefOp) -> Result<OpValue, CpError> {
        let current = self.refs.get(name);
        match op {
            AtomicRefOp::Get => Ok(OpValue::Value(current.and_then(AtomicRef::get))),
            AtomicRefOp::Contains { value } => Ok(OpValue::Bool(match current {
                Some(reference) => reference.contains(value),
                None => value.is_none(),
            })),
            _ => Err(CpError::invalid_argument("not a read-only atomic reference operation")),
        }
    }

    pub fn destroy(&mut self, name: &str) -> bool {
        self.refs.remove(name).is_some()
    }
}
