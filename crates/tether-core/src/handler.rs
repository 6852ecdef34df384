//! Handler results and the synchronous local-handler seam.
//!
//! Both local handlers and the asynchronous execution context produce a
//! [`HandlerResult`]: either a set of operation-specific response fields
//! (plus an optional binary payload) or a [`HandlerError`] whose message is
//! reported back to the host.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::{
    DeleteRegistrySectionsArgs, Operation, OperationType, ReadRegistryArgs, WriteRegistryArgs,
};

/// Successful handler output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Operation-specific fields, placed at the top level of the response.
    pub fields: Map<String, Value>,
    /// Raw bytes sent in the response frame's binary payload.
    pub binary: Option<Vec<u8>>,
}

impl HandlerOutput {
    /// An output with no fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Attach a binary payload.
    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = Some(binary);
        self
    }
}

/// An application-level failure reported to the host as `success: false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The operation has no handler on this device.
    pub fn unsupported(kind: OperationType) -> Self {
        Self::new(format!("{kind} is not supported by this agent"))
    }
}

pub type HandlerResult = Result<HandlerOutput, HandlerError>;

/// Handles local operations inline on the device loop.
///
/// Implementations must return promptly; anything with unbounded latency
/// belongs behind [`ExecutionContext`](crate::context::ExecutionContext).
pub trait LocalHandler: Send {
    fn handle(&mut self, operation: &Operation, binary: &[u8]) -> HandlerResult;
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// An in-memory persistent-registry stand-in: named sections of string
/// key/value pairs.
///
/// Handles the registry operations and reports every other local operation
/// as unsupported.
#[derive(Debug, Default, Clone)]
pub struct MemoryRegistry {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single value.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    fn read(&self, args: &ReadRegistryArgs) -> HandlerOutput {
        let mut values = Map::new();
        let wanted: Vec<(&String, &[String])> = if args.values.is_empty() {
            self.sections.keys().map(|name| (name, &[][..])).collect()
        } else {
            args.values
                .iter()
                .map(|(name, keys)| (name, keys.as_slice()))
                .collect()
        };

        for (name, keys) in wanted {
            let Some(section) = self.sections.get(name) else {
                continue;
            };
            let entries: Map<String, Value> = section
                .iter()
                .filter(|(key, _)| keys.is_empty() || keys.contains(*key))
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            values.insert(name.clone(), Value::Object(entries));
        }
        HandlerOutput::new().with("values", values)
    }

    fn write(&mut self, args: &WriteRegistryArgs) -> HandlerOutput {
        for (name, entries) in &args.values {
            let section = self.sections.entry(name.clone()).or_default();
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        section.insert(key.clone(), value.clone());
                    }
                    None => {
                        section.remove(key);
                    }
                }
            }
            if section.is_empty() {
                self.sections.remove(name);
            }
        }
        HandlerOutput::new()
    }

    fn delete_sections(&mut self, args: &DeleteRegistrySectionsArgs) -> HandlerResult {
        if args.sections.is_empty() {
            if !args.allow_entire_registry_delete {
                return Err(HandlerError::new(
                    "refusing to delete the entire registry without allowEntireRegistryDelete",
                ));
            }
            self.sections.clear();
            return Ok(HandlerOutput::new());
        }
        for name in &args.sections {
            self.sections.remove(name);
        }
        Ok(HandlerOutput::new())
    }
}

impl LocalHandler for MemoryRegistry {
    fn handle(&mut self, operation: &Operation, _binary: &[u8]) -> HandlerResult {
        match operation {
            Operation::ReadRegistry(args) => Ok(self.read(args)),
            Operation::WriteRegistry(args) => Ok(self.write(args)),
            Operation::DeleteRegistrySections(args) => self.delete_sections(args),
            Operation::DeleteEntireRegistry => {
                self.sections.clear();
                Ok(HandlerOutput::new())
            }
            other => Err(HandlerError::unsupported(other.kind())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
