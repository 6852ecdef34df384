//! Request and response envelopes carried in the text part of a frame.
//!
//! A request envelope names an [`OperationType`] and carries its arguments as
//! JSON. On the wire the arguments are opaque; at the device's router
//! boundary they are validated into the typed [`Operation`] union, one
//! variant per operation with its own argument struct.
//!
//! # Example
//!
//! ```
//! use tether_core::envelope::{Operation, OperationType, GetValueArgs, NodeRef};
//!
//! let op = Operation::GetValue(GetValueArgs {
//!     node: NodeRef::global("AuthManager.isLoggedIn"),
//!     field: None,
//! });
//! assert_eq!(op.kind(), OperationType::GetValue);
//!
//! let args = op.args().unwrap();
//! let parsed = Operation::parse(OperationType::GetValue, Some(args)).unwrap();
//! assert_eq!(parsed, op);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::wire::Frame;

/// Protocol/schema version stamped on every request.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Generate a fresh request id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns `true` when `version` shares the major component of
/// [`PROTOCOL_VERSION`].
pub fn is_compatible_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_owned);
    match (major(version), major(PROTOCOL_VERSION)) {
        (Some(theirs), Some(ours)) => !theirs.is_empty() && theirs == ours,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Device log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    /// All levels, least to most verbose.
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Verbose,
    ];

    /// The wire name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
        }
    }

    /// The `tracing` filter directive equivalent to this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "trace",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log level: {s}"))
    }
}

/// Cross-cutting options attached to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Requested device log verbosity.
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Where the device should deliver the final result.
///
/// Either a bare port (the host's address is implied) or a full `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallbackAddress {
    Port(u16),
    Address(String),
}

impl Default for CallbackAddress {
    fn default() -> Self {
        CallbackAddress::Address(String::new())
    }
}

impl fmt::Display for CallbackAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAddress::Port(port) => write!(f, ":{port}"),
            CallbackAddress::Address(addr) => f.write_str(addr),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationType
// ---------------------------------------------------------------------------

/// The closed set of operation names understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    // Local: handled inline on the device's event loop.
    Handshake,
    SetSettings,
    GetRecentLogs,
    ReadRegistry,
    WriteRegistry,
    DeleteRegistrySections,
    DeleteEntireRegistry,
    GetVolumeList,
    GetDirectoryListing,
    StatPath,
    CreateDirectory,
    DeleteFile,
    RenameFile,
    ReadFile,
    WriteFile,
    GetApplicationStartTime,
    // Asynchronous: forwarded to the execution context.
    CallFunc,
    GetValue,
    GetValues,
    SetValue,
    GetFocusedNode,
    HasFocus,
    IsInFocusChain,
    FocusNode,
    OnFieldChangeOnce,
}

impl OperationType {
    /// Every operation type.
    pub const ALL: [OperationType; 25] = [
        OperationType::Handshake,
        OperationType::SetSettings,
        OperationType::GetRecentLogs,
        OperationType::ReadRegistry,
        OperationType::WriteRegistry,
        OperationType::DeleteRegistrySections,
        OperationType::DeleteEntireRegistry,
        OperationType::GetVolumeList,
        OperationType::GetDirectoryListing,
        OperationType::StatPath,
        OperationType::CreateDirectory,
        OperationType::DeleteFile,
        OperationType::RenameFile,
        OperationType::ReadFile,
        OperationType::WriteFile,
        OperationType::GetApplicationStartTime,
        OperationType::CallFunc,
        OperationType::GetValue,
        OperationType::GetValues,
        OperationType::SetValue,
        OperationType::GetFocusedNode,
        OperationType::HasFocus,
        OperationType::IsInFocusChain,
        OperationType::FocusNode,
        OperationType::OnFieldChangeOnce,
    ];

    /// The wire name, e.g. `"getValue"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Handshake => "handshake",
            OperationType::SetSettings => "setSettings",
            OperationType::GetRecentLogs => "getRecentLogs",
            OperationType::ReadRegistry => "readRegistry",
            OperationType::WriteRegistry => "writeRegistry",
            OperationType::DeleteRegistrySections => "deleteRegistrySections",
            OperationType::DeleteEntireRegistry => "deleteEntireRegistry",
            OperationType::GetVolumeList => "getVolumeList",
            OperationType::GetDirectoryListing => "getDirectoryListing",
            OperationType::StatPath => "statPath",
            OperationType::CreateDirectory => "createDirectory",
            OperationType::DeleteFile => "deleteFile",
            OperationType::RenameFile => "renameFile",
            OperationType::ReadFile => "readFile",
            OperationType::WriteFile => "writeFile",
            OperationType::GetApplicationStartTime => "getApplicationStartTime",
            OperationType::CallFunc => "callFunc",
            OperationType::GetValue => "getValue",
            OperationType::GetValues => "getValues",
            OperationType::SetValue => "setValue",
            OperationType::GetFocusedNode => "getFocusedNode",
            OperationType::HasFocus => "hasFocus",
            OperationType::IsInFocusChain => "isInFocusChain",
            OperationType::FocusNode => "focusNode",
            OperationType::OnFieldChangeOnce => "onFieldChangeOnce",
        }
    }

    /// Local operations run inline on the device loop; the rest are handed
    /// to the asynchronous execution context.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            OperationType::Handshake
                | OperationType::SetSettings
                | OperationType::GetRecentLogs
                | OperationType::ReadRegistry
                | OperationType::WriteRegistry
                | OperationType::DeleteRegistrySections
                | OperationType::DeleteEntireRegistry
                | OperationType::GetVolumeList
                | OperationType::GetDirectoryListing
                | OperationType::StatPath
                | OperationType::CreateDirectory
                | OperationType::DeleteFile
                | OperationType::RenameFile
                | OperationType::ReadFile
                | OperationType::WriteFile
                | OperationType::GetApplicationStartTime
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown operation type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Argument structs
// ---------------------------------------------------------------------------

/// Root a key path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeBase {
    #[default]
    Global,
    Scene,
    FocusedNode,
    ElementId,
}

/// Reference to a node in the device application's state tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    #[serde(default)]
    pub base: NodeBase,
    #[serde(default)]
    pub key_path: String,
}

impl NodeRef {
    /// A key path resolved against the global node.
    pub fn global(key_path: impl Into<String>) -> Self {
        Self {
            base: NodeBase::Global,
            key_path: key_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentLogsArgs {
    /// Newest lines to return; all buffered lines when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRegistryArgs {
    /// Section name to keys. An empty map reads everything, an empty key
    /// list reads a whole section.
    #[serde(default)]
    pub values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRegistryArgs {
    /// Section name to key/value pairs; a `null` value deletes the key.
    pub values: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRegistrySectionsArgs {
    pub sections: Vec<String>,
    /// Must be set for an empty `sections` list to wipe the registry.
    #[serde(default)]
    pub allow_entire_registry_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePathArgs {
    pub from_path: String,
    pub to_path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFuncArgs {
    #[serde(flatten)]
    pub node: NodeRef,
    pub func_name: String,
    #[serde(default)]
    pub func_params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetValueArgs {
    #[serde(flatten)]
    pub node: NodeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetValuesArgs {
    pub requests: BTreeMap<String, GetValueArgs>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetValueArgs {
    #[serde(flatten)]
    pub node: NodeRef,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusNodeArgs {
    #[serde(flatten)]
    pub node: NodeRef,
    #[serde(default = "default_true")]
    pub on: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveFieldArgs {
    #[serde(flatten)]
    pub node: NodeRef,
    pub field: String,
    /// Only fire once the field equals this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_value: Option<Value>,
    /// Device-side give-up budget in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timeout: Option<u64>,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Argument validation failures at the router boundary.
#[derive(Error, Debug)]
pub enum ArgsError {
    /// The operation needs arguments but none were sent.
    #[error("{0} requires args")]
    Missing(OperationType),

    /// The arguments do not match the operation's schema.
    #[error("invalid args for {kind}: {source}")]
    Invalid {
        kind: OperationType,
        #[source]
        source: serde_json::Error,
    },
}

/// A typed operation: one variant per [`OperationType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Handshake,
    SetSettings(Settings),
    GetRecentLogs(RecentLogsArgs),
    ReadRegistry(ReadRegistryArgs),
    WriteRegistry(WriteRegistryArgs),
    DeleteRegistrySections(DeleteRegistrySectionsArgs),
    DeleteEntireRegistry,
    GetVolumeList,
    GetDirectoryListing(PathArgs),
    StatPath(PathArgs),
    CreateDirectory(PathArgs),
    DeleteFile(PathArgs),
    RenameFile(RenamePathArgs),
    ReadFile(PathArgs),
    /// File contents travel in the frame's binary payload.
    WriteFile(PathArgs),
    GetApplicationStartTime,
    CallFunc(CallFuncArgs),
    GetValue(GetValueArgs),
    GetValues(GetValuesArgs),
    SetValue(SetValueArgs),
    GetFocusedNode,
    HasFocus(NodeRef),
    IsInFocusChain(NodeRef),
    FocusNode(FocusNodeArgs),
    OnFieldChangeOnce(ObserveFieldArgs),
}

fn typed<T: serde::de::DeserializeOwned>(
    kind: OperationType,
    args: Option<Value>,
) -> Result<T, ArgsError> {
    let args = args.ok_or(ArgsError::Missing(kind))?;
    serde_json::from_value(args).map_err(|source| ArgsError::Invalid { kind, source })
}

impl Operation {
    /// The operation's type tag.
    pub fn kind(&self) -> OperationType {
        match self {
            Operation::Handshake => OperationType::Handshake,
            Operation::SetSettings(_) => OperationType::SetSettings,
            Operation::GetRecentLogs(_) => OperationType::GetRecentLogs,
            Operation::ReadRegistry(_) => OperationType::ReadRegistry,
            Operation::WriteRegistry(_) => OperationType::WriteRegistry,
            Operation::DeleteRegistrySections(_) => OperationType::DeleteRegistrySections,
            Operation::DeleteEntireRegistry => OperationType::DeleteEntireRegistry,
            Operation::GetVolumeList => OperationType::GetVolumeList,
            Operation::GetDirectoryListing(_) => OperationType::GetDirectoryListing,
            Operation::StatPath(_) => OperationType::StatPath,
            Operation::CreateDirectory(_) => OperationType::CreateDirectory,
            Operation::DeleteFile(_) => OperationType::DeleteFile,
            Operation::RenameFile(_) => OperationType::RenameFile,
            Operation::ReadFile(_) => OperationType::ReadFile,
            Operation::WriteFile(_) => OperationType::WriteFile,
            Operation::GetApplicationStartTime => OperationType::GetApplicationStartTime,
            Operation::CallFunc(_) => OperationType::CallFunc,
            Operation::GetValue(_) => OperationType::GetValue,
            Operation::GetValues(_) => OperationType::GetValues,
            Operation::SetValue(_) => OperationType::SetValue,
            Operation::GetFocusedNode => OperationType::GetFocusedNode,
            Operation::HasFocus(_) => OperationType::HasFocus,
            Operation::IsInFocusChain(_) => OperationType::IsInFocusChain,
            Operation::FocusNode(_) => OperationType::FocusNode,
            Operation::OnFieldChangeOnce(_) => OperationType::OnFieldChangeOnce,
        }
    }

    /// Validate raw JSON arguments into the typed variant for `kind`.
    ///
    /// Operations without arguments ignore whatever was sent.
    pub fn parse(kind: OperationType, args: Option<Value>) -> Result<Self, ArgsError> {
        let args = args.filter(|v| !v.is_null());
        let op = match kind {
            OperationType::Handshake => Operation::Handshake,
            OperationType::SetSettings => Operation::SetSettings(typed(kind, args)?),
            OperationType::GetRecentLogs => {
                // An absent args object means "everything".
                let args = args.or_else(|| Some(Value::Object(Map::new())));
                Operation::GetRecentLogs(typed(kind, args)?)
            }
            OperationType::ReadRegistry => {
                let args = args.or_else(|| Some(Value::Object(Map::new())));
                Operation::ReadRegistry(typed(kind, args)?)
            }
            OperationType::WriteRegistry => Operation::WriteRegistry(typed(kind, args)?),
            OperationType::DeleteRegistrySections => {
                Operation::DeleteRegistrySections(typed(kind, args)?)
            }
            OperationType::DeleteEntireRegistry => Operation::DeleteEntireRegistry,
            OperationType::GetVolumeList => Operation::GetVolumeList,
            OperationType::GetDirectoryListing => {
                Operation::GetDirectoryListing(typed(kind, args)?)
            }
            OperationType::StatPath => Operation::StatPath(typed(kind, args)?),
            OperationType::CreateDirectory => Operation::CreateDirectory(typed(kind, args)?),
            OperationType::DeleteFile => Operation::DeleteFile(typed(kind, args)?),
            OperationType::RenameFile => Operation::RenameFile(typed(kind, args)?),
            OperationType::ReadFile => Operation::ReadFile(typed(kind, args)?),
            OperationType::WriteFile => Operation::WriteFile(typed(kind, args)?),
            OperationType::GetApplicationStartTime => Operation::GetApplicationStartTime,
            OperationType::CallFunc => Operation::CallFunc(typed(kind, args)?),
            OperationType::GetValue => Operation::GetValue(typed(kind, args)?),
            OperationType::GetValues => Operation::GetValues(typed(kind, args)?),
            OperationType::SetValue => Operation::SetValue(typed(kind, args)?),
            OperationType::GetFocusedNode => Operation::GetFocusedNode,
            OperationType::HasFocus => Operation::HasFocus(typed(kind, args)?),
            OperationType::IsInFocusChain => Operation::IsInFocusChain(typed(kind, args)?),
            OperationType::FocusNode => Operation::FocusNode(typed(kind, args)?),
            OperationType::OnFieldChangeOnce => Operation::OnFieldChangeOnce(typed(kind, args)?),
        };
        Ok(op)
    }

    /// Serialize the arguments for the wire. Argument-less operations encode
    /// as an empty object.
    pub fn args(&self) -> Result<Value, serde_json::Error> {
        match self {
            Operation::Handshake
            | Operation::DeleteEntireRegistry
            | Operation::GetVolumeList
            | Operation::GetApplicationStartTime
            | Operation::GetFocusedNode => Ok(Value::Object(Map::new())),
            Operation::SetSettings(a) => serde_json::to_value(a),
            Operation::GetRecentLogs(a) => serde_json::to_value(a),
            Operation::ReadRegistry(a) => serde_json::to_value(a),
            Operation::WriteRegistry(a) => serde_json::to_value(a),
            Operation::DeleteRegistrySections(a) => serde_json::to_value(a),
            Operation::GetDirectoryListing(a)
            | Operation::StatPath(a)
            | Operation::CreateDirectory(a)
            | Operation::DeleteFile(a)
            | Operation::ReadFile(a)
            | Operation::WriteFile(a) => serde_json::to_value(a),
            Operation::RenameFile(a) => serde_json::to_value(a),
            Operation::CallFunc(a) => serde_json::to_value(a),
            Operation::GetValue(a) => serde_json::to_value(a),
            Operation::GetValues(a) => serde_json::to_value(a),
            Operation::SetValue(a) => serde_json::to_value(a),
            Operation::HasFocus(a) | Operation::IsInFocusChain(a) => serde_json::to_value(a),
            Operation::FocusNode(a) => serde_json::to_value(a),
            Operation::OnFieldChangeOnce(a) => serde_json::to_value(a),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// A request as serialized into a frame's text payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub callback_address: CallbackAddress,
    pub version: String,
}

impl RequestEnvelope {
    /// Build an envelope for `operation` with a fresh id.
    pub fn new(
        operation: &Operation,
        settings: Settings,
        callback_address: CallbackAddress,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: generate_id(),
            kind: operation.kind(),
            args: operation.args()?,
            settings,
            callback_address,
            version: PROTOCOL_VERSION.to_string(),
        })
    }
}

/// Error details in a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// A response as serialized into a frame's text payload.
///
/// Operation-specific result fields sit at the top level next to the common
/// ones and are collected into [`fields`](Self::fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_taken: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ResponseEnvelope {
    /// The device-supplied error message, if the response is a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// Device acknowledgment of a received request. Silences host retries only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub id: String,
    pub ack: bool,
}

/// A frame received by the host, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// The device received the request with this id.
    Ack { id: String },
    /// The final result for a request.
    Response {
        envelope: ResponseEnvelope,
        binary: Vec<u8>,
    },
}

impl DeviceMessage {
    /// Classify a frame sent by the device.
    pub fn from_frame(frame: Frame) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(&frame.text)?;
        if value.get("ack").and_then(Value::as_bool) == Some(true) {
            let ack: AckEnvelope = serde_json::from_value(value)?;
            return Ok(DeviceMessage::Ack { id: ack.id });
        }
        let envelope: ResponseEnvelope = serde_json::from_value(value)?;
        Ok(DeviceMessage::Response {
            envelope,
            binary: frame.binary,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_type_names_match_serde() {
        for kind in OperationType::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
            assert_eq!(kind.as_str().parse::<OperationType>().unwrap(), kind);
        }
    }

    #[test]
    fn local_and_async_split() {
        assert!(OperationType::ReadRegistry.is_local());
        assert!(OperationType::SetSettings.is_local());
        assert!(!OperationType::GetValue.is_local());
        assert!(!OperationType::OnFieldChangeOnce.is_local());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!("teleport".parse::<OperationType>().is_err());
        assert!(serde_json::from_value::<OperationType>(json!("teleport")).is_err());
    }

    #[test]
    fn parse_typed_args() {
        let op = Operation::parse(
            OperationType::SetValue,
            Some(json!({"base": "scene", "keyPath": "#title", "field": "text", "value": "hi"})),
        )
        .unwrap();
        match op {
            Operation::SetValue(args) => {
                assert_eq!(args.node.base, NodeBase::Scene);
                assert_eq!(args.node.key_path, "#title");
                assert_eq!(args.field, "text");
                assert_eq!(args.value, json!("hi"));
            }
            other => panic!("expected SetValue, got {other:?}"),
        }
    }

    #[test]
    fn parse_missing_args() {
        let err = Operation::parse(OperationType::StatPath, None).unwrap_err();
        assert!(matches!(err, ArgsError::Missing(OperationType::StatPath)));
        let err = Operation::parse(OperationType::StatPath, Some(Value::Null)).unwrap_err();
        assert!(matches!(err, ArgsError::Missing(_)));
        assert_eq!(
            Operation::parse(OperationType::ReadRegistry, Some(Value::Null)).unwrap(),
            Operation::ReadRegistry(ReadRegistryArgs::default())
        );
    }

    #[test]
    fn parse_invalid_args() {
        let err = Operation::parse(OperationType::StatPath, Some(json!({"path": 5}))).unwrap_err();
        assert!(matches!(err, ArgsError::Invalid { .. }));
        assert!(err.to_string().starts_with("invalid args for statPath"));
    }

    #[test]
    fn argless_operations_ignore_args() {
        let op = Operation::parse(OperationType::Handshake, Some(json!({"x": 1}))).unwrap();
        assert_eq!(op, Operation::Handshake);
        assert_eq!(op.args().unwrap(), json!({}));
        assert_eq!(
            Operation::parse(OperationType::GetRecentLogs, None).unwrap(),
            Operation::GetRecentLogs(RecentLogsArgs::default())
        );
    }

    #[test]
    fn observe_args_wire_names() {
        let op = Operation::OnFieldChangeOnce(ObserveFieldArgs {
            node: NodeRef::global("player"),
            field: "state".into(),
            match_value: Some(json!("playing")),
            retry_timeout: Some(4800),
        });
        assert_eq!(
            op.args().unwrap(),
            json!({
                "base": "global",
                "keyPath": "player",
                "field": "state",
                "matchValue": "playing",
                "retryTimeout": 4800
            })
        );
    }

    #[test]
    fn request_envelope_wire_shape() {
        let env = RequestEnvelope::new(
            &Operation::ReadFile(PathArgs {
                path: "tmp:/a.txt".into(),
            }),
            Settings {
                log_level: LogLevel::Debug,
            },
            CallbackAddress::Address("10.0.0.2:50123".into()),
        )
        .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "readFile");
        assert_eq!(json["args"], json!({"path": "tmp:/a.txt"}));
        assert_eq!(json["settings"], json!({"logLevel": "debug"}));
        assert_eq!(json["callbackAddress"], "10.0.0.2:50123");
        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert!(!env.id.is_empty());
    }

    #[test]
    fn callback_address_accepts_port_or_string() {
        let port: CallbackAddress = serde_json::from_value(json!(8080)).unwrap();
        assert_eq!(port, CallbackAddress::Port(8080));
        let addr: CallbackAddress = serde_json::from_value(json!("h:1")).unwrap();
        assert_eq!(addr, CallbackAddress::Address("h:1".into()));
    }

    #[test]
    fn response_envelope_flattens_fields() {
        let text = r#"{"id":"a","success":true,"timeTaken":12,"value":42,"found":true}"#;
        let env: ResponseEnvelope = serde_json::from_str(text).unwrap();
        assert_eq!(env.time_taken, Some(12));
        assert_eq!(env.fields.get("value"), Some(&json!(42)));
        assert_eq!(env.fields.get("found"), Some(&json!(true)));
        assert!(env.error.is_none());
    }

    #[test]
    fn device_message_classification() {
        let ack = Frame {
            text: r#"{"id":"r1","ack":true}"#.into(),
            binary: vec![],
        };
        assert_eq!(
            DeviceMessage::from_frame(ack).unwrap(),
            DeviceMessage::Ack { id: "r1".into() }
        );

        let failure = Frame {
            text: r#"{"id":"r1","success":false,"error":{"message":"boom"}}"#.into(),
            binary: vec![7],
        };
        match DeviceMessage::from_frame(failure).unwrap() {
            DeviceMessage::Response { envelope, binary } => {
                assert!(!envelope.success);
                assert_eq!(envelope.error_message(), Some("boom"));
                assert_eq!(binary, vec![7]);
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn version_compatibility() {
        assert!(is_compatible_version("1.0.0"));
        assert!(is_compatible_version("1.4"));
        assert!(!is_compatible_version("2.0.0"));
        assert!(!is_compatible_version(""));
    }

    #[test]
    fn log_level_directives() {
        assert_eq!(LogLevel::Verbose.as_directive(), "trace");
        assert_eq!(LogLevel::Warn.as_directive(), "warn");
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Info);
    }
}
