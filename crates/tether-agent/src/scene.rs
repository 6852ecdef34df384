//! JSON-backed node tree behind the agent's asynchronous operations.
//!
//! The agent has no render thread of its own, so scene-graph operations run
//! against a JSON document (optionally seeded from `--scene`). Key paths are
//! dot-separated; numeric segments index arrays. Field observation waits on
//! a change counter bumped by every mutation.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tether_core::context::AsyncHandler;
use tether_core::envelope::{
    FocusNodeArgs, GetValueArgs, NodeBase, NodeRef, ObserveFieldArgs, Operation, SetValueArgs,
};
use tether_core::handler::{HandlerError, HandlerOutput, HandlerResult};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Give-up budget for observations that arrive without `retryTimeout`.
const DEFAULT_OBSERVE_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct SceneState {
    root: Value,
    focus: Option<String>,
}

/// The agent's execution-context handler.
pub struct Scene {
    state: Mutex<SceneState>,
    changes: watch::Sender<u64>,
}

impl Scene {
    pub fn new(root: Value) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(SceneState { root, focus: None }),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SceneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn get_value(&self, args: &GetValueArgs) -> Result<Value, HandlerError> {
        let state = self.lock();
        let path = resolve(&state, &args.node, args.field.as_deref())?;
        lookup(&state.root, &path)
            .cloned()
            .ok_or_else(|| HandlerError::new(format!("no value at {}", display_path(&path))))
    }

    fn set_value(&self, args: &SetValueArgs) -> HandlerResult {
        {
            let mut state = self.lock();
            let path = resolve(&state, &args.node, Some(&args.field))?;
            let slot = lookup_mut(&mut state.root, &path)?;
            *slot = args.value.clone();
        }
        self.bump();
        Ok(HandlerOutput::new())
    }

    fn focus(&self, args: &FocusNodeArgs) -> HandlerResult {
        {
            let mut state = self.lock();
            let path = resolve(&state, &args.node, None)?;
            if lookup(&state.root, &path).is_none() {
                return Err(HandlerError::new(format!(
                    "no node at {}",
                    display_path(&path)
                )));
            }
            let key_path = path.join(".");
            if args.on {
                state.focus = Some(key_path);
            } else if state.focus.as_deref() == Some(key_path.as_str()) {
                state.focus = None;
            }
        }
        self.bump();
        Ok(HandlerOutput::new())
    }

    fn focus_relation(&self, node: &NodeRef) -> Result<(bool, bool), HandlerError> {
        let state = self.lock();
        let key_path = resolve(&state, node, None)?.join(".");
        let Some(focus) = state.focus.as_deref() else {
            return Ok((false, false));
        };
        let has_focus = focus == key_path;
        let in_chain = has_focus
            || key_path.is_empty()
            || focus
                .strip_prefix(key_path.as_str())
                .is_some_and(|rest| rest.starts_with('.'));
        Ok((has_focus, in_chain))
    }

    async fn observe(&self, args: &ObserveFieldArgs) -> HandlerResult {
        let budget = args
            .retry_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_OBSERVE_BUDGET);
        let deadline = Instant::now() + budget;
        let field = GetValueArgs {
            node: args.node.clone(),
            field: Some(args.field.clone()),
        };

        let mut changes = self.changes.subscribe();
        let initial = self.get_value(&field).ok();
        if let (Some(expected), Some(current)) = (&args.match_value, &initial) {
            if expected == current {
                return Ok(HandlerOutput::new().with("value", current.clone()));
            }
        }

        loop {
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return Err(HandlerError::new(format!(
                        "gave up waiting for {} to change after {}ms",
                        args.field,
                        budget.as_millis()
                    )))
                }
            }
            let current = self.get_value(&field).ok();
            let fired = match &args.match_value {
                Some(expected) => current.as_ref() == Some(expected),
                None => current != initial,
            };
            if fired {
                debug!(field = %args.field, "observed change");
                return Ok(HandlerOutput::new().with("value", current.unwrap_or(Value::Null)));
            }
        }
    }
}

#[async_trait]
impl AsyncHandler for Scene {
    async fn handle(&self, operation: Operation, _binary: Vec<u8>) -> HandlerResult {
        match &operation {
            Operation::GetValue(args) => {
                Ok(HandlerOutput::new().with("value", self.get_value(args)?))
            }
            Operation::GetValues(args) => {
                let mut values = Map::new();
                for (name, request) in &args.requests {
                    values.insert(name.clone(), self.get_value(request)?);
                }
                Ok(HandlerOutput::new().with("values", values))
            }
            Operation::SetValue(args) => self.set_value(args),
            Operation::GetFocusedNode => {
                let focus = self.lock().focus.clone();
                Ok(HandlerOutput::new().with("keyPath", focus))
            }
            Operation::HasFocus(node) => {
                let (has_focus, _) = self.focus_relation(node)?;
                Ok(HandlerOutput::new().with("hasFocus", has_focus))
            }
            Operation::IsInFocusChain(node) => {
                let (_, in_chain) = self.focus_relation(node)?;
                Ok(HandlerOutput::new().with("isInFocusChain", in_chain))
            }
            Operation::FocusNode(args) => self.focus(args),
            Operation::OnFieldChangeOnce(args) => self.observe(args).await,
            other => Err(HandlerError::unsupported(other.kind())),
        }
    }
}

/// Absolute path segments for `node`, plus an optional trailing field.
fn resolve(
    state: &SceneState,
    node: &NodeRef,
    field: Option<&str>,
) -> Result<Vec<String>, HandlerError> {
    let mut path: Vec<String> = match node.base {
        NodeBase::Global | NodeBase::Scene => Vec::new(),
        NodeBase::FocusedNode => match &state.focus {
            Some(focus) => split(focus),
            None => return Err(HandlerError::new("no node has focus")),
        },
        NodeBase::ElementId => {
            return Err(HandlerError::new("elementId lookup is not supported by this agent"))
        }
    };
    path.extend(split(&node.key_path));
    if let Some(field) = field {
        path.extend(split(field));
    }
    Ok(path)
}

fn split(key_path: &str) -> Vec<String> {
    key_path
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".into()
    } else {
        path.join(".")
    }
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Like [`lookup`], creating missing object members along the way.
fn lookup_mut<'a>(root: &'a mut Value, path: &[String]) -> Result<&'a mut Value, HandlerError> {
    let mut node = root;
    for segment in path {
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| HandlerError::new(format!("no element {segment}")))?,
            _ => {
                return Err(HandlerError::new(format!(
                    "{} is not a node",
                    display_path(path)
                )))
            }
        };
    }
    Ok(node)
}
