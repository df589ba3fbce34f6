//! WebSocket protocol types.
//!
//! Every frame is a JSON text message.
//!
//! ## Client → Server ([`Request`])
//!
//! ```json
//! {"id": "7", "type": "ACTION", "action": "TAG_NEW",
//!  "tagNewParams": {"name": "Work", "color": "#ff0000"}}
//! ```
//!
//! The parameters live under a key derived from the action name
//! (`TAG_NEW` → `tagNewParams`). Actions that act on a single entity carry
//! its bare id (`"tagDeleteParams": 3`).
//!
//! ## Server → Client ([`Response`])
//!
//! - `ACTION_EXECUTED`: the outcome of one request, echoing its `id`, with
//!   `status` set to `OK` or `ERROR`
//! - backend messages (`TAG_UPDATE`, `SUMMARY_LIST`, ...): state changes
//!   pushed to clients, with empty `id` and `status`

use crate::models::{ProjectId, SessionId, TagId, TaskId};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Client → Server
// ============================================================================

/// A raw request as read off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, echoed in the `ACTION_EXECUTED` reply.
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub action: String,
    /// Every other field, including the `<action>Params` entry.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Actions understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    TagNew,
    TagDelete,
    TagEdit,
    ProjectNew,
    ProjectGet,
    ProjectDelete,
    ProjectEdit,
    TaskNew,
    TaskDelete,
    TaskToggle,
    TaskEdit,
    SessionNew,
    SessionDelete,
}

impl Action {
    pub const ALL: [Action; 13] = [
        Action::TagNew,
        Action::TagDelete,
        Action::TagEdit,
        Action::ProjectNew,
        Action::ProjectGet,
        Action::ProjectDelete,
        Action::ProjectEdit,
        Action::TaskNew,
        Action::TaskDelete,
        Action::TaskToggle,
        Action::TaskEdit,
        Action::SessionNew,
        Action::SessionDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::TagNew => "TAG_NEW",
            Action::TagDelete => "TAG_DELETE",
            Action::TagEdit => "TAG_EDIT",
            Action::ProjectNew => "PROJECT_NEW",
            Action::ProjectGet => "PROJECT_GET",
            Action::ProjectDelete => "PROJECT_DELETE",
            Action::ProjectEdit => "PROJECT_EDIT",
            Action::TaskNew => "TASK_NEW",
            Action::TaskDelete => "TASK_DELETE",
            Action::TaskToggle => "TASK_TOGGLE",
            Action::TaskEdit => "TASK_EDIT",
            Action::SessionNew => "SESSION_NEW",
            Action::SessionDelete => "SESSION_DELETE",
        }
    }

    /// Request field holding this action's parameters.
    pub fn params_key(&self) -> &'static str {
        match self {
            Action::TagNew => "tagNewParams",
            Action::TagDelete => "tagDeleteParams",
            Action::TagEdit => "tagEditParams",
            Action::ProjectNew => "projectNewParams",
            Action::ProjectGet => "projectGetParams",
            Action::ProjectDelete => "projectDeleteParams",
            Action::ProjectEdit => "projectEditParams",
            Action::TaskNew => "taskNewParams",
            Action::TaskDelete => "taskDeleteParams",
            Action::TaskToggle => "taskToggleParams",
            Action::TaskEdit => "taskEditParams",
            Action::SessionNew => "sessionNewParams",
            Action::SessionDelete => "sessionDeleteParams",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("Unsupported action: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagNewParams {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEditParams {
    pub id: TagId,
    pub new_name: String,
    pub new_color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNewParams {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<TagId>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEditParams {
    pub id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<TagId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNewParams {
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEditParams {
    pub task_id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewParams {
    pub project_id: ProjectId,
    /// Minutes
    pub duration: u64,
    /// Unix seconds
    pub date: u64,
}

/// Largest integer the store can hold; ids, durations and dates above it are
/// rejected at decode time.
pub const MAX_STORED_INTEGER: u64 = i64::MAX as u64;

/// A fully decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TagNew(TagNewParams),
    TagDelete(TagId),
    TagEdit(TagEditParams),
    ProjectNew(ProjectNewParams),
    ProjectGet(ProjectId),
    ProjectDelete(ProjectId),
    ProjectEdit(ProjectEditParams),
    TaskNew(TaskNewParams),
    TaskDelete(TaskId),
    TaskToggle(TaskId),
    TaskEdit(TaskEditParams),
    SessionNew(SessionNewParams),
    SessionDelete(SessionId),
}

impl Command {
    /// Decode the action and its parameters.
    ///
    /// Fails with `InvalidArgument` for an unknown action and for missing or
    /// malformed parameters.
    pub fn decode(request: &Request) -> Result<Self> {
        let action: Action = request.action.parse()?;
        let command = match action {
            Action::TagNew => Command::TagNew(params(request, action)?),
            Action::TagDelete => Command::TagDelete(params(request, action)?),
            Action::TagEdit => Command::TagEdit(params(request, action)?),
            Action::ProjectNew => Command::ProjectNew(params(request, action)?),
            Action::ProjectGet => Command::ProjectGet(params(request, action)?),
            Action::ProjectDelete => Command::ProjectDelete(params(request, action)?),
            Action::ProjectEdit => Command::ProjectEdit(params(request, action)?),
            Action::TaskNew => Command::TaskNew(params(request, action)?),
            Action::TaskDelete => Command::TaskDelete(params(request, action)?),
            Action::TaskToggle => Command::TaskToggle(params(request, action)?),
            Action::TaskEdit => Command::TaskEdit(params(request, action)?),
            Action::SessionNew => Command::SessionNew(params(request, action)?),
            Action::SessionDelete => Command::SessionDelete(params(request, action)?),
        };
        command.check_range()?;
        Ok(command)
    }

    /// Every integer the command would hand to the store.
    fn integers(&self) -> Vec<u64> {
        match self {
            Command::TagNew(_) => Vec::new(),
            Command::TagDelete(id)
            | Command::ProjectGet(id)
            | Command::ProjectDelete(id)
            | Command::TaskDelete(id)
            | Command::TaskToggle(id)
            | Command::SessionDelete(id) => vec![*id],
            Command::TagEdit(p) => vec![p.id],
            Command::ProjectNew(p) => p.tags.clone(),
            Command::ProjectEdit(p) => std::iter::once(p.id).chain(p.tags.iter().copied()).collect(),
            Command::TaskNew(p) => vec![p.project_id],
            Command::TaskEdit(p) => vec![p.task_id],
            Command::SessionNew(p) => vec![p.project_id, p.duration, p.date],
        }
    }

    fn check_range(&self) -> Result<()> {
        match self.integers().into_iter().find(|&n| n > MAX_STORED_INTEGER) {
            Some(n) => Err(Error::InvalidArgument(format!(
                "Value out of range for {}: {}",
                self.action(),
                n
            ))),
            None => Ok(()),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Command::TagNew(_) => Action::TagNew,
            Command::TagDelete(_) => Action::TagDelete,
            Command::TagEdit(_) => Action::TagEdit,
            Command::ProjectNew(_) => Action::ProjectNew,
            Command::ProjectGet(_) => Action::ProjectGet,
            Command::ProjectDelete(_) => Action::ProjectDelete,
            Command::ProjectEdit(_) => Action::ProjectEdit,
            Command::TaskNew(_) => Action::TaskNew,
            Command::TaskDelete(_) => Action::TaskDelete,
            Command::TaskToggle(_) => Action::TaskToggle,
            Command::TaskEdit(_) => Action::TaskEdit,
            Command::SessionNew(_) => Action::SessionNew,
            Command::SessionDelete(_) => Action::SessionDelete,
        }
    }
}

fn params<T: DeserializeOwned>(request: &Request, action: Action) -> Result<T> {
    let key = action.params_key();
    let value = request
        .params
        .get(key)
        .ok_or_else(|| Error::InvalidArgument(format!("Missing {} for {}", key, action)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::InvalidArgument(format!("Invalid {}: {}", key, e)))
}

// ============================================================================
// Server → Client
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Outcome of a single request
    ActionExecuted,
    TagUpdate,
    TagDelete,
    TagList,
    SummaryUpdate,
    SummaryList,
    ProjectUpdate,
    ProjectDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
    /// Backend messages carry no status.
    #[serde(rename = "")]
    None,
}

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    pub id: String,
    pub status: Status,
}

impl Response {
    /// Successful `ACTION_EXECUTED` reply.
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageType::ActionExecuted,
            payload,
            id: id.into(),
            status: Status::Ok,
        }
    }

    /// Failed `ACTION_EXECUTED` reply; the payload is the error message.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::ActionExecuted,
            payload: Value::String(message.into()),
            id: id.into(),
            status: Status::Error,
        }
    }

    /// Unsolicited state-change message.
    pub fn backend(kind: MessageType, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            id: String::new(),
            status: Status::None,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
