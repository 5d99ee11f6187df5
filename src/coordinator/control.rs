//! Control protocol
//!
//! Administrators talk newline-delimited JSON on the control port. A request
//! is an object `{"<verb>": <payload>}`; the reply is `{"<verb>": <result>}`
//! or `{"<verb>": "ERROR", "error": "<message>"}` when the coordinator
//! refuses. Unknown verbs and non-object messages kill the connection.

use crate::common::{AuditEventType, Error, Result};
use crate::coordinator::space_desc::parse_space;
use crate::coordinator::state::Coordinator;
use serde_json::{json, Value};

pub const SUCCESS: &str = "SUCCESS";
pub const ERROR: &str = "ERROR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    AddSpace(String),
    DelSpace(String),
    LstSpaces,
    GetSpace(String),
    Quiesce,
    Shutdown,
    GetStatus,
    GoLive,
    BackupState,
}

fn text_payload(verb: &str, payload: &Value) -> Result<String> {
    payload
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::kill(format!("{} expects a string payload", verb)))
}

impl ControlRequest {
    pub fn from_verb(verb: &str, payload: &Value) -> Result<Self> {
        Ok(match verb {
            "add-space" => ControlRequest::AddSpace(text_payload(verb, payload)?),
            "del-space" => ControlRequest::DelSpace(text_payload(verb, payload)?),
            "lst-spaces" => ControlRequest::LstSpaces,
            "get-space" => ControlRequest::GetSpace(text_payload(verb, payload)?),
            "quiesce" => ControlRequest::Quiesce,
            "shutdown" => ControlRequest::Shutdown,
            "get-status" => ControlRequest::GetStatus,
            "go-live" => ControlRequest::GoLive,
            "backup-state" => ControlRequest::BackupState,
            other => {
                return Err(Error::kill(format!(
                    "Control connection got invalid request {}",
                    other
                )))
            }
        })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ControlRequest::AddSpace(_) => "add-space",
            ControlRequest::DelSpace(_) => "del-space",
            ControlRequest::LstSpaces => "lst-spaces",
            ControlRequest::GetSpace(_) => "get-space",
            ControlRequest::Quiesce => "quiesce",
            ControlRequest::Shutdown => "shutdown",
            ControlRequest::GetStatus => "get-status",
            ControlRequest::GoLive => "go-live",
            ControlRequest::BackupState => "backup-state",
        }
    }

    /// Parse one request line. An object may carry several verbs; they are
    /// run in the order they appear, one reply per verb.
    pub fn parse_line(line: &str) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_str(line).map_err(|_| {
            Error::kill(format!("Control connection got non-JSON message {}", line))
        })?;
        let Value::Object(map) = value else {
            return Err(Error::kill(format!(
                "Control connection got invalid JSON message {}",
                line
            )));
        };
        map.iter()
            .map(|(verb, payload)| Self::from_verb(verb, payload))
            .collect()
    }

    /// Request line as sent by a client.
    pub fn to_line(&self) -> String {
        let payload = match self {
            ControlRequest::AddSpace(s) | ControlRequest::DelSpace(s) | ControlRequest::GetSpace(s) => {
                s.as_str()
            }
            _ => "",
        };
        json!({ self.verb(): payload }).to_string()
    }
}

/// The answer to one request, plus what the server should do about it.
#[derive(Debug, Clone)]
pub struct ControlReply {
    /// One JSON line, without the trailing newline.
    pub response: String,
    pub event: Option<(AuditEventType, Option<String>)>,
    /// Snapshot returned by a successful `shutdown`.
    pub snapshot: Option<String>,
}

impl ControlReply {
    fn success(verb: &str, result: &str) -> Self {
        Self {
            response: json!({ verb: result }).to_string(),
            event: None,
            snapshot: None,
        }
    }

    fn failure(verb: &str, msg: &str) -> Self {
        Self {
            response: json!({ verb: ERROR, "error": msg }).to_string(),
            event: None,
            snapshot: None,
        }
    }

    fn with_event(mut self, event: AuditEventType, target: Option<String>) -> Self {
        self.event = Some((event, target));
        self
    }
}

/// Run one request. Coordinator refusals become `ERROR` replies; anything
/// else is returned as an error and ends the connection.
pub fn execute(coord: &mut Coordinator, request: &ControlRequest) -> Result<ControlReply> {
    let verb = request.verb();
    let outcome = match request {
        ControlRequest::AddSpace(text) => parse_space(text)
            .and_then(|space| {
                let name = space.name.clone();
                coord.add_space(space)?;
                Ok(name)
            })
            .map(|name| {
                ControlReply::success(verb, SUCCESS)
                    .with_event(AuditEventType::SpaceAdded, Some(name))
            }),
        ControlRequest::DelSpace(name) => coord.del_space(name).map(|()| {
            ControlReply::success(verb, SUCCESS)
                .with_event(AuditEventType::SpaceDeleted, Some(name.clone()))
        }),
        ControlRequest::LstSpaces => Ok(ControlReply::success(verb, &coord.lst_spaces().join("\n"))),
        ControlRequest::GetSpace(name) => match coord.get_space(name) {
            Ok(space) => Ok(ControlReply::success(
                verb,
                &serde_json::to_string_pretty(space)?,
            )),
            Err(e) => Err(e),
        },
        ControlRequest::Quiesce => coord.quiesce().map(|state_id| {
            ControlReply::success(verb, &state_id)
                .with_event(AuditEventType::Quiesce, Some(state_id.clone()))
        }),
        ControlRequest::Shutdown => coord.shutdown().map(|snapshot| {
            let mut reply =
                ControlReply::success(verb, &snapshot).with_event(AuditEventType::Shutdown, None);
            reply.snapshot = Some(snapshot);
            reply
        }),
        ControlRequest::GetStatus => Ok(ControlReply::success(
            verb,
            &serde_json::to_string_pretty(&coord.get_status())?,
        )),
        ControlRequest::GoLive => coord
            .go_live()
            .map(|()| ControlReply::success(verb, SUCCESS).with_event(AuditEventType::GoLive, None)),
        ControlRequest::BackupState => Ok(ControlReply::success(verb, &coord.backup_state()?)),
    };

    match outcome {
        Ok(reply) => {
            tracing::info!("{} request processed", verb);
            Ok(reply)
        }
        Err(e) if e.is_domain() => {
            tracing::error!("failing control request {}: {}", verb, e);
            Ok(ControlReply::failure(verb, &e.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Parse and run every request on one line.
pub fn handle_line(coord: &mut Coordinator, line: &str) -> Result<Vec<ControlReply>> {
    ControlRequest::parse_line(line)?
        .iter()
        .map(|request| execute(coord, request))
        .collect()
}
