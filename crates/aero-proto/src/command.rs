use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Takeoff,
    Land,
    Disarm,
    GotoLocation,
    FollowTarget,
    DoNothing,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Takeoff => "takeoff",
            ActionKind::Land => "land",
            ActionKind::Disarm => "disarm",
            ActionKind::GotoLocation => "goto_location",
            ActionKind::FollowTarget => "follow_target",
            ActionKind::DoNothing => "do_nothing",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "takeoff" => Some(ActionKind::Takeoff),
            "land" => Some(ActionKind::Land),
            "disarm" => Some(ActionKind::Disarm),
            "goto_location" => Some(ActionKind::GotoLocation),
            "follow_target" => Some(ActionKind::FollowTarget),
            "do_nothing" => Some(ActionKind::DoNothing),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TakeoffParams {
    /// None means the executor's default takeoff altitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
}

/// Offboard reposition target, NED relative to the origin with a positive altitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GotoParams {
    pub north_m: f64,
    pub east_m: f64,
    pub altitude_m: f64,
    #[serde(default)]
    pub yaw_deg: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FollowParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// Closed set of high-level actions, each carrying only its own parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Takeoff(TakeoffParams),
    Land,
    Disarm,
    GotoLocation(GotoParams),
    FollowTarget(FollowParams),
    DoNothing,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Takeoff(_) => ActionKind::Takeoff,
            Action::Land => ActionKind::Land,
            Action::Disarm => ActionKind::Disarm,
            Action::GotoLocation(_) => ActionKind::GotoLocation,
            Action::FollowTarget(_) => ActionKind::FollowTarget,
            Action::DoNothing => ActionKind::DoNothing,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("{action} requires parameter {param}")]
    MissingParameter { action: ActionKind, param: &'static str },

    #[error("{action}: parameter {param} is invalid ({reason})")]
    InvalidParameter {
        action: ActionKind,
        param: &'static str,
        reason: String,
    },

    #[error("{0}: parameters must be a JSON object")]
    MalformedParameters(ActionKind),

    #[error("command reply is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A resolved high-level command. Decoded from and encoded to the JSON wire shape
/// `{"action": ..., "parameters": {...}, "reason": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireCommand", into = "WireCommand")]
pub struct Command {
    action: Action,
    reason: String,
}

impl Command {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self { action, reason: reason.into() }
    }

    pub fn takeoff(altitude_m: Option<f64>, reason: impl Into<String>) -> Self {
        Self::new(Action::Takeoff(TakeoffParams { altitude_m }), reason)
    }

    pub fn land(reason: impl Into<String>) -> Self {
        Self::new(Action::Land, reason)
    }

    pub fn disarm(reason: impl Into<String>) -> Self {
        Self::new(Action::Disarm, reason)
    }

    pub fn goto(north_m: f64, east_m: f64, altitude_m: f64, reason: impl Into<String>) -> Self {
        Self::new(
            Action::GotoLocation(GotoParams { north_m, east_m, altitude_m, yaw_deg: 0.0 }),
            reason,
        )
    }

    pub fn follow(target_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::new(Action::FollowTarget(FollowParams { target_id }), reason)
    }

    pub fn do_nothing(reason: impl Into<String>) -> Self {
        Self::new(Action::DoNothing, reason)
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Loosely typed wire form. Only used at the decoding boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub reason: String,
}

impl TryFrom<WireCommand> for Command {
    type Error = CommandError;

    fn try_from(wire: WireCommand) -> Result<Self, Self::Error> {
        let kind = ActionKind::from_wire(wire.action.trim())
            .ok_or_else(|| CommandError::UnknownAction(wire.action.clone()))?;

        let empty = Map::new();
        let params = match &wire.parameters {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(_) => return Err(CommandError::MalformedParameters(kind)),
        };

        let action = match kind {
            ActionKind::Takeoff => Action::Takeoff(TakeoffParams {
                altitude_m: optional_f64(kind, params, "altitude_m")?,
            }),
            ActionKind::Land => Action::Land,
            ActionKind::Disarm => Action::Disarm,
            ActionKind::GotoLocation => Action::GotoLocation(GotoParams {
                north_m: required_f64(kind, params, "north_m")?,
                east_m: required_f64(kind, params, "east_m")?,
                altitude_m: required_f64(kind, params, "altitude_m")?,
                yaw_deg: optional_f64(kind, params, "yaw_deg")?.unwrap_or(0.0),
            }),
            ActionKind::FollowTarget => Action::FollowTarget(FollowParams {
                target_id: optional_id(kind, params, "target_id")?,
            }),
            ActionKind::DoNothing => Action::DoNothing,
        };

        Ok(Command { action, reason: wire.reason })
    }
}

impl From<Command> for WireCommand {
    fn from(cmd: Command) -> Self {
        let mut params = Map::new();
        match &cmd.action {
            Action::Takeoff(p) => {
                if let Some(alt) = p.altitude_m {
                    params.insert("altitude_m".into(), alt.into());
                }
            }
            Action::GotoLocation(p) => {
                params.insert("north_m".into(), p.north_m.into());
                params.insert("east_m".into(), p.east_m.into());
                params.insert("altitude_m".into(), p.altitude_m.into());
                params.insert("yaw_deg".into(), p.yaw_deg.into());
            }
            Action::FollowTarget(p) => {
                if let Some(id) = &p.target_id {
                    params.insert("target_id".into(), id.clone().into());
                }
            }
            Action::Land | Action::Disarm | Action::DoNothing => {}
        }
        WireCommand {
            action: cmd.kind().as_str().to_string(),
            parameters: Some(Value::Object(params)),
            reason: cmd.reason,
        }
    }
}

fn optional_f64(
    action: ActionKind,
    params: &Map<String, Value>,
    param: &'static str,
) -> Result<Option<f64>, CommandError> {
    match params.get(param) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| CommandError::InvalidParameter {
            action,
            param,
            reason: format!("{} is not representable as f64", n),
        }),
        Some(other) => Err(CommandError::InvalidParameter {
            action,
            param,
            reason: format!("expected a number, got {}", other),
        }),
    }
}

fn required_f64(
    action: ActionKind,
    params: &Map<String, Value>,
    param: &'static str,
) -> Result<f64, CommandError> {
    optional_f64(action, params, param)?.ok_or(CommandError::MissingParameter { action, param })
}

// Track ids are strings but decision sources often emit bare integers.
fn optional_id(
    action: ActionKind,
    params: &Map<String, Value>,
    param: &'static str,
) -> Result<Option<String>, CommandError> {
    match params.get(param) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(CommandError::InvalidParameter {
            action,
            param,
            reason: format!("expected a string id, got {}", other),
        }),
    }
}

/// Decodes a decision-source reply: either a bare JSON object or one wrapped in a
/// ```json fenced block.
pub fn parse_reply(text: &str) -> Result<Command, CommandError> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    let wire: WireCommand = serde_json::from_str(body)?;
    Command::try_from(wire)
}
