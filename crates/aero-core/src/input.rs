//! Operator console input.

use std::str::FromStr;

use aero_proto::{parse_reply, Action, Command, CommandError, GotoParams};

/// One operator request, as delivered to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HumanInput {
    /// Take authority and run this command.
    Command(Command),
    /// Hand authority to the autonomous source.
    Release,
    /// Stop autonomous following and take authority back.
    StopFollow,
    SimulateTarget,
    ClearTargets,
    Exit,
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("unknown input '{0}'")]
    Unknown(String),
    #[error("{keyword}: expected {expected}")]
    Usage { keyword: &'static str, expected: &'static str },
    #[error("{keyword}: '{value}' is not a number")]
    NotANumber { keyword: &'static str, value: String },
    #[error(transparent)]
    Command(#[from] CommandError),
}

fn number(keyword: &'static str, s: &str) -> Result<f64, InputError> {
    s.parse().map_err(|_| InputError::NotANumber { keyword, value: s.to_string() })
}

impl FromStr for HumanInput {
    type Err = InputError;

    /// Keywords: `land`, `disarm`, `takeoff [alt]`, `goto N E ALT [yaw]`,
    /// `follow [id]`, `hold`, `release`, `stop_follow`, `simulate_person`,
    /// `clear_detection`, `exit`. A line starting with `{` is a JSON command.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.starts_with('{') {
            return Ok(HumanInput::Command(parse_reply(line)?));
        }

        let lower = line.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        let input = match words.as_slice() {
            ["land"] => HumanInput::Command(Command::land("Human override: manual land.")),
            ["disarm"] => HumanInput::Command(Command::disarm("Human override: manual disarm.")),
            ["hold"] => HumanInput::Command(Command::do_nothing("Human override: hold position.")),
            ["takeoff"] => HumanInput::Command(Command::takeoff(None, "Human override: takeoff.")),
            ["takeoff", alt] => {
                HumanInput::Command(Command::takeoff(Some(number("takeoff", alt)?), "Human override: takeoff."))
            }
            ["takeoff", ..] => return Err(InputError::Usage { keyword: "takeoff", expected: "takeoff [ALT]" }),
            ["goto", n, e, alt, rest @ ..] if rest.len() <= 1 => {
                let params = GotoParams {
                    north_m: number("goto", n)?,
                    east_m: number("goto", e)?,
                    altitude_m: number("goto", alt)?,
                    yaw_deg: rest.first().map(|y| number("goto", y)).transpose()?.unwrap_or(0.0),
                };
                HumanInput::Command(Command::new(Action::GotoLocation(params), "Human override: goto."))
            }
            ["goto", ..] => return Err(InputError::Usage { keyword: "goto", expected: "goto N E ALT [YAW]" }),
            ["follow"] => HumanInput::Command(Command::follow(None, "Human override: follow.")),
            ["follow", _] => {
                // ids keep the operator's casing
                let id = line.split_whitespace().nth(1).map(str::to_string);
                HumanInput::Command(Command::follow(id, "Human override: follow."))
            }
            ["release"] => HumanInput::Release,
            ["stop_follow"] => HumanInput::StopFollow,
            ["simulate_person"] => HumanInput::SimulateTarget,
            ["clear_detection"] => HumanInput::ClearTargets,
            ["exit"] | ["quit"] => HumanInput::Exit,
            _ => return Err(InputError::Unknown(line.to_string())),
        };
        Ok(input)
    }
}
