//! Request/response envelope shared by the controller, the triggers and the
//! policy authority.
//!
//! A [`Message`] is a command code plus an ordered list of JSON values. The
//! same envelope carries requests and responses; responses use the
//! `Response*` codes. Messages are immutable once built.

mod queue;

pub use queue::{PendingRequest, QueueClosed, RequestQueue, ResponseHandle};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands with a numeric code above this value are refused while the
/// daemon is locked.
pub const LOCK_THRESHOLD: u16 = 2047;

/// Reason carried by the error response of requests abandoned at shutdown.
pub const SHUTTING_DOWN: &str = "shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    // Read-only / always allowed
    Ping,
    GetSettings,
    GetProfile,
    Unlock,
    GetLockState,
    GetMode,
    Lock,

    // Privileged
    ModeSwitch,
    PutSettings,
    Reload,
    SetPassphrase,
    StopDisable,
    NewException,
    CheckScheduledRules,

    // Responses
    ResponseOk,
    ResponseWarning,
    ResponseError,
    ResponseLocked,
}

impl Command {
    pub const ALL: [Command; 18] = [
        Command::Ping,
        Command::GetSettings,
        Command::GetProfile,
        Command::Unlock,
        Command::GetLockState,
        Command::GetMode,
        Command::Lock,
        Command::ModeSwitch,
        Command::PutSettings,
        Command::Reload,
        Command::SetPassphrase,
        Command::StopDisable,
        Command::NewException,
        Command::CheckScheduledRules,
        Command::ResponseOk,
        Command::ResponseWarning,
        Command::ResponseError,
        Command::ResponseLocked,
    ];

    /// Numeric wire code.
    pub const fn code(self) -> u16 {
        match self {
            Command::Ping => 1,
            Command::GetSettings => 2,
            Command::GetProfile => 3,
            Command::Unlock => 4,
            Command::GetLockState => 5,
            Command::GetMode => 6,
            Command::Lock => 7,
            Command::ModeSwitch => 2049,
            Command::PutSettings => 2050,
            Command::Reload => 2051,
            Command::SetPassphrase => 2052,
            Command::StopDisable => 2053,
            Command::NewException => 2054,
            Command::CheckScheduledRules => 2055,
            Command::ResponseOk => 4097,
            Command::ResponseWarning => 4098,
            Command::ResponseError => 4099,
            Command::ResponseLocked => 4100,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Whether the lock gate applies to this command.
    pub fn requires_unlock(self) -> bool {
        self.code() > LOCK_THRESHOLD
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            Command::ResponseOk
                | Command::ResponseWarning
                | Command::ResponseError
                | Command::ResponseLocked
        )
    }

    /// Commands only the daemon itself may issue.
    pub fn is_internal(self) -> bool {
        matches!(self, Command::CheckScheduledRules)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{command:?} is missing argument {index}")]
    MissingArgument { command: Command, index: usize },

    #[error("{command:?} argument {index} is invalid: {source}")]
    InvalidArgument {
        command: Command,
        index: usize,
        source: serde_json::Error,
    },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    command: Command,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<Value>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            arguments: Vec::new(),
        }
    }

    pub fn with_args(command: Command, arguments: Vec<Value>) -> Self {
        Self { command, arguments }
    }

    pub fn ok() -> Self {
        Self::new(Command::ResponseOk)
    }

    pub fn ok_with(arguments: Vec<Value>) -> Self {
        Self::with_args(Command::ResponseOk, arguments)
    }

    pub fn warning() -> Self {
        Self::new(Command::ResponseWarning)
    }

    /// Error response carrying a human-readable reason as its only argument.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::with_args(Command::ResponseError, vec![Value::String(reason.into())])
    }

    pub fn locked() -> Self {
        Self::with_args(Command::ResponseLocked, vec![Value::from(1)])
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn is_ok(&self) -> bool {
        self.command == Command::ResponseOk
    }

    /// Decode the argument at `index` into a typed value.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ProtocolError> {
        let value = self
            .arguments
            .get(index)
            .ok_or(ProtocolError::MissingArgument {
                command: self.command,
                index,
            })?;
        serde_json::from_value(value.clone()).map_err(|source| ProtocolError::InvalidArgument {
            command: self.command,
            index,
            source,
        })
    }

    /// Reason attached to an error response, if any.
    pub fn reason(&self) -> Option<&str> {
        match self.command {
            Command::ResponseError => self.arguments.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Serialize a typed value into a message argument.
pub fn to_arg<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(value)?)
}
