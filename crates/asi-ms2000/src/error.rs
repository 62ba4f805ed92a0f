use std::time::Duration;

use stage_core::AxisId;

/// Fault codes reported by the controller after the `:N` marker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    UnknownCommand,
    UnrecognizedAxisParameter,
    MissingParameters,
    ParameterOutOfRange,
    OperationFailed,
    UndefinedError,
    InvalidCardAddress,
    SerialCommandHalted,
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        use ErrorCode::*;
        match self {
            UnknownCommand => 1,
            UnrecognizedAxisParameter => 2,
            MissingParameters => 3,
            ParameterOutOfRange => 4,
            OperationFailed => 5,
            UndefinedError => 6,
            InvalidCardAddress => 7,
            SerialCommandHalted => 21,
        }
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = u32;
    fn try_from(code: u32) -> std::result::Result<Self, u32> {
        use ErrorCode::*;
        Ok(match code {
            1 => UnknownCommand,
            2 => UnrecognizedAxisParameter,
            3 => MissingParameters,
            4 => ParameterOutOfRange,
            5 => OperationFailed,
            6 => UndefinedError,
            7 => InvalidCardAddress,
            21 => SerialCommandHalted,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        use ErrorCode::*;
        let msg = match self {
            UnknownCommand => "unknown command",
            UnrecognizedAxisParameter => "unrecognized axis parameter",
            MissingParameters => "missing parameters",
            ParameterOutOfRange => "parameter out of range",
            OperationFailed => "operation failed",
            UndefinedError => "undefined error",
            InvalidCardAddress => "invalid card address",
            SerialCommandHalted => "serial command halted",
        };
        write!(f, "{msg} (:N-{})", self.code())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serial port {port} unavailable ({reason})")]
    PortUnavailable {
        port: String,
        /// true when another process holds the port
        busy: bool,
        reason: String,
    },
    #[error("no reply to identification probe on {port} within {timeout:?}")]
    ValidationTimeout { port: String, timeout: Duration },
    #[error("device on {port} is not a {expected} controller, it replied {reply:?}")]
    ValidationMismatch {
        port: String,
        expected: String,
        reply: String,
    },
    #[error("no {expected} controller found (tried {tried:?})")]
    DeviceNotFound { expected: String, tried: Vec<String> },
    #[error("command {command:?} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
    #[error("command {command:?} rejected by controller: {}", describe_nak(.code, .raw_code))]
    NegativeAck {
        command: String,
        code: Option<ErrorCode>,
        raw_code: Option<u32>,
    },
    #[error("malformed response to {command:?}: {reply:?}")]
    MalformedResponse { command: String, reply: String },
    #[error("command {0:?} contains a line terminator")]
    TerminatorInCommand(String),
    #[error("invalid {what} {value} for axis {axis}")]
    InvalidValue {
        axis: AxisId,
        what: &'static str,
        value: f64,
    },
    #[error("serial connection is not open")]
    NotOpen,
    #[error("serial connection closed")]
    Closed,
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
}

fn describe_nak(code: &Option<ErrorCode>, raw_code: &Option<u32>) -> String {
    match (code, raw_code) {
        (Some(code), _) => code.to_string(),
        (None, Some(raw)) => format!("unrecognized error code {raw}"),
        (None, None) => "no error code".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn test_error_code_table() {
    for raw in [1, 2, 3, 4, 5, 6, 7, 21] {
        let code = ErrorCode::try_from(raw).unwrap();
        assert_eq!(code.code(), raw);
    }
    assert_eq!(ErrorCode::try_from(8), Err(8));
    assert_eq!(ErrorCode::try_from(0), Err(0));
    assert_eq!(
        ErrorCode::try_from(21),
        Ok(ErrorCode::SerialCommandHalted)
    );
}

#[test]
fn test_nak_display() {
    let e = Error::NegativeAck {
        command: "M X=10".into(),
        code: Some(ErrorCode::ParameterOutOfRange),
        raw_code: Some(4),
    };
    assert_eq!(
        e.to_string(),
        "command \"M X=10\" rejected by controller: parameter out of range (:N-4)"
    );
}
