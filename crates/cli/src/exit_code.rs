// Consistent exit codes for the supportchat CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error (bad identity, endpoint or config)
//   13 = network error (server unreachable, transport lost)
//   14 = request rejected by the server
//   15 = request timed out

use std::process;

use supportchat_session::config::ConfigError;
use supportchat_session::SessionError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Network = 13,
    Rejected = 14,
    Timeout = 15,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(session_err) = cause.downcast_ref::<SessionError>() {
                return Self::from_session_error(session_err);
            }
            if cause.downcast_ref::<ServerUnreachable>().is_some() {
                return Self::Network;
            }
            if let Some(config_err) = cause.downcast_ref::<ConfigError>() {
                return match config_err {
                    ConfigError::InvalidEndpoint(_) | ConfigError::Parse(_) => Self::Usage,
                    _ => Self::Error,
                };
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                        Self::Network
                    }
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }

    pub fn from_session_error(err: &SessionError) -> Self {
        match err {
            SessionError::InvalidIdentity(_) | SessionError::InvalidEndpoint(_) => Self::Usage,
            SessionError::NotConnected | SessionError::TransportLost => Self::Network,
            SessionError::RemoteRejected { .. } => Self::Rejected,
            SessionError::Timeout => Self::Timeout,
            SessionError::Cancelled | SessionError::Protocol(_) => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// The session gave up reconnecting before it was ever usable.
#[derive(Debug)]
pub struct ServerUnreachable {
    pub attempts: u32,
}

impl std::fmt::Display for ServerUnreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chat server unreachable after {} attempts", self.attempts)
    }
}

impl std::error::Error for ServerUnreachable {}
