// STOMP 1.2 text frame codec.
//
// Frame layout: COMMAND EOL, header lines `name:value` EOL, blank line,
// body, NUL. A message consisting only of EOLs is a transport heartbeat.
// Header values are escaped (`\\`, `\n`, `\r`, `\c`) in every frame
// except CONNECT and CONNECTED.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED frames carry raw header values.
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Result of decoding one WebSocket text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// EOL-only keepalive.
    Heartbeat,
    Frame(Frame),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown STOMP command `{0}`")]
    UnknownCommand(String),

    #[error("frame has no header terminator")]
    MissingHeaderEnd,

    #[error("malformed header line `{0}`")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header `{0}`")]
    InvalidEscape(String),

    #[error("content-length {declared} exceeds body of {actual} bytes")]
    ContentLength { declared: usize, actual: usize },
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decode one frame from a WebSocket text message.
pub fn decode(input: &str) -> Result<Decoded, StompError> {
    let trimmed = input.trim_start_matches(['\r', '\n']);
    if trimmed.is_empty() || trimmed == "\0" {
        return Ok(Decoded::Heartbeat);
    }

    let (head, rest) = split_head(trimmed).ok_or(StompError::MissingHeaderEnd)?;
    let mut lines = head.lines();
    let command_line = lines.next().unwrap_or_default().trim_end_matches('\r');
    let command = Command::parse(command_line)
        .ok_or_else(|| StompError::UnknownCommand(command_line.to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) =
            line.split_once(':').ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let frame = Frame { command, headers, body: String::new() };
    let body = match frame.get("content-length").and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(declared) => {
            let bytes = rest.as_bytes();
            if declared > bytes.len() {
                return Err(StompError::ContentLength { declared, actual: bytes.len() });
            }
            String::from_utf8_lossy(&bytes[..declared]).into_owned()
        }
        None => match rest.find('\0') {
            Some(end) => rest[..end].to_string(),
            // Some brokers strip the trailing NUL; the message boundary
            // already delimits the frame.
            None => rest.to_string(),
        },
    };

    Ok(Decoded::Frame(Frame { body, ..frame }))
}

fn split_head(input: &str) -> Option<(&str, &str)> {
    let lf = input.find("\n\n").map(|i| (i, 2));
    let crlf = input.find("\r\n\r\n").map(|i| (i, 4));
    let (at, len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => {
            // Header-only frame without a body, e.g. `CONNECTED\nversion:1.2\n\0`.
            let end = input.find('\0')?;
            return Some((&input[..end], ""));
        }
    };
    Some((&input[..at], &input[at + len..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
