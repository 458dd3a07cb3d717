//! # STOMP 1.2 Frames
//!
//! The chat server speaks STOMP over WebSocket text messages. This module is
//! the envelope layer only: it turns frames into text and text back into
//! frames. What the bodies mean is the wire codec's business.
//!
//! A WebSocket message may carry several NUL-terminated frames, and a message
//! made of nothing but line breaks is a heart-beat.

use std::fmt;

use crate::error::FrameError;

/// STOMP commands this client sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(match raw {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim (no escaping).
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Something read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Header lookup. When a header repeats, the first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat_out_ms: u64, heartbeat_in_ms: u64, token: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat_out_ms, heartbeat_in_ms));
        if let Some(token) = token {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Serializes the frame, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Splits one transport message into heart-beats and frames.
///
/// Each element is parsed independently so one bad frame does not poison the
/// others that arrived with it.
pub fn parse_stream(text: &str) -> Vec<Result<Inbound, FrameError>> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start_matches(['\n', '\r']);
        if trimmed.is_empty() {
            if !rest.is_empty() {
                out.push(Ok(Inbound::Heartbeat));
            }
            break;
        }
        match trimmed.find('\0') {
            Some(end) => {
                out.push(parse_frame(&trimmed[..end]).map(Inbound::Frame));
                rest = &trimmed[end + 1..];
            }
            None => {
                out.push(Err(FrameError::Unterminated));
                break;
            }
        }
    }
    out
}

/// Parses a single frame without its NUL terminator.
pub fn parse_frame(raw: &str) -> Result<Frame, FrameError> {
    let raw = raw.trim_start_matches(['\n', '\r']);
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }

    let mut pos = 0;
    let mut lines: Vec<&str> = Vec::new();
    loop {
        let newline = raw[pos..].find('\n').map(|i| pos + i);
        let line_end = newline.unwrap_or(raw.len());
        let line = raw[pos..line_end].trim_end_matches('\r');
        pos = newline.map(|n| n + 1).unwrap_or(raw.len());
        if line.is_empty() {
            break;
        }
        lines.push(line);
        if newline.is_none() {
            break;
        }
    }

    let (command_line, header_lines) = lines.split_first().ok_or(FrameError::Empty)?;
    let command = Command::parse(command_line)?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::with_capacity(header_lines.len());
    for line in header_lines {
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if unescape {
            headers.push((unescape_header(k)?, unescape_header(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    Ok(Frame {
        command,
        headers,
        body: raw[pos..].to_string(),
    })
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::BadEscape(raw.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_encodes_headers_and_terminator() {
        let text = Frame::send("/app/chat/room/7", r#"{"content":"hi"}"#).encode();
        assert!(text.starts_with("SEND\ndestination:/app/chat/room/7\n"));
        assert!(text.contains("content-type:application/json\n"));
        assert!(text.ends_with("\n\n{\"content\":\"hi\"}\0"));
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let text = Frame::connect("chat.example", 4000, 4000, Some("tok")).encode();
        assert!(text.contains("host:chat.example\n"));
        assert!(text.contains("heart-beat:4000,4000\n"));
        assert!(text.contains("Authorization:Bearer tok\n"));
    }

    #[test]
    fn header_values_with_colons_survive() {
        let frame = Frame::new(Command::Message)
            .header("destination", "/topic/a:b")
            .with_body("x");
        let parsed = parse_frame(frame.encode().trim_end_matches('\0')).unwrap();
        assert_eq!(parsed.get("destination"), Some("/topic/a:b"));
        assert_eq!(parsed.body, "x");
    }

    #[test]
    fn stream_with_heartbeat_and_two_frames() {
        let text = "\n";
        assert_eq!(parse_stream(text), vec![Ok(Inbound::Heartbeat)]);

        let text = "MESSAGE\ndestination:/topic/x\nsubscription:sub-1\n\n{\"a\":1}\0\nERROR\nmessage:nope\n\nbad\0";
        let parsed = parse_stream(text);
        assert_eq!(parsed.len(), 2);
        match &parsed[0] {
            Ok(Inbound::Frame(f)) => {
                assert_eq!(f.command, Command::Message);
                assert_eq!(f.get("subscription"), Some("sub-1"));
                assert_eq!(f.body, "{\"a\":1}");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &parsed[1] {
            Ok(Inbound::Frame(f)) => {
                assert_eq!(f.command, Command::Error);
                assert_eq!(f.get("message"), Some("nope"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn crlf_line_endings_and_first_header_wins() {
        let frame = parse_frame("CONNECTED\r\nversion:1.2\r\nversion:1.1\r\n\r\n").unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn malformed_input_is_reported() {
        assert_eq!(parse_frame("BOGUS\n\n"), Err(FrameError::UnknownCommand("BOGUS".into())));
        assert!(matches!(parse_frame("MESSAGE\nnocolon\n\n"), Err(FrameError::MalformedHeader(_))));
        assert!(matches!(parse_frame("MESSAGE\nbad:\\x\n\n"), Err(FrameError::BadEscape(_))));
        assert_eq!(parse_stream("MESSAGE\n\nbody"), vec![Err(FrameError::Unterminated)]);
    }
}
