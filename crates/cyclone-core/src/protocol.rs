//! Engine wire protocol.
//!
//! One JSON object per line over a persistent TCP socket. Every object has a
//! `type` tag:
//!
//! - client to engine: `eval`, `play`, `pause`, `stop`, `hush`,
//!   `getSamples`, `getSounds`, `getBanks`
//! - engine to client: `active`, `error`, `status`, `samples`, `sounds`,
//!   `banks`
//!
//! Lines that fail to parse are dropped; the connection stays open.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Longest unterminated line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Transport control requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Play,
    Pause,
    Stop,
    Hush,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Play => "play",
            Control::Pause => "pause",
            Control::Stop => "stop",
            Control::Hush => "hush",
        }
    }
}

impl std::str::FromStr for Control {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(Control::Play),
            "pause" => Ok(Control::Pause),
            "stop" => Ok(Control::Stop),
            "hush" => Ok(Control::Hush),
            other => Err(format!("unknown transport control '{}'", other)),
        }
    }
}

/// Inventory an engine can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Samples,
    Sounds,
    Banks,
}

impl QueryKind {
    /// The startup batch a freshly connected client pipelines.
    pub const STARTUP: [QueryKind; 3] = [QueryKind::Samples, QueryKind::Banks, QueryKind::Sounds];

    pub fn request(self) -> ClientMessage {
        match self {
            QueryKind::Samples => ClientMessage::GetSamples,
            QueryKind::Sounds => ClientMessage::GetSounds,
            QueryKind::Banks => ClientMessage::GetBanks,
        }
    }
}

impl std::str::FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "samples" => Ok(QueryKind::Samples),
            "sounds" => Ok(QueryKind::Sounds),
            "banks" => Ok(QueryKind::Banks),
            other => Err(format!("unknown inventory '{}'", other)),
        }
    }
}

/// Client to engine messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Eval {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bufnr: Option<i64>,
    },
    Play,
    Pause,
    Stop,
    Hush,
    GetSamples,
    GetSounds,
    GetBanks,
}

impl ClientMessage {
    pub fn eval(code: impl Into<String>) -> Self {
        ClientMessage::Eval {
            code: code.into(),
            bufnr: None,
        }
    }

    pub fn control(control: Control) -> Self {
        match control {
            Control::Play => ClientMessage::Play,
            Control::Pause => ClientMessage::Pause,
            Control::Stop => ClientMessage::Stop,
            Control::Hush => ClientMessage::Hush,
        }
    }
}

/// Half-open text range in the buffer that was evaluated.
///
/// Only meaningful against the buffer contents at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpan {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

/// A span currently producing sound, with the value it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveElement {
    #[serde(flatten)]
    pub span: SourceSpan,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Engine to client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Active {
        elements: Vec<ActiveElement>,
        cycle: i64,
        /// Evaluation counter; a fresh evaluation may restart `cycle` at 0.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation: Option<u64>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        col: Option<u32>,
    },
    Status {
        playing: bool,
        cycle: i64,
        cps: f64,
    },
    Samples {
        samples: Vec<String>,
    },
    Sounds {
        sounds: Vec<String>,
    },
    Banks {
        banks: Vec<String>,
    },
}

impl ServerMessage {
    /// The query this message answers, if it is an inventory reply.
    pub fn query_kind(&self) -> Option<QueryKind> {
        match self {
            ServerMessage::Samples { .. } => Some(QueryKind::Samples),
            ServerMessage::Sounds { .. } => Some(QueryKind::Sounds),
            ServerMessage::Banks { .. } => Some(QueryKind::Banks),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Active { .. } => "active",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Samples { .. } => "samples",
            ServerMessage::Sounds { .. } => "sounds",
            ServerMessage::Banks { .. } => "banks",
        }
    }
}

/// Serialize a message as one protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Reassembles newline-delimited JSON from arbitrarily chunked reads.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Discarding the rest of an oversized line.
    skipping: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held for an unterminated line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and collect every complete line it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            match rest.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    if self.skipping {
                        self.skipping = false;
                    } else {
                        self.buf.extend_from_slice(&rest[..idx]);
                        if let Some(line) = self.take_line() {
                            lines.push(line);
                        }
                    }
                    self.buf.clear();
                    rest = &rest[idx + 1..];
                }
                None => {
                    if !self.skipping {
                        self.buf.extend_from_slice(rest);
                        if self.buf.len() > MAX_LINE_BYTES {
                            log::warn!(
                                "[PROTOCOL] Dropping line longer than {} bytes",
                                MAX_LINE_BYTES
                            );
                            self.buf.clear();
                            self.skipping = true;
                        }
                    }
                    rest = &[];
                }
            }
        }

        lines
    }

    /// Feed a chunk and decode every complete line as `T`, dropping lines
    /// that are not valid messages.
    pub fn push_messages<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<T> {
        self.push(chunk)
            .into_iter()
            .filter_map(|line| match serde_json::from_str::<T>(&line) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::debug!("[PROTOCOL] Dropping malformed line ({}): {}", e, line);
                    None
                }
            })
            .collect()
    }

    fn take_line(&mut self) -> Option<String> {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(line),
            Err(_) => {
                log::debug!("[PROTOCOL] Dropping line that is not UTF-8");
                None
            }
        }
    }
}
