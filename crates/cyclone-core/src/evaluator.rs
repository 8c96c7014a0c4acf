//! The seam between the server and the pattern evaluator.
//!
//! The evaluator owns the pattern language; the server only hands it code,
//! asks it to hush, and relays its inventory.

use std::fmt;
use std::sync::OnceLock;

/// Pattern evaluator hosted by the engine.
///
/// Calls arrive from a blocking worker thread, one evaluation at a time.
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate `code`, replacing whatever pattern is playing.
    fn evaluate(&self, code: &str, bufnr: Option<i64>) -> Result<(), EvalError>;

    /// Silence all output immediately.
    fn hush(&self);

    fn samples(&self) -> Vec<String>;

    fn sounds(&self) -> Vec<String>;

    fn banks(&self) -> Vec<String>;
}

/// Failure reported by the evaluator for bad user code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub message: String,
    pub line: Option<u32>,
    pub col: Option<u32>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            col: None,
        }
    }

    pub fn at(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            col: Some(col),
        }
    }

    /// Line and column, falling back to whatever the message text names.
    pub fn position(&self) -> (Option<u32>, Option<u32>) {
        if self.line.is_some() {
            return (self.line, self.col);
        }
        parse_position(&self.message)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

struct PositionPatterns {
    line: regex::Regex,
    col: regex::Regex,
    pair: regex::Regex,
}

fn patterns() -> Option<&'static PositionPatterns> {
    static PATTERNS: OnceLock<Option<PositionPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(PositionPatterns {
                line: regex::Regex::new(r"(?i)\bline\s*(\d+)").ok()?,
                col: regex::Regex::new(r"(?i)\b(?:col|column)\s*(\d+)").ok()?,
                pair: regex::Regex::new(r"\((\d+):(\d+)\)|\b(\d+):(\d+)\b").ok()?,
            })
        })
        .as_ref()
}

/// Best-effort line/column from an error message.
///
/// Understands "line 3", "line 3, col 7" / "column 7", and "3:7".
pub fn parse_position(message: &str) -> (Option<u32>, Option<u32>) {
    let Some(p) = patterns() else {
        return (None, None);
    };

    let number = |caps: &regex::Captures, idx: usize| {
        caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok())
    };

    if let Some(caps) = p.line.captures(message) {
        let line = number(&caps, 1);
        let col = p.col.captures(message).and_then(|c| number(&c, 1));
        return (line, col);
    }

    if let Some(caps) = p.pair.captures(message) {
        let line = number(&caps, 1).or_else(|| number(&caps, 3));
        let col = number(&caps, 2).or_else(|| number(&caps, 4));
        return (line, col);
    }

    (None, None)
}
