//! Tool size validation
//!
//! Sizes are free text checked against a permissive allow-list. The tool
//! type name decides the extra rule: thread tools get an automatic "M"
//! prefix, mills and drills need a numeric size.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizeError {
    #[error("invalid characters in size '{0}': only letters, digits, dots and dashes are allowed")]
    InvalidCharacters(String),
    #[error("size '{0}' must be numeric for mills and drills (e.g. 8, 10.5, M6)")]
    NotNumeric(String),
}

impl SizeError {
    pub fn code(&self) -> &'static str {
        match self {
            SizeError::InvalidCharacters(_) => "invalid_characters",
            SizeError::NotNumeric(_) => "not_numeric",
        }
    }
}

/// Accepted size, possibly rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeCheck {
    pub value: String,
    /// Set when the value differs from the input beyond trimming
    pub note: Option<String>,
}

/// Which rule family a tool type falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    Thread,
    Numeric,
    Free,
}

const THREAD_MARKERS: [&str; 2] = ["резьб", "thread"];
const NUMERIC_MARKERS: [&str; 4] = ["фрез", "mill", "сверл", "drill"];

fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9Мм.\-\s]").expect("static pattern"))
}

fn numeric_size() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[мm]?[0-9]+[.0-9]*$").expect("static pattern"))
}

fn is_thread(lower_type: &str) -> bool {
    THREAD_MARKERS.iter().any(|m| lower_type.contains(m))
}

fn is_numeric(lower_type: &str) -> bool {
    NUMERIC_MARKERS.iter().any(|m| lower_type.contains(m))
}

/// Thread rules win over numeric ones for the hint ("Thread mill" is a thread tool)
pub fn size_kind(tool_type: &str) -> SizeKind {
    let lower = tool_type.to_lowercase();
    if is_thread(&lower) {
        SizeKind::Thread
    } else if is_numeric(&lower) {
        SizeKind::Numeric
    } else {
        SizeKind::Free
    }
}

/// Placeholder shown in the size input for a tool type
pub fn size_hint(tool_type: &str) -> &'static str {
    if tool_type.trim().is_empty() {
        return "Tool size";
    }
    match size_kind(tool_type) {
        SizeKind::Thread => "e.g. M8, M10",
        SizeKind::Numeric => "e.g. 8, 10.5, 12",
        SizeKind::Free => "Tool size",
    }
}

pub fn validate_tool_size(tool_type: &str, tool_size: &str) -> Result<SizeCheck, SizeError> {
    let size = tool_size.trim();
    if size.is_empty() {
        return Ok(SizeCheck {
            value: String::new(),
            note: None,
        });
    }

    if invalid_chars().is_match(size) {
        return Err(SizeError::InvalidCharacters(size.to_string()));
    }

    let lower_type = tool_type.to_lowercase();
    let lower_size = size.to_lowercase();

    if is_thread(&lower_type) && !lower_size.starts_with('m') && !lower_size.starts_with('м') {
        return Ok(SizeCheck {
            value: format!("M{}", size.to_uppercase()),
            note: Some("added the M prefix to the thread size".to_string()),
        });
    }

    if is_numeric(&lower_type) {
        let compact: String = lower_size.chars().filter(|c| !c.is_whitespace()).collect();
        if !numeric_size().is_match(&compact) {
            return Err(SizeError::NotNumeric(size.to_string()));
        }
    }

    Ok(SizeCheck {
        value: size.to_string(),
        note: None,
    })
}
