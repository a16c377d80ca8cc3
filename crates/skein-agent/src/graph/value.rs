use std::collections::BTreeMap;
use std::fmt;

use skein_core::types::{ChatMessage, Judgment};

/// Payload carried along graph edges.
///
/// Every node declares the [`ValueKind`] it consumes and produces, so shape
/// mismatches are caught when the graph is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    /// Named template variables.
    Vars(BTreeMap<String, String>),
    Messages(Vec<ChatMessage>),
    Message(ChatMessage),
    Judgment(Judgment),
    /// Fan-in input: one entry per predecessor, keyed by its label.
    Merged(BTreeMap<String, Value>),
}

/// Declared shape of a node's input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Vars,
    Messages,
    Message,
    Judgment,
    Merged,
    /// Accepts anything. Only meaningful as an input contract.
    Any,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Vars => "vars",
            Self::Messages => "messages",
            Self::Message => "message",
            Self::Judgment => "judgment",
            Self::Merged => "merged",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

impl ValueKind {
    /// Whether a consumer declaring `self` may take a value of kind `produced`.
    pub fn accepts(self, produced: ValueKind) -> bool {
        matches!(self, Self::Any | Self::Merged) || self == produced
    }
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Single-entry variable map.
    pub fn var(name: &str, value: impl Into<String>) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(name.to_string(), value.into());
        Self::Vars(vars)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Vars(_) => ValueKind::Vars,
            Self::Messages(_) => ValueKind::Messages,
            Self::Message(_) => ValueKind::Message,
            Self::Judgment(_) => ValueKind::Judgment,
            Self::Merged(_) => ValueKind::Merged,
        }
    }

    /// Template variables derived from this value.
    ///
    /// Judgments expose `red_flag`, `description` and `address`; scalar
    /// values are bound to `input`.
    pub fn to_vars(&self) -> BTreeMap<String, String> {
        match self {
            Self::Vars(vars) => vars.clone(),
            Self::Judgment(j) => {
                let mut vars = BTreeMap::new();
                vars.insert("red_flag".into(), j.red_flag.to_string());
                vars.insert("description".into(), j.description.clone());
                vars.insert("address".into(), j.address.clone().unwrap_or_default());
                vars
            }
            Self::Merged(entries) => {
                let mut vars: BTreeMap<String, String> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect();
                vars.insert("input".into(), merge_text(entries));
                vars
            }
            other => {
                let mut vars = BTreeMap::new();
                vars.insert("input".into(), other.to_string());
                vars
            }
        }
    }
}

/// Compose fan-in entries into one text, one `label: value` line per entry
/// in label order.
pub fn merge_text(entries: &BTreeMap<String, Value>) -> String {
    let mut out = String::new();
    for (label, value) in entries {
        out.push_str(label);
        out.push_str(": ");
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Message(m) => f.write_str(&m.content),
            Self::Messages(msgs) => {
                let parts: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
                f.write_str(&parts.join("\n"))
            }
            Self::Vars(vars) => {
                let lines: Vec<String> = vars.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                f.write_str(&lines.join("\n"))
            }
            Self::Judgment(j) => match serde_json::to_string(j) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{:?}", j),
            },
            Self::Merged(entries) => f.write_str(merge_text(entries).trim_end()),
        }
    }
}
