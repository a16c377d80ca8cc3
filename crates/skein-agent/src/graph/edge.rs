use std::sync::Arc;

use skein_core::error::{Result, SkeinError};

use super::value::{Value, ValueKind};

type DecideFn = dyn Fn(&Value) -> Result<String> + Send + Sync;

/// A named decision bound to one source node.
///
/// The function maps the source's output to one of `candidates`. Only the
/// chosen successor runs; the others are skipped entirely.
#[derive(Clone)]
pub struct Branch {
    pub name: String,
    pub candidates: Vec<String>,
    decide: Arc<DecideFn>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .finish()
    }
}

impl Branch {
    pub fn new<F>(name: impl Into<String>, candidates: Vec<String>, decide: F) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            candidates,
            decide: Arc::new(decide),
        }
    }

    /// Route on a judgment's flag: `flagged` when raised, `clear` otherwise.
    pub fn on_flag(name: impl Into<String>, flagged: &str, clear: &str) -> Self {
        let name = name.into();
        let (flagged, clear) = (flagged.to_string(), clear.to_string());
        let candidates = vec![flagged.clone(), clear.clone()];
        let branch_name = name.clone();
        Self::new(name, candidates, move |value| match value {
            Value::Judgment(j) if j.red_flag => Ok(flagged.clone()),
            Value::Judgment(_) => Ok(clear.clone()),
            other => Err(SkeinError::ContractViolation {
                node: branch_name.clone(),
                expected: ValueKind::Judgment.to_string(),
                found: other.kind().to_string(),
            }),
        })
    }

    /// Evaluate the decision. Labels outside the candidate set are rejected.
    pub fn resolve(&self, source: &str, value: &Value) -> Result<String> {
        let label = (self.decide)(value)?;
        if self.candidates.iter().any(|c| *c == label) {
            Ok(label)
        } else {
            Err(SkeinError::UnresolvedBranch {
                node: source.to_string(),
                label,
            })
        }
    }
}

/// How a node hands its output on.
#[derive(Debug, Clone)]
pub(crate) enum Successors {
    /// Every listed node receives the output (fan-out when more than one).
    Edges(Vec<String>),
    /// Exactly one candidate receives the output.
    Branch(Branch),
}

impl Successors {
    /// Every node this rule can possibly hand output to.
    pub(crate) fn targets(&self) -> &[String] {
        match self {
            Self::Edges(to) => to,
            Self::Branch(b) => &b.candidates,
        }
    }
}
