use thiserror::Error;

/// A single problem found while compiling a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `start` has no outgoing edge or branch.
    NoEntry,
    /// Node cannot be reached from `start`.
    Unreachable(String),
    /// Node (other than `end`) has neither an outgoing edge nor a branch.
    DeadEnd(String),
    /// Nodes that participate in at least one cycle.
    Cycle(Vec<String>),
    /// An edge leaves `end`.
    EdgeFromEnd(String),
    /// An edge or branch candidate points at `start`.
    EdgeIntoStart(String),
    /// Producer output does not match consumer input.
    ContractMismatch {
        from: String,
        to: String,
        produced: String,
        expected: String,
    },
    /// Two predecessors of a fan-in node share an output label.
    DuplicateFanInLabel { node: String, label: String },
    /// A single-input node is fed by more than one unconditional producer.
    MultipleInputs { node: String, sources: Vec<String> },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEntry => write!(f, "start has no successor"),
            Self::Unreachable(id) => write!(f, "node '{}' is unreachable from start", id),
            Self::DeadEnd(id) => write!(f, "node '{}' has no outgoing edge or branch", id),
            Self::Cycle(ids) => write!(f, "cycle through [{}]", ids.join(", ")),
            Self::EdgeFromEnd(to) => write!(f, "end has an outgoing edge to '{}'", to),
            Self::EdgeIntoStart(from) => write!(f, "'{}' points back into start", from),
            Self::ContractMismatch {
                from,
                to,
                produced,
                expected,
            } => write!(
                f,
                "'{}' produces {} but '{}' expects {}",
                from, produced, to, expected
            ),
            Self::DuplicateFanInLabel { node, label } => write!(
                f,
                "fan-in '{}' has more than one predecessor labelled '{}'",
                node, label
            ),
            Self::MultipleInputs { node, sources } => write!(
                f,
                "'{}' takes one input but always receives from [{}]",
                node,
                sources.join(", ")
            ),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SkeinError {
    // Graph construction errors
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node '{0}' already has a successor rule (edges and a branch are exclusive)")]
    AmbiguousSuccessor(String),

    #[error("Graph validation failed: {}", join_violations(.0))]
    GraphValidation(Vec<Violation>),

    // Graph invocation errors
    #[error("Branch on '{node}' resolved to undeclared label '{label}'")]
    UnresolvedBranch { node: String, label: String },

    #[error("Node '{node}' contract violated: expected {expected}, got {found}")]
    ContractViolation {
        node: String,
        expected: String,
        found: String,
    },

    #[error("Node '{0}' received inputs from more than one predecessor")]
    ConflictingInputs(String),

    #[error("Graph finished without reaching end")]
    EndNotReached,

    // Agent chain errors
    #[error("Agent chain has no steps")]
    ChainEmpty,

    #[error("Agent chain step {index} failed: {source}")]
    ChainStepFailed {
        index: usize,
        #[source]
        source: Box<SkeinError>,
    },

    // Collaborator errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("Agent {agent} failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Similarity search failed: {0}")]
    Search(String),

    // Data errors
    #[error("Content is empty")]
    EmptyContent,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Prompt file not found: {0}")]
    PromptNotFound(String),

    #[error("Prompt file is empty: {0}")]
    PromptEmpty(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Session errors
    #[error("Session error: {0}")]
    Session(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SkeinError>;
