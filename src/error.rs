use crate::graph::OpKind;
use thiserror::Error;

/// Error type for graph lowering.
///
/// Every variant is fatal: a graph either lowers completely or the whole
/// conversion fails. Each variant carries enough context (operator kind,
/// node identity) to diagnose which stage rejected the graph.
#[derive(Debug, Error)]
pub enum LowerError {
    /// A packed parameter blob was unrecognized or used an unsupported
    /// quantization scheme.
    #[error("failed to decode packed parameter `{name}`: {reason}")]
    Decode {
        /// Parameter store key of the offending blob
        name: String,
        /// What the decoder rejected
        reason: String,
    },

    /// The backward producer search exhausted the graph without finding
    /// quantization metadata. Indicates a tracer/graph contract violation.
    #[error("no quantization producer found reachable from node {node} ({kind})")]
    Resolution {
        /// Node at which the search bottomed out
        node: usize,
        /// Operator kind of that node
        kind: OpKind,
    },

    /// Conversion was requested for an operator kind outside the fixed
    /// registry.
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),

    /// An operand-count or operand-type assertion failed after
    /// materialization. Signals an internal bug in the resolver or
    /// materializer rather than bad input.
    #[error("invariant violation at node {node} ({kind}): {message}")]
    Invariant {
        /// Node at which the invariant failed
        node: usize,
        /// Operator kind of that node
        kind: OpKind,
        /// What was violated
        message: String,
    },
}

impl LowerError {
    pub(crate) fn invariant(node: usize, kind: OpKind, message: impl Into<String>) -> Self {
        LowerError::Invariant {
            node,
            kind,
            message: message.into(),
        }
    }
}
