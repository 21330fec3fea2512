//! In-memory representation of a traced quantized computation graph.
//!
//! The graph is produced by an external tracer and handed to this crate by
//! reference; the only mutation this crate performs is the materializer's
//! one-shot append of quantization operands (see [`crate::lower::materialize`]).

use crate::{error::LowerError, tensor::Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Programmatic construction of traced graphs.
pub mod build;

/// A reference to a producing node's output: `(node index, output index)`.
pub type Wire = (usize, usize);

/// Operator kinds the tracer may emit.
///
/// The serialized tag strings are a contract with the external tracer;
/// renaming any of them breaks resolution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
pub enum OpKind {
    /// A graph input placeholder.
    #[strum(serialize = "prim::Param")]
    Input,
    /// A literal value (scalar, int list, symbol, or tensor).
    #[strum(serialize = "prim::Constant")]
    Constant,
    /// Bundles a variadic set of tensors (used by `quantized::cat`).
    #[strum(serialize = "prim::ListConstruct")]
    ListConstruct,
    #[strum(serialize = "aten::quantize_per_tensor")]
    QuantizePerTensor,
    #[strum(serialize = "aten::dequantize")]
    Dequantize,
    #[strum(serialize = "quantized::conv2d")]
    Conv2d,
    #[strum(serialize = "quantized::conv2d_relu")]
    Conv2dRelu,
    #[strum(serialize = "quantized::linear")]
    Linear,
    #[strum(serialize = "quantized::linear_relu")]
    LinearRelu,
    #[strum(serialize = "quantized::add")]
    Add,
    #[strum(serialize = "quantized::add_relu")]
    AddRelu,
    #[strum(serialize = "quantized::mul")]
    Mul,
    #[strum(serialize = "quantized::mul_relu")]
    MulRelu,
    #[strum(serialize = "quantized::cat")]
    Cat,
    #[strum(serialize = "quantized::add_scalar")]
    AddScalar,
    #[strum(serialize = "quantized::mul_scalar")]
    MulScalar,
    #[strum(serialize = "quantized::relu6")]
    Relu6,
    #[strum(serialize = "aten::relu")]
    Relu,
}

impl OpKind {
    /// Parse a tracer tag string.
    ///
    /// Tags outside the fixed registry are a fatal
    /// [`LowerError::UnsupportedOperator`], never a silent fallback.
    pub fn from_tag(tag: &str) -> Result<Self, LowerError> {
        Self::from_str(tag).map_err(|_| LowerError::UnsupportedOperator(tag.to_string()))
    }

    /// The tracer tag string for this kind.
    pub fn tag(self) -> &'static str {
        self.into()
    }
}

/// A literal attribute carried by a [`OpKind::Constant`] node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    F64(f64),
    I64(i64),
    Bool(bool),
    IntList(Vec<i64>),
    /// Symbolic reference to a packed parameter store entry.
    Symbol(String),
    Tensor(Tensor<f32>),
}

/// One node of the traced graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedNode {
    /// Index of this node in the graph.
    pub idx: usize,
    /// Operator kind.
    pub kind: OpKind,
    /// Ordered input edges.
    pub inputs: Vec<Wire>,
    /// Literal payload, present only on `Constant` nodes.
    pub literal: Option<Literal>,
}

/// A traced computation graph: nodes keyed by index, plus declared
/// graph inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TracedGraph {
    /// Map of node indices to nodes.
    pub nodes: BTreeMap<usize, TracedNode>,
    /// Indices of input nodes.
    pub inputs: Vec<usize>,
    /// Output wires of the graph.
    pub outputs: Vec<Wire>,
}

impl TracedGraph {
    /// Look up a node by index.
    ///
    /// # Panics
    ///
    /// Panics on a dangling index; wires always reference existing nodes in a
    /// well-formed trace.
    pub fn node(&self, idx: usize) -> &TracedNode {
        self.nodes
            .get(&idx)
            .unwrap_or_else(|| panic!("dangling node index {idx}"))
    }

    /// The node producing `wire`.
    pub fn producer(&self, wire: Wire) -> &TracedNode {
        self.node(wire.0)
    }

    /// Append a fresh constant node and return its wire.
    pub(crate) fn push_constant(&mut self, literal: Literal) -> Wire {
        let idx = self.nodes.keys().next_back().map_or(0, |last| last + 1);
        self.nodes.insert(
            idx,
            TracedNode {
                idx,
                kind: OpKind::Constant,
                inputs: vec![],
                literal: Some(literal),
            },
        );
        (idx, 0)
    }

    fn literal(&self, wire: Wire) -> Result<&Literal, LowerError> {
        let node = self.producer(wire);
        node.literal.as_ref().ok_or_else(|| {
            LowerError::invariant(node.idx, node.kind, "expected a constant operand")
        })
    }

    /// Scalar f64 literal behind `wire`.
    pub fn expect_f64(&self, wire: Wire) -> Result<f64, LowerError> {
        match self.literal(wire)? {
            Literal::F64(v) => Ok(*v),
            other => Err(LowerError::invariant(
                wire.0,
                self.producer(wire).kind,
                format!("expected f64 literal, found {other:?}"),
            )),
        }
    }

    /// Scalar i64 literal behind `wire`.
    pub fn expect_i64(&self, wire: Wire) -> Result<i64, LowerError> {
        match self.literal(wire)? {
            Literal::I64(v) => Ok(*v),
            other => Err(LowerError::invariant(
                wire.0,
                self.producer(wire).kind,
                format!("expected i64 literal, found {other:?}"),
            )),
        }
    }

    /// Int-list literal behind `wire`.
    pub fn expect_int_list(&self, wire: Wire) -> Result<&[i64], LowerError> {
        match self.literal(wire)? {
            Literal::IntList(v) => Ok(v),
            other => Err(LowerError::invariant(
                wire.0,
                self.producer(wire).kind,
                format!("expected int list literal, found {other:?}"),
            )),
        }
    }

    /// Symbol literal behind `wire`.
    pub fn expect_symbol(&self, wire: Wire) -> Result<&str, LowerError> {
        match self.literal(wire)? {
            Literal::Symbol(v) => Ok(v),
            other => Err(LowerError::invariant(
                wire.0,
                self.producer(wire).kind,
                format!("expected symbol literal, found {other:?}"),
            )),
        }
    }

    /// Tensor literal behind `wire`.
    pub fn expect_tensor(&self, wire: Wire) -> Result<&Tensor<f32>, LowerError> {
        match self.literal(wire)? {
            Literal::Tensor(v) => Ok(v),
            other => Err(LowerError::invariant(
                wire.0,
                self.producer(wire).kind,
                format!("expected tensor literal, found {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in [
            OpKind::QuantizePerTensor,
            OpKind::Dequantize,
            OpKind::Conv2d,
            OpKind::Conv2dRelu,
            OpKind::Linear,
            OpKind::LinearRelu,
            OpKind::Add,
            OpKind::AddRelu,
            OpKind::Mul,
            OpKind::MulRelu,
            OpKind::Cat,
            OpKind::AddScalar,
            OpKind::MulScalar,
            OpKind::Relu6,
            OpKind::Relu,
        ] {
            assert_eq!(OpKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert_eq!(OpKind::Conv2d.tag(), "quantized::conv2d");
        assert_eq!(
            OpKind::QuantizePerTensor.tag(),
            "aten::quantize_per_tensor"
        );
    }

    #[test]
    fn unknown_tag_is_unsupported() {
        let err = OpKind::from_tag("quantized::conv3d").unwrap_err();
        assert!(matches!(
            err,
            LowerError::UnsupportedOperator(tag) if tag == "quantized::conv3d"
        ));
    }

    #[test]
    fn tensor_literals_are_readable() {
        let mut b = build::GraphBuilder::new();
        let t = b.const_tensor(Tensor::from_vec(vec![1.0f32, 2.0]));
        let s = b.const_symbol("fc._packed_params");
        let graph = b.finish();

        assert_eq!(graph.expect_tensor(t).unwrap().data(), &[1.0, 2.0]);
        assert!(graph.expect_tensor(s).is_err());
    }

    #[test]
    fn push_constant_allocates_past_last_index() {
        let mut graph = TracedGraph::default();
        let a = graph.push_constant(Literal::F64(1.5));
        let b = graph.push_constant(Literal::I64(3));
        assert_eq!(a, (0, 0));
        assert_eq!(b, (1, 0));
        assert_eq!(graph.expect_f64(a).unwrap(), 1.5);
        assert_eq!(graph.expect_i64(b).unwrap(), 3);
        assert!(graph.expect_f64(b).is_err());
    }
}
