//! The affine-quantization IR emitted by the lowering pass.
//!
//! [`QirNode`] is a closed set: the conversion registry may emit these
//! variants and nothing else. Quantization descriptors (scales, zero
//! points) are typed payload fields, never positional operands.

use crate::params::{QuantScale, QuantZeroPoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod execute;

/// Identifier of a value (node output) in a [`QirGraph`].
pub type ValueId = usize;

/// Storage type a value is cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    U8,
    I8,
    I32,
    F32,
}

/// One node of the affine-quantization IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QirNode {
    /// Graph input, positionally bound at execution time.
    Input { index: usize },
    /// Named entry of the output parameter table.
    Param { name: String },
    /// Real scalar constant.
    Constant { value: f64 },

    /// `clip(round(zero_point + value/scale), q_min, q_max)` cast to `dtype`.
    /// Per-channel schemes quantize along `axis`.
    Quantize {
        value: ValueId,
        scale: QuantScale,
        zero_point: QuantZeroPoint,
        axis: usize,
        dtype: DType,
    },
    /// `(value - zero_point) * scale`.
    Dequantize {
        value: ValueId,
        scale: f64,
        zero_point: i32,
    },
    /// Rescale an integer accumulator from one affine domain to another.
    /// Per-channel input scales requantize along `axis`.
    Requantize {
        value: ValueId,
        in_scale: QuantScale,
        in_zero_point: i32,
        out_scale: f64,
        out_zero_point: i32,
        axis: usize,
    },

    /// Affine 2-D convolution over zero-point-shifted u8 operands with i32
    /// accumulation. Input layout NCHW, weight layout OIHW; padding has
    /// already been applied by an explicit `Pad`.
    AffineConv2d {
        input: ValueId,
        weight: ValueId,
        input_zero_point: i32,
        weight_zero_point: QuantZeroPoint,
        strides: (usize, usize),
        dilation: (usize, usize),
        groups: usize,
    },
    /// Affine dense contraction (`input [n,k]` × `weight [m,k]`), i32
    /// accumulation, zero-point-shifted operands.
    AffineDense {
        input: ValueId,
        weight: ValueId,
        input_zero_point: i32,
        weight_zero_point: QuantZeroPoint,
    },
    /// Add a rank-1 bias along channel axis 1.
    BiasAdd { value: ValueId, bias: ValueId },
    /// Elementwise clamp to `[min, max]`.
    Clip {
        value: ValueId,
        min: f64,
        max: f64,
    },
    /// Storage-type cast (rounds to the nearest integer for integer types).
    Cast { value: ValueId, dtype: DType },

    /// Real-valued elementwise addition (scalar constants broadcast).
    Add { lhs: ValueId, rhs: ValueId },
    /// Real-valued elementwise multiplication (scalar constants broadcast).
    Multiply { lhs: ValueId, rhs: ValueId },
    /// Real-valued concatenation along `axis`.
    Concatenate { inputs: Vec<ValueId>, axis: usize },
    /// Real-valued `max(value, 0)`.
    Relu { value: ValueId },
    /// Pad the two trailing (spatial) axes of an NCHW tensor symmetrically
    /// with `pad_value`. The fill value is semantically load-bearing: for
    /// quantized inputs it must be the input zero point, not zero.
    Pad {
        value: ValueId,
        padding: (usize, usize),
        pad_value: f64,
    },
}

/// An emitted IR graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QirGraph {
    /// Nodes keyed by value id.
    pub nodes: BTreeMap<ValueId, QirNode>,
    /// Graph input value ids, in declaration order.
    pub inputs: Vec<ValueId>,
    /// Graph output value ids.
    pub outputs: Vec<ValueId>,
}

impl QirGraph {
    /// Look up a node by value id.
    ///
    /// # Panics
    ///
    /// Panics on a dangling id.
    pub fn node(&self, id: ValueId) -> &QirNode {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("dangling value id {id}"))
    }
}

/// Append-only builder for [`QirGraph`].
#[derive(Debug, Default)]
pub struct QirBuilder {
    graph: QirGraph,
    next_id: ValueId,
}

impl QirBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node, returning the id of its value.
    pub fn push(&mut self, node: QirNode) -> ValueId {
        let id = self.next_id;
        self.next_id += 1;
        if let QirNode::Input { .. } = node {
            self.graph.inputs.push(id);
        }
        self.graph.nodes.insert(id, node);
        id
    }

    /// The node behind an already-emitted value.
    pub fn node(&self, id: ValueId) -> &QirNode {
        self.graph.node(id)
    }

    /// Declare a graph output.
    pub fn set_output(&mut self, id: ValueId) {
        self.graph.outputs.push(id);
    }

    /// Finish building.
    pub fn finish(self) -> QirGraph {
        self.graph
    }
}
