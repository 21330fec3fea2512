//! Builder for constructing [`TracedGraph`] instances programmatically.
//!
//! Hosts without a tracer frontend (and the test suite) use this to assemble
//! graphs wire by wire, in the same shape the external tracer would emit.

use super::{Literal, OpKind, TracedGraph, TracedNode, Wire};
use crate::tensor::Tensor;

/// Builder for traced graphs.
///
/// Node indices are allocated monotonically, so a built graph is always a DAG
/// with producers at lower indices than their consumers.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<TracedNode>,
    inputs: Vec<usize>,
    outputs: Vec<Wire>,
    next_id: usize,
}

impl GraphBuilder {
    /// Create a new empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, kind: OpKind, inputs: Vec<Wire>, literal: Option<Literal>) -> Wire {
        let idx = self.alloc();
        self.nodes.push(TracedNode {
            idx,
            kind,
            inputs,
            literal,
        });
        (idx, 0)
    }

    /// Add a graph input placeholder.
    pub fn input(&mut self) -> Wire {
        let wire = self.push(OpKind::Input, vec![], None);
        self.inputs.push(wire.0);
        wire
    }

    /// Add a scalar f64 constant.
    pub fn const_f64(&mut self, value: f64) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::F64(value)))
    }

    /// Add a scalar i64 constant.
    pub fn const_i64(&mut self, value: i64) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::I64(value)))
    }

    /// Add a bool constant.
    pub fn const_bool(&mut self, value: bool) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::Bool(value)))
    }

    /// Add an int-list constant (strides, padding, dilation).
    pub fn const_int_list(&mut self, values: Vec<i64>) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::IntList(values)))
    }

    /// Add a symbol constant naming a packed parameter store entry.
    pub fn const_symbol(&mut self, name: impl Into<String>) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::Symbol(name.into())))
    }

    /// Add a tensor constant.
    pub fn const_tensor(&mut self, tensor: Tensor<f32>) -> Wire {
        self.push(OpKind::Constant, vec![], Some(Literal::Tensor(tensor)))
    }

    /// Bundle wires into a list node (the tracer's `prim::ListConstruct`).
    pub fn list(&mut self, items: Vec<Wire>) -> Wire {
        self.push(OpKind::ListConstruct, items, None)
    }

    /// `aten::quantize_per_tensor(value, scale, zero_point)`.
    pub fn quantize_per_tensor(&mut self, value: Wire, scale: f64, zero_point: i64) -> Wire {
        let scale = self.const_f64(scale);
        let zp = self.const_i64(zero_point);
        self.push(OpKind::QuantizePerTensor, vec![value, scale, zp], None)
    }

    /// `aten::dequantize(value)`.
    pub fn dequantize(&mut self, value: Wire) -> Wire {
        self.push(OpKind::Dequantize, vec![value], None)
    }

    /// `quantized::conv2d` (or the relu-fused variant).
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        input: Wire,
        packed_param: &str,
        stride: (i64, i64),
        padding: (i64, i64),
        dilation: (i64, i64),
        groups: i64,
        output_scale: f64,
        output_zero_point: i64,
        with_relu: bool,
    ) -> Wire {
        let packed = self.const_symbol(packed_param);
        let stride = self.const_int_list(vec![stride.0, stride.1]);
        let padding = self.const_int_list(vec![padding.0, padding.1]);
        let dilation = self.const_int_list(vec![dilation.0, dilation.1]);
        let groups = self.const_i64(groups);
        let out_scale = self.const_f64(output_scale);
        let out_zp = self.const_i64(output_zero_point);
        let kind = if with_relu {
            OpKind::Conv2dRelu
        } else {
            OpKind::Conv2d
        };
        self.push(
            kind,
            vec![
                input, packed, stride, padding, dilation, groups, out_scale, out_zp,
            ],
            None,
        )
    }

    /// `quantized::linear` (or the relu-fused variant).
    pub fn linear(
        &mut self,
        input: Wire,
        packed_param: &str,
        output_scale: f64,
        output_zero_point: i64,
        with_relu: bool,
    ) -> Wire {
        let packed = self.const_symbol(packed_param);
        let out_scale = self.const_f64(output_scale);
        let out_zp = self.const_i64(output_zero_point);
        let kind = if with_relu {
            OpKind::LinearRelu
        } else {
            OpKind::Linear
        };
        self.push(kind, vec![input, packed, out_scale, out_zp], None)
    }

    /// `quantized::add` / `quantized::mul` and their relu-fused variants.
    pub fn binop(
        &mut self,
        kind: OpKind,
        lhs: Wire,
        rhs: Wire,
        output_scale: f64,
        output_zero_point: i64,
    ) -> Wire {
        assert!(
            matches!(
                kind,
                OpKind::Add | OpKind::AddRelu | OpKind::Mul | OpKind::MulRelu
            ),
            "binop expects an elementwise add/mul kind, got {kind}"
        );
        let out_scale = self.const_f64(output_scale);
        let out_zp = self.const_i64(output_zero_point);
        self.push(kind, vec![lhs, rhs, out_scale, out_zp], None)
    }

    /// `quantized::cat(list, axis)` with declared output quant params.
    pub fn cat(
        &mut self,
        items: Vec<Wire>,
        axis: i64,
        output_scale: f64,
        output_zero_point: i64,
    ) -> Wire {
        let list = self.list(items);
        let axis = self.const_i64(axis);
        let out_scale = self.const_f64(output_scale);
        let out_zp = self.const_i64(output_zero_point);
        self.push(OpKind::Cat, vec![list, axis, out_scale, out_zp], None)
    }

    /// `quantized::add_scalar(value, scalar)`.
    ///
    /// Output quant params are not supplied: the materializer computes them.
    pub fn add_scalar(&mut self, value: Wire, scalar: f64) -> Wire {
        let scalar = self.const_f64(scalar);
        self.push(OpKind::AddScalar, vec![value, scalar], None)
    }

    /// `quantized::mul_scalar(value, scalar)`.
    pub fn mul_scalar(&mut self, value: Wire, scalar: f64) -> Wire {
        let scalar = self.const_f64(scalar);
        self.push(OpKind::MulScalar, vec![value, scalar], None)
    }

    /// `quantized::relu6(value, inplace)`.
    pub fn relu6(&mut self, value: Wire) -> Wire {
        let inplace = self.const_bool(false);
        self.push(OpKind::Relu6, vec![value, inplace], None)
    }

    /// `aten::relu(value)`.
    pub fn relu(&mut self, value: Wire) -> Wire {
        self.push(OpKind::Relu, vec![value], None)
    }

    /// Declare a graph output.
    pub fn output(&mut self, wire: Wire) {
        self.outputs.push(wire);
    }

    /// Finish building and return the traced graph.
    pub fn finish(self) -> TracedGraph {
        TracedGraph {
            nodes: self.nodes.into_iter().map(|n| (n.idx, n)).collect(),
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_quantize_dequantize_chain() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.5, 128);
        let d = b.dequantize(q);
        b.output(d);
        let graph = b.finish();

        assert_eq!(graph.inputs, vec![0]);
        assert_eq!(graph.outputs, vec![(4, 0)]);
        let qnode = graph.node(q.0);
        assert_eq!(qnode.kind, OpKind::QuantizePerTensor);
        assert_eq!(qnode.inputs.len(), 3);
        assert_eq!(graph.expect_f64(qnode.inputs[1]).unwrap(), 0.5);
        assert_eq!(graph.expect_i64(qnode.inputs[2]).unwrap(), 128);
    }

    #[test]
    fn conv_operand_layout_matches_contract() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.5, 128);
        let c = b.conv2d(q, "features.0._packed_params", (1, 1), (0, 0), (1, 1), 1, 1.0, 0, false);
        b.output(c);
        let graph = b.finish();

        let node = graph.node(c.0);
        assert_eq!(node.inputs.len(), 8);
        // Output quant params sit at the table positions the resolver expects.
        assert_eq!(graph.expect_f64(node.inputs[6]).unwrap(), 1.0);
        assert_eq!(graph.expect_i64(node.inputs[7]).unwrap(), 0);
    }
}
