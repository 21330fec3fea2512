//! Per-operator conversion into affine-quantization IR nodes.
//!
//! Conversion functions are pure rewrites over a materialized node: every
//! quant param they need sits at a fixed operand position, so they never
//! walk the graph. Dispatch is a closed match over [`OpKind`]; reaching an
//! arm for a kind the registry cannot convert is a structural bug upstream.

use crate::{
    error::LowerError,
    graph::{OpKind, TracedGraph, TracedNode, Wire},
    params::QuantParamRegistry,
    qir::{QirBuilder, ValueId},
};
use std::collections::BTreeMap;

mod activation;
mod binop;
mod cat;
mod conv2d;
mod dense;
mod quantize;
mod scalar;

/// Shared state threaded through the conversion functions.
pub(crate) struct ConvertCtx<'a> {
    pub graph: &'a TracedGraph,
    pub registry: &'a QuantParamRegistry,
    pub qir: &'a mut QirBuilder,
    /// Traced wire -> emitted IR value.
    pub values: &'a mut BTreeMap<Wire, ValueId>,
}

impl ConvertCtx<'_> {
    /// IR value already emitted for a traced wire.
    pub fn value(&self, wire: Wire) -> Result<ValueId, LowerError> {
        self.values.get(&wire).copied().ok_or_else(|| {
            LowerError::invariant(
                wire.0,
                self.graph.producer(wire).kind,
                "operand has no converted value",
            )
        })
    }

    /// Exact post-materialization operand count.
    pub fn expect_arity(&self, node: &TracedNode, n: usize) -> Result<(), LowerError> {
        if node.inputs.len() != n {
            return Err(LowerError::invariant(
                node.idx,
                node.kind,
                format!(
                    "expected {n} operands after materialization, found {}",
                    node.inputs.len()
                ),
            ));
        }
        Ok(())
    }

    /// Read an appended `(scale, zero_point)` literal pair starting at
    /// operand `at`.
    pub fn scale_zp(&self, node: &TracedNode, at: usize) -> Result<(f64, i32), LowerError> {
        let scale = self.graph.expect_f64(node.inputs[at])?;
        let zp = self.graph.expect_i64(node.inputs[at + 1])?;
        Ok((scale, zp as i32))
    }

    /// Read a two-element int-list operand (stride, padding, dilation).
    pub fn int_pair(&self, node: &TracedNode, at: usize) -> Result<(usize, usize), LowerError> {
        let list = self.graph.expect_int_list(node.inputs[at])?;
        match list {
            [a, b] => Ok((*a as usize, *b as usize)),
            _ => Err(LowerError::invariant(
                node.idx,
                node.kind,
                format!("operand {at} must be a 2-element int list, found {list:?}"),
            )),
        }
    }
}

/// Convert one materialized node, returning the IR value of its output.
pub(crate) fn convert_node(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    match node.kind {
        OpKind::QuantizePerTensor => quantize::quantize_per_tensor(ctx, node),
        OpKind::Dequantize => quantize::dequantize(ctx, node),
        OpKind::Conv2d => conv2d::quantized_conv2d(ctx, node, false),
        OpKind::Conv2dRelu => conv2d::quantized_conv2d(ctx, node, true),
        OpKind::Linear => dense::quantized_linear(ctx, node, false),
        OpKind::LinearRelu => dense::quantized_linear(ctx, node, true),
        OpKind::Add => binop::quantized_binop(ctx, node, binop::BinOp::Add, false),
        OpKind::AddRelu => binop::quantized_binop(ctx, node, binop::BinOp::Add, true),
        OpKind::Mul => binop::quantized_binop(ctx, node, binop::BinOp::Mul, false),
        OpKind::MulRelu => binop::quantized_binop(ctx, node, binop::BinOp::Mul, true),
        OpKind::Cat => cat::quantized_cat(ctx, node),
        OpKind::AddScalar => scalar::add_scalar(ctx, node),
        OpKind::MulScalar => scalar::mul_scalar(ctx, node),
        OpKind::Relu6 => activation::relu6(ctx, node),
        OpKind::Relu => activation::relu(ctx, node),
        OpKind::Input | OpKind::Constant | OpKind::ListConstruct => Err(LowerError::invariant(
            node.idx,
            node.kind,
            "structural node reached the conversion registry",
        )),
    }
}
