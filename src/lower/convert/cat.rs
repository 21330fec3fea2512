//! Conversion of `quantized::cat`.

use super::ConvertCtx;
use crate::{
    error::LowerError,
    graph::{OpKind, TracedNode},
    params::{QuantScale, QuantZeroPoint},
    qir::{DType, QirNode, ValueId},
};
use itertools::Itertools;

/// Materialized operand layout:
/// 0 list construct, 1 axis, 2 output_scale, 3 output_zero_point,
/// then one `(scale, zero_point)` pair per bundled tensor.
#[tracing::instrument(name = "convert::cat", skip_all, fields(node = node.idx))]
pub(super) fn quantized_cat(
    ctx: &mut ConvertCtx<'_>,
    node: &TracedNode,
) -> Result<ValueId, LowerError> {
    let list = ctx.graph.producer(node.inputs[0]);
    if list.kind != OpKind::ListConstruct {
        return Err(LowerError::invariant(
            node.idx,
            node.kind,
            format!("cat operand 0 must be a list construct, found {}", list.kind),
        ));
    }
    let num_inputs = list.inputs.len();
    ctx.expect_arity(node, 4 + 2 * num_inputs)?;

    let axis = ctx.graph.expect_i64(node.inputs[1])?;
    if axis < 0 {
        return Err(LowerError::invariant(
            node.idx,
            node.kind,
            format!("negative concat axis {axis} is not supported"),
        ));
    }
    let (output_scale, output_zero_point) = ctx.scale_zp(node, 2)?;

    // Every input is dequantized with its own params, concatenated in the
    // real domain, then quantized once to the shared output params.
    let mut dequantized = Vec::with_capacity(num_inputs);
    let param_pairs = node.inputs[4..].iter().copied().tuples();
    for (&item, (scale_wire, zp_wire)) in list.inputs.iter().zip(param_pairs) {
        let value = ctx.value(item)?;
        let scale = ctx.graph.expect_f64(scale_wire)?;
        let zero_point = ctx.graph.expect_i64(zp_wire)? as i32;
        dequantized.push(ctx.qir.push(QirNode::Dequantize {
            value,
            scale,
            zero_point,
        }));
    }
    let concat = ctx.qir.push(QirNode::Concatenate {
        inputs: dequantized,
        axis: axis as usize,
    });

    Ok(ctx.qir.push(QirNode::Quantize {
        value: concat,
        scale: QuantScale::PerTensor(output_scale),
        zero_point: QuantZeroPoint::PerTensor(output_zero_point),
        axis: 1,
        dtype: DType::U8,
    }))
}
