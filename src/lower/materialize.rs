//! Graph-mutating pass appending resolved quant params to operator inputs.
//!
//! After materialization, every node that needs quant context carries its
//! input `(scale, zero_point)` wires as trailing operands in declared-arity
//! order, so conversion functions index into them positionally and never
//! need graph context. The pass consumes the graph and returns a
//! [`MaterializedGraph`]; re-applying it would duplicate appended operands
//! and corrupt downstream indexing, which the newtype makes unrepresentable.

use super::resolve::resolve_quant_params;
use crate::{
    error::LowerError,
    graph::{Literal, OpKind, TracedGraph, Wire},
};

impl OpKind {
    /// Number of quantized inputs whose params the materializer must
    /// resolve and append. `None` for kinds needing no quant context;
    /// `cat` is variadic and handled separately.
    pub(crate) fn num_quantized_inputs(self) -> Option<usize> {
        match self {
            OpKind::Conv2d
            | OpKind::Conv2dRelu
            | OpKind::Linear
            | OpKind::LinearRelu
            | OpKind::Dequantize
            | OpKind::AddScalar
            | OpKind::MulScalar
            | OpKind::Relu6
            | OpKind::Relu => Some(1),
            OpKind::Add | OpKind::AddRelu | OpKind::Mul | OpKind::MulRelu => Some(2),
            _ => None,
        }
    }
}

/// A traced graph that has been through materialization exactly once.
#[derive(Debug, Clone)]
pub struct MaterializedGraph {
    graph: TracedGraph,
}

impl MaterializedGraph {
    /// The underlying graph, with quant param operands appended.
    pub fn graph(&self) -> &TracedGraph {
        &self.graph
    }
}

/// Append resolved quantization operands to every node needing them.
#[tracing::instrument(name = "materialize", skip_all)]
pub fn materialize(mut graph: TracedGraph) -> Result<MaterializedGraph, LowerError> {
    let indices: Vec<usize> = graph.nodes.keys().copied().collect();
    for idx in indices {
        let kind = graph.node(idx).kind;

        let pairs: Vec<(Wire, Wire)> = if kind == OpKind::Cat {
            resolve_cat_inputs(&graph, idx)?
        } else if let Some(n) = kind.num_quantized_inputs() {
            let node = graph.node(idx);
            if node.inputs.len() < n {
                return Err(LowerError::invariant(
                    idx,
                    kind,
                    format!("{n} quantized input(s) declared, {} present", node.inputs.len()),
                ));
            }
            let quantized: Vec<Wire> = node.inputs[..n].to_vec();
            quantized
                .iter()
                .map(|&w| resolve_quant_params(&graph, w))
                .collect::<Result<_, _>>()?
        } else {
            continue;
        };

        // Scalar ops get their computed *output* params appended first, so
        // they land at the (2, 3) positions the resolver table declares.
        if matches!(kind, OpKind::AddScalar | OpKind::MulScalar) {
            let scalar_wire = *graph.node(idx).inputs.get(1).ok_or_else(|| {
                LowerError::invariant(idx, kind, "scalar operand missing")
            })?;
            let scalar = graph.expect_f64(scalar_wire)?;
            if scalar <= 0.0 {
                return Err(LowerError::invariant(
                    idx,
                    kind,
                    format!("only positive scalars are supported, got {scalar}"),
                ));
            }
            let in_scale = graph.expect_f64(pairs[0].0)?;
            let in_zp = graph.expect_i64(pairs[0].1)?;
            let (out_scale, out_zp) = match kind {
                OpKind::MulScalar => (in_scale * scalar, in_zp),
                _ => add_scalar_output_quant_param(in_scale, in_zp, scalar),
            };
            tracing::debug!(node = idx, %kind, out_scale, out_zp, "computed scalar op output params");
            let s = graph.push_constant(Literal::F64(out_scale));
            let z = graph.push_constant(Literal::I64(out_zp));
            let node = graph.nodes.get_mut(&idx).unwrap();
            node.inputs.push(s);
            node.inputs.push(z);
        }

        let node = graph.nodes.get_mut(&idx).unwrap();
        for (scale, zp) in pairs {
            node.inputs.push(scale);
            node.inputs.push(zp);
        }
    }
    Ok(MaterializedGraph { graph })
}

/// Resolve the params of every tensor bundled into a cat node's list input.
fn resolve_cat_inputs(graph: &TracedGraph, idx: usize) -> Result<Vec<(Wire, Wire)>, LowerError> {
    let node = graph.node(idx);
    let list_wire = *node.inputs.first().ok_or_else(|| {
        LowerError::invariant(idx, node.kind, "cat node has no list operand")
    })?;
    let list = graph.producer(list_wire);
    if list.kind != OpKind::ListConstruct {
        return Err(LowerError::invariant(
            idx,
            node.kind,
            format!("cat operand 0 must be a list construct, found {}", list.kind),
        ));
    }
    list.inputs
        .iter()
        .map(|&w| resolve_quant_params(graph, w))
        .collect()
}

/// Output quant params for `add_scalar`, modeling the reference fixed-point
/// add kernel's range-preserving requantization.
///
/// The scalar is converted into quantized units `c_q = round(c / s)`. When
/// the shifted zero point `z - c_q` leaves [0, 255], it is clamped to the
/// violated bound and the scale stretched to cover the lost range.
pub(crate) fn add_scalar_output_quant_param(s: f64, z: i64, c: f64) -> (f64, i64) {
    const Q_MIN: i64 = 0;
    const Q_MAX: i64 = 255;
    let c_q = (c / s).round() as i64;

    if Q_MIN > z - c_q {
        let s_prime = (Q_MAX - (z - c_q)) as f64 / (Q_MAX - Q_MIN) as f64 * s;
        (s_prime, Q_MIN)
    } else if Q_MAX < z - c_q {
        let s_prime = ((z - c_q) - Q_MIN) as f64 / (Q_MAX - Q_MIN) as f64 * s;
        (s_prime, Q_MAX)
    } else {
        (s, z - c_q)
    }
}
