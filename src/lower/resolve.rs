//! Backward search recovering the quantization params describing an edge.
//!
//! Quantized operators in the trace format do not take their input quant
//! params as arguments, and edges carry no quantization descriptor. The
//! resolver recovers the `(scale, zero_point)` constant pair for any edge
//! known by operator contract to carry a quantized tensor, by walking
//! backward to a producer that owns the params at fixed operand positions.

use crate::{
    error::LowerError,
    graph::{OpKind, TracedGraph, Wire},
};

impl OpKind {
    /// Operand positions at which this kind carries its *output*
    /// scale/zero-point pair, if it carries one at fixed positions.
    ///
    /// For the terminal quantize op these are its literal operands; for the
    /// scalar ops the positions only exist once the materializer has been
    /// through the node, which topological processing order guarantees.
    pub(crate) fn quant_param_indices(self) -> Option<(usize, usize)> {
        match self {
            OpKind::QuantizePerTensor => Some((1, 2)),
            OpKind::Conv2d | OpKind::Conv2dRelu => Some((6, 7)),
            OpKind::Linear
            | OpKind::LinearRelu
            | OpKind::Add
            | OpKind::AddRelu
            | OpKind::Mul
            | OpKind::MulRelu
            | OpKind::Cat
            | OpKind::AddScalar
            | OpKind::MulScalar => Some((2, 3)),
            _ => None,
        }
    }
}

/// Resolve the `(scale, zero_point)` wire pair describing `wire`.
///
/// Walks backward from the producing node. A producer whose kind owns quant
/// params returns them directly; otherwise the search recurses into the
/// producer's *first* input, assuming the quantized value is always reachable
/// through the first operand. That assumption is inherited from the source
/// trace format and does not hold for operators whose quantized tensor is not
/// operand zero; see the crate tests pinning this behavior.
///
/// Terminates on any DAG: every step moves strictly to a producer. A
/// producer with no inputs fails with [`LowerError::Resolution`].
pub fn resolve_quant_params(graph: &TracedGraph, wire: Wire) -> Result<(Wire, Wire), LowerError> {
    let node = graph.producer(wire);
    if let Some((s, z)) = node.kind.quant_param_indices() {
        return match (node.inputs.get(s), node.inputs.get(z)) {
            (Some(&scale), Some(&zp)) => Ok((scale, zp)),
            _ => Err(LowerError::invariant(
                node.idx,
                node.kind,
                format!(
                    "quant param operands ({s}, {z}) missing; node has {} inputs",
                    node.inputs.len()
                ),
            )),
        };
    }
    match node.inputs.first() {
        Some(&first) => resolve_quant_params(graph, first),
        None => Err(LowerError::Resolution {
            node: node.idx,
            kind: node.kind,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build::GraphBuilder;

    #[test]
    fn quantize_resolves_to_its_literal_operands() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.5, 128);
        b.output(q);
        let graph = b.finish();

        let (scale, zp) = resolve_quant_params(&graph, q).unwrap();
        assert_eq!(graph.expect_f64(scale).unwrap(), 0.5);
        assert_eq!(graph.expect_i64(zp).unwrap(), 128);
    }

    #[test]
    fn walks_through_param_free_producers() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.25, 10);
        let r = b.relu(q); // relu owns no quant params
        b.output(r);
        let graph = b.finish();

        let (scale, _) = resolve_quant_params(&graph, r).unwrap();
        assert_eq!(graph.expect_f64(scale).unwrap(), 0.25);
    }

    #[test]
    fn conv_output_params_sit_at_fixed_positions() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.5, 128);
        let c = b.conv2d(q, "c._packed_params", (1, 1), (0, 0), (1, 1), 1, 2.0, 7, false);
        b.output(c);
        let graph = b.finish();

        let (scale, zp) = resolve_quant_params(&graph, c).unwrap();
        assert_eq!(graph.expect_f64(scale).unwrap(), 2.0);
        assert_eq!(graph.expect_i64(zp).unwrap(), 7);
    }

    #[test]
    fn graph_without_quantize_ancestor_fails() {
        let mut b = GraphBuilder::new();
        let x = b.input();
        let r = b.relu(x);
        b.output(r);
        let graph = b.finish();

        let err = resolve_quant_params(&graph, r).unwrap_err();
        assert!(matches!(err, LowerError::Resolution { node: 0, .. }));
    }

    #[test]
    fn first_input_heuristic_is_pinned() {
        // The search follows operand zero even when the quantized value is
        // the second operand; this is inherited behavior, kept visible here.
        let mut b = GraphBuilder::new();
        let a = b.input();
        let x = b.input();
        let q = b.quantize_per_tensor(x, 0.5, 0);
        let r = b.binop(crate::graph::OpKind::Add, q, a, 1.0, 0);
        b.output(r);
        let graph = b.finish();

        // Resolving the *second* operand of the add walks into `a`, which
        // has no producer chain, and fails.
        let err = resolve_quant_params(&graph, a).unwrap_err();
        assert!(matches!(err, LowerError::Resolution { .. }));
        // The first operand resolves fine.
        assert!(resolve_quant_params(&graph, q).is_ok());
    }
}
