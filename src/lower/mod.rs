//! The lowering pass: traced quantized graph in, affine-quantization IR out.
//!
//! Control flow: decode the parameter store into a registry (once per model),
//! materialize quant params onto the graph, then convert node by node in
//! index order. A graph either lowers completely or the whole pass fails.

use crate::{
    error::LowerError,
    graph::{OpKind, TracedGraph, Wire},
    params::QuantParamRegistry,
    qir::{QirBuilder, QirGraph, QirNode, ValueId},
    tensor::Tensor,
};
use std::collections::BTreeMap;

mod convert;
pub mod materialize;
pub mod resolve;

pub use materialize::{materialize, MaterializedGraph};
pub use resolve::resolve_quant_params;

/// Result of a completed lowering: the IR graph plus the output parameter
/// table holding every weight/bias under its symbolic handle.
#[derive(Debug, Clone)]
pub struct Lowered {
    /// The emitted affine-quantization IR.
    pub qir: QirGraph,
    /// Output parameter table keyed by symbolic handle.
    pub params: BTreeMap<String, Tensor<f32>>,
}

/// Lower a traced graph, building the quant parameter registry from the
/// external parameter store.
#[tracing::instrument(name = "lower", skip_all)]
pub fn lower(
    graph: TracedGraph,
    store: &BTreeMap<String, Vec<u8>>,
) -> Result<Lowered, LowerError> {
    let registry = QuantParamRegistry::scan(store)?;
    lower_with_registry(graph, &registry)
}

/// Lower a traced graph against an already-built registry.
///
/// Registries are read-only after construction, so independent graph
/// conversions may share one.
#[tracing::instrument(name = "lower_with_registry", skip_all)]
pub fn lower_with_registry(
    graph: TracedGraph,
    registry: &QuantParamRegistry,
) -> Result<Lowered, LowerError> {
    let materialized = materialize(graph)?;
    let graph = materialized.graph();

    let mut qir = QirBuilder::new();
    let mut values: BTreeMap<Wire, ValueId> = BTreeMap::new();
    for (i, &input_idx) in graph.inputs.iter().enumerate() {
        let id = qir.push(QirNode::Input { index: i });
        values.insert((input_idx, 0), id);
    }

    for (&idx, node) in &graph.nodes {
        match node.kind {
            // Structural nodes carry literals or wiring, not values to
            // convert; their payloads are read positionally by converters.
            OpKind::Input | OpKind::Constant | OpKind::ListConstruct => continue,
            _ => {
                let out = {
                    let mut ctx = convert::ConvertCtx {
                        graph,
                        registry,
                        qir: &mut qir,
                        values: &mut values,
                    };
                    convert::convert_node(&mut ctx, node)?
                };
                values.insert((idx, 0), out);
            }
        }
    }

    for out_wire in &graph.outputs {
        let id = values.get(out_wire).copied().ok_or_else(|| {
            LowerError::invariant(
                out_wire.0,
                graph.producer(*out_wire).kind,
                "graph output was never converted",
            )
        })?;
        qir.set_output(id);
    }

    let mut params = BTreeMap::new();
    registry.materialize_params(&mut params);

    Ok(Lowered {
        qir: qir.finish(),
        params,
    })
}
