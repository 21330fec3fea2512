//! Lowering of traced quantized computation graphs into an explicit
//! affine-quantization IR.
//!
//! The entry point is [`lower`]: give it a [`graph::TracedGraph`] and the
//! external parameter store, and it returns a [`Lowered`] bundle holding the
//! IR graph plus the dequantized parameter table. [`qir::QirGraph::evaluate`]
//! runs the result.

/// Error taxonomy shared by every lowering stage.
pub mod error;
/// Traced input graph types and the programmatic graph builder.
pub mod graph;
pub mod lower;
pub mod params;
pub mod qir;
pub mod tensor;

pub use error::LowerError;
pub use lower::{lower, lower_with_registry, Lowered};
