//! Quant parameter records and the process-scoped registry.
//!
//! The registry is built once per model load from the external parameter
//! store, then read-only: the materializer and the conversion functions
//! only ever look records up. Multiple graph conversions may share one
//! registry concurrently.

use crate::{error::LowerError, tensor::Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod decode;

pub use decode::{pack_quant_params, unpack_quant_params};

/// Name suffix marking packed entries in the external parameter store.
pub const PACKED_PARAM_SUFFIX: &str = "._packed_params";

/// Per-tensor or per-output-channel quantization scale.
///
/// Invariant: every element is > 0 (enforced by the decoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantScale {
    PerTensor(f64),
    PerChannel(Vec<f64>),
}

impl QuantScale {
    /// The scalar scale, or `None` for per-channel schemes.
    pub fn per_tensor(&self) -> Option<f64> {
        match self {
            QuantScale::PerTensor(s) => Some(*s),
            QuantScale::PerChannel(_) => None,
        }
    }

    /// Multiply every element by `k`, preserving the scheme.
    ///
    /// Used to form the convolution accumulator scale
    /// `input_scale * weight_scale`.
    pub fn scaled_by(&self, k: f64) -> QuantScale {
        match self {
            QuantScale::PerTensor(s) => QuantScale::PerTensor(s * k),
            QuantScale::PerChannel(s) => QuantScale::PerChannel(s.iter().map(|s| s * k).collect()),
        }
    }

    /// Scale for channel `c` (per-tensor schemes ignore `c`).
    pub fn at(&self, c: usize) -> f64 {
        match self {
            QuantScale::PerTensor(s) => *s,
            QuantScale::PerChannel(s) => s[c],
        }
    }
}

/// Per-tensor or per-output-channel zero point, aligned with [`QuantScale`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantZeroPoint {
    PerTensor(i32),
    PerChannel(Vec<i32>),
}

impl QuantZeroPoint {
    /// The scalar zero point, or `None` for per-channel schemes.
    pub fn per_tensor(&self) -> Option<i32> {
        match self {
            QuantZeroPoint::PerTensor(z) => Some(*z),
            QuantZeroPoint::PerChannel(_) => None,
        }
    }

    /// Zero point for channel `c` (per-tensor schemes ignore `c`).
    pub fn at(&self, c: usize) -> i32 {
        match self {
            QuantZeroPoint::PerTensor(z) => *z,
            QuantZeroPoint::PerChannel(z) => z[c],
        }
    }
}

/// Affine quantization record for one weight (and optionally bias) tensor.
///
/// Created by the decoder from a single packed blob; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantParam {
    /// Weight tensor, dequantized to real values.
    pub weight: Tensor<f32>,
    /// Fused bias, when the operator carries one.
    pub bias: Option<Tensor<f32>>,
    /// Weight quantization scale.
    pub scale: QuantScale,
    /// Weight zero point.
    pub zero_point: QuantZeroPoint,
    /// Symbolic name the weight is bound to in the output parameter table.
    pub weight_handle: String,
    /// Symbolic name for the bias, when present.
    pub bias_handle: Option<String>,
}

impl QuantParam {
    /// Build a record, deriving the symbolic handles from the store key by
    /// stripping the packed suffix and appending `_weight` / `_bias`.
    pub fn new(
        weight: Tensor<f32>,
        bias: Option<Tensor<f32>>,
        scale: QuantScale,
        zero_point: QuantZeroPoint,
        param_key: &str,
    ) -> Self {
        let prefix = param_key.strip_suffix(PACKED_PARAM_SUFFIX).unwrap_or(param_key);
        let bias_handle = bias.is_some().then(|| format!("{prefix}_bias"));
        Self {
            weight,
            bias,
            scale,
            zero_point,
            weight_handle: format!("{prefix}_weight"),
            bias_handle,
        }
    }
}

/// Process-scoped mapping from parameter names to decoded records.
#[derive(Debug, Clone, Default)]
pub struct QuantParamRegistry {
    params: BTreeMap<String, QuantParam>,
}

impl QuantParamRegistry {
    /// Scan the external parameter store, decoding every entry whose key
    /// carries the packed suffix.
    #[tracing::instrument(name = "QuantParamRegistry::scan", skip_all)]
    pub fn scan(store: &BTreeMap<String, Vec<u8>>) -> Result<Self, LowerError> {
        let mut params = BTreeMap::new();
        for (key, blob) in store {
            if key.ends_with(PACKED_PARAM_SUFFIX) {
                let param = unpack_quant_params(key, blob)?;
                tracing::debug!(key, handle = %param.weight_handle, "decoded packed parameter");
                params.insert(key.clone(), param);
            }
        }
        Ok(Self { params })
    }

    /// Look up a decoded record by its original store key.
    pub fn get(&self, name: &str) -> Option<&QuantParam> {
        self.params.get(name)
    }

    /// Number of decoded records.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Copy every weight/bias tensor into the output parameter table under
    /// its symbolic handle. This is the registry's only external side effect.
    pub fn materialize_params(&self, table: &mut BTreeMap<String, Tensor<f32>>) {
        for param in self.params.values() {
            table.insert(param.weight_handle.clone(), param.weight.clone());
            if let (Some(handle), Some(bias)) = (&param.bias_handle, &param.bias) {
                table.insert(handle.clone(), bias.clone());
            }
        }
    }
}
