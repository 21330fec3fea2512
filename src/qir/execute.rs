//! Reference evaluator for emitted IR graphs.
//!
//! Walks the graph sequentially, storing every node's output. All values are
//! carried as `Tensor<f64>`: quantized u8 values and i32 accumulators are
//! exact integers in f64, so the fixed-point arithmetic below is bit-faithful
//! to the kernels it models.

use super::{DType, QirGraph, QirNode, ValueId};
use crate::params::{QuantScale, QuantZeroPoint};
use crate::tensor::Tensor;
use std::collections::BTreeMap;

impl DType {
    fn clamp_range(self) -> (f64, f64) {
        match self {
            DType::U8 => (0.0, 255.0),
            DType::I8 => (-128.0, 127.0),
            DType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DType::F32 => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }
}

/// Index of the `axis` coordinate for a flat row-major offset.
fn channel_of(flat: usize, dims: &[usize], axis: usize) -> usize {
    let inner: usize = dims[axis + 1..].iter().product();
    (flat / inner) % dims[axis]
}

impl QirGraph {
    /// Execute the graph and return the output tensors.
    ///
    /// # Panics
    ///
    /// Panics when `inputs` does not match the declared graph inputs or a
    /// `Param` node names a missing table entry; both indicate host misuse,
    /// not a lowering failure.
    pub fn evaluate(
        &self,
        inputs: &[Tensor<f64>],
        params: &BTreeMap<String, Tensor<f32>>,
    ) -> Vec<Tensor<f64>> {
        let values = self.execute_graph(inputs, params);
        self.outputs
            .iter()
            .map(|id| values.get(id).unwrap().clone())
            .collect()
    }

    /// Execute the graph, returning every node's output keyed by value id.
    pub fn execute_graph(
        &self,
        inputs: &[Tensor<f64>],
        params: &BTreeMap<String, Tensor<f32>>,
    ) -> BTreeMap<ValueId, Tensor<f64>> {
        assert_eq!(
            inputs.len(),
            self.inputs.len(),
            "graph declares {} inputs, {} provided",
            self.inputs.len(),
            inputs.len()
        );
        let mut values: BTreeMap<ValueId, Tensor<f64>> = BTreeMap::new();
        for (&id, node) in &self.nodes {
            let out = self.eval_node(node, inputs, params, &values);
            values.insert(id, out);
        }
        values
    }

    fn eval_node(
        &self,
        node: &QirNode,
        inputs: &[Tensor<f64>],
        params: &BTreeMap<String, Tensor<f32>>,
        values: &BTreeMap<ValueId, Tensor<f64>>,
    ) -> Tensor<f64> {
        let val = |id: ValueId| -> &Tensor<f64> {
            values
                .get(&id)
                .unwrap_or_else(|| panic!("value {id} used before definition"))
        };

        match node {
            QirNode::Input { index } => inputs[*index].clone(),
            QirNode::Param { name } => params
                .get(name)
                .unwrap_or_else(|| panic!("parameter table has no entry `{name}`"))
                .map(|&v| v as f64),
            QirNode::Constant { value } => Tensor::construct(vec![*value], vec![1]),

            QirNode::Quantize {
                value,
                scale,
                zero_point,
                axis,
                dtype,
            } => {
                let v = val(*value);
                let (lo, hi) = dtype.clamp_range();
                let dims = v.dims().to_vec();
                // Per-tensor schemes ignore the axis; it may exceed the rank.
                let per_channel = matches!(scale, QuantScale::PerChannel(_))
                    || matches!(zero_point, QuantZeroPoint::PerChannel(_));
                let data = v
                    .data()
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| {
                        let c = if per_channel {
                            channel_of(i, &dims, *axis)
                        } else {
                            0
                        };
                        (zero_point.at(c) as f64 + x / scale.at(c)).round().clamp(lo, hi)
                    })
                    .collect();
                Tensor::construct(data, dims)
            }

            QirNode::Dequantize {
                value,
                scale,
                zero_point,
            } => val(*value).map(|&q| (q - *zero_point as f64) * scale),

            QirNode::Requantize {
                value,
                in_scale,
                in_zero_point,
                out_scale,
                out_zero_point,
                axis,
            } => {
                let v = val(*value);
                let dims = v.dims().to_vec();
                let per_channel = matches!(in_scale, QuantScale::PerChannel(_));
                let data = v
                    .data()
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| {
                        let c = if per_channel {
                            channel_of(i, &dims, *axis)
                        } else {
                            0
                        };
                        (in_scale.at(c) * (x - *in_zero_point as f64) / out_scale).round()
                            + *out_zero_point as f64
                    })
                    .collect();
                Tensor::construct(data, dims)
            }

            QirNode::AffineConv2d {
                input,
                weight,
                input_zero_point,
                weight_zero_point,
                strides,
                dilation,
                groups,
            } => {
                let x = val(*input);
                let w = val(*weight);
                let [n, cin, h, wd]: [usize; 4] = x.dims().try_into().expect("conv input not NCHW");
                let [oc, cin_g, kh, kw]: [usize; 4] =
                    w.dims().try_into().expect("conv weight not OIHW");
                assert_eq!(cin, cin_g * groups, "channel/group mismatch");
                assert_eq!(oc % groups, 0, "output channels not divisible by groups");

                let (sh, sw) = *strides;
                let (dh, dw) = *dilation;
                let oh = (h - ((kh - 1) * dh + 1)) / sh + 1;
                let ow = (wd - ((kw - 1) * dw + 1)) / sw + 1;
                let izp = *input_zero_point as f64;
                let oc_per_group = oc / groups;

                let mut out = vec![0.0; n * oc * oh * ow];
                for b in 0..n {
                    for o in 0..oc {
                        let g = o / oc_per_group;
                        let wzp = weight_zero_point.at(o) as f64;
                        for y in 0..oh {
                            for xo in 0..ow {
                                let mut acc = 0.0;
                                for ic in 0..cin_g {
                                    for ky in 0..kh {
                                        for kx in 0..kw {
                                            let iy = y * sh + ky * dh;
                                            let ix = xo * sw + kx * dw;
                                            let xv = x.get(&[b, g * cin_g + ic, iy, ix]);
                                            let wv = w.get(&[o, ic, ky, kx]);
                                            acc += (xv - izp) * (wv - wzp);
                                        }
                                    }
                                }
                                out[((b * oc + o) * oh + y) * ow + xo] = acc;
                            }
                        }
                    }
                }
                Tensor::construct(out, vec![n, oc, oh, ow])
            }

            QirNode::AffineDense {
                input,
                weight,
                input_zero_point,
                weight_zero_point,
            } => {
                let x = val(*input);
                let w = val(*weight);
                let [n, k]: [usize; 2] = x.dims().try_into().expect("dense input not rank 2");
                let [m, wk]: [usize; 2] = w.dims().try_into().expect("dense weight not rank 2");
                assert_eq!(k, wk, "dense contraction length mismatch");
                let izp = *input_zero_point as f64;

                let mut out = vec![0.0; n * m];
                for b in 0..n {
                    for o in 0..m {
                        let wzp = weight_zero_point.at(o) as f64;
                        let mut acc = 0.0;
                        for i in 0..k {
                            acc += (x.get(&[b, i]) - izp) * (w.get(&[o, i]) - wzp);
                        }
                        out[b * m + o] = acc;
                    }
                }
                Tensor::construct(out, vec![n, m])
            }

            QirNode::BiasAdd { value, bias } => {
                let v = val(*value);
                let b = val(*bias);
                let dims = v.dims().to_vec();
                assert!(dims.len() >= 2, "bias_add needs a channel axis");
                assert_eq!(b.len(), dims[1], "bias length mismatch");
                let data = v
                    .data()
                    .iter()
                    .enumerate()
                    .map(|(i, &x)| x + b.data()[channel_of(i, &dims, 1)])
                    .collect();
                Tensor::construct(data, dims)
            }

            QirNode::Clip { value, min, max } => val(*value).map(|&x| x.clamp(*min, *max)),

            QirNode::Cast { value, dtype } => match dtype {
                DType::F32 => val(*value).clone(),
                _ => val(*value).map(|&x| x.round()),
            },

            QirNode::Add { lhs, rhs } => broadcast_binop(val(*lhs), val(*rhs), |a, b| a + b),
            QirNode::Multiply { lhs, rhs } => broadcast_binop(val(*lhs), val(*rhs), |a, b| a * b),

            QirNode::Concatenate { inputs, axis } => {
                let tensors: Vec<&Tensor<f64>> = inputs.iter().map(|&id| val(id)).collect();
                Tensor::concat(&tensors, *axis)
            }

            QirNode::Relu { value } => val(*value).map(|&x| x.max(0.0)),

            QirNode::Pad {
                value,
                padding,
                pad_value,
            } => {
                let v = val(*value);
                let [n, c, h, w]: [usize; 4] = v.dims().try_into().expect("pad input not NCHW");
                let (ph, pw) = *padding;
                let (nh, nw) = (h + 2 * ph, w + 2 * pw);
                let mut out = vec![*pad_value; n * c * nh * nw];
                for b in 0..n {
                    for ch in 0..c {
                        for y in 0..h {
                            for x in 0..w {
                                out[((b * c + ch) * nh + y + ph) * nw + x + pw] =
                                    v.get(&[b, ch, y, x]);
                            }
                        }
                    }
                }
                Tensor::construct(out, vec![n, c, nh, nw])
            }
        }
    }
}

/// Elementwise op with scalar broadcast: a length-1 operand broadcasts
/// against the other; otherwise shapes must agree.
fn broadcast_binop(
    lhs: &Tensor<f64>,
    rhs: &Tensor<f64>,
    f: impl Fn(f64, f64) -> f64,
) -> Tensor<f64> {
    if rhs.len() == 1 {
        let b = rhs.data()[0];
        lhs.map(|&a| f(a, b))
    } else if lhs.len() == 1 {
        let a = lhs.data()[0];
        rhs.map(|&b| f(a, b))
    } else {
        assert_eq!(lhs.dims(), rhs.dims(), "elementwise shape mismatch");
        Tensor::construct(
            lhs.data()
                .iter()
                .zip(rhs.data())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            lhs.dims().to_vec(),
        )
    }
}
