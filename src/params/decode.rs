//! Packed parameter blob decoding.
//!
//! A packed blob bundles one quantized weight tensor, its quantization
//! scheme, and an optional bias. Layout (little-endian):
//!
//! ```text
//! magic        b"QPKD"
//! scheme       u8   0 = per-tensor, 1 = per-channel (along dim 0)
//! rank         u8   4 for convolution packing, 2 for linear packing
//! has_bias     u8
//! dims         u32 * rank
//! num_scales   u32  1 (per-tensor) or dims[0] (per-channel)
//! scales       f32 * num_scales
//! zero_points  i32 * num_scales
//! qweight      i8  * prod(dims)
//! bias         f32 * dims[0]   (only when has_bias != 0)
//! ```
//!
//! Two unpack strategies exist, selected the way the source tracer selects
//! them: attempt convolution-style unpacking first and fall back to
//! linear-style when the blob's structure rejects it. Anything else is a
//! fatal [`LowerError::Decode`].

use super::{QuantParam, QuantScale, QuantZeroPoint};
use crate::{error::LowerError, tensor::Tensor};
use rayon::prelude::*;

const PACKED_MAGIC: &[u8; 4] = b"QPKD";

/// Bounds-checked little-endian reader over a blob.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err(format!(
                "truncated blob: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len() - self.pos
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32, String> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, String> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

struct RawPacked {
    dims: Vec<usize>,
    scales: Vec<f64>,
    zero_points: Vec<i32>,
    qweight: Vec<i8>,
    bias: Option<Vec<f32>>,
}

/// Unpack a blob, requiring weight rank `expected_rank`.
///
/// The rank requirement is what makes the convolution/linear fallback work:
/// a linear blob (rank 2) structurally rejects convolution-style unpacking.
fn unpack(blob: &[u8], expected_rank: usize) -> Result<RawPacked, String> {
    let mut r = Reader::new(blob);

    let magic = r.take(4)?;
    if magic != PACKED_MAGIC {
        return Err(format!("bad magic {magic:?}"));
    }
    let scheme = r.read_u8()?;
    if scheme > 1 {
        return Err(format!("unknown quantization scheme {scheme}"));
    }
    let rank = r.read_u8()? as usize;
    if rank != expected_rank {
        return Err(format!("weight rank {rank}, expected {expected_rank}"));
    }
    let has_bias = r.read_u8()? != 0;

    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(r.read_u32()? as usize);
    }
    let out_channels = dims[0];
    let num_elements: usize = dims.iter().product();

    let num_scales = r.read_u32()? as usize;
    let expected_scales = if scheme == 0 { 1 } else { out_channels };
    if num_scales != expected_scales {
        return Err(format!(
            "scheme {scheme} expects {expected_scales} scale(s), found {num_scales}"
        ));
    }

    let mut scales = Vec::with_capacity(num_scales);
    for _ in 0..num_scales {
        let s = r.read_f32()? as f64;
        if !(s > 0.0) || !s.is_finite() {
            return Err(format!("non-positive scale {s}"));
        }
        scales.push(s);
    }
    let mut zero_points = Vec::with_capacity(num_scales);
    for _ in 0..num_scales {
        let zp = r.read_i32()?;
        // Weight encodings may be signed 8-bit; nothing wider is representable.
        if !(-128..=255).contains(&zp) {
            return Err(format!("zero point {zp} outside the 8-bit range"));
        }
        zero_points.push(zp);
    }

    let qweight: Vec<i8> = r.take(num_elements)?.iter().map(|&b| b as i8).collect();

    let bias = if has_bias {
        let mut bias = Vec::with_capacity(out_channels);
        for _ in 0..out_channels {
            bias.push(r.read_f32()?);
        }
        Some(bias)
    } else {
        None
    };

    if r.remaining() != 0 {
        return Err(format!("{} trailing bytes after payload", r.remaining()));
    }

    Ok(RawPacked {
        dims,
        scales,
        zero_points,
        qweight,
        bias,
    })
}

/// Dequantize the stored weight to real values: `scale_c * (q - zp_c)`,
/// with the channel taken along dim 0 for per-channel schemes.
fn dequantize_weight(raw: &RawPacked) -> Tensor<f32> {
    let inner: usize = raw.dims[1..].iter().product();
    let per_channel = raw.scales.len() > 1;
    let data: Vec<f32> = raw
        .qweight
        .par_iter()
        .enumerate()
        .map(|(i, &q)| {
            let c = if per_channel { i / inner } else { 0 };
            (raw.scales[c] * (q as i32 - raw.zero_points[c]) as f64) as f32
        })
        .collect();
    Tensor::construct(data, raw.dims.clone())
}

/// Decode a packed parameter blob into a [`QuantParam`].
///
/// Convolution-style unpacking is attempted first; linear-style is the
/// fallback. An encoding neither strategy accepts is fatal.
pub fn unpack_quant_params(name: &str, blob: &[u8]) -> Result<QuantParam, LowerError> {
    let raw = match unpack(blob, 4) {
        Ok(raw) => raw,
        Err(conv_reason) => unpack(blob, 2).map_err(|linear_reason| LowerError::Decode {
            name: name.to_string(),
            reason: format!(
                "conv-style unpack failed ({conv_reason}); linear-style unpack failed ({linear_reason})"
            ),
        })?,
    };

    let weight = dequantize_weight(&raw);
    let bias = raw
        .bias
        .as_ref()
        .map(|b| Tensor::construct(b.clone(), vec![raw.dims[0]]));

    let (scale, zero_point) = if raw.scales.len() == 1 {
        (
            QuantScale::PerTensor(raw.scales[0]),
            QuantZeroPoint::PerTensor(raw.zero_points[0]),
        )
    } else {
        (
            QuantScale::PerChannel(raw.scales.clone()),
            QuantZeroPoint::PerChannel(raw.zero_points.clone()),
        )
    };

    Ok(QuantParam::new(weight, bias, scale, zero_point, name))
}

/// Encode a packed parameter blob — the inverse of [`unpack_quant_params`].
///
/// Hosts (and the test suite) use this to assemble parameter stores without
/// the original tracer runtime. The scheme is per-tensor when a single
/// scale is given, per-channel otherwise.
///
/// # Panics
///
/// Panics when lengths are inconsistent with `dims`.
pub fn pack_quant_params(
    dims: &[usize],
    scales: &[f64],
    zero_points: &[i32],
    qweight: &[i8],
    bias: Option<&[f32]>,
) -> Vec<u8> {
    assert!(dims.len() == 2 || dims.len() == 4, "weight must be rank 2 or 4");
    assert_eq!(qweight.len(), dims.iter().product::<usize>());
    assert_eq!(scales.len(), zero_points.len());
    assert!(scales.len() == 1 || scales.len() == dims[0]);
    if let Some(bias) = bias {
        assert_eq!(bias.len(), dims[0]);
    }

    let mut blob = Vec::new();
    blob.extend_from_slice(PACKED_MAGIC);
    blob.push(if scales.len() == 1 { 0 } else { 1 });
    blob.push(dims.len() as u8);
    blob.push(u8::from(bias.is_some()));
    for &d in dims {
        blob.extend_from_slice(&(d as u32).to_le_bytes());
    }
    blob.extend_from_slice(&(scales.len() as u32).to_le_bytes());
    for &s in scales {
        blob.extend_from_slice(&(s as f32).to_le_bytes());
    }
    for &zp in zero_points {
        blob.extend_from_slice(&zp.to_le_bytes());
    }
    blob.extend(qweight.iter().map(|&q| q as u8));
    if let Some(bias) = bias {
        for &b in bias {
            blob.extend_from_slice(&b.to_le_bytes());
        }
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_tensor_conv_blob_round_trips() {
        let qweight: Vec<i8> = (0..8).collect();
        let blob = pack_quant_params(&[2, 1, 2, 2], &[0.25], &[0], &qweight, Some(&[0.5, -0.5]));
        let param = unpack_quant_params("features.0._packed_params", &blob).unwrap();

        assert_eq!(param.weight.dims(), &[2, 1, 2, 2]);
        assert_eq!(param.weight.data()[3], 0.75); // 0.25 * (3 - 0)
        assert_eq!(param.scale, QuantScale::PerTensor(0.25));
        assert_eq!(param.zero_point, QuantZeroPoint::PerTensor(0));
        assert_eq!(param.weight_handle, "features.0_weight");
        assert_eq!(param.bias_handle.as_deref(), Some("features.0_bias"));
        assert_eq!(param.bias.unwrap().data(), &[0.5, -0.5]);
    }

    #[test]
    fn per_channel_scheme_decodes_vectors() {
        let qweight: Vec<i8> = vec![4, 4, 8, 8];
        let blob = pack_quant_params(&[2, 2], &[0.5, 0.25], &[0, 4], &qweight, None);
        let param = unpack_quant_params("fc._packed_params", &blob).unwrap();

        assert_eq!(param.scale, QuantScale::PerChannel(vec![0.5, 0.25]));
        assert_eq!(param.zero_point, QuantZeroPoint::PerChannel(vec![0, 4]));
        // Channel 0: 0.5 * (4 - 0); channel 1: 0.25 * (8 - 4).
        assert_eq!(param.weight.data(), &[2.0, 2.0, 1.0, 1.0]);
        assert!(param.bias.is_none());
        assert!(param.bias_handle.is_none());
    }

    #[test]
    fn linear_blob_decodes_via_fallback() {
        let qweight: Vec<i8> = vec![1, 2, 3, 4, 5, 6];
        let blob = pack_quant_params(&[3, 2], &[1.0], &[0], &qweight, None);
        // Rank 2 rejects conv-style unpacking, so this exercises the fallback.
        let param = unpack_quant_params("classifier._packed_params", &blob).unwrap();
        assert_eq!(param.weight.dims(), &[3, 2]);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let qweight: Vec<i8> = vec![0; 4];
        let mut blob = pack_quant_params(&[2, 2], &[1.0], &[0], &qweight, None);
        blob[0] = b'X';
        let err = unpack_quant_params("p._packed_params", &blob).unwrap_err();
        assert!(matches!(err, LowerError::Decode { name, .. } if name == "p._packed_params"));
    }

    #[test]
    fn truncated_blob_is_fatal() {
        let qweight: Vec<i8> = vec![0; 4];
        let mut blob = pack_quant_params(&[2, 2], &[1.0], &[0], &qweight, None);
        blob.truncate(blob.len() - 2);
        assert!(unpack_quant_params("p._packed_params", &blob).is_err());
    }

    #[test]
    fn non_positive_scale_is_fatal() {
        let qweight: Vec<i8> = vec![0; 4];
        let blob = pack_quant_params(&[2, 2], &[0.0], &[0], &qweight, None);
        let err = unpack_quant_params("p._packed_params", &blob).unwrap_err();
        assert!(err.to_string().contains("non-positive scale"));
    }
}
