//! Minimal dense tensor used throughout the lowering pipeline.
//!
//! Values are stored row-major. Real-valued weights are `Tensor<f32>`;
//! the reference evaluator carries everything as `Tensor<f64>` so that
//! 8-bit quantized values and i32 accumulators stay exact.

use serde::{Deserialize, Serialize};

/// A dense tensor with row-major storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tensor<T> {
    data: Vec<T>,
    dims: Vec<usize>,
}

impl<T> Tensor<T> {
    /// Construct a tensor from raw data and dimensions.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not equal the product of `dims`.
    pub fn construct(data: Vec<T>, dims: Vec<usize>) -> Self {
        assert_eq!(
            data.len(),
            dims.iter().product::<usize>(),
            "tensor data length {} does not match dims {:?}",
            data.len(),
            dims
        );
        Self { data, dims }
    }

    /// Construct a rank-1 tensor.
    pub fn from_vec(data: Vec<T>) -> Self {
        let dims = vec![data.len()];
        Self { data, dims }
    }

    /// The raw row-major data.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// The tensor dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat offset of a multi-dimensional index.
    ///
    /// # Panics
    ///
    /// Panics if `index` rank or bounds disagree with the tensor dims.
    pub fn offset(&self, index: &[usize]) -> usize {
        assert_eq!(index.len(), self.dims.len(), "index rank mismatch");
        let mut flat = 0;
        for (i, &idx) in index.iter().enumerate() {
            assert!(idx < self.dims[i], "index {idx} out of bounds at axis {i}");
            flat = flat * self.dims[i] + idx;
        }
        flat
    }

    /// Apply `f` elementwise, producing a new tensor of the same shape.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(f).collect(),
            dims: self.dims.clone(),
        }
    }
}

impl<T: Copy> Tensor<T> {
    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> T {
        self.data[self.offset(index)]
    }
}

impl Tensor<f64> {
    /// Concatenate tensors along `axis`. All dims other than `axis` must agree.
    ///
    /// # Panics
    ///
    /// Panics on rank or dimension mismatch, or when `inputs` is empty.
    pub fn concat(inputs: &[&Tensor<f64>], axis: usize) -> Tensor<f64> {
        assert!(!inputs.is_empty(), "concat of zero tensors");
        let rank = inputs[0].dims.len();
        assert!(axis < rank, "concat axis {axis} out of range for rank {rank}");
        for t in inputs {
            assert_eq!(t.dims.len(), rank, "concat rank mismatch");
            for d in 0..rank {
                if d != axis {
                    assert_eq!(t.dims[d], inputs[0].dims[d], "concat dim mismatch at axis {d}");
                }
            }
        }

        let mut out_dims = inputs[0].dims.clone();
        out_dims[axis] = inputs.iter().map(|t| t.dims[axis]).sum();

        // Copy in outer-block order: outer = dims before axis, inner = dims after.
        let outer: usize = inputs[0].dims[..axis].iter().product();
        let mut data = Vec::with_capacity(out_dims.iter().product());
        for block in 0..outer {
            for t in inputs {
                let stride = t.dims[axis..].iter().product::<usize>();
                data.extend_from_slice(&t.data[block * stride..(block + 1) * stride]);
            }
        }
        Tensor::construct(data, out_dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_row_major() {
        let t = Tensor::construct((0..24).map(|x| x as f64).collect(), vec![2, 3, 4]);
        assert_eq!(t.get(&[0, 0, 0]), 0.0);
        assert_eq!(t.get(&[0, 1, 0]), 4.0);
        assert_eq!(t.get(&[1, 2, 3]), 23.0);
    }

    #[test]
    fn concat_axis1() {
        let a = Tensor::construct(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::construct(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let c = Tensor::concat(&[&a, &b], 1);
        assert_eq!(c.dims(), &[2, 4]);
        assert_eq!(c.data(), &[1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]);
    }

    #[test]
    fn concat_axis0() {
        let a = Tensor::construct(vec![1.0, 2.0], vec![1, 2]);
        let b = Tensor::construct(vec![3.0, 4.0], vec![1, 2]);
        let c = Tensor::concat(&[&a, &b], 0);
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    #[should_panic]
    fn construct_rejects_length_mismatch() {
        Tensor::construct(vec![1.0, 2.0, 3.0], vec![2, 2]);
    }
}
