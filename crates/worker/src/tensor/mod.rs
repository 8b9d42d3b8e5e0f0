//! Tensor data structures
//!
//! Row-major 2-D tensors used for model weights and scaled feature windows.
//! A feature window has shape `[rows, features]`; a weight matrix has shape
//! `[out, in]`.

pub mod ops;

pub use ops::{linear, matvec, sigmoid_in_place, tanh_in_place};

use serde::{Deserialize, Serialize};

/// Tensor shape
pub type Shape = Vec<usize>;

/// Owned row-major tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    pub shape: Shape,
}

impl<T> Tensor<T>
where
    T: Copy,
{
    /// Create a new tensor from data and shape
    ///
    /// Returns `None` if the element count does not match the shape.
    pub fn new(data: Vec<T>, shape: Shape) -> Option<Self> {
        let size: usize = shape.iter().product();
        if size != data.len() {
            return None;
        }
        Some(Self { data, shape })
    }

    /// Create a zero tensor
    pub fn zeros(shape: Shape) -> Self
    where
        T: Default,
    {
        let size: usize = shape.iter().product();
        Self {
            data: vec![T::default(); size],
            shape,
        }
    }

    /// Build a 2-D tensor from equally sized rows
    pub fn from_rows(rows: &[Vec<T>]) -> Option<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return None;
        }
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Some(Self {
            data,
            shape: vec![rows.len(), cols],
        })
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows of a 2-D tensor
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Number of columns of a 2-D tensor
    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }

    /// Borrow one row of a 2-D tensor
    pub fn row(&self, i: usize) -> &[T] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Iterate over the rows of a 2-D tensor
    pub fn iter_rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks(self.cols().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_rows() {
        let tensor = Tensor::new(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]).unwrap();

        assert_eq!(tensor.rows(), 3);
        assert_eq!(tensor.cols(), 2);
        assert_eq!(tensor.row(1), &[3.0, 4.0]);
        assert_eq!(tensor.iter_rows().count(), 3);
    }

    #[test]
    fn test_tensor_shape_mismatch() {
        assert!(Tensor::new(vec![1.0f64, 2.0, 3.0], vec![2, 2]).is_none());
        assert!(Tensor::from_rows(&[vec![1.0f64], vec![1.0, 2.0]]).is_none());
    }
}
