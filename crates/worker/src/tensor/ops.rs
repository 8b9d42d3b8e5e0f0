//! Tensor kernels for CPU inference
//!
//! The recurrent forecaster only needs matrix-vector products and
//! element-wise activations, so these are the only kernels provided.

use crate::tensor::Tensor;
use tidecast_common::{Result, ServeError};

/// Matrix-vector product: y = W x
///
/// W: (out, in), x: (in), y: (out)
pub fn matvec(weight: &Tensor<f64>, x: &[f64]) -> Result<Vec<f64>> {
    if weight.shape.len() != 2 {
        return Err(ServeError::unhandled("Matvec requires a 2D weight"));
    }
    let (out, inp) = (weight.shape[0], weight.shape[1]);
    if inp != x.len() {
        return Err(ServeError::unhandled(format!(
            "Matvec dimension mismatch: ({}, {}) @ ({})",
            out,
            inp,
            x.len()
        )));
    }

    Ok(weight
        .iter_rows()
        .map(|row| row.iter().zip(x).map(|(w, v)| w * v).sum())
        .collect())
}

/// Affine layer: y = W x + b
pub fn linear(weight: &Tensor<f64>, bias: &[f64], x: &[f64]) -> Result<Vec<f64>> {
    let mut y = matvec(weight, x)?;
    if y.len() != bias.len() {
        return Err(ServeError::unhandled(format!(
            "Bias length {} does not match output {}",
            bias.len(),
            y.len()
        )));
    }
    for (v, b) in y.iter_mut().zip(bias) {
        *v += b;
    }
    Ok(y)
}

/// Logistic sigmoid applied element-wise
pub fn sigmoid_in_place(values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }
}

/// Hyperbolic tangent applied element-wise
pub fn tanh_in_place(values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = v.tanh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matvec() {
        let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let y = matvec(&w, &[5.0, 6.0]).unwrap();
        assert_eq!(y, vec![17.0, 39.0]);
    }

    #[test]
    fn test_matvec_dimension_mismatch() {
        let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        assert!(matvec(&w, &[1.0]).is_err());
    }

    #[test]
    fn test_linear_adds_bias() {
        let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]).unwrap();
        let y = linear(&w, &[0.5, -0.5], &[1.0, 2.0]).unwrap();
        assert_eq!(y, vec![1.5, 1.5]);
    }

    #[test]
    fn test_activations() {
        let mut s = vec![0.0, 100.0, -100.0];
        sigmoid_in_place(&mut s);
        assert!((s[0] - 0.5).abs() < 1e-12);
        assert!(s[1] > 0.999);
        assert!(s[2] < 0.001);

        let mut t = vec![0.0, 50.0];
        tanh_in_place(&mut t);
        assert_eq!(t[0], 0.0);
        assert!((t[1] - 1.0).abs() < 1e-12);
    }
}
