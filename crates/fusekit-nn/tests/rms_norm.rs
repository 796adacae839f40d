use std::sync::Arc;

use fusekit_core::{DType, Tensor};
use fusekit_kernels::CpuKernels;
use fusekit_nn::{Module, RmsNorm, RmsNormBridge, DEFAULT_EPS};

fn bridge() -> RmsNormBridge {
    RmsNormBridge::new(Arc::new(CpuKernels::new())).unwrap()
}

fn leaf(t: Tensor) -> Tensor {
    let mut t = t;
    t.set_requires_grad(true);
    t
}

fn assert_close(actual: &[f32], expected: &[f64], rtol: f64, atol: f64, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let err = (a as f64 - e).abs();
        assert!(err <= atol + rtol * e.abs(), "{what}[{i}]: got {a}, expected {e}");
    }
}

/// `x * rsqrt(mean(x^2) + eps) * w` over rows of length `cols`.
fn reference(x: &[f64], w: &[f64], cols: usize, eps: f64) -> Vec<f64> {
    x.chunks(cols)
        .flat_map(|row| {
            let inv = 1.0 / (row.iter().map(|v| v * v).sum::<f64>() / cols as f64 + eps).sqrt();
            row.iter().zip(w).map(move |(v, w)| v * inv * w)
        })
        .collect()
}

/// Closed-form input gradient of `reference` for upstream gradient `go`.
fn reference_grad(x: &[f64], w: &[f64], go: &[f64], cols: usize, eps: f64) -> Vec<f64> {
    x.chunks(cols)
        .zip(go.chunks(cols))
        .flat_map(|(row, g)| {
            let inv = 1.0 / (row.iter().map(|v| v * v).sum::<f64>() / cols as f64 + eps).sqrt();
            let dot: f64 = (0..cols).map(|i| row[i] * g[i] * w[i]).sum();
            (0..cols)
                .map(|i| w[i] * g[i] * inv - row[i] * inv.powi(3) * dot / cols as f64)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[test]
fn test_implicit_matches_reference() {
    let x = leaf(Tensor::randn(&[4, 6], 1));
    let w = leaf(Tensor::randn(&[6], 2));
    let go = Tensor::randn(&[4, 6], 3);
    let eps = 1e-5;

    let y = bridge().rms_norm(&x, &w, None, eps).unwrap();
    let (xv, wv) = (x.to_vec_f64(), w.to_vec_f64());
    assert_close(&y.to_vec_f32(), &reference(&xv, &wv, 6, eps), 1e-4, 1e-3, "out");

    y.backward_with(go.clone()).unwrap();
    let expected = reference_grad(&xv, &wv, &go.to_vec_f64(), 6, eps);
    assert_close(&x.grad().unwrap().to_vec_f32(), &expected, 1e-4, 1e-3, "dx");

    // dweight = sum over rows of go * x * inv_rms
    let gov = go.to_vec_f64();
    let mut dw = vec![0.0; 6];
    for (row, g) in xv.chunks(6).zip(gov.chunks(6)) {
        let inv = 1.0 / (row.iter().map(|v| v * v).sum::<f64>() / 6.0 + eps).sqrt();
        for i in 0..6 {
            dw[i] += g[i] * row[i] * inv;
        }
    }
    assert_close(&w.grad().unwrap().to_vec_f32(), &dw, 1e-4, 1e-3, "dweight");
}

#[test]
fn test_five_by_five_scenario() {
    let x = leaf(Tensor::randn(&[5, 5], 42));
    let w = Tensor::ones(&[5]);
    let b = Tensor::zeros(&[5], DType::F32);

    let y = bridge().rms_norm(&x, &w, Some(&b), DEFAULT_EPS).unwrap();
    y.backward_with(Tensor::ones(&[5, 5])).unwrap();

    let xv = x.to_vec_f64();
    let expected = reference_grad(&xv, &[1.0; 5], &[1.0; 25], 5, DEFAULT_EPS);
    assert_close(&x.grad().unwrap().to_vec_f32(), &expected, 1e-4, 1e-3, "dx");
    assert_close(&y.to_vec_f32(), &reference(&xv, &[1.0; 5], 5, DEFAULT_EPS), 1e-4, 1e-3, "out");
}

#[test]
fn test_explicit_matches_implicit() {
    let x = leaf(Tensor::randn(&[3, 8], 11));
    let w = leaf(Tensor::randn(&[8], 12));
    let b = leaf(Tensor::randn(&[8], 13));
    let go = Tensor::randn(&[3, 8], 14);

    let x2 = leaf(Tensor::from_f32(&x.to_vec_f32(), x.dims()));
    let w2 = leaf(Tensor::from_f32(&w.to_vec_f32(), w.dims()));
    let b2 = leaf(Tensor::from_f32(&b.to_vec_f32(), b.dims()));

    let implicit = bridge().rms_norm(&x, &w, Some(&b), 1e-6).unwrap();
    let explicit = bridge().rms_norm_with_shape(&x2, &w2, Some(&b2), 1e-6, &[8]).unwrap();
    assert_close(
        &explicit.to_vec_f32(),
        &implicit.to_vec_f64(),
        1e-4,
        1e-3,
        "out",
    );

    implicit.backward_with(go.clone()).unwrap();
    explicit.backward_with(go).unwrap();
    for (a, e, what) in [(&x2, &x, "dx"), (&w2, &w, "dweight"), (&b2, &b, "dbias")] {
        assert_close(
            &a.grad().unwrap().to_vec_f32(),
            &e.grad().unwrap().to_vec_f64(),
            1e-4,
            1e-3,
            what,
        );
    }
}

#[test]
fn test_explicit_reduces_over_trailing_dims() {
    let x = Tensor::randn(&[2, 3, 4], 21);
    let w = Tensor::ones(&[3, 4]);
    let y = bridge().rms_norm_with_shape(&x, &w, None, 1e-6, &[3, 4]).unwrap();
    let expected = reference(&x.to_vec_f64(), &[1.0; 12], 12, 1e-6);
    assert_close(&y.to_vec_f32(), &expected, 1e-4, 1e-3, "out");
}

#[test]
fn test_explicit_trailing_dims_backward_matches_flattened() {
    let x = leaf(Tensor::randn(&[2, 3, 4], 22));
    let w = leaf(Tensor::randn(&[3, 4], 23));
    let b = leaf(Tensor::randn(&[3, 4], 24));
    let go = Tensor::randn(&[2, 3, 4], 25);

    let flat_x = leaf(Tensor::from_f32(&x.to_vec_f32(), &[2, 12]));
    let flat_w = leaf(Tensor::from_f32(&w.to_vec_f32(), &[12]));
    let flat_b = leaf(Tensor::from_f32(&b.to_vec_f32(), &[12]));

    let shaped = bridge().rms_norm_with_shape(&x, &w, Some(&b), 1e-6, &[3, 4]).unwrap();
    let flat = bridge().rms_norm(&flat_x, &flat_w, Some(&flat_b), 1e-6).unwrap();
    assert_eq!(shaped.dims(), &[2, 3, 4]);
    assert_close(&shaped.to_vec_f32(), &flat.to_vec_f64(), 1e-6, 1e-6, "out");

    shaped.backward_with(go.clone()).unwrap();
    flat.backward_with(Tensor::from_f32(&go.to_vec_f32(), &[2, 12])).unwrap();

    let (dx, dw, db) = (x.grad().unwrap(), w.grad().unwrap(), b.grad().unwrap());
    assert_eq!(dx.dims(), &[2, 3, 4]);
    assert_eq!(dw.dims(), &[3, 4]);
    assert_eq!(db.dims(), &[3, 4]);
    for (a, e, what) in [(&dx, &flat_x, "dx"), (&dw, &flat_w, "dweight"), (&db, &flat_b, "dbias")] {
        assert_close(&a.to_vec_f32(), &e.grad().unwrap().to_vec_f64(), 1e-6, 1e-6, what);
    }
}

#[test]
fn test_explicit_precision_round_trip() {
    let x = leaf(Tensor::randn(&[4, 16], 31).to_dtype(DType::F16));
    let w = leaf(Tensor::ones(&[16]).to_dtype(DType::F16));

    let y = bridge().rms_norm_with_shape(&x, &w, None, 1e-6, &[16]).unwrap();
    assert_eq!(y.dtype(), DType::F16);
    let expected = reference(&x.to_vec_f64(), &[1.0; 16], 16, 1e-6);
    assert_close(&y.to_vec_f32(), &expected, 1e-2, 1e-2, "out");

    // gradients come back in the kernel's F32 precision
    y.backward_with(Tensor::ones(&[4, 16]).to_dtype(DType::F16)).unwrap();
    let dx = x.grad().unwrap();
    assert_eq!(dx.dtype(), DType::F32);
    assert_eq!(dx.dims(), &[4, 16]);
    assert!(dx.to_vec_f32().iter().all(|v| v.is_finite()));
}

#[test]
fn test_implicit_keeps_native_precision() {
    let x = Tensor::randn(&[2, 8], 41).to_dtype(DType::BF16);
    let w = Tensor::ones(&[8]).to_dtype(DType::BF16);
    let y = bridge().rms_norm(&x, &w, None, 1e-6).unwrap();
    assert_eq!(y.dtype(), DType::BF16);
}

#[test]
fn test_layers_agree() {
    let x = Tensor::randn(&[3, 10], 51);
    let plain = RmsNorm::new(bridge(), 10, DEFAULT_EPS).forward(&x).unwrap();
    let shaped = RmsNorm::with_normalized_shape(bridge(), 10, DEFAULT_EPS)
        .forward(&x)
        .unwrap();
    assert_close(&shaped.to_vec_f32(), &plain.to_vec_f64(), 1e-5, 1e-5, "out");
}

#[test]
fn test_kernel_errors_propagate() {
    let x = Tensor::randn(&[2, 6], 61);
    let w = Tensor::ones(&[4]);
    assert!(bridge().rms_norm(&x, &w, None, 1e-6).is_err());
    assert!(bridge().rms_norm_with_shape(&x, &Tensor::ones(&[6]), None, 1e-6, &[5]).is_err());
}
