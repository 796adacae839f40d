//! Numerical checks of the reference CPU backend.

use fusekit_core::storage::CpuBuffer;
use fusekit_core::{DType, Device, Generator, Tensor};
use fusekit_kernels::{AttentionKernels, CpuKernels, MhaConfig, RmsNormKernels, VarLenBatch};

fn f64_randn(dims: &[usize], seed: u64) -> Tensor {
    Tensor::randn(dims, seed).to_dtype(DType::F64)
}

fn perturbed(t: &Tensor, idx: usize, delta: f64) -> Tensor {
    let mut data = t.to_vec_f64();
    data[idx] += delta;
    Tensor::from_buffer(CpuBuffer::F64(data), t.dims()).unwrap()
}

fn weighted_sum(a: &Tensor, b: &Tensor) -> f64 {
    a.to_vec_f64().iter().zip(b.to_vec_f64()).map(|(x, y)| x * y).sum()
}

fn assert_close(actual: f64, expected: f64, tol: f64, what: &str) {
    let err = (actual - expected).abs();
    assert!(
        err <= tol * (1.0 + expected.abs()),
        "{what}: got {actual}, expected {expected} (err {err})"
    );
}

fn config(causal: bool) -> MhaConfig {
    MhaConfig {
        dropout_p: 0.0,
        softmax_scale: 0.5,
        causal,
        return_softmax: false,
    }
}

#[test]
fn test_attention_gradients_match_finite_differences() {
    let kernels = CpuKernels::new();
    // grouped-query: 4 query heads share 2 key/value heads
    let q = f64_randn(&[2, 3, 4, 4], 1);
    let k = f64_randn(&[2, 5, 2, 4], 2);
    let v = f64_randn(&[2, 5, 2, 4], 3);
    let dout = f64_randn(&[2, 3, 4, 4], 4);
    let cfg = config(true);

    let mut rng = Generator::new(Device::Cpu, 0);
    let fwd = kernels.mha_fwd(&q, &k, &v, &cfg, &mut rng).unwrap();
    let (dq, dk, dv) = (q.zeros_like(), k.zeros_like(), v.zeros_like());
    kernels
        .mha_bwd(&dout, &q, &k, &v, &fwd.out, &fwd.softmax_lse, &cfg, &mut rng, &dq, &dk, &dv)
        .unwrap();

    let loss = |q: &Tensor, k: &Tensor, v: &Tensor| {
        let mut rng = Generator::new(Device::Cpu, 0);
        let out = kernels.mha_fwd(q, k, v, &cfg, &mut rng).unwrap().out;
        weighted_sum(&out, &dout)
    };

    let h = 1e-6;
    for idx in [0, 7, 33, 95] {
        let numeric = (loss(&perturbed(&q, idx, h), &k, &v) - loss(&perturbed(&q, idx, -h), &k, &v)) / (2.0 * h);
        assert_close(dq.to_vec_f64()[idx], numeric, 1e-5, "dq");
    }
    for idx in [0, 13, 50, 79] {
        let numeric = (loss(&q, &perturbed(&k, idx, h), &v) - loss(&q, &perturbed(&k, idx, -h), &v)) / (2.0 * h);
        assert_close(dk.to_vec_f64()[idx], numeric, 1e-5, "dk");
        let numeric = (loss(&q, &k, &perturbed(&v, idx, h)) - loss(&q, &k, &perturbed(&v, idx, -h))) / (2.0 * h);
        assert_close(dv.to_vec_f64()[idx], numeric, 1e-5, "dv");
    }
}

#[test]
fn test_varlen_matches_per_sequence_fixed() {
    let kernels = CpuKernels::new();
    let (h, d) = (2, 4);
    let lens_q = [3, 2];
    let lens_k = [4, 1];
    let q = f64_randn(&[5, h, d], 10);
    let k = f64_randn(&[5, h, d], 11);
    let v = f64_randn(&[5, h, d], 12);
    let batch = VarLenBatch::from_seqlens(&lens_q, &lens_k).unwrap();
    let cfg = config(true);

    let mut rng = Generator::new(Device::Cpu, 0);
    let packed = kernels.mha_varlen_fwd(&q, &k, &v, &batch, &cfg, &mut rng).unwrap();
    assert_eq!(packed.softmax_lse.dims(), &[h, 5]);
    let packed_out = packed.out.to_vec_f64();

    let (mut q_off, mut k_off) = (0, 0);
    for (&lq, &lk) in lens_q.iter().zip(&lens_k) {
        let qi = q.narrow(0, q_off, lq).unwrap().contiguous().reshape(&[1, lq as isize, h as isize, d as isize]).unwrap();
        let ki = k.narrow(0, k_off, lk).unwrap().contiguous().reshape(&[1, lk as isize, h as isize, d as isize]).unwrap();
        let vi = v.narrow(0, k_off, lk).unwrap().contiguous().reshape(&[1, lk as isize, h as isize, d as isize]).unwrap();
        let single = kernels.mha_fwd(&qi, &ki, &vi, &cfg, &mut rng).unwrap();
        let expected = single.out.to_vec_f64();
        let got = &packed_out[q_off * h * d..(q_off + lq) * h * d];
        for (a, b) in got.iter().zip(&expected) {
            assert_close(*a, *b, 1e-12, "varlen output");
        }
        q_off += lq;
        k_off += lk;
    }
}

#[test]
fn test_varlen_backward_fills_given_buffers() {
    let kernels = CpuKernels::new();
    let q = f64_randn(&[4, 1, 2], 20);
    let k = f64_randn(&[4, 1, 2], 21);
    let v = f64_randn(&[4, 1, 2], 22);
    let batch = VarLenBatch::single(4, 4).unwrap();
    let cfg = config(false);
    let mut rng = Generator::new(Device::Cpu, 0);
    let fwd = kernels.mha_varlen_fwd(&q, &k, &v, &batch, &cfg, &mut rng).unwrap();
    let dout = Tensor::ones(&[4, 1, 2]);

    let dq_buf = q.zeros_like();
    let (dq, dk, _) = kernels
        .mha_varlen_bwd(&dout, &q, &k, &v, &fwd.out, &fwd.softmax_lse, &batch, &cfg, &mut rng, Some(&dq_buf), None, None)
        .unwrap();
    assert!(dq.shares_storage(&dq_buf));
    assert_eq!(dk.dtype(), DType::F64);
    assert_eq!(dk.dims(), k.dims());
}

#[test]
fn test_rms_norm_gradients_match_finite_differences() {
    let kernels = CpuKernels::new();
    let x = f64_randn(&[3, 6], 30);
    let w = f64_randn(&[6], 31);
    let b = f64_randn(&[6], 32);
    let go = f64_randn(&[3, 6], 33);
    let eps = 1e-6;

    let (_, inv) = kernels.rms_norm(&x, None, &w, Some(&b), eps).unwrap();
    let grads = kernels.rms_norm_backward(&x, &go, &inv, None, &w, Some(&b), eps).unwrap();

    let loss = |x: &Tensor, w: &Tensor| {
        let (y, _) = kernels.rms_norm(x, None, w, Some(&b), eps).unwrap();
        weighted_sum(&y, &go)
    };
    let h = 1e-6;
    for idx in [0, 5, 11, 17] {
        let numeric = (loss(&perturbed(&x, idx, h), &w) - loss(&perturbed(&x, idx, -h), &w)) / (2.0 * h);
        assert_close(grads.grad_input.to_vec_f64()[idx], numeric, 1e-5, "dx");
    }
    for idx in 0..6 {
        let numeric = (loss(&x, &perturbed(&w, idx, h)) - loss(&x, &perturbed(&w, idx, -h))) / (2.0 * h);
        assert_close(grads.grad_weight.to_vec_f64()[idx], numeric, 1e-5, "dw");
    }
}
