//! Strided matrix kernels in the BLAS calling convention.
//!
//! Every kernel computes `r = beta * r + alpha * (...)` in place on `r`. When
//! `beta` is zero the previous contents of `r` are ignored, so `r` may hold
//! garbage (or NaN) on entry.

use rayon::prelude::*;

use crate::tensors::Tensor;

/// Copies `operand` if it shares storage with `out`, so that writing to `out`
/// cannot alter it mid-computation.
fn detach(operand: &Tensor, out: &Tensor) -> Tensor {
    if operand.shares_storage(out) {
        Tensor::from_vec(operand.sizes(), operand.to_vec())
    } else {
        operand.clone()
    }
}

fn scale(row: &mut [f32], beta: f32) {
    if beta == 0.0 {
        row.fill(0.0);
    } else if beta != 1.0 {
        row.iter_mut().for_each(|v| *v *= beta);
    }
}

/// Runs `f(i, row)` for every row of a `rows × cols` matrix laid out in `data`
/// with strides `rs`/`cs`.
///
/// Row-major outputs are processed in parallel; other layouts go through a
/// scratch row sequentially.
fn for_each_row<F>(data: &mut [f32], rows: usize, cols: usize, rs: usize, cs: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    if cs == 1 && rows == 1 {
        f(0, &mut data[..cols]);
    } else if cs == 1 && rs >= cols {
        data.par_chunks_mut(rs)
            .enumerate()
            .for_each(|(i, chunk)| f(i, &mut chunk[..cols]));
    } else {
        let mut row = vec![0.0; cols];
        for i in 0..rows {
            for (j, v) in row.iter_mut().enumerate() {
                *v = data[i * rs + j * cs];
            }
            f(i, &mut row);
            for (j, v) in row.iter().enumerate() {
                data[i * rs + j * cs] = *v;
            }
        }
    }
}

/// `r = beta * r + alpha * (m1 × m2)`.
///
/// # Panics
///
/// - If `m1` or `m2` is not 2-D.
/// - If `m1.size(1) != m2.size(0)` or `r` is not `m1.size(0) × m2.size(1)`.
pub fn addmm(r: &Tensor, beta: f32, alpha: f32, m1: &Tensor, m2: &Tensor) {
    assert!(
        m1.ndim() == 2 && m2.ndim() == 2,
        "matrices expected, got {}D, {}D tensors",
        m1.ndim(),
        m2.ndim()
    );
    assert_eq!(
        m1.size(1),
        m2.size(0),
        "size mismatch, m1: {:?}, m2: {:?}",
        m1.sizes(),
        m2.sizes()
    );
    let (m, k, n) = (m1.size(0), m1.size(1), m2.size(1));
    assert!(
        r.ndim() == 2 && r.size(0) == m && r.size(1) == n,
        "size mismatch, result: {:?}, expected [{m}, {n}]",
        r.sizes()
    );
    if m * n == 0 {
        return;
    }

    let m1 = detach(m1, r);
    let m2 = detach(m2, r);
    let a_ref = m1.data();
    let b_ref = m2.data();
    let a: &[f32] = &a_ref;
    let b: &[f32] = &b_ref;
    let (ars, acs) = (m1.stride(0), m1.stride(1));
    let (brs, bcs) = (m2.stride(0), m2.stride(1));

    let (rrs, rcs) = (r.stride(0), r.stride(1));
    let mut out_ref = r.data_mut();
    for_each_row(&mut out_ref, m, n, rrs, rcs, |i, row| {
        scale(row, beta);
        for l in 0..k {
            let a_il = alpha * a[i * ars + l * acs];
            let b_row = l * brs;
            if bcs == 1 {
                for (c, &bv) in row.iter_mut().zip(&b[b_row..b_row + n]) {
                    *c += a_il * bv;
                }
            } else {
                for (j, c) in row.iter_mut().enumerate() {
                    *c += a_il * b[b_row + j * bcs];
                }
            }
        }
    });
}

/// `r = beta * r + alpha * (mat × vec)`.
///
/// # Panics
///
/// If `mat` is not 2-D, `vec` or `r` is not 1-D, or the sizes disagree.
pub fn addmv(r: &Tensor, beta: f32, alpha: f32, mat: &Tensor, vec: &Tensor) {
    assert!(
        mat.ndim() == 2 && vec.ndim() == 1,
        "matrix and vector expected, got {}D, {}D",
        mat.ndim(),
        vec.ndim()
    );
    assert_eq!(
        mat.size(1),
        vec.size(0),
        "size mismatch, mat: {:?}, vec: {:?}",
        mat.sizes(),
        vec.sizes()
    );
    let (m, k) = (mat.size(0), mat.size(1));
    assert!(
        r.ndim() == 1 && r.size(0) == m,
        "size mismatch, result: {:?}, expected [{m}]",
        r.sizes()
    );
    if m == 0 {
        return;
    }

    let mat = detach(mat, r);
    let vec = detach(vec, r);
    let a_ref = mat.data();
    let x_ref = vec.data();
    let a: &[f32] = &a_ref;
    let x: &[f32] = &x_ref;
    let (ars, acs) = (mat.stride(0), mat.stride(1));
    let xs = vec.stride(0);

    let dot = |i: usize| -> f32 { (0..k).map(|l| a[i * ars + l * acs] * x[l * xs]).sum() };
    let update = |i: usize, y: &mut f32| {
        let prev = if beta == 0.0 { 0.0 } else { beta * *y };
        *y = prev + alpha * dot(i);
    };

    let rs = r.stride(0);
    let mut out_ref = r.data_mut();
    if rs == 1 {
        out_ref[..m]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, y)| update(i, y));
    } else {
        for i in 0..m {
            update(i, &mut out_ref[i * rs]);
        }
    }
}

/// `r = beta * r + alpha * (v1 ⊗ v2)`.
///
/// # Panics
///
/// If `v1`/`v2` are not vectors or `r` is not `v1.size(0) × v2.size(0)`.
pub fn addr(r: &Tensor, beta: f32, alpha: f32, v1: &Tensor, v2: &Tensor) {
    assert!(
        v1.ndim() == 1 && v2.ndim() == 1,
        "vectors expected, got {}D, {}D tensors",
        v1.ndim(),
        v2.ndim()
    );
    let (m, n) = (v1.size(0), v2.size(0));
    assert!(
        r.ndim() == 2 && r.size(0) == m && r.size(1) == n,
        "size mismatch, result: {:?}, expected [{m}, {n}]",
        r.sizes()
    );
    if m * n == 0 {
        return;
    }

    let u = detach(v1, r).to_vec();
    let v = detach(v2, r).to_vec();
    let (rrs, rcs) = (r.stride(0), r.stride(1));
    let mut out_ref = r.data_mut();
    for_each_row(&mut out_ref, m, n, rrs, rcs, |i, row| {
        scale(row, beta);
        let ui = alpha * u[i];
        for (c, &vj) in row.iter_mut().zip(&v) {
            *c += ui * vj;
        }
    });
}

/// `r = t * value`, resizing `r` to the shape of `t`.
pub fn mul(r: &mut Tensor, t: &Tensor, value: f32) {
    let values = t.to_vec();
    r.resize_as(t);
    let n = r.n_element();
    if n == 0 {
        return;
    }
    if r.is_contiguous() {
        r.data_mut()[..n]
            .par_iter_mut()
            .zip(values.par_iter())
            .for_each(|(o, &v)| *o = v * value);
    } else {
        r.copy_from(&Tensor::from_vec(t.sizes(), values.iter().map(|v| v * value).collect()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn addmm_multiplies_and_accumulates() {
        let a = tensor!([[1, 2], [3, 4]]);
        let b = tensor!([[5, 6], [7, 8]]);
        let r = tensor!([[1, 1], [1, 1]]);
        addmm(&r, 2.0, 1.0, &a, &b);
        assert_eq!(r.to_vec(), vec![21.0, 24.0, 45.0, 52.0]);
    }

    #[test]
    fn addmm_ignores_garbage_when_beta_is_zero() {
        let a = tensor!([[1, 0], [0, 1]]);
        let b = tensor!([[2, 3], [4, 5]]);
        let r = Tensor::zeros(&[2, 2]);
        r.fill(f32::NAN);
        addmm(&r, 0.0, 1.0, &a, &b);
        assert_eq!(r.to_vec(), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn addmm_reads_transposed_operands() {
        let a = tensor!([[1, 2, 3], [4, 5, 6]]);
        let at = a.new_transpose(0, 1);
        let r = Tensor::zeros(&[3, 3]);
        addmm(&r, 0.0, 1.0, &at, &a);
        assert_eq!(
            r.to_vec(),
            vec![17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]
        );
    }

    #[test]
    fn addmm_writes_through_transposed_output() {
        let a = tensor!([[1, 2], [3, 4]]);
        let id = tensor!([[1, 0], [0, 1]]);
        let backing = Tensor::zeros(&[2, 2]);
        let r = backing.new_transpose(0, 1);
        addmm(&r, 0.0, 1.0, &a, &id);
        assert_eq!(backing.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn addmm_handles_aliased_operand() {
        let a = tensor!([[1, 2], [3, 4]]);
        let id = tensor!([[1, 0], [0, 1]]);
        addmm(&a, 1.0, 1.0, &a.clone(), &id);
        assert_eq!(a.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn addmm_rejects_inner_mismatch() {
        let r = Tensor::zeros(&[2, 2]);
        addmm(&r, 0.0, 1.0, &Tensor::zeros(&[2, 3]), &Tensor::zeros(&[2, 2]));
    }

    #[test]
    #[should_panic(expected = "matrices expected")]
    fn addmm_rejects_vectors() {
        let r = Tensor::zeros(&[2, 2]);
        addmm(&r, 0.0, 1.0, &Tensor::zeros(&[4]), &Tensor::zeros(&[2, 2]));
    }

    #[test]
    fn addmv_computes_affine_map() {
        let w = tensor!([[1, 2, 3], [4, 5, 6]]);
        let x = tensor!([1, 0, -1]);
        let y = tensor!([10, 20]);
        addmv(&y, 1.0, 1.0, &w, &x);
        assert_eq!(y.to_vec(), vec![8.0, 18.0]);
    }

    #[test]
    fn addr_adds_outer_product() {
        let r = Tensor::zeros(&[2, 3]);
        addr(&r, 0.0, 1.0, &tensor!([1, 2]), &tensor!([3, 4, 5]));
        assert_eq!(r.to_vec(), vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
        addr(&r, 1.0, -1.0, &tensor!([1, 1]), &tensor!([1, 1, 1]));
        assert_eq!(r.to_vec(), vec![2.0, 3.0, 4.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn mul_scales_into_resized_output() {
        let mut r = Tensor::new();
        mul(&mut r, &tensor!([[1, 2], [3, 4]]), 0.5);
        assert_eq!(r.sizes(), &[2, 2]);
        assert_eq!(r.to_vec(), vec![0.5, 1.0, 1.5, 2.0]);
    }
}
