use rayon::prelude::*;

use crate::nn::Layer;
use crate::ops::exp_minus_approx;
use crate::tensors::Tensor;

/// `nn.SoftMax` over the channel axis.
///
/// | Input | Frames | Channels | Positions per frame |
/// |---|---|---|---|
/// | `[D]` | 1 | `D` | 1 |
/// | `[N, D]` | `N` | `D` | 1 |
/// | `[D, H, W]` | 1 | `D` | `H·W` |
/// | `[N, D, H, W]` | `N` | `D` | `H·W` |
#[derive(Debug, Default)]
pub struct SoftMax {
    pub output: Tensor,
}

impl SoftMax {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Writes the softmax of `src(0..out.len())` into `out`.
#[allow(clippy::cast_possible_truncation)]
fn normalize(out: &mut [f32], src: impl Fn(usize) -> f32) {
    let max = (0..out.len())
        .map(&src)
        .fold(f32::NEG_INFINITY, |m, x| if x >= m { x } else { m });
    let mut sum = 0.0;
    for (d, o) in out.iter_mut().enumerate() {
        let z = exp_minus_approx(f64::from(max - src(d))) as f32;
        *o = z;
        sum += z;
    }
    let inv = 1.0 / sum;
    for o in out {
        *o *= inv;
    }
}

impl Layer for SoftMax {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let (nframe, dim, stride) = match *input.sizes() {
            [d] => (1, d, 1),
            [n, d] => (n, d, 1),
            [d, h, w] => (1, d, h * w),
            [n, d, h, w] => (n, d, h * w),
            _ => panic!("1D, 2D, 3D or 4D tensor expected, got {}D", input.ndim()),
        };
        self.output.resize_as(input);
        if input.n_element() == 0 {
            return &self.output;
        }

        let input = input.contiguous();
        let src_ref = input.data();
        let src: &[f32] = &src_ref;
        let mut dst = self.output.data_mut();
        if stride == 1 {
            dst[..nframe * dim]
                .par_chunks_mut(dim)
                .enumerate()
                .for_each(|(f, out)| normalize(out, |d| src[f * dim + d]));
        } else {
            // one row per (frame, position), gathered across the strided channel axis
            let mut rows = vec![0.0; nframe * stride * dim];
            rows.par_chunks_mut(dim).enumerate().for_each(|(t, out)| {
                let base = (t / stride) * dim * stride + t % stride;
                normalize(out, |d| src[base + d * stride]);
            });
            for (t, row) in rows.chunks(dim).enumerate() {
                let base = (t / stride) * dim * stride + t % stride;
                for (d, &v) in row.iter().enumerate() {
                    dst[base + d * stride] = v;
                }
            }
        }
        drop(dst);
        &self.output
    }

    fn output(&self) -> &Tensor {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;
    use rand::Rng;

    fn assert_distribution(values: &[f32]) {
        let sum: f32 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum is {sum}");
        assert!(values.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn vector_is_a_distribution() {
        let mut sm = SoftMax::new();
        let out = sm.update_output(&tensor!([1, 2, 3, 4]));
        let v = out.to_vec();
        assert_distribution(&v);
        assert!(v.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn shifting_inputs_leaves_output_unchanged() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let x: Vec<f32> = (0..10).map(|_| rng.random_range(-5.0..5.0)).collect();
            let c: f32 = rng.random_range(-50.0..50.0);
            let mut sm = SoftMax::new();
            let a = sm.update_output(&Tensor::from_vec(&[10], x.clone())).to_vec();
            let b = sm
                .update_output(&Tensor::from_vec(&[10], x.iter().map(|v| v + c).collect()))
                .to_vec();
            assert_distribution(&a);
            for (p, q) in a.iter().zip(&b) {
                assert!((p - q).abs() < 1e-5, "{p} vs {q}");
            }
        }
    }

    #[test]
    fn rows_of_a_batch_are_independent() {
        let mut sm = SoftMax::new();
        let out = sm.update_output(&tensor!([[0, 0], [5, 5], [-100, 100]]));
        let v = out.to_vec();
        assert_eq!(&v[..4], &[0.5, 0.5, 0.5, 0.5]);
        assert!(v[4] < 1e-6 && (v[5] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn spatial_input_normalizes_each_position_over_channels() {
        let mut sm = SoftMax::new();
        // [2 channels, 1, 3 positions]
        let out = sm.update_output(&tensor!([[[1, 0, -3]], [[1, 2, 4]]]));
        assert_eq!(out.sizes(), &[2, 1, 3]);
        for p in 0..3 {
            let pair = [out.get(&[0, 0, p]), out.get(&[1, 0, p])];
            assert_distribution(&pair);
        }
        assert!((out.get(&[0, 0, 0]) - 0.5).abs() < 1e-6);
        assert!(out.get(&[1, 0, 2]) > 0.99);
    }

    #[test]
    fn batched_spatial_input_keeps_shape() {
        let mut rng = rand::rng();
        let data: Vec<f32> = (0..2 * 3 * 2 * 2).map(|_| rng.random_range(-3.0..3.0)).collect();
        let mut sm = SoftMax::new();
        let out = sm.update_output(&Tensor::from_vec(&[2, 3, 2, 2], data));
        assert_eq!(out.sizes(), &[2, 3, 2, 2]);
        for n in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let col: Vec<f32> = (0..3).map(|c| out.get(&[n, c, y, x])).collect();
                    assert_distribution(&col);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "1D, 2D, 3D or 4D tensor expected")]
    fn rejects_scalars() {
        let _ = SoftMax::new().update_output(&Tensor::new());
    }
}
