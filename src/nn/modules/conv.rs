//! Spatial convolution as unfold + matrix multiply.
//!
//! Each input sample `[C, H, W]` is unfolded into a `[C·kH·kW, oH·oW]` matrix
//! whose row `(c, ki, kj)` holds, for every output position, the input pixel
//! under kernel tap `(ki, kj)` of plane `c` (zero where the tap falls into the
//! padding). The output is then `bias + weight × unfolded`.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::io::Table;
use crate::nn::modules::{Linear, spatial_dims};
use crate::nn::{Layer, Window, field, tensor_field};
use crate::ops::addmm;
use crate::tensors::Tensor;

/// `nn.SpatialConvolutionMM` and the legacy `nn.SpatialConvolution`.
#[derive(Debug)]
pub struct SpatialConvolution {
    pub window: Window,
    pub n_input_plane: usize,
    pub n_output_plane: usize,
    /// `[n_output_plane, n_input_plane · kH · kW]`
    pub weight: Tensor,
    /// `[n_output_plane]`
    pub bias: Tensor,
    pub output: Tensor,
    finput: Tensor,
}

impl SpatialConvolution {
    /// Builds a convolution from a 2-D or 4-D weight.
    ///
    /// # Panics
    ///
    /// Panics if the weight or bias shape disagrees with the plane counts and window.
    #[must_use]
    pub fn new(
        window: Window,
        n_input_plane: usize,
        n_output_plane: usize,
        weight: &Tensor,
        bias: Tensor,
    ) -> Self {
        let cols = n_input_plane * window.kh * window.kw;
        assert_eq!(
            weight.n_element(),
            n_output_plane * cols,
            "weight of shape {:?} does not match {n_output_plane}x{cols}",
            weight.sizes()
        );
        assert_eq!(bias.n_element(), n_output_plane, "bias size mismatch");
        Self {
            window,
            n_input_plane,
            n_output_plane,
            weight: weight.contiguous().sub_view(0, &[n_output_plane, cols]),
            bias,
            output: Tensor::new(),
            finput: Tensor::new(),
        }
    }

    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let mut window = Window::from_table(t, class)?;
        if window.pad_w == 0 && window.pad_h == 0 {
            let pad = field(t, class, "padding")?;
            window.pad_w = pad;
            window.pad_h = pad;
        }
        let n_input_plane = field(t, class, "nInputPlane")?;
        let n_output_plane = field(t, class, "nOutputPlane")?;
        let weight = tensor_field(t, class, "weight")?;
        if !matches!(weight.ndim(), 2 | 4)
            || weight.size(0) != n_output_plane
            || weight.n_element() != n_output_plane * n_input_plane * window.kh * window.kw
        {
            return Err(Error::Model(format!(
                "{class}: weight of shape {:?} does not match {n_input_plane} -> {n_output_plane} planes with a {}x{} kernel",
                weight.sizes(),
                window.kh,
                window.kw
            )));
        }
        let bias = match t.get_tensor("bias") {
            Some(b) => b.to_float_tensor()?,
            None => Tensor::zeros(&[n_output_plane]),
        };
        if bias.n_element() != n_output_plane {
            return Err(Error::Model(format!(
                "{class}: bias has {} elements, expected {n_output_plane}",
                bias.n_element()
            )));
        }
        Ok(Self::new(window, n_input_plane, n_output_plane, &weight, bias))
    }

    /// The convolution computing `linear` on a `planes × size × size` feature map.
    ///
    /// # Errors
    ///
    /// [`Error::Model`] when the Linear input width is not `planes · size²`.
    pub fn from_linear(linear: &Linear, planes: usize, size: usize) -> Result<Self> {
        let (outputs, inputs) = (linear.weight.size(0), linear.weight.size(1));
        if inputs != planes * size * size {
            return Err(Error::Model(format!(
                "Linear layer takes {inputs} inputs, but the feature map is {planes}x{size}x{size}"
            )));
        }
        let window = Window {
            kw: size,
            kh: size,
            dw: 1,
            dh: 1,
            pad_w: 0,
            pad_h: 0,
        };
        Ok(Self::new(
            window,
            planes,
            outputs,
            &linear.weight,
            linear.bias.clone(),
        ))
    }
}

/// Fills `finput` (`[C·kH·kW, oH·oW]`, row-major) from one `[C, H, W]` sample.
fn unfold(finput: &mut [f32], src: &[f32], win: Window, h: usize, w: usize, oh: usize, ow: usize) {
    let taps = win.kh * win.kw;
    finput
        .par_chunks_mut(oh * ow)
        .enumerate()
        .for_each(|(k, row)| {
            let plane = &src[(k / taps) * h * w..(k / taps + 1) * h * w];
            let ki = (k % taps) / win.kw;
            let kj = (k % taps) % win.kw;
            for (y, out) in row.chunks_mut(ow).enumerate() {
                let Some(iy) = (y * win.dh + ki).checked_sub(win.pad_h).filter(|&iy| iy < h) else {
                    out.fill(0.0);
                    continue;
                };
                let line = &plane[iy * w..(iy + 1) * w];
                for (x, v) in out.iter_mut().enumerate() {
                    *v = (x * win.dw + kj)
                        .checked_sub(win.pad_w)
                        .and_then(|ix| line.get(ix))
                        .copied()
                        .unwrap_or(0.0);
                }
            }
        });
}

impl Layer for SpatialConvolution {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let (batch, [n, c, h, w]) = spatial_dims(input);
        assert_eq!(
            c, self.n_input_plane,
            "input has {c} planes, expected {}",
            self.n_input_plane
        );
        let win = self.window;
        let planes = self.n_output_plane;
        let (Some(oh), Some(ow)) = (
            Window::conv_extent(h, win.kh, win.dh, win.pad_h),
            Window::conv_extent(w, win.kw, win.dw, win.pad_w),
        ) else {
            panic!(
                "given input size ({c}x{h}x{w}) with a {}x{} kernel: output size is too small",
                win.kh, win.kw
            );
        };

        if batch {
            self.output.resize_4d(n, planes, oh, ow);
        } else {
            self.output.resize_3d(planes, oh, ow);
        }
        let cols = oh * ow;
        self.finput.resize_2d(c * win.kh * win.kw, cols);

        let input = input.contiguous();
        let bias = self.bias.to_vec();
        let frame = c * h * w;
        for s in 0..n {
            {
                let src = input.data();
                let mut dst = self.finput.data_mut();
                unfold(&mut dst, &src[s * frame..(s + 1) * frame], win, h, w, oh, ow);
            }
            let out = self.output.sub_view(s * planes * cols, &[planes, cols]);
            for (row, &b) in out.data_mut().chunks_mut(cols).zip(&bias) {
                row.fill(b);
            }
            addmm(&out, 1.0, 1.0, &self.weight, &self.finput);
        }
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

    fn window(k: (usize, usize), d: (usize, usize), pad: (usize, usize)) -> Window {
        Window {
            kh: k.0,
            kw: k.1,
            dh: d.0,
            dw: d.1,
            pad_h: pad.0,
            pad_w: pad.1,
        }
    }

    #[test]
    fn one_by_one_identity_passes_input_through() {
        let mut conv = SpatialConvolution::new(
            window((1, 1), (1, 1), (0, 0)),
            1,
            1,
            &tensor!([[1.0]]),
            tensor!([0.0]),
        );
        let input = Tensor::from_vec(&[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
        let out = conv.update_output(&input);
        assert_eq!(out.sizes(), &[1, 1, 3, 3]);
        assert_eq!(out.to_vec(), input.to_vec());
    }

    #[test]
    fn output_shape_follows_the_convolution_formula() {
        let win = window((3, 2), (1, 2), (0, 1));
        let mut conv = SpatialConvolution::new(
            win,
            3,
            4,
            &Tensor::zeros(&[4, 3 * 3 * 2]),
            Tensor::zeros(&[4]),
        );
        let out = conv.update_output(&Tensor::zeros(&[2, 3, 7, 9]));
        assert_eq!(out.sizes(), &[2, 4, 5, 5]);
    }

    #[test]
    fn three_dimensional_input_stays_unbatched() {
        let mut conv = SpatialConvolution::new(
            window((2, 2), (1, 1), (0, 0)),
            1,
            2,
            &Tensor::from_vec(&[2, 1, 2, 2], vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]),
            tensor!([0.0, 100.0]),
        );
        let input = tensor!([[[1, 2, 3], [4, 5, 6], [7, 8, 9]]]);
        let out = conv.update_output(&input);
        assert_eq!(out.sizes(), &[2, 2, 2]);
        assert_eq!(
            out.to_vec(),
            vec![1.0, 2.0, 4.0, 5.0, 105.0, 106.0, 108.0, 109.0]
        );
    }

    #[test]
    fn padding_taps_read_zero() {
        let mut conv = SpatialConvolution::new(
            window((3, 3), (1, 1), (1, 1)),
            1,
            1,
            &Tensor::from_vec(&[1, 9], vec![1.0; 9]),
            tensor!([1.0]),
        );
        let out = conv.update_output(&tensor!([[[1, 2], [3, 4]]]));
        assert_eq!(out.to_vec(), vec![11.0; 4]);
    }

    #[test]
    fn stride_skips_positions_and_planes_mix() {
        let mut conv = SpatialConvolution::new(
            window((1, 1), (2, 2), (0, 0)),
            2,
            1,
            &tensor!([[1.0, 10.0]]),
            tensor!([0.0]),
        );
        let input = Tensor::from_vec(&[2, 4, 4], (0..32).map(|v| v as f32).collect());
        let out = conv.update_output(&input);
        assert_eq!(out.sizes(), &[1, 2, 2]);
        assert_eq!(out.to_vec(), vec![160.0, 182.0, 248.0, 270.0]);
    }

    #[test]
    fn output_slot_is_reused_across_calls() {
        let mut conv = SpatialConvolution::new(
            window((1, 1), (1, 1), (0, 0)),
            1,
            1,
            &tensor!([[2.0]]),
            tensor!([0.0]),
        );
        let first = conv.update_output(&Tensor::zeros(&[1, 4, 4])).clone();
        let second = conv.update_output(&Tensor::zeros(&[1, 2, 2])).clone();
        assert!(first.shares_storage(&second));
    }

    #[test]
    #[should_panic(expected = "output size is too small")]
    fn kernel_larger_than_input_panics() {
        let mut conv = SpatialConvolution::new(
            window((5, 5), (1, 1), (0, 0)),
            1,
            1,
            &Tensor::zeros(&[1, 25]),
            tensor!([0.0]),
        );
        let _ = conv.update_output(&Tensor::zeros(&[1, 3, 3]));
    }
}
