use rayon::prelude::*;

use crate::error::Result;
use crate::io::Table;
use crate::nn::modules::spatial_dims;
use crate::nn::{Layer, Window};
use crate::tensors::Tensor;

/// Pooled extent along one axis, or `None` when the window does not fit.
///
/// `ceil`/`floor((in − k + 2·pad) / d) + 1`, minus one if the last window
/// would start at or past `in + pad`.
#[must_use]
pub fn pooled_extent(input: usize, k: usize, d: usize, pad: usize, ceil_mode: bool) -> Option<usize> {
    let span = (input + 2 * pad).checked_sub(k)?;
    if d == 0 {
        return None;
    }
    let mut out = if ceil_mode { span.div_ceil(d) } else { span / d } + 1;
    if (out - 1) * d >= input + pad {
        out -= 1;
    }
    Some(out)
}

/// `nn.SpatialMaxPooling`.
#[derive(Debug)]
pub struct SpatialMaxPooling {
    pub window: Window,
    pub ceil_mode: bool,
    pub output: Tensor,
}

impl SpatialMaxPooling {
    #[must_use]
    pub fn new(window: Window, ceil_mode: bool) -> Self {
        Self {
            window,
            ceil_mode,
            output: Tensor::new(),
        }
    }

    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let ceil_mode = match t.get("ceil_mode") {
            Some(crate::io::Object::Boolean(b)) => b,
            _ => t.get_number("ceil_mode") != 0.0,
        };
        Ok(Self::new(Window::from_table(t, class)?, ceil_mode))
    }
}

impl Layer for SpatialMaxPooling {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let (batch, [n, c, h, w]) = spatial_dims(input);
        let win = self.window;
        let (Some(oh), Some(ow)) = (
            pooled_extent(h, win.kh, win.dh, win.pad_h, self.ceil_mode),
            pooled_extent(w, win.kw, win.dw, win.pad_w, self.ceil_mode),
        ) else {
            panic!(
                "given input size ({c}x{h}x{w}) with a {}x{} window: output size is too small",
                win.kh, win.kw
            );
        };

        if batch {
            self.output.resize_4d(n, c, oh, ow);
        } else {
            self.output.resize_3d(c, oh, ow);
        }
        if oh * ow == 0 {
            return &self.output;
        }

        let input = input.contiguous();
        let src_ref = input.data();
        let src: &[f32] = &src_ref;
        let mut dst = self.output.data_mut();
        dst.par_chunks_mut(oh * ow)
            .enumerate()
            .for_each(|(p, out)| {
                let plane = &src[p * h * w..(p + 1) * h * w];
                for (i, row) in out.chunks_mut(ow).enumerate() {
                    let hstart = (i * win.dh).saturating_sub(win.pad_h);
                    let hend = (i * win.dh + win.kh).saturating_sub(win.pad_h).min(h);
                    for (j, v) in row.iter_mut().enumerate() {
                        let wstart = (j * win.dw).saturating_sub(win.pad_w);
                        let wend = (j * win.dw + win.kw).saturating_sub(win.pad_w).min(w);
                        let mut max = f32::NEG_INFINITY;
                        for y in hstart..hend {
                            for &x in &plane[y * w + wstart..y * w + wend.max(wstart)] {
                                if x > max {
                                    max = x;
                                }
                            }
                        }
                        *v = max;
                    }
                }
            });
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

    fn square(k: usize, d: usize, pad: usize) -> Window {
        Window {
            kw: k,
            kh: k,
            dw: d,
            dh: d,
            pad_w: pad,
            pad_h: pad,
        }
    }

    #[test]
    fn even_input_pools_to_half_in_both_modes() {
        assert_eq!(pooled_extent(4, 2, 2, 0, false), Some(2));
        assert_eq!(pooled_extent(4, 2, 2, 0, true), Some(2));
    }

    #[test]
    fn last_window_starting_in_padding_is_dropped() {
        // ceil((5 - 2 + 2) / 2) + 1 = 4 windows; the 4th would start at 6 = in + pad
        assert_eq!(pooled_extent(5, 2, 2, 1, true), Some(3));
        assert_eq!(pooled_extent(5, 2, 2, 1, false), Some(3));
        assert_eq!(pooled_extent(5, 1, 3, 0, true), Some(2));
    }

    #[test]
    fn strided_ceil_windows_never_start_past_the_input() {
        let mut pool = SpatialMaxPooling::new(square(1, 3, 0), true);
        let input = Tensor::from_vec(&[1, 5, 5], (0..25).map(|v| v as f32).collect());
        let out = pool.update_output(&input);
        assert_eq!(out.sizes(), &[1, 2, 2]);
        assert_eq!(out.to_vec(), vec![0.0, 3.0, 15.0, 18.0]);
    }

    #[test]
    fn ceil_mode_keeps_partial_windows() {
        assert_eq!(pooled_extent(5, 2, 2, 0, false), Some(2));
        assert_eq!(pooled_extent(5, 2, 2, 0, true), Some(3));
    }

    #[test]
    fn takes_window_maxima() {
        let mut pool = SpatialMaxPooling::new(square(2, 2, 0), false);
        let input = tensor!([[[1, 5, 2, 0], [3, 4, 8, 1], [0, 0, -1, -2], [9, 0, -3, -4]]]);
        let out = pool.update_output(&input);
        assert_eq!(out.sizes(), &[1, 2, 2]);
        assert_eq!(out.to_vec(), vec![5.0, 8.0, 9.0, -1.0]);
    }

    #[test]
    fn padded_ceil_windows_clip_to_input() {
        let mut pool = SpatialMaxPooling::new(square(2, 2, 1), true);
        let input = Tensor::from_vec(&[1, 1, 5, 5], (0..25).map(|v| -(v as f32)).collect());
        let out = pool.update_output(&input);
        assert_eq!(out.sizes(), &[1, 1, 3, 3]);
        // window (0,0) covers only input (0,0); later windows start at odd rows/cols
        assert_eq!(
            out.to_vec(),
            vec![0.0, -1.0, -3.0, -5.0, -6.0, -8.0, -15.0, -16.0, -18.0]
        );
    }

    #[test]
    fn planes_are_pooled_independently() {
        let mut pool = SpatialMaxPooling::new(square(2, 2, 0), false);
        let input = Tensor::from_vec(&[2, 3, 2, 2], (0..24).map(|v| v as f32).collect());
        let out = pool.update_output(&input);
        assert_eq!(out.sizes(), &[2, 3, 1, 1]);
        assert_eq!(out.to_vec(), vec![3.0, 7.0, 11.0, 15.0, 19.0, 23.0]);
    }
}
