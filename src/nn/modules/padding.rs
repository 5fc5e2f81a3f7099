use rayon::prelude::*;

use crate::io::Table;
use crate::nn::Layer;
use crate::nn::modules::spatial_dims;
use crate::tensors::Tensor;

/// `nn.SpatialZeroPadding`. Negative amounts crop instead of padding.
#[derive(Debug)]
pub struct SpatialZeroPadding {
    pub pad_l: isize,
    pub pad_r: isize,
    pub pad_t: isize,
    pub pad_b: isize,
    pub output: Tensor,
}

impl SpatialZeroPadding {
    #[must_use]
    pub fn new(pad_l: isize, pad_r: isize, pad_t: isize, pad_b: isize) -> Self {
        Self {
            pad_l,
            pad_r,
            pad_t,
            pad_b,
            output: Tensor::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_table(t: &Table) -> Self {
        Self::new(
            t.get_int("pad_l") as isize,
            t.get_int("pad_r") as isize,
            t.get_int("pad_t") as isize,
            t.get_int("pad_b") as isize,
        )
    }
}

/// `in + a + b`, panicking when cropping removes more than the input.
fn padded(input: usize, a: isize, b: isize) -> usize {
    isize::try_from(input)
        .ok()
        .and_then(|i| usize::try_from(i + a + b).ok())
        .unwrap_or_else(|| panic!("cropping {} from an extent of {input}", -(a + b)))
}

/// `(first output index, first input index)` of the copied span for leading pad `pad`.
const fn span_start(pad: isize) -> (usize, usize) {
    if pad >= 0 {
        (pad.unsigned_abs(), 0)
    } else {
        (0, pad.unsigned_abs())
    }
}

impl Layer for SpatialZeroPadding {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let (batch, [n, c, h, w]) = spatial_dims(input);
        let oh = padded(h, self.pad_t, self.pad_b);
        let ow = padded(w, self.pad_l, self.pad_r);
        if batch {
            self.output.resize_4d(n, c, oh, ow);
        } else {
            self.output.resize_3d(c, oh, ow);
        }
        if oh * ow == 0 || n * c == 0 {
            return &self.output;
        }

        let (oy0, iy0) = span_start(self.pad_t);
        let (ox0, ix0) = span_start(self.pad_l);
        let rows = h.saturating_sub(iy0).min(oh.saturating_sub(oy0));
        let cols = w.saturating_sub(ix0).min(ow.saturating_sub(ox0));

        let input = input.contiguous();
        let src_ref = input.data();
        let src: &[f32] = &src_ref;
        let mut dst = self.output.data_mut();
        dst[..n * c * oh * ow]
            .par_chunks_mut(oh * ow)
            .enumerate()
            .for_each(|(p, out)| {
                out.fill(0.0);
                let plane = &src[p * h * w..(p + 1) * h * w];
                for y in 0..rows {
                    let line = &plane[(iy0 + y) * w + ix0..][..cols];
                    out[(oy0 + y) * ow + ox0..][..cols].copy_from_slice(line);
                }
            });
        drop(dst);
        &self.output
    }

    fn output(&self) -> &Tensor {
        &self.output
    }
}
