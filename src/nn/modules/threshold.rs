use rayon::prelude::*;

use crate::io::{Flag, Table};
use crate::nn::Layer;
use crate::tensors::Tensor;

/// `nn.Threshold` and `nn.ReLU`: `y = x > threshold ? x : val`.
#[derive(Debug)]
pub struct Threshold {
    pub threshold: f32,
    pub val: f32,
    /// When set, the input is overwritten and the output aliases it.
    pub inplace: Flag,
    pub output: Tensor,
}

impl Threshold {
    #[must_use]
    pub fn new(threshold: f32, val: f32, inplace: bool) -> Self {
        Self {
            threshold,
            val,
            inplace: Flag::from(inplace),
            output: Tensor::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_table(t: &Table) -> Self {
        Self {
            threshold: t.get_number("threshold") as f32,
            val: t.get_number("val") as f32,
            inplace: t.get_flag("inplace"),
            output: Tensor::new(),
        }
    }
}

impl Layer for Threshold {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let (threshold, val) = (self.threshold, self.val);
        let n = input.n_element();
        if self.inplace.is_true() {
            if n > 0 {
                if input.is_contiguous() {
                    input.data_mut()[..n]
                        .par_iter_mut()
                        .filter(|x| **x <= threshold)
                        .for_each(|x| *x = val);
                } else {
                    let clipped = input
                        .to_vec()
                        .into_iter()
                        .map(|x| if x > threshold { x } else { val })
                        .collect();
                    input.copy_from(&Tensor::from_vec(input.sizes(), clipped));
                }
            }
            self.output.set(input);
        } else {
            self.output.resize_as(input);
            if n > 0 {
                let src = input.contiguous();
                let src_ref = src.data();
                self.output.data_mut()[..n]
                    .par_iter_mut()
                    .zip(src_ref[..n].par_iter())
                    .for_each(|(o, &x)| *o = if x > threshold { x } else { val });
            }
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

    #[test]
    fn relu_zeroes_non_positive_inputs() {
        let mut relu = Threshold::new(0.0, 0.0, false);
        let input = tensor!([[-1, 0, 2], [3, -4, 0.5]]);
        let out = relu.update_output(&input);
        assert_eq!(out.to_vec(), vec![0.0, 0.0, 2.0, 3.0, 0.0, 0.5]);
        assert!(!out.shares_storage(&input));
        assert_eq!(input.get(&[0, 0]), -1.0);
    }

    #[test]
    fn custom_threshold_and_replacement() {
        let mut th = Threshold::new(1.5, -7.0, false);
        let out = th.update_output(&tensor!([1, 1.5, 2]));
        assert_eq!(out.to_vec(), vec![-7.0, -7.0, 2.0]);
    }

    #[test]
    fn inplace_overwrites_and_aliases_the_input() {
        let mut relu = Threshold::new(0.0, 0.0, true);
        let input = tensor!([-2, 3, -1]);
        let out = relu.update_output(&input).clone();
        assert!(out.shares_storage(&input));
        assert_eq!(input.to_vec(), vec![0.0, 3.0, 0.0]);
    }

    #[test]
    fn inplace_respects_strides() {
        let mut relu = Threshold::new(0.0, 0.0, true);
        let input = tensor!([[-1, 2], [3, -4]]).new_transpose(0, 1);
        relu.update_output(&input);
        assert_eq!(input.to_vec(), vec![0.0, 3.0, 2.0, 0.0]);
    }

    #[test]
    fn reads_fields_from_the_module_table() {
        let t = Table::from_pairs([
            ("threshold", crate::io::Object::Number(1.0)),
            ("val", crate::io::Object::Number(9.0)),
            ("inplace", crate::io::Object::Boolean(false)),
        ]);
        let th = Threshold::from_table(&t);
        assert_eq!((th.threshold, th.val, th.inplace), (1.0, 9.0, Flag::False));
    }
}
