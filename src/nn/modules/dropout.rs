use crate::io::{Flag, Table};
use crate::nn::Layer;
use crate::ops::mul;
use crate::tensors::Tensor;

/// `nn.Dropout` at inference time.
///
/// Passes the input through. Models saved with `v2 = false` trained with
/// unscaled activations and expect the output multiplied by `1 − p`; models
/// with `v2` missing or true get an unscaled copy.
#[derive(Debug)]
pub struct Dropout {
    pub p: f32,
    pub inplace: Flag,
    pub v2: Flag,
    pub output: Tensor,
}

impl Dropout {
    #[must_use]
    pub fn new(p: f32, inplace: Flag, v2: Flag) -> Self {
        Self {
            p,
            inplace,
            v2,
            output: Tensor::new(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn from_table(t: &Table) -> Self {
        Self::new(
            t.get_number("p") as f32,
            t.get_flag("inplace"),
            t.get_flag("v2"),
        )
    }

    /// Whether outputs are scaled by `1 − p`.
    #[must_use]
    pub fn scales(&self) -> bool {
        self.v2 == Flag::False
    }
}

impl Layer for Dropout {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        if self.inplace.is_true() {
            self.output.set(input);
        } else {
            self.output.resize_as(input);
            self.output.copy_from(input);
        }
        if self.scales() {
            let out = self.output.clone();
            mul(&mut self.output, &out, 1.0 - self.p);
        }
        &self.output
    }

    fn output(&self) -> &Tensor {
        &self.output
    }
}
