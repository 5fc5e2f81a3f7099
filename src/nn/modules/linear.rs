use crate::error::{Error, Result};
use crate::io::Table;
use crate::nn::{Layer, tensor_field};
use crate::ops::{addmm, addmv, addr};
use crate::tensors::Tensor;

/// `nn.Linear`: `y = W·x + b`.
#[derive(Debug)]
pub struct Linear {
    /// `[outputs, inputs]`
    pub weight: Tensor,
    /// `[outputs]`
    pub bias: Tensor,
    pub output: Tensor,
    /// Ones-vector of the last batch size, used to broadcast the bias.
    add_buffer: Tensor,
}

impl Linear {
    /// # Panics
    ///
    /// Panics unless `weight` is 2-D and `bias` has one entry per output row.
    #[must_use]
    pub fn new(weight: Tensor, bias: Tensor) -> Self {
        assert_eq!(weight.ndim(), 2, "linear weight must be a matrix");
        assert_eq!(
            bias.n_element(),
            weight.size(0),
            "bias size mismatch"
        );
        let n = bias.n_element();
        Self {
            weight,
            bias: bias.contiguous().sub_view(0, &[n]),
            output: Tensor::new(),
            add_buffer: Tensor::new(),
        }
    }

    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let weight = tensor_field(t, class, "weight")?;
        if weight.ndim() != 2 {
            return Err(Error::Model(format!(
                "{class}: weight must be 2-D, got {:?}",
                weight.sizes()
            )));
        }
        let bias = match t.get_tensor("bias") {
            Some(b) => b.to_float_tensor()?,
            None => Tensor::zeros(&[weight.size(0)]),
        };
        if bias.n_element() != weight.size(0) {
            return Err(Error::Model(format!(
                "{class}: bias has {} elements, expected {}",
                bias.n_element(),
                weight.size(0)
            )));
        }
        let mut linear = Self::new(weight, bias);
        if let Some(buf) = t.get_tensor("addBuffer") {
            linear.add_buffer = buf.to_float_tensor()?;
        }
        Ok(linear)
    }
}

impl Layer for Linear {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let outputs = self.weight.size(0);
        match input.ndim() {
            1 => {
                self.output.resize_1d(outputs);
                self.output.copy_from(&self.bias);
                addmv(&self.output, 1.0, 1.0, &self.weight, input);
            }
            2 => {
                let nframe = input.size(0);
                self.output.resize_2d(nframe, outputs);
                if self.add_buffer.n_element() != nframe {
                    self.add_buffer = Tensor::zeros(&[nframe]);
                    self.add_buffer.fill(1.0);
                }
                addmm(
                    &self.output,
                    0.0,
                    1.0,
                    input,
                    &self.weight.new_transpose(0, 1),
                );
                addr(&self.output, 1.0, 1.0, &self.add_buffer, &self.bias);
            }
            n => panic!("input must be vector or matrix, got {n}D"),
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

    fn layer() -> Linear {
        Linear::new(tensor!([[1, 2, 3], [0, -1, 1]]), tensor!([10, 20]))
    }

    #[test]
    fn vector_input() {
        let mut l = layer();
        let out = l.update_output(&tensor!([1, 1, 1]));
        assert_eq!(out.sizes(), &[2]);
        assert_eq!(out.to_vec(), vec![16.0, 20.0]);
    }

    #[test]
    fn batch_input_broadcasts_bias() {
        let mut l = layer();
        let out = l.update_output(&tensor!([[1, 1, 1], [1, 0, 0], [0, 0, 2]]));
        assert_eq!(out.sizes(), &[3, 2]);
        assert_eq!(out.to_vec(), vec![16.0, 20.0, 11.0, 20.0, 16.0, 22.0]);
    }

    #[test]
    fn add_buffer_follows_batch_size() {
        let mut l = layer();
        l.update_output(&Tensor::zeros(&[4, 3]));
        assert_eq!(l.add_buffer.to_vec(), vec![1.0; 4]);
        let out = l.update_output(&Tensor::zeros(&[2, 3]));
        assert_eq!(out.to_vec(), vec![10.0, 20.0, 10.0, 20.0]);
        assert_eq!(l.add_buffer.n_element(), 2);
    }

    #[test]
    #[should_panic(expected = "input must be vector or matrix")]
    fn rejects_spatial_input() {
        let mut l = layer();
        let _ = l.update_output(&Tensor::zeros(&[1, 3, 1, 1]));
    }
}
