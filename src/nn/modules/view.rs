use crate::error::{Error, Result};
use crate::io::Table;
use crate::nn::{Layer, field};
use crate::tensors::Tensor;

/// `nn.View`: reinterprets the input as `[numElements]`, or as
/// `[batch, numElements]` when it holds several samples.
#[derive(Debug)]
pub struct View {
    pub num_elements: usize,
    pub output: Tensor,
}

impl View {
    /// # Panics
    ///
    /// Panics if `num_elements` is zero.
    #[must_use]
    pub fn new(num_elements: usize) -> Self {
        assert!(num_elements > 0, "view of zero elements");
        Self {
            num_elements,
            output: Tensor::new(),
        }
    }

    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let num_elements = field(t, class, "numElements")?;
        if num_elements == 0 {
            return Err(Error::Model(format!("{class}: numElements must be positive")));
        }
        Ok(Self::new(num_elements))
    }
}

impl Layer for View {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let n = input.n_element();
        let num = self.num_elements;
        assert!(
            n > 0 && n % num == 0,
            "input of {n} elements cannot be viewed as rows of {num}"
        );
        let input = input.contiguous();
        let Some(storage) = input.storage() else {
            panic!("tensor has no storage");
        };
        let (storage, offset) = (std::rc::Rc::clone(storage), input.storage_offset());
        let batch = n / num;
        self.output = if batch > 1 {
            Tensor::new_with_storage_2d(storage, offset, batch, -1, num, -1)
        } else {
            Tensor::new_with_storage_1d(storage, offset, num, -1)
        };
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
    fn single_sample_flattens_to_a_vector() {
        let mut v = View::new(6);
        let input = tensor!([[[1, 2, 3], [4, 5, 6]]]);
        let out = v.update_output(&input);
        assert_eq!(out.sizes(), &[6]);
        assert_eq!(out.to_vec(), input.to_vec());
        assert!(out.shares_storage(&input));
    }

    #[test]
    fn batches_become_rows() {
        let mut v = View::new(4);
        let input = Tensor::zeros(&[3, 1, 2, 2]);
        let out = v.update_output(&input).clone();
        assert_eq!(out.sizes(), &[3, 4]);
        input.fill(2.0);
        assert_eq!(out.to_vec(), vec![2.0; 12]);
    }

    #[test]
    fn view_starts_at_the_input_offset() {
        let base = tensor!([[9, 9], [1, 2]]);
        let row = base.new_select(0, 1);
        let out = View::new(2).update_output(&row).clone();
        assert_eq!(out.to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "cannot be viewed")]
    fn indivisible_input_panics() {
        let _ = View::new(4).update_output(&Tensor::zeros(&[6]));
    }

    #[test]
    fn zero_elements_is_a_model_error() {
        let t = Table::from_pairs([("numElements", crate::io::Object::Number(0.0))]);
        assert!(matches!(View::from_table(&t, "nn.View"), Err(Error::Model(_))));
    }
}
