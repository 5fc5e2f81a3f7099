use crate::error::{Error, Result};
use crate::io::{Flag, Table};
use crate::nn::Layer;
use crate::tensors::{MAX_DIMS, Tensor};

/// `nn.Reshape`: an aliasing view with a configured shape.
///
/// `size` is the per-sample shape and `batchsize` the same shape with a
/// leading batch dimension, filled in from the input on every call. With
/// `batch_mode` unset the input is treated as a single sample when it holds
/// exactly `num_elements` values and its leading dimension is not 1.
#[derive(Debug)]
pub struct Reshape {
    pub num_elements: usize,
    pub batch_mode: Flag,
    pub size: Vec<usize>,
    pub batchsize: Vec<usize>,
    pub output: Tensor,
}

impl Reshape {
    /// A reshape to `size`, batched as `[N, size..]`.
    ///
    /// # Panics
    ///
    /// Panics if `size` has more than three dimensions.
    #[must_use]
    pub fn new(size: &[usize], batch_mode: Flag) -> Self {
        assert!(size.len() < MAX_DIMS, "reshape to {size:?} has too many dimensions");
        let mut batchsize = vec![1];
        batchsize.extend_from_slice(size);
        Self {
            num_elements: size.iter().product(),
            batch_mode,
            size: size.to_vec(),
            batchsize,
            output: Tensor::new(),
        }
    }

    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let dims = |name: &str| -> Result<Option<Vec<usize>>> {
            let Some(storage) = t.get_storage(name) else {
                return Ok(None);
            };
            let values = storage.data.to_i64_vec().ok_or_else(|| {
                Error::Model(format!("{class}: {name} must be a LongStorage"))
            })?;
            if values.len() > MAX_DIMS {
                return Err(Error::Model(format!(
                    "{class}: {name} has {} dimensions, at most {MAX_DIMS} are supported",
                    values.len()
                )));
            }
            values
                .into_iter()
                .map(|v| {
                    usize::try_from(v)
                        .map_err(|_| Error::Model(format!("{class}: negative {name} entry {v}")))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some)
        };

        let num_elements = usize::try_from(t.get_int("nelement"))
            .map_err(|_| Error::Model(format!("{class}: nelement is negative")))?;
        let size = dims("size")?.unwrap_or_else(|| vec![num_elements]);
        let batchsize = match dims("batchsize")? {
            Some(b) if !b.is_empty() => b,
            _ => std::iter::once(1).chain(size.iter().copied()).collect(),
        };
        if batchsize.len() > MAX_DIMS {
            return Err(Error::Model(format!(
                "{class}: batched shape {batchsize:?} has too many dimensions"
            )));
        }
        Ok(Self {
            num_elements,
            batch_mode: t.get_flag("batchMode"),
            size,
            batchsize,
            output: Tensor::new(),
        })
    }

    fn target_shape(&self, input: &Tensor) -> Vec<usize> {
        let leading = (input.ndim() > 0).then(|| input.size(0));
        let single = match self.batch_mode {
            Flag::False => true,
            Flag::True => false,
            Flag::Unset => input.n_element() == self.num_elements && leading != Some(1),
        };
        if single {
            self.size.clone()
        } else {
            let mut shape = self.batchsize.clone();
            shape[0] = leading.unwrap_or(1);
            shape
        }
    }
}

impl Layer for Reshape {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        let shape = self.target_shape(input);
        let n = input.n_element();
        assert_eq!(
            shape.iter().product::<usize>(),
            n,
            "cannot reshape {:?} to {shape:?}",
            input.sizes()
        );
        let src = input.contiguous();
        self.output = if n > 0 {
            src.sub_view(0, &shape)
        } else {
            Tensor::zeros(&shape)
        };
        &self.output
    }

    fn output(&self) -> &Tensor {
        &self.output
    }
}
