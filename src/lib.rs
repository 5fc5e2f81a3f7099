//! thnets: a small inference runtime for Torch7 networks.
//!
//! Loads `nn.Sequential` models saved in the Torch7 binary object format,
//! compiles them into a flat list of layers and runs them forward on CPU.
//!
//! # Features
//!
//! - Binary object reader and writer with backreference (shared and cyclic) support.
//! - Strided tensor views over reference-counted storages, aliasing without copies.
//! - Forward kernels for convolution (unfold + GEMM), max pooling, linear,
//!   softmax, threshold/ReLU, dropout, view, reshape and zero padding.
//! - A "make spatial" rewrite turning a classifier head into convolutions so
//!   larger images produce a grid of scores.
//!
//! # Goals
//!
//! - Run pretrained image classifiers with no Lua or Torch install.
//! - Keep loading failures as values and shape mismatches as loud panics.
//!
//! # Modules
//!
//! - [`tensors`]: storages, tensor views, the `tensor!` literal macro.
//! - [`ops`]: BLAS-style kernels over tensors.
//! - [`io`]: the serialized object model, reader and writer.
//! - [`nn`]: module compilation, forward evaluation, make-spatial.
//! - [`api`]: the model-directory driver.
//! - [`error`]: error taxonomy.
//! - [`approx`]: float comparison helpers.
//!
//! # Example
//!
//! ```rust
//! use thnets::nn::{Layer, SoftMax};
//! use thnets::tensor;
//!
//! let mut softmax = SoftMax::new();
//! let out = softmax.update_output(&tensor!([1.0, 1.0]));
//! assert_eq!(out.to_vec(), vec![0.5, 0.5]);
//! ```

pub mod api;
pub mod approx;
pub mod error;
pub mod io;
pub mod nn;
pub mod ops;
pub mod tensors;

pub use api::{LoadOptions, ProcessOutput, ThNetwork, last_error};
pub use error::{Error, ErrorKind, Result};
pub use tensors::{Storage, Tensor};
