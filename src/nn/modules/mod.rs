//! Forward kernels, one file per layer type.

mod conv;
mod dropout;
mod linear;
mod padding;
mod pooling;
mod reshape;
mod softmax;
mod threshold;
mod view;

pub use conv::SpatialConvolution;
pub use dropout::Dropout;
pub use linear::Linear;
pub use padding::SpatialZeroPadding;
pub use pooling::{SpatialMaxPooling, pooled_extent};
pub use reshape::Reshape;
pub use softmax::SoftMax;
pub use threshold::Threshold;
pub use view::View;

/// Splits a 3-D or 4-D spatial input into `(batch, planes, height, width)`.
///
/// # Panics
///
/// Panics for any other rank.
pub(crate) fn spatial_dims(input: &crate::tensors::Tensor) -> (bool, [usize; 4]) {
    match input.ndim() {
        3 => (false, [1, input.size(0), input.size(1), input.size(2)]),
        4 => (
            true,
            [input.size(0), input.size(1), input.size(2), input.size(3)],
        ),
        n => panic!("3D or 4D (batch mode) tensor expected, got {n}D"),
    }
}
