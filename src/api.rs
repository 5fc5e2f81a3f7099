//! # Driver
//!
//! [`ThNetwork`] bundles everything needed to classify images: the compiled
//! [`Network`], the object trees it was built from, and the per-channel
//! normalization statistics.
//!
//! A model directory holds two files:
//!
//! - `model.net`: an `nn.Sequential` module tree.
//! - `stat.t7`: a table with a `mean` and a `std` tensor, one entry per input channel.
//!
//! ```no_run
//! use thnets::api::{self, ThNetwork};
//!
//! let mut net = ThNetwork::load_network("models/overfeat").unwrap_or_else(|e| {
//!     panic!("load failed ({}): {e}", api::last_error());
//! });
//! net.make_spatial().unwrap();
//! let pixels = vec![0u8; 3 * 231 * 231];
//! let out = net.process_images(&[pixels.as_slice()], 231, 231, 3 * 231);
//! println!("{} scores on a {}x{} grid", out.len(), out.width, out.height);
//! ```

use std::cell::Cell;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::io::{self, LongSize, Object, ReaderOptions, ScalarType, Table};
use crate::nn::{self, Network};
use crate::tensors::Tensor;

/// Crop size the classifier head was trained on.
pub const DEFAULT_SPATIAL_CROP: usize = 231;

const BYTE_TO_FLOAT: f32 = 1.0 / 255.0;

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// Code of the last failed driver call on this thread, `0` after a success.
///
/// See [`ErrorKind`](crate::error::ErrorKind) for the values.
#[must_use]
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

fn record<T>(result: Result<T>) -> Result<T> {
    let code = result.as_ref().map_or_else(Error::code, |_| 0);
    LAST_ERROR.with(|c| c.set(code));
    result
}

/// Where and how to load a model directory.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Width of "long" fields in both files.
    pub long_size: LongSize,
    /// Input size assumed by [`ThNetwork::make_spatial`].
    pub spatial_crop: usize,
    pub model_file: PathBuf,
    pub stats_file: PathBuf,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            long_size: LongSize::default(),
            spatial_crop: DEFAULT_SPATIAL_CROP,
            model_file: PathBuf::from("model.net"),
            stats_file: PathBuf::from("stat.t7"),
        }
    }
}

/// A deserialized tree, released when dropped.
#[derive(Debug, Default)]
struct ObjectTree(Object);

impl Drop for ObjectTree {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The result of one forward pass.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Final module output; aliases the network's output slot.
    pub tensor: Tensor,
    /// Last dimension of a 3-D or 4-D output, else 1.
    pub width: usize,
    /// Second to last dimension of a 3-D or 4-D output, else 1.
    pub height: usize,
}

impl ProcessOutput {
    fn new(tensor: Tensor) -> Self {
        let n = tensor.ndim();
        let (width, height) = if n >= 3 {
            (tensor.size(n - 1), tensor.size(n - 2))
        } else {
            (1, 1)
        };
        Self {
            tensor,
            width,
            height,
        }
    }

    /// Number of output values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensor.n_element()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The output values in row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.tensor.to_vec()
    }
}

/// A loaded network with its normalization statistics.
#[derive(Debug)]
pub struct ThNetwork {
    net: Network,
    mean: Vec<f32>,
    std: Vec<f32>,
    spatial_crop: usize,
    net_obj: ObjectTree,
    stat_obj: ObjectTree,
}

impl ThNetwork {
    /// Loads `model.net` and `stat.t7` from `dir`.
    ///
    /// # Errors
    ///
    /// - [`Error::OpenFile`] / [`Error::ReadFile`] if either file is missing or short.
    /// - [`Error::WrongObject`] if the statistics are not a `mean`/`std` table.
    /// - Any compile error from [`nn::compile`].
    ///
    /// The error code is also left in [`last_error`].
    pub fn load_network(dir: impl AsRef<Path>) -> Result<Self> {
        Self::load_network_with(dir, &LoadOptions::default())
    }

    /// [`ThNetwork::load_network`] with explicit file names and long width.
    ///
    /// # Errors
    ///
    /// See [`ThNetwork::load_network`].
    pub fn load_network_with(dir: impl AsRef<Path>, options: &LoadOptions) -> Result<Self> {
        record(Self::load(dir.as_ref(), options))
    }

    fn load(dir: &Path, options: &LoadOptions) -> Result<Self> {
        let reader = ReaderOptions {
            long_size: options.long_size,
        };
        let net_obj = ObjectTree(io::load_file(dir.join(&options.model_file), reader)?);
        let net = nn::compile(&net_obj.0)?;
        info!("loaded {} modules from {}", net.len(), dir.display());

        let stat_obj = ObjectTree(io::load_file(dir.join(&options.stats_file), reader)?);
        let Some(stats) = stat_obj.0.as_table() else {
            return Err(Error::WrongObject(format!(
                "statistics are a {}, expected a table",
                stat_obj.0.type_name()
            )));
        };
        if stats.len() != 2 {
            return Err(Error::WrongObject(format!(
                "statistics table has {} entries, expected mean and std",
                stats.len()
            )));
        }
        let mean = stat_vector(stats, "mean")?;
        let std = stat_vector(stats, "std")?;
        if mean.is_empty() || mean.len() != std.len() {
            return Err(Error::WrongObject(format!(
                "mean has {} entries but std has {}",
                mean.len(),
                std.len()
            )));
        }
        info!("normalization over {} channels: mean {mean:?}, std {std:?}", mean.len());

        Ok(Self {
            net,
            mean,
            std,
            spatial_crop: options.spatial_crop,
            net_obj,
            stat_obj,
        })
    }

    /// Wraps an already compiled network.
    ///
    /// # Panics
    ///
    /// Panics if `mean` and `std` differ in length or are empty.
    #[must_use]
    pub fn from_network(net: Network, mean: Vec<f32>, std: Vec<f32>) -> Self {
        assert!(
            !mean.is_empty() && mean.len() == std.len(),
            "mean and std must have one entry per channel"
        );
        Self {
            net,
            mean,
            std,
            spatial_crop: DEFAULT_SPATIAL_CROP,
            net_obj: ObjectTree::default(),
            stat_obj: ObjectTree::default(),
        }
    }

    #[must_use]
    pub const fn network(&self) -> &Network {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.net
    }

    /// The deserialized `model.net` tree.
    #[must_use]
    pub fn model_object(&self) -> &Object {
        &self.net_obj.0
    }

    /// The deserialized `stat.t7` tree.
    #[must_use]
    pub fn stats_object(&self) -> &Object {
        &self.stat_obj.0
    }

    #[must_use]
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    #[must_use]
    pub fn std(&self) -> &[f32] {
        &self.std
    }

    /// Number of input channels.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Rewrites the classifier head so any input of at least the crop size
    /// can be processed. See [`Network::make_spatial`].
    ///
    /// # Errors
    ///
    /// [`Error::Model`] if the network does not fit the crop size.
    pub fn make_spatial(&mut self) -> Result<()> {
        let result = self.net.make_spatial(self.spatial_crop, self.channels());
        if result.is_ok() {
            info!(
                "made spatial for {}x{} crops, {} modules left",
                self.spatial_crop,
                self.spatial_crop,
                self.net.len()
            );
        }
        record(result)
    }

    /// Runs planar float images `[batch, channels, height, width]`, normalizing
    /// each channel with the loaded statistics first.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not hold exactly `batch` images, or if a kernel
    /// rejects the input shape.
    pub fn process_float(
        &mut self,
        data: &[f32],
        batch: usize,
        width: usize,
        height: usize,
    ) -> ProcessOutput {
        let c = self.channels();
        let plane = width * height;
        assert_eq!(
            data.len(),
            batch * c * plane,
            "expected {batch} images of {c}x{height}x{width} floats"
        );
        let mut normalized = Vec::with_capacity(data.len());
        if plane > 0 {
            for image in data.chunks(c * plane) {
                for (ch, values) in image.chunks(plane).enumerate() {
                    let (m, s) = (self.mean[ch], self.std[ch]);
                    normalized.extend(values.iter().map(|&v| (v - m) / s));
                }
            }
        }
        self.run(Tensor::from_vec(&[batch, c, height, width], normalized))
    }

    /// Runs interleaved 8-bit images, one slice per image, whose rows are
    /// `stride` bytes apart. Pixels are scaled to `[0, 1]` and normalized.
    ///
    /// # Panics
    ///
    /// Panics if an image is too short for `height` rows of `stride` bytes,
    /// or if a kernel rejects the input shape.
    pub fn process_images(
        &mut self,
        images: &[&[u8]],
        width: usize,
        height: usize,
        stride: usize,
    ) -> ProcessOutput {
        let c = self.channels();
        let plane = width * height;
        assert!(stride >= c * width, "row stride {stride} is shorter than a row");
        let mut data = vec![0.0; images.len() * c * plane];
        if plane > 0 {
            for (dst, src) in data.chunks_mut(c * plane).zip(images) {
                assert!(
                    src.len() >= stride * (height - 1) + c * width,
                    "image of {} bytes is too short for {height} rows of {stride}",
                    src.len()
                );
                rgb_to_planes(dst, src, width, stride, &self.mean, &self.std);
            }
        }
        self.run(Tensor::from_vec(&[images.len(), c, height, width], data))
    }

    fn run(&mut self, input: Tensor) -> ProcessOutput {
        ProcessOutput::new(self.net.forward(&input))
    }

    /// Releases the network and both object trees.
    pub fn free(self) {}
}

/// Converts interleaved bytes into normalized planar floats.
fn rgb_to_planes(dst: &mut [f32], src: &[u8], width: usize, stride: usize, mean: &[f32], std: &[f32]) {
    let c = mean.len();
    let plane = dst.len() / c;
    for (ch, plane) in dst.chunks_mut(plane).enumerate() {
        for (i, row) in plane.chunks_mut(width).enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                let px = f32::from(src[ch + c * j + stride * i]);
                *v = (px * BYTE_TO_FLOAT - mean[ch]) / std[ch];
            }
        }
    }
}

fn stat_vector(stats: &Table, name: &str) -> Result<Vec<f32>> {
    let t = stats
        .get_tensor(name)
        .ok_or_else(|| Error::WrongObject(format!("statistics table has no {name} tensor")))?;
    if t.scalar_type != ScalarType::Float {
        warn!("converting {} {name} statistics to Float", t.scalar_type.name());
    }
    Ok(t.to_float_tensor()?.to_vec())
}
