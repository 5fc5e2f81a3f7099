//! Compiled networks.
//!
//! [`compile`] turns a deserialized `nn.Sequential` object into a [`Network`]:
//! an ordered list of [`Module`]s, each holding its parameters and a
//! persistent output tensor that is resized (not reallocated) across calls.
//!
//! # Supported modules
//!
//! | Class | Variant |
//! |---|---|
//! | `nn.SpatialConvolutionMM`, `nn.SpatialConvolution` | [`Module::SpatialConvolution`] |
//! | `nn.SpatialMaxPooling` | [`Module::SpatialMaxPooling`] |
//! | `nn.Linear` | [`Module::Linear`] |
//! | `nn.SoftMax` | [`Module::SoftMax`] |
//! | `nn.Threshold`, `nn.ReLU` | [`Module::Threshold`] |
//! | `nn.View` | [`Module::View`] |
//! | `nn.Dropout` | [`Module::Dropout`] |
//! | `nn.SpatialZeroPadding` | [`Module::SpatialZeroPadding`] |
//! | `nn.Reshape` | [`Module::Reshape`] |
//!
//! Any other class name fails compilation with [`Error::Model`].
//!
//! # Limitations
//!
//! - Forward evaluation mutates the per-module output slots, so a network
//!   serves one caller at a time. Storages are `Rc`-shared, which keeps a
//!   `Network` on the thread that built it.
//! - Shape mismatches between the model and the input panic inside the kernels.

pub mod modules;

use std::rc::Rc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::io::{Object, Table};
use crate::tensors::Tensor;

pub use modules::{
    Dropout, Linear, Reshape, SoftMax, SpatialConvolution, SpatialMaxPooling,
    SpatialZeroPadding, Threshold, View,
};

/// Class name of the only supported container.
pub const SEQUENTIAL: &str = "nn.Sequential";

/// A layer with a persistent output slot.
pub trait Layer {
    /// Computes the layer's output for `input` into its output slot and
    /// returns that slot.
    fn update_output(&mut self, input: &Tensor) -> &Tensor;

    /// The output of the last call to [`Layer::update_output`].
    fn output(&self) -> &Tensor;
}

/// Kernel geometry shared by convolution and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub kw: usize,
    pub kh: usize,
    pub dw: usize,
    pub dh: usize,
    pub pad_w: usize,
    pub pad_h: usize,
}

impl Window {
    /// Reads `kW`, `kH`, `dW`, `dH`, `padW` and `padH` from a module table.
    pub(crate) fn from_table(t: &Table, class: &str) -> Result<Self> {
        let w = Self {
            kw: field(t, class, "kW")?,
            kh: field(t, class, "kH")?,
            dw: field(t, class, "dW")?,
            dh: field(t, class, "dH")?,
            pad_w: field(t, class, "padW")?,
            pad_h: field(t, class, "padH")?,
        };
        if w.kw == 0 || w.kh == 0 || w.dw == 0 || w.dh == 0 {
            return Err(Error::Model(format!(
                "{class}: kernel and stride must be positive, got {w:?}"
            )));
        }
        Ok(w)
    }

    /// Convolution output extent `(in + 2·pad − k) / d + 1`, or `None` when
    /// the kernel does not fit.
    #[must_use]
    pub const fn conv_extent(input: usize, k: usize, d: usize, pad: usize) -> Option<usize> {
        let padded = input + 2 * pad;
        if padded < k || d == 0 {
            None
        } else {
            Some((padded - k) / d + 1)
        }
    }
}

/// Reads a non-negative integer field.
pub(crate) fn field(t: &Table, class: &str, name: &str) -> Result<usize> {
    let v = t.get_int(name);
    usize::try_from(v).map_err(|_| Error::Model(format!("{class}: {name} is negative ({v})")))
}

/// Reads a required tensor field as a float tensor.
pub(crate) fn tensor_field(t: &Table, class: &str, name: &str) -> Result<Tensor> {
    t.get_tensor(name)
        .ok_or_else(|| Error::Model(format!("{class}: missing {name} tensor")))?
        .to_float_tensor()
}

/// Recognized module class names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    SpatialConvolutionMM,
    SpatialConvolution,
    SpatialMaxPooling,
    Linear,
    SoftMax,
    Threshold,
    ReLU,
    View,
    Dropout,
    SpatialZeroPadding,
    Reshape,
}

impl ModuleKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::SpatialConvolutionMM,
        Self::SpatialConvolution,
        Self::SpatialMaxPooling,
        Self::Linear,
        Self::SoftMax,
        Self::Threshold,
        Self::ReLU,
        Self::View,
        Self::Dropout,
        Self::SpatialZeroPadding,
        Self::Reshape,
    ];

    /// The serialized class name.
    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::SpatialConvolutionMM => "nn.SpatialConvolutionMM",
            Self::SpatialConvolution => "nn.SpatialConvolution",
            Self::SpatialMaxPooling => "nn.SpatialMaxPooling",
            Self::Linear => "nn.Linear",
            Self::SoftMax => "nn.SoftMax",
            Self::Threshold => "nn.Threshold",
            Self::ReLU => "nn.ReLU",
            Self::View => "nn.View",
            Self::Dropout => "nn.Dropout",
            Self::SpatialZeroPadding => "nn.SpatialZeroPadding",
            Self::Reshape => "nn.Reshape",
        }
    }

    /// Looks up a class name.
    #[must_use]
    pub fn from_class(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.class_name() == name)
    }
}

/// One compiled layer.
#[derive(Debug)]
pub enum Module {
    SpatialConvolution(SpatialConvolution),
    SpatialMaxPooling(SpatialMaxPooling),
    Linear(Linear),
    SoftMax(SoftMax),
    Threshold(Threshold),
    View(View),
    Dropout(Dropout),
    SpatialZeroPadding(SpatialZeroPadding),
    Reshape(Reshape),
}

impl Module {
    /// Builds a module of `kind` from its field table.
    ///
    /// # Errors
    ///
    /// [`Error::Model`] when a required parameter is missing or invalid.
    pub fn from_fields(kind: ModuleKind, t: &Table) -> Result<Self> {
        let class = kind.class_name();
        Ok(match kind {
            ModuleKind::SpatialConvolutionMM | ModuleKind::SpatialConvolution => {
                Self::SpatialConvolution(SpatialConvolution::from_table(t, class)?)
            }
            ModuleKind::SpatialMaxPooling => {
                Self::SpatialMaxPooling(SpatialMaxPooling::from_table(t, class)?)
            }
            ModuleKind::Linear => Self::Linear(Linear::from_table(t, class)?),
            ModuleKind::SoftMax => Self::SoftMax(SoftMax::default()),
            ModuleKind::Threshold | ModuleKind::ReLU => Self::Threshold(Threshold::from_table(t)),
            ModuleKind::View => Self::View(View::from_table(t, class)?),
            ModuleKind::Dropout => Self::Dropout(Dropout::from_table(t)),
            ModuleKind::SpatialZeroPadding => {
                Self::SpatialZeroPadding(SpatialZeroPadding::from_table(t))
            }
            ModuleKind::Reshape => Self::Reshape(Reshape::from_table(t, class)?),
        })
    }

    /// Short variant name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SpatialConvolution(_) => "SpatialConvolution",
            Self::SpatialMaxPooling(_) => "SpatialMaxPooling",
            Self::Linear(_) => "Linear",
            Self::SoftMax(_) => "SoftMax",
            Self::Threshold(_) => "Threshold",
            Self::View(_) => "View",
            Self::Dropout(_) => "Dropout",
            Self::SpatialZeroPadding(_) => "SpatialZeroPadding",
            Self::Reshape(_) => "Reshape",
        }
    }

    fn layer(&self) -> &dyn Layer {
        match self {
            Self::SpatialConvolution(m) => m,
            Self::SpatialMaxPooling(m) => m,
            Self::Linear(m) => m,
            Self::SoftMax(m) => m,
            Self::Threshold(m) => m,
            Self::View(m) => m,
            Self::Dropout(m) => m,
            Self::SpatialZeroPadding(m) => m,
            Self::Reshape(m) => m,
        }
    }

    fn layer_mut(&mut self) -> &mut dyn Layer {
        match self {
            Self::SpatialConvolution(m) => m,
            Self::SpatialMaxPooling(m) => m,
            Self::Linear(m) => m,
            Self::SoftMax(m) => m,
            Self::Threshold(m) => m,
            Self::View(m) => m,
            Self::Dropout(m) => m,
            Self::SpatialZeroPadding(m) => m,
            Self::Reshape(m) => m,
        }
    }
}

impl Layer for Module {
    fn update_output(&mut self, input: &Tensor) -> &Tensor {
        self.layer_mut().update_output(input)
    }

    fn output(&self) -> &Tensor {
        self.layer().output()
    }
}

/// An ordered list of modules evaluated one after another.
#[derive(Debug, Default)]
pub struct Network {
    modules: Vec<Module>,
}

impl Network {
    /// A network of the given modules.
    #[must_use]
    pub const fn new(modules: Vec<Module>) -> Self {
        Self { modules }
    }

    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut Vec<Module> {
        &mut self.modules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Runs every module in order, feeding each output to the next module.
    ///
    /// The returned tensor views the last module's output slot; the next
    /// call overwrites it.
    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for (i, m) in self.modules.iter_mut().enumerate() {
            x = m.update_output(&x).clone();
            trace!("{} {}: {:?}", i + 1, m.name(), x.sizes());
        }
        x
    }

    /// Rewrites a classifier into a fully convolutional network.
    ///
    /// View and Reshape modules are removed and every Linear module becomes a
    /// convolution whose kernel covers the whole feature map it would see when
    /// the network is fed a `crop × crop` image with `planes` channels.
    ///
    /// # Errors
    ///
    /// [`Error::Model`] when the crop is too small for a layer or a Linear
    /// layer's input width does not match the tracked feature map.
    pub fn make_spatial(&mut self, crop: usize, planes: usize) -> Result<()> {
        let too_small =
            |i: usize| Error::Model(format!("crop size {crop} is too small for module {}", i + 1));

        let before = self.modules.len();
        self.modules
            .retain(|m| !matches!(m, Module::View(_) | Module::Reshape(_)));
        debug!("make_spatial: removed {} view/reshape modules", before - self.modules.len());

        let mut size = crop;
        let mut planes = planes;
        for (i, m) in self.modules.iter_mut().enumerate() {
            match m {
                Module::Linear(l) => {
                    let conv = SpatialConvolution::from_linear(l, planes, size)?;
                    debug!(
                        "make_spatial: module {} Linear -> {}x{} convolution, {} -> {} planes",
                        i + 1,
                        size,
                        size,
                        planes,
                        conv.n_output_plane
                    );
                    planes = conv.n_output_plane;
                    size = 1;
                    *m = Module::SpatialConvolution(conv);
                }
                Module::SpatialConvolution(c) => {
                    let w = c.window;
                    size = Window::conv_extent(size, w.kw, w.dw, w.pad_w).ok_or_else(|| too_small(i))?;
                    planes = c.n_output_plane;
                }
                Module::SpatialMaxPooling(p) => {
                    let w = p.window;
                    size = modules::pooled_extent(size, w.kh, w.dh, w.pad_h, p.ceil_mode)
                        .ok_or_else(|| too_small(i))?;
                }
                Module::SpatialZeroPadding(z) => {
                    let grown = isize::try_from(size).unwrap_or(isize::MAX) + z.pad_l + z.pad_r;
                    size = usize::try_from(grown)
                        .ok()
                        .filter(|&s| s > 0)
                        .ok_or_else(|| too_small(i))?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Compiles a deserialized `nn.Sequential` into a [`Network`].
///
/// # Errors
///
/// - [`Error::WrongObject`] if `root` is not an `nn.Sequential` module with a
///   `modules` table.
/// - [`Error::Model`] for an unknown module class or invalid parameters.
pub fn compile(root: &Object) -> Result<Network> {
    let Some(seq) = root.as_module() else {
        return Err(Error::WrongObject(format!(
            "network root is a {}, expected {SEQUENTIAL}",
            root.type_name()
        )));
    };
    if seq.name() != SEQUENTIAL {
        return Err(Error::WrongObject(format!(
            "network root is {}, expected {SEQUENTIAL}",
            seq.name()
        )));
    }
    let list = seq
        .table()
        .and_then(|t| t.get("modules"))
        .and_then(|o| o.as_table().map(Rc::clone))
        .ok_or_else(|| Error::WrongObject(format!("{SEQUENTIAL} has no modules table")))?;

    let mut entries: Vec<(Option<f64>, Object)> = list
        .records()
        .iter()
        .map(|(k, v)| (k.as_number(), v.clone()))
        .collect();
    if entries.iter().all(|(k, _)| k.is_some()) {
        entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    }

    let mut modules = Vec::with_capacity(entries.len());
    for (i, (_, value)) in entries.iter().enumerate() {
        let Some(child) = value.as_module() else {
            return Err(Error::Model(format!(
                "entry {} of modules is a {}, expected a module",
                i + 1,
                value.type_name()
            )));
        };
        let kind = ModuleKind::from_class(child.name())
            .ok_or_else(|| Error::Model(format!("unknown module type {}", child.name())))?;
        let fields = child.table().map_or_else(Table::new, Rc::clone);
        let module = Module::from_fields(kind, &fields)?;
        debug!("module {}: {} as {}", i + 1, child.name(), module.name());
        modules.push(module);
    }
    Ok(Network { modules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ModuleObject;

    fn module(name: &str, fields: Rc<Table>) -> Object {
        Object::Module(ModuleObject::new(name, fields))
    }

    fn sequential(children: Vec<Object>) -> Object {
        let list = Table::new();
        for (i, c) in children.into_iter().enumerate() {
            list.push(Object::Number((i + 1) as f64), c);
        }
        module(
            SEQUENTIAL,
            Table::from_pairs([("modules", Object::Table(list))]),
        )
    }

    #[test]
    fn class_names_are_unique_and_resolvable() {
        for kind in ModuleKind::ALL {
            assert_eq!(ModuleKind::from_class(kind.class_name()), Some(kind));
        }
        assert_eq!(ModuleKind::from_class("nn.Tanh"), None);
    }

    #[test]
    fn compiles_parameterless_modules() {
        let net = compile(&sequential(vec![
            module("nn.ReLU", Table::new()),
            module("nn.SoftMax", Table::new()),
        ]))
        .unwrap();
        assert_eq!(net.len(), 2);
        assert_eq!(net.modules()[0].name(), "Threshold");
        assert_eq!(net.modules()[1].name(), "SoftMax");
    }

    #[test]
    fn modules_are_ordered_by_numeric_key() {
        let list = Table::new();
        list.push(Object::Number(2.0), module("nn.SoftMax", Table::new()));
        list.push(Object::Number(1.0), module("nn.ReLU", Table::new()));
        let root = module(SEQUENTIAL, Table::from_pairs([("modules", Object::Table(list))]));
        let net = compile(&root).unwrap();
        assert_eq!(net.modules()[0].name(), "Threshold");
    }

    #[test]
    fn unknown_module_fails_compilation() {
        let err = compile(&sequential(vec![module("nn.Tanh", Table::new())])).unwrap_err();
        assert!(matches!(err, Error::Model(ref m) if m.contains("nn.Tanh")));
    }

    #[test]
    fn root_must_be_sequential() {
        let err = compile(&module("nn.Concat", Table::new())).unwrap_err();
        assert!(matches!(err, Error::WrongObject(_)));
        let err = compile(&Object::Number(1.0)).unwrap_err();
        assert!(matches!(err, Error::WrongObject(_)));
        let err = compile(&module(SEQUENTIAL, Table::new())).unwrap_err();
        assert!(matches!(err, Error::WrongObject(_)));
    }

    #[test]
    fn conv_extent_matches_formula() {
        assert_eq!(Window::conv_extent(5, 3, 1, 0), Some(3));
        assert_eq!(Window::conv_extent(5, 3, 2, 1), Some(3));
        assert_eq!(Window::conv_extent(2, 3, 1, 0), None);
    }
}
