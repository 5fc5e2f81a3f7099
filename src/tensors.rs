//! Core tensor data structures.
//!
//! # Storage and views
//!
//! A [`Storage`] is a flat, reference-counted `f32` buffer. A [`Tensor`] is a
//! view of at most four dimensions over a storage: sizes, strides (in
//! elements) and a storage offset. Several tensors may view the same storage;
//! a write through one view is visible through every other view of it. Layers
//! rely on this to reshape without copying.
//!
//! - Cloning a `Tensor` creates another view of the same storage (the storage
//!   refcount goes up by one). Dropping a view releases it.
//! - `resize*` recompute row-major strides and only allocate when the tensor
//!   has no storage yet or the storage is too small for the new extent.
//! - `set`, `new_select`, `new_transpose` and the `new_with_storage*`
//!   constructors never move element data. `resize_as` and `copy_from` may.
//!
//! A storage built by [`Storage::with_buffer`] is *foreign*: it wraps a buffer
//! handed over by someone else (a deserialized storage, caller input). The
//! runtime never reallocates a foreign buffer; a tensor that needs more room
//! than a foreign storage offers gets a fresh owned storage instead.
//!
//! ## Example
//!
//! ```rust
//! use thnets::tensors::Tensor;
//! let t = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! let row = t.new_select(0, 1);
//! assert_eq!(row.to_vec(), vec![4.0, 5.0, 6.0]);
//! ```

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// Maximum rank of a runtime tensor.
pub const MAX_DIMS: usize = 4;

/// A reference-counted flat `f32` buffer.
pub struct Storage {
    data: RefCell<Vec<f32>>,
    foreign: bool,
}

impl Storage {
    /// Allocates a zero-filled owned storage of `len` elements.
    #[must_use]
    pub fn new(len: usize) -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(vec![0.0; len]),
            foreign: false,
        })
    }

    /// Takes ownership of `data` as an owned storage.
    #[must_use]
    pub fn from_vec(data: Vec<f32>) -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(data),
            foreign: false,
        })
    }

    /// Wraps a buffer that belongs to someone else.
    ///
    /// The buffer is never reallocated by tensor operations.
    #[must_use]
    pub fn with_buffer(data: Vec<f32>) -> Rc<Self> {
        Rc::new(Self {
            data: RefCell::new(data),
            foreign: true,
        })
    }

    /// Number of elements in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer was supplied from outside the runtime.
    #[must_use]
    pub const fn is_foreign(&self) -> bool {
        self.foreign
    }

    /// Current reference count of a shared storage.
    #[must_use]
    pub fn refcount(this: &Rc<Self>) -> usize {
        Rc::strong_count(this)
    }

    /// Borrows the whole buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, [f32]> {
        Ref::map(self.data.borrow(), Vec::as_slice)
    }

    /// Mutably borrows the whole buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is borrowed elsewhere.
    pub fn borrow_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.data.borrow_mut(), Vec::as_mut_slice)
    }

    /// Grows an owned buffer to at least `len` elements, zero-filling the tail.
    fn grow(&self, len: usize) {
        let mut data = self.data.borrow_mut();
        if data.len() < len {
            data.resize(len, 0.0);
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.len())
            .field("foreign", &self.foreign)
            .finish()
    }
}

/// A strided view of up to [`MAX_DIMS`] dimensions over a [`Storage`].
#[derive(Clone, Default)]
pub struct Tensor {
    size: [usize; MAX_DIMS],
    stride: [usize; MAX_DIMS],
    ndim: usize,
    storage: Option<Rc<Storage>>,
    offset: usize,
}

fn contiguous_strides(sizes: &[usize]) -> [usize; MAX_DIMS] {
    let mut stride = [0; MAX_DIMS];
    let mut acc = 1;
    for d in (0..sizes.len()).rev() {
        stride[d] = acc;
        acc *= sizes[d];
    }
    stride
}

fn check_rank(n: usize) {
    assert!(
        n <= MAX_DIMS,
        "tensors have at most {MAX_DIMS} dimensions, got {n}"
    );
}

impl Tensor {
    /// An empty 0-dimensional tensor without storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero-filled contiguous tensor of the given sizes.
    #[must_use]
    pub fn zeros(sizes: &[usize]) -> Self {
        let mut t = Self::new();
        t.resize(sizes);
        t
    }

    /// Creates a contiguous tensor owning `data`.
    ///
    /// # Panics
    ///
    /// Panics if the number of elements in `data` does not match the shape product.
    #[must_use]
    pub fn from_vec(sizes: &[usize], data: Vec<f32>) -> Self {
        check_rank(sizes.len());
        assert_eq!(
            sizes.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            sizes,
            data.len()
        );
        Self::from_storage(Storage::from_vec(data), 0, sizes, None)
    }

    /// Builds a view over an existing storage.
    ///
    /// `strides` defaults to the contiguous row-major layout.
    ///
    /// # Panics
    ///
    /// Panics if the view reaches past the end of the storage.
    #[must_use]
    pub fn from_storage(
        storage: Rc<Storage>,
        offset: usize,
        sizes: &[usize],
        strides: Option<&[usize]>,
    ) -> Self {
        check_rank(sizes.len());
        let mut size = [0; MAX_DIMS];
        size[..sizes.len()].copy_from_slice(sizes);
        let stride = match strides {
            Some(s) => {
                assert_eq!(s.len(), sizes.len(), "sizes and strides differ in rank");
                let mut stride = [0; MAX_DIMS];
                stride[..s.len()].copy_from_slice(s);
                stride
            }
            None => contiguous_strides(sizes),
        };
        let t = Self {
            size,
            stride,
            ndim: sizes.len(),
            storage: Some(storage),
            offset,
        };
        let len = t.storage.as_ref().map_or(0, |s| s.len());
        assert!(
            offset + t.span() <= len,
            "view of {} elements at offset {} exceeds storage of {}",
            t.span(),
            offset,
            len
        );
        t
    }

    /// A 1-D view over `storage`; a stride of `-1` means contiguous.
    #[must_use]
    pub fn new_with_storage_1d(
        storage: Rc<Storage>,
        offset: usize,
        size0: usize,
        stride0: isize,
    ) -> Self {
        let stride0 = if stride0 == -1 { 1 } else { stride0.unsigned_abs() };
        Self::from_storage(storage, offset, &[size0], Some(&[stride0]))
    }

    /// A 2-D view over `storage`; a stride of `-1` means contiguous.
    #[must_use]
    pub fn new_with_storage_2d(
        storage: Rc<Storage>,
        offset: usize,
        size0: usize,
        stride0: isize,
        size1: usize,
        stride1: isize,
    ) -> Self {
        let stride0 = if stride0 == -1 { size1 } else { stride0.unsigned_abs() };
        let stride1 = if stride1 == -1 { 1 } else { stride1.unsigned_abs() };
        Self::from_storage(storage, offset, &[size0, size1], Some(&[stride0, stride1]))
    }

    /// Number of dimensions.
    #[must_use]
    pub const fn ndim(&self) -> usize {
        self.ndim
    }

    /// Size of dimension `dim`.
    #[must_use]
    pub fn size(&self, dim: usize) -> usize {
        assert!(dim < self.ndim, "dimension {dim} out of range for {}D tensor", self.ndim);
        self.size[dim]
    }

    /// Stride of dimension `dim`, in elements.
    #[must_use]
    pub fn stride(&self, dim: usize) -> usize {
        assert!(dim < self.ndim, "dimension {dim} out of range for {}D tensor", self.ndim);
        self.stride[dim]
    }

    /// All sizes.
    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.size[..self.ndim]
    }

    /// All strides.
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.stride[..self.ndim]
    }

    /// Offset of the first element inside the storage.
    #[must_use]
    pub const fn storage_offset(&self) -> usize {
        self.offset
    }

    /// The viewed storage, if any.
    #[must_use]
    pub const fn storage(&self) -> Option<&Rc<Storage>> {
        self.storage.as_ref()
    }

    /// Product of the sizes; `0` for a 0-dimensional tensor.
    #[must_use]
    pub fn n_element(&self) -> usize {
        if self.ndim == 0 {
            0
        } else {
            self.sizes().iter().product()
        }
    }

    /// Number of storage elements between the first and one past the last viewed element.
    #[must_use]
    pub fn span(&self) -> usize {
        if self.n_element() == 0 {
            return 0;
        }
        1 + self
            .sizes()
            .iter()
            .zip(self.strides())
            .map(|(&s, &st)| (s - 1) * st)
            .sum::<usize>()
    }

    /// Whether the view is dense and row-major.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(self.sizes());
        self.sizes()
            .iter()
            .zip(self.strides().iter().zip(&expected))
            .all(|(&s, (&st, &e))| s == 1 || st == e)
    }

    /// Whether both tensors view the same storage.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        match (&self.storage, &other.storage) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn same_view(&self, other: &Self) -> bool {
        self.ndim == other.ndim
            && self.offset == other.offset
            && self.sizes() == other.sizes()
            && self.strides() == other.strides()
            && match (&self.storage, &other.storage) {
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }

    /// Makes sure the storage holds at least `offset + len` elements.
    fn ensure_storage(&mut self, len: usize) {
        match &self.storage {
            None => {
                self.storage = Some(Storage::new(len));
                self.offset = 0;
            }
            Some(s) if s.len() >= self.offset + len => {}
            Some(s) if !s.is_foreign() => s.grow(self.offset + len),
            Some(_) => {
                self.storage = Some(Storage::new(len));
                self.offset = 0;
            }
        }
    }

    /// Reshapes to `sizes` with row-major strides, allocating only when needed.
    pub fn resize(&mut self, sizes: &[usize]) {
        check_rank(sizes.len());
        self.ndim = sizes.len();
        self.size = [0; MAX_DIMS];
        self.size[..sizes.len()].copy_from_slice(sizes);
        self.stride = contiguous_strides(sizes);
        self.ensure_storage(sizes.iter().product());
    }

    /// `resize(&[size0])`.
    pub fn resize_1d(&mut self, size0: usize) {
        self.resize(&[size0]);
    }

    /// `resize(&[size0, size1])`.
    pub fn resize_2d(&mut self, size0: usize, size1: usize) {
        self.resize(&[size0, size1]);
    }

    /// `resize(&[size0, size1, size2])`.
    pub fn resize_3d(&mut self, size0: usize, size1: usize, size2: usize) {
        self.resize(&[size0, size1, size2]);
    }

    /// `resize(&[size0, size1, size2, size3])`.
    pub fn resize_4d(&mut self, size0: usize, size1: usize, size2: usize, size3: usize) {
        self.resize(&[size0, size1, size2, size3]);
    }

    /// Takes the shape of `src`, reallocating only when the element count grows.
    ///
    /// Resizing a tensor as itself is a no-op.
    pub fn resize_as(&mut self, src: &Self) {
        if self.same_view(src) {
            return;
        }
        self.resize(&src.size[..src.ndim]);
    }

    /// Turns this tensor into another view of `src`'s storage.
    ///
    /// The old storage is released, `src`'s storage is retained.
    pub fn set(&mut self, src: &Self) {
        if self.same_view(src) {
            return;
        }
        *self = src.clone();
    }

    /// A view of slice `index` along `dim`, one dimension smaller.
    ///
    /// # Panics
    ///
    /// Panics if `dim` or `index` is out of range.
    #[must_use]
    pub fn new_select(&self, dim: usize, index: usize) -> Self {
        assert!(dim < self.ndim, "select dimension {dim} out of range");
        assert!(index < self.size[dim], "select index {index} out of range");
        let mut t = Self {
            size: [0; MAX_DIMS],
            stride: [0; MAX_DIMS],
            ndim: self.ndim - 1,
            storage: self.storage.clone(),
            offset: self.offset + index * self.stride[dim],
        };
        let mut j = 0;
        for d in 0..self.ndim {
            if d != dim {
                t.size[j] = self.size[d];
                t.stride[j] = self.stride[d];
                j += 1;
            }
        }
        t
    }

    /// A contiguous view of `sizes` starting `offset` elements past this
    /// tensor's first element, over the same storage.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has no storage or the view does not fit it.
    #[must_use]
    pub fn sub_view(&self, offset: usize, sizes: &[usize]) -> Self {
        let Some(storage) = &self.storage else {
            panic!("tensor has no storage");
        };
        Self::from_storage(Rc::clone(storage), self.offset + offset, sizes, None)
    }

    /// Swaps two dimensions in place, without moving data.
    pub fn transpose(&mut self, dim1: usize, dim2: usize) {
        assert!(
            dim1 < self.ndim && dim2 < self.ndim,
            "transpose dimensions out of range"
        );
        self.size.swap(dim1, dim2);
        self.stride.swap(dim1, dim2);
    }

    /// A transposed view sharing this tensor's storage.
    #[must_use]
    pub fn new_transpose(&self, dim1: usize, dim2: usize) -> Self {
        let mut t = self.clone();
        t.transpose(dim1, dim2);
        t
    }

    /// Borrows the viewed part of the storage, starting at the storage offset.
    ///
    /// Indexing into the slice must go through [`Tensor::strides`] unless the
    /// tensor is contiguous.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has no storage or the storage is mutably borrowed.
    pub fn data(&self) -> Ref<'_, [f32]> {
        let Some(storage) = &self.storage else {
            panic!("tensor has no storage");
        };
        let (start, end) = (self.offset, self.offset + self.span());
        Ref::map(storage.borrow(), |d| &d[start..end])
    }

    /// Mutably borrows the viewed part of the storage.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has no storage or the storage is borrowed elsewhere.
    pub fn data_mut(&self) -> RefMut<'_, [f32]> {
        let Some(storage) = &self.storage else {
            panic!("tensor has no storage");
        };
        let (start, end) = (self.offset, self.offset + self.span());
        RefMut::map(storage.borrow_mut(), |d| &mut d[start..end])
    }

    fn linear_index(&self, mut flat: usize) -> usize {
        let mut idx = 0;
        for d in (0..self.ndim).rev() {
            idx += (flat % self.size[d]) * self.stride[d];
            flat /= self.size[d];
        }
        idx
    }

    /// Reads one element.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> f32 {
        assert_eq!(index.len(), self.ndim, "index rank mismatch");
        let pos = index
            .iter()
            .zip(self.sizes().iter().zip(self.strides()))
            .map(|(&i, (&s, &st))| {
                assert!(i < s, "index {i} out of range for size {s}");
                i * st
            })
            .sum::<usize>();
        self.data()[pos]
    }

    /// Copies the elements out in logical row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        let n = self.n_element();
        if n == 0 {
            return Vec::new();
        }
        let data = self.data();
        if self.is_contiguous() {
            return data[..n].to_vec();
        }
        (0..n).map(|i| data[self.linear_index(i)]).collect()
    }

    /// Returns `self` if already contiguous, otherwise a packed copy.
    #[must_use]
    pub fn contiguous(&self) -> Self {
        if self.is_contiguous() {
            self.clone()
        } else {
            Self::from_vec(self.sizes(), self.to_vec())
        }
    }

    /// Sets every viewed element to zero.
    pub fn zero(&self) {
        self.fill(0.0);
    }

    /// Sets every viewed element to `value`.
    pub fn fill(&self, value: f32) {
        let n = self.n_element();
        if n == 0 {
            return;
        }
        if self.is_contiguous() {
            self.data_mut()[..n].fill(value);
        } else {
            let mut data = self.data_mut();
            for i in 0..n {
                data[self.linear_index(i)] = value;
            }
        }
    }

    /// Copies the elements of `src` into this tensor, in logical order.
    ///
    /// # Panics
    ///
    /// Panics if the element counts differ.
    pub fn copy_from(&self, src: &Self) {
        let n = self.n_element();
        assert_eq!(n, src.n_element(), "copy: element count mismatch");
        if n == 0 {
            return;
        }
        let values = src.to_vec();
        if self.is_contiguous() {
            self.data_mut()[..n].copy_from_slice(&values);
        } else {
            let mut data = self.data_mut();
            for (i, v) in values.into_iter().enumerate() {
                data[self.linear_index(i)] = v;
            }
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("size", &self.sizes())
            .field("stride", &self.strides())
            .field("offset", &self.offset)
            .field("storage", &self.storage)
            .finish()
    }
}

impl PartialEq for Tensor {
    /// Tensors compare by shape and element values, not by storage identity.
    fn eq(&self, other: &Self) -> bool {
        self.sizes() == other.sizes() && self.to_vec() == other.to_vec()
    }
}

/// Defines a contiguous tensor from nested literal arrays.
///
/// Supports up to four levels of nesting as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use thnets::tensor;
/// let t = tensor!([[1.0, -2.0], [3.0, 4.0]]);
/// assert_eq!(t.sizes(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ([ $( $inner:tt )* ]) => {{
        let (shape, data) = $crate::__tensor_parts!([ $( $inner )* ]);
        $crate::tensors::Tensor::from_vec(&shape, data)
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __tensor_parts {
    ([ $( [ $( $inner:tt )* ] ),+ $(,)? ]) => {{
        let children: ::std::vec::Vec<(::std::vec::Vec<usize>, ::std::vec::Vec<f32>)> =
            ::std::vec![ $( $crate::__tensor_parts!([ $( $inner )* ]) ),+ ];
        let first_shape = children[0].0.clone();
        assert!(
            children.iter().all(|c| c.0 == first_shape),
            "ragged tensor literal (rows have mismatched shapes)"
        );
        let mut shape = ::std::vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = ::std::vec::Vec::new();
        for (_, d) in children {
            data.extend(d);
        }
        (shape, data)
    }};
    ([ $( $x:expr ),+ $(,)? ]) => {{
        let data: ::std::vec::Vec<f32> = ::std::vec![ $( $x as f32 ),+ ];
        (::std::vec![data.len()], data)
    }};
}
