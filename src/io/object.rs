//! In-memory object tree produced by the [`Reader`](super::Reader).
//!
//! Tables, storages, tensors and modules are shared through [`Rc`]: a
//! backreference in the stream yields another handle to the same value, so
//! [`Rc::strong_count`] is the object's reference count. Tables may contain
//! themselves; call [`Object::release`] on a root before dropping it to break
//! such cycles.

use std::cell::{OnceCell, Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use briny::prelude::*;

use crate::error::{Error, Result};
use crate::tensors::{MAX_DIMS, Storage, Tensor};

/// Element type of a serialized tensor or storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// `u8`
    Byte,
    /// `i8`
    Char,
    /// `i16`
    Short,
    /// `i32`
    Int,
    /// on-disk width set by [`LongSize`](super::LongSize), `i64` in memory
    Long,
    /// `f32`
    Float,
    /// `f64`
    Double,
}

impl ScalarType {
    /// Parses the type part of a `torch.<Type>Tensor` / `torch.<Type>Storage` class name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Byte" => Self::Byte,
            "Char" => Self::Char,
            "Short" => Self::Short,
            "Int" => Self::Int,
            "Long" => Self::Long,
            "Float" => Self::Float,
            "Double" => Self::Double,
            _ => return None,
        })
    }

    /// The name used in class names.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Byte => "Byte",
            Self::Char => "Char",
            Self::Short => "Short",
            Self::Int => "Int",
            Self::Long => "Long",
            Self::Float => "Float",
            Self::Double => "Double",
        }
    }
}

/// Typed contents of a serialized storage.
///
/// Float data is held as a runtime [`Storage`] so compiled layers can view it
/// without copying.
#[derive(Debug, Clone)]
pub enum StorageData {
    Byte(Vec<u8>),
    Char(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Rc<Storage>),
    Double(Vec<f64>),
}

impl StorageData {
    /// The element type.
    #[must_use]
    pub const fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Byte(_) => ScalarType::Byte,
            Self::Char(_) => ScalarType::Char,
            Self::Short(_) => ScalarType::Short,
            Self::Int(_) => ScalarType::Int,
            Self::Long(_) => ScalarType::Long,
            Self::Float(_) => ScalarType::Float,
            Self::Double(_) => ScalarType::Double,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Byte(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Float(s) => s.len(),
            Self::Double(v) => v.len(),
        }
    }

    /// Whether the storage holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts every element to `f32`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::Byte(v) => v.iter().map(|&x| f32::from(x)).collect(),
            Self::Char(v) => v.iter().map(|&x| f32::from(x)).collect(),
            Self::Short(v) => v.iter().map(|&x| f32::from(x)).collect(),
            Self::Int(v) => v.iter().map(|&x| x as f32).collect(),
            Self::Long(v) => v.iter().map(|&x| x as f32).collect(),
            Self::Float(s) => s.borrow().to_vec(),
            Self::Double(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Integer contents, for the integer element types.
    #[must_use]
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            Self::Byte(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::Char(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::Short(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::Int(v) => Some(v.iter().map(|&x| i64::from(x)).collect()),
            Self::Long(v) => Some(v.clone()),
            Self::Float(_) | Self::Double(_) => None,
        }
    }
}

/// A serialized `torch.*Storage`.
#[derive(Debug, Clone)]
pub struct StorageObject {
    pub data: StorageData,
}

impl StorageObject {
    /// A float storage sharing `storage`.
    #[must_use]
    pub fn float(storage: Rc<Storage>) -> Rc<Self> {
        Rc::new(Self {
            data: StorageData::Float(storage),
        })
    }

    /// A long storage, as used for `nn.Reshape` sizes.
    #[must_use]
    pub fn long(values: Vec<i64>) -> Rc<Self> {
        Rc::new(Self {
            data: StorageData::Long(values),
        })
    }
}

/// A serialized `torch.*Tensor` descriptor.
#[derive(Debug, Clone)]
pub struct TensorObject {
    pub scalar_type: ScalarType,
    pub size: Vec<i64>,
    pub stride: Vec<i64>,
    /// Zero-based storage offset.
    pub offset: i64,
    pub storage: Option<Rc<StorageObject>>,
}

impl Validate for TensorObject {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.size.len() != self.stride.len() {
            return Err(ValidationError);
        }
        if self.size.iter().chain(&self.stride).any(|&v| v < 0) {
            return Err(ValidationError);
        }
        let empty = self.size.is_empty() || self.size.contains(&0);
        let Some(storage) = &self.storage else {
            return if empty { Ok(()) } else { Err(ValidationError) };
        };
        if storage.data.scalar_type() != self.scalar_type || self.offset < 0 {
            return Err(ValidationError);
        }
        if empty {
            return Ok(());
        }
        let extent = self
            .size
            .iter()
            .zip(&self.stride)
            .try_fold(self.offset, |acc, (&s, &st)| {
                (s - 1).checked_mul(st).and_then(|v| acc.checked_add(v))
            })
            .ok_or(ValidationError)?;
        if usize::try_from(extent).map_or(true, |e| e >= storage.data.len()) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

impl TensorObject {
    /// A contiguous float descriptor over a copy of `tensor`'s elements.
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn from_tensor(tensor: &Tensor) -> Rc<Self> {
        let contiguous = Tensor::from_vec(tensor.sizes(), tensor.to_vec());
        Rc::new(Self {
            scalar_type: ScalarType::Float,
            size: contiguous.sizes().iter().map(|&s| s as i64).collect(),
            stride: contiguous.strides().iter().map(|&s| s as i64).collect(),
            offset: 0,
            storage: contiguous.storage().cloned().map(StorageObject::float),
        })
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.size.len()
    }

    /// Builds a runtime `f32` tensor viewing this descriptor.
    ///
    /// Float storages are shared without copying; other element types are
    /// converted into a fresh storage.
    ///
    /// # Errors
    ///
    /// [`Error::Model`] for tensors of more than four dimensions and
    /// [`Error::Corrupted`] when the descriptor does not fit its storage.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn to_float_tensor(&self) -> Result<Tensor> {
        if self.ndim() > MAX_DIMS {
            return Err(Error::Model(format!(
                "{}-dimensional tensors are not supported",
                self.ndim()
            )));
        }
        if self.validate().is_err() {
            return Err(Error::Corrupted("tensor descriptor exceeds its storage".into()));
        }
        let Some(storage) = &self.storage else {
            return Ok(Tensor::new());
        };
        let sizes: Vec<usize> = self.size.iter().map(|&s| s as usize).collect();
        let strides: Vec<usize> = self.stride.iter().map(|&s| s as usize).collect();
        let buffer = match &storage.data {
            StorageData::Float(s) => Rc::clone(s),
            other => Storage::with_buffer(other.to_f32_vec()),
        };
        Ok(Tensor::from_storage(
            buffer,
            self.offset as usize,
            &sizes,
            Some(&strides),
        ))
    }
}

/// An ordered list of `(name, value)` records.
#[derive(Default)]
pub struct Table {
    records: RefCell<Vec<(Object, Object)>>,
}

impl Table {
    /// An empty table.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A table of string-keyed entries.
    #[must_use]
    pub fn from_pairs<I, K>(pairs: I) -> Rc<Self>
    where
        I: IntoIterator<Item = (K, Object)>,
        K: AsRef<str>,
    {
        let t = Self::new();
        for (k, v) in pairs {
            t.push(Object::string(k.as_ref()), v);
        }
        t
    }

    /// Appends a record.
    pub fn push(&self, name: Object, value: Object) {
        self.records.borrow_mut().push((name, value));
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    /// Whether the table has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the records.
    pub fn records(&self) -> Ref<'_, [(Object, Object)]> {
        Ref::map(self.records.borrow(), Vec::as_slice)
    }

    /// The value of the first record whose name is the string `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Object> {
        self.records
            .borrow()
            .iter()
            .find(|(k, _)| k.as_bytes() == Some(name.as_bytes()))
            .map(|(_, v)| v.clone())
    }

    /// A numeric field, `0` when absent or not a number.
    #[must_use]
    pub fn get_number(&self, name: &str) -> f64 {
        self.get(name).and_then(|o| o.as_number()).unwrap_or(0.0)
    }

    /// A numeric field truncated to an integer, `0` when absent.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn get_int(&self, name: &str) -> i64 {
        self.get_number(name) as i64
    }

    /// A boolean field.
    #[must_use]
    pub fn get_flag(&self, name: &str) -> Flag {
        match self.get(name) {
            Some(Object::Boolean(b)) => Flag::from(b),
            _ => Flag::Unset,
        }
    }

    /// A tensor field.
    #[must_use]
    pub fn get_tensor(&self, name: &str) -> Option<Rc<TensorObject>> {
        match self.get(name) {
            Some(Object::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    /// A storage field.
    #[must_use]
    pub fn get_storage(&self, name: &str) -> Option<Rc<StorageObject>> {
        match self.get(name) {
            Some(Object::Storage(s)) => Some(s),
            _ => None,
        }
    }

    fn take_records(&self) -> Vec<(Object, Object)> {
        std::mem::take(&mut *self.records.borrow_mut())
    }
}

/// A serialized `nn.*` module: class name plus its field table.
pub struct ModuleObject {
    name: String,
    table: OnceCell<Rc<Table>>,
}

impl ModuleObject {
    /// A module with the given class name and fields.
    #[must_use]
    pub fn new(name: impl Into<String>, table: Rc<Table>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            table: OnceCell::from(table),
        })
    }

    /// A module whose table is filled in later by the reader.
    pub(crate) fn pending(name: String) -> Rc<Self> {
        Rc::new(Self {
            name,
            table: OnceCell::new(),
        })
    }

    pub(crate) fn attach(&self, table: Rc<Table>) {
        let _ = self.table.set(table);
    }

    /// Full class name, e.g. `nn.Sequential`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field table.
    #[must_use]
    pub fn table(&self) -> Option<&Rc<Table>> {
        self.table.get()
    }
}

/// A boolean module field that may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flag {
    #[default]
    Unset,
    False,
    True,
}

impl From<bool> for Flag {
    fn from(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }
}

impl Flag {
    /// `true` only when explicitly set to true.
    #[must_use]
    pub const fn is_true(self) -> bool {
        matches!(self, Self::True)
    }
}

/// A deserialized value.
#[derive(Clone, Default)]
pub enum Object {
    #[default]
    Nil,
    Number(f64),
    String(Vec<u8>),
    Boolean(bool),
    Table(Rc<Table>),
    Storage(Rc<StorageObject>),
    Tensor(Rc<TensorObject>),
    Module(Rc<ModuleObject>),
}

impl Object {
    /// A string object.
    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::String(s.as_bytes().to_vec())
    }

    /// Short name of the variant, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
            Self::Table(_) => "table",
            Self::Storage(_) => "storage",
            Self::Tensor(_) => "tensor",
            Self::Module(_) => "module",
        }
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_table(&self) -> Option<&Rc<Table>> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Rc<TensorObject>> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_module(&self) -> Option<&Rc<ModuleObject>> {
        match self {
            Self::Module(m) => Some(m),
            _ => None,
        }
    }

    /// Empties every table reachable from this object.
    ///
    /// Shared children are only dropped by this handle; they stay alive while
    /// referenced elsewhere. Reference cycles through tables are broken.
    pub fn release(&self) {
        let mut visited = HashSet::new();
        self.release_inner(&mut visited);
    }

    fn release_inner(&self, visited: &mut HashSet<*const Table>) {
        let table = match self {
            Self::Table(t) => Rc::clone(t),
            Self::Module(m) => match m.table() {
                Some(t) => Rc::clone(t),
                None => return,
            },
            _ => return,
        };
        if !visited.insert(Rc::as_ptr(&table)) {
            return;
        }
        for (k, v) in table.take_records() {
            k.release_inner(visited);
            v.release_inner(visited);
        }
    }

    fn print(
        &self,
        f: &mut fmt::Formatter<'_>,
        indent: usize,
        path: &mut Vec<*const Table>,
    ) -> fmt::Result {
        let pad = "    ".repeat(indent);
        match self {
            Self::Nil => writeln!(f, "{pad}nil"),
            Self::Number(n) => writeln!(f, "{pad}{n:.6}"),
            Self::String(s) => writeln!(f, "{pad}\"{}\"", String::from_utf8_lossy(s)),
            Self::Boolean(b) => writeln!(f, "{pad}{b}"),
            Self::Storage(s) => writeln!(
                f,
                "{pad}{} storage of {} elements",
                s.data.scalar_type().name(),
                s.data.len()
            ),
            Self::Tensor(t) => {
                write!(
                    f,
                    "{pad}{} tensor of dimension {}",
                    t.scalar_type.name(),
                    t.ndim()
                )?;
                if t.ndim() > 0 {
                    let dims: Vec<String> = t.size.iter().map(i64::to_string).collect();
                    write!(f, " ({})", dims.join(","))?;
                }
                writeln!(f)
            }
            Self::Table(t) => {
                writeln!(f, "{pad}Table long {}", t.len())?;
                print_records(t, f, indent, path)
            }
            Self::Module(m) => match m.table() {
                None => writeln!(f, "{pad}nn module {} (not loaded)", m.name()),
                Some(t) => {
                    writeln!(f, "{pad}nn module {} with {} elements", m.name(), t.len())?;
                    print_records(t, f, indent, path)
                }
            },
        }
    }
}

fn print_records(
    table: &Rc<Table>,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
    path: &mut Vec<*const Table>,
) -> fmt::Result {
    let ptr = Rc::as_ptr(table);
    if path.contains(&ptr) {
        return writeln!(f, "{}<cycle>", "    ".repeat(indent + 1));
    }
    path.push(ptr);
    let records = table.records();
    let n = records.len();
    for (i, (k, v)) in records.iter().enumerate() {
        write!(f, "{}{}/{}: ", "    ".repeat(indent), i + 1, n)?;
        k.print(f, 0, path)?;
        v.print(f, indent + 1, path)?;
    }
    path.pop();
    Ok(())
}

impl fmt::Display for Object {
    /// Indented dump of the tree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f, 0, &mut Vec::new())
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "Nil"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({:?})", String::from_utf8_lossy(s)),
            Self::Boolean(b) => write!(f, "Boolean({b})"),
            Self::Table(t) => write!(f, "Table({} records)", t.len()),
            Self::Storage(s) => write!(
                f,
                "Storage({}, {})",
                s.data.scalar_type().name(),
                s.data.len()
            ),
            Self::Tensor(t) => write!(f, "Tensor({}, {:?})", t.scalar_type.name(), t.size),
            Self::Module(m) => write!(f, "Module({})", m.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_tensor(size: &[i64], stride: &[i64], offset: i64, len: usize) -> TensorObject {
        TensorObject {
            scalar_type: ScalarType::Float,
            size: size.to_vec(),
            stride: stride.to_vec(),
            offset,
            storage: Some(StorageObject::float(Storage::from_vec(
                (0..len).map(|x| x as f32).collect(),
            ))),
        }
    }

    #[test]
    fn scalar_names_round_trip() {
        for ty in [
            ScalarType::Byte,
            ScalarType::Char,
            ScalarType::Short,
            ScalarType::Int,
            ScalarType::Long,
            ScalarType::Float,
            ScalarType::Double,
        ] {
            assert_eq!(ScalarType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(ScalarType::from_name("Half"), None);
    }

    #[test]
    fn descriptor_must_fit_storage() {
        assert!(float_tensor(&[2, 3], &[3, 1], 0, 6).validate().is_ok());
        assert!(float_tensor(&[2, 3], &[3, 1], 1, 6).validate().is_err());
        assert!(float_tensor(&[2, 3], &[3, 1], 1, 7).validate().is_ok());
        assert!(float_tensor(&[2], &[-1], 0, 6).validate().is_err());
    }

    #[test]
    fn float_tensor_shares_storage_and_honours_offset() {
        let desc = float_tensor(&[2], &[2], 1, 5);
        let t = desc.to_float_tensor().unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 3.0]);
        let Some(StorageData::Float(s)) = desc.storage.as_ref().map(|s| &s.data) else {
            panic!("expected float storage");
        };
        assert!(Rc::ptr_eq(s, t.storage().unwrap()));
    }

    #[test]
    fn integer_tensor_is_converted() {
        let desc = TensorObject {
            scalar_type: ScalarType::Byte,
            size: vec![3],
            stride: vec![1],
            offset: 0,
            storage: Some(Rc::new(StorageObject {
                data: StorageData::Byte(vec![0, 128, 255]),
            })),
        };
        assert_eq!(desc.to_float_tensor().unwrap().to_vec(), vec![0.0, 128.0, 255.0]);
    }

    #[test]
    fn table_getters_default_when_missing() {
        let t = Table::from_pairs([
            ("kW", Object::Number(3.0)),
            ("inplace", Object::Boolean(true)),
        ]);
        assert_eq!(t.get_int("kW"), 3);
        assert_eq!(t.get_number("padW"), 0.0);
        assert_eq!(t.get_flag("inplace"), Flag::True);
        assert_eq!(t.get_flag("v2"), Flag::Unset);
        assert!(t.get_tensor("weight").is_none());
    }

    #[test]
    fn release_breaks_self_reference() {
        let t = Table::new();
        t.push(Object::string("self"), Object::Table(Rc::clone(&t)));
        assert_eq!(Rc::strong_count(&t), 2);
        Object::Table(Rc::clone(&t)).release();
        assert_eq!(Rc::strong_count(&t), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn printer_describes_modules_and_cycles() {
        let fields = Table::from_pairs([("weight", Object::Tensor(TensorObject::from_tensor(
            &Tensor::zeros(&[3, 4]),
        )))]);
        fields.push(Object::string("me"), Object::Table(Rc::clone(&fields)));
        let m = Object::Module(ModuleObject::new("nn.Linear", Rc::clone(&fields)));
        let text = m.to_string();
        assert!(text.starts_with("nn module nn.Linear with 2 elements"));
        assert!(text.contains("Float tensor of dimension 2 (3,4)"));
        assert!(text.contains("<cycle>"));
        m.release();
    }
}
