//! Backreference-resolving parser for the binary object format.

use std::io::{self, Read};
use std::rc::Rc;

use briny::prelude::*;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::trace;

use super::object::{ModuleObject, Object, ScalarType, StorageData, StorageObject, Table, TensorObject};
use super::{LongSize, ReaderOptions, tag};
use crate::error::{Error, Result};
use crate::tensors::Storage;

/// Reads one object tree from a byte stream.
///
/// Every table and torch record is registered under the next index (starting
/// at 1) before its body is read, so a record can refer to itself.
pub struct Reader<R> {
    inner: R,
    options: ReaderOptions,
    refs: Vec<Option<Object>>,
}

fn count(v: i64, what: &str) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::Corrupted(format!("negative {what} {v}")))
}

impl<R: Read> Reader<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R, options: ReaderOptions) -> Self {
        Self {
            inner,
            options,
            refs: vec![None],
        }
    }

    /// Reads the next object.
    ///
    /// On failure every object built so far is released before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// [`Error::ReadFile`] on short reads, [`Error::Corrupted`] on malformed
    /// input and [`Error::NotImplemented`] on unsupported records.
    pub fn read_object(&mut self) -> Result<Object> {
        let result = self.read_any();
        if result.is_err() {
            for obj in self.refs.drain(1..).flatten() {
                obj.release();
            }
        }
        result
    }

    fn next_index(&self) -> i32 {
        i32::try_from(self.refs.len()).unwrap_or(i32::MAX)
    }

    fn lookup(&self, idx: i32) -> Result<Object> {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.refs.get(i))
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| Error::Corrupted(format!("dangling backreference {idx}")))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32::<LittleEndian>()?)
    }

    fn read_long(&mut self) -> Result<i64> {
        Ok(match self.options.long_size {
            LongSize::Four => i64::from(self.inner.read_i32::<LittleEndian>()?),
            LongSize::Eight => self.inner.read_i64::<LittleEndian>()?,
        })
    }

    /// Reads `n` elements of `width` bytes each.
    ///
    /// The buffer grows with the bytes actually read, so a declared size larger
    /// than the stream fails with a short read instead of allocating it up front.
    fn read_elements(&mut self, n: usize, width: usize) -> Result<Vec<u8>> {
        let len = n
            .checked_mul(width)
            .ok_or_else(|| Error::Corrupted(format!("{n} elements overflow the address space")))?;
        let mut buf = Vec::new();
        (&mut self.inner)
            .take(u64::try_from(len).unwrap_or(u64::MAX))
            .read_to_end(&mut buf)?;
        if buf.len() < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(buf)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        self.read_elements(count(i64::from(len), "string length")?, 1)
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|_| Error::Corrupted("class name is not valid UTF-8".into()))
    }

    fn read_any(&mut self) -> Result<Object> {
        match self.read_i32()? {
            tag::NIL => Ok(Object::Nil),
            tag::NUMBER => Ok(Object::Number(self.inner.read_f64::<LittleEndian>()?)),
            tag::STRING => Ok(Object::String(self.read_bytes()?)),
            tag::TABLE => self.read_table(),
            tag::TORCH => self.read_torch(),
            tag::BOOLEAN => Ok(Object::Boolean(self.read_i32()? != 0)),
            tag::FUNCTION | tag::LEGACY_RECUR_FUNCTION | tag::RECUR_FUNCTION => Err(
                Error::NotImplemented("serialized functions are not supported".into()),
            ),
            other => Err(Error::Corrupted(format!("unknown type tag {other}"))),
        }
    }

    fn read_table(&mut self) -> Result<Object> {
        let idx = self.read_i32()?;
        if idx != self.next_index() {
            return match self.lookup(idx)? {
                obj @ Object::Table(_) => Ok(obj),
                other => Err(Error::Corrupted(format!(
                    "backreference {idx} is a {}, expected a table",
                    other.type_name()
                ))),
            };
        }
        let table = Table::new();
        self.refs.push(Some(Object::Table(Rc::clone(&table))));
        let n = self.read_i32()?;
        let n = count(i64::from(n), "table size")?;
        for _ in 0..n {
            let name = self.read_any()?;
            let value = self.read_any()?;
            table.push(name, value);
        }
        Ok(Object::Table(table))
    }

    fn read_torch(&mut self) -> Result<Object> {
        let idx = self.read_i32()?;
        if idx != self.next_index() {
            return match self.lookup(idx)? {
                obj @ (Object::Storage(_) | Object::Tensor(_) | Object::Module(_)) => Ok(obj),
                other => Err(Error::Corrupted(format!(
                    "backreference {idx} is a {}, expected a torch object",
                    other.type_name()
                ))),
            };
        }
        let slot = self.refs.len();
        self.refs.push(None);

        let mut class = self.read_string()?;
        if class.starts_with("V ") {
            class = self.read_string()?;
        }
        trace!("record {idx}: {class}");

        let obj = if let Some(ty) = class
            .strip_prefix("torch.")
            .and_then(|c| c.strip_suffix("Tensor"))
        {
            let ty = Self::scalar_type(ty)?;
            Object::Tensor(Rc::new(self.read_tensor(ty)?))
        } else if let Some(ty) = class
            .strip_prefix("torch.")
            .and_then(|c| c.strip_suffix("Storage"))
        {
            let ty = Self::scalar_type(ty)?;
            Object::Storage(Rc::new(self.read_storage(ty)?))
        } else if class.starts_with("nn.") {
            let module = ModuleObject::pending(class);
            self.refs[slot] = Some(Object::Module(Rc::clone(&module)));
            match self.read_any()? {
                Object::Table(t) => module.attach(t),
                other => {
                    return Err(Error::Corrupted(format!(
                        "module {} holds a {}, expected a table",
                        module.name(),
                        other.type_name()
                    )));
                }
            }
            Object::Module(module)
        } else {
            return Err(Error::NotImplemented(format!("unsupported class {class}")));
        };
        self.refs[slot] = Some(obj.clone());
        Ok(obj)
    }

    fn scalar_type(name: &str) -> Result<ScalarType> {
        ScalarType::from_name(name)
            .ok_or_else(|| Error::Corrupted(format!("unknown scalar type {name:?}")))
    }

    fn read_storage(&mut self, ty: ScalarType) -> Result<StorageObject> {
        let n = self.read_long()?;
        let n = count(n, "storage size")?;
        let data = match ty {
            ScalarType::Byte => StorageData::Byte(self.read_elements(n, 1)?),
            ScalarType::Char => StorageData::Char(
                self.read_elements(n, 1)?
                    .into_iter()
                    .map(|b| i8::from_le_bytes([b]))
                    .collect(),
            ),
            ScalarType::Short => {
                let raw = self.read_elements(n, 2)?;
                let mut v = vec![0; n];
                LittleEndian::read_i16_into(&raw, &mut v);
                StorageData::Short(v)
            }
            ScalarType::Int => {
                let raw = self.read_elements(n, 4)?;
                let mut v = vec![0; n];
                LittleEndian::read_i32_into(&raw, &mut v);
                StorageData::Int(v)
            }
            ScalarType::Long => match self.options.long_size {
                LongSize::Eight => {
                    let raw = self.read_elements(n, 8)?;
                    let mut v = vec![0; n];
                    LittleEndian::read_i64_into(&raw, &mut v);
                    StorageData::Long(v)
                }
                LongSize::Four => {
                    let raw = self.read_elements(n, 4)?;
                    let mut scratch = vec![0; n];
                    LittleEndian::read_i32_into(&raw, &mut scratch);
                    StorageData::Long(scratch.into_iter().map(i64::from).collect())
                }
            },
            ScalarType::Float => {
                let raw = self.read_elements(n, 4)?;
                let mut v = vec![0.0; n];
                LittleEndian::read_f32_into(&raw, &mut v);
                StorageData::Float(Storage::with_buffer(v))
            }
            ScalarType::Double => {
                let raw = self.read_elements(n, 8)?;
                let mut v = vec![0.0; n];
                LittleEndian::read_f64_into(&raw, &mut v);
                StorageData::Double(v)
            }
        };
        Ok(StorageObject { data })
    }

    fn read_tensor(&mut self, ty: ScalarType) -> Result<TensorObject> {
        let ndim = self.read_i32()?;
        let ndim = count(i64::from(ndim), "dimension count")?;
        let size = (0..ndim).map(|_| self.read_long()).collect::<Result<Vec<_>>>()?;
        let stride = (0..ndim).map(|_| self.read_long()).collect::<Result<Vec<_>>>()?;
        let offset = self
            .read_long()?
            .checked_sub(1)
            .ok_or_else(|| Error::Corrupted("tensor storage offset out of range".into()))?;
        let storage = match self.read_any()? {
            Object::Storage(s) => Some(s),
            Object::Nil => None,
            other => {
                return Err(Error::Corrupted(format!(
                    "tensor refers to a {}, expected a storage",
                    other.type_name()
                )));
            }
        };
        let desc = TensorObject {
            scalar_type: ty,
            size,
            stride,
            offset,
            storage,
        };
        let trusted = TrustedData::new(desc)
            .map_err(|_| Error::Corrupted("tensor descriptor exceeds its storage".into()))?;
        Ok(trusted.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use byteorder::WriteBytesExt;

    fn parse(bytes: &[u8]) -> Result<Object> {
        Reader::new(bytes, ReaderOptions::default()).read_object()
    }

    fn put_i32(buf: &mut Vec<u8>, v: i32) {
        buf.write_i32::<LittleEndian>(v).unwrap();
    }

    fn put_str(buf: &mut Vec<u8>, s: &str) {
        put_i32(buf, s.len() as i32);
        buf.extend_from_slice(s.as_bytes());
    }

    #[test]
    fn reads_number_and_string() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::NUMBER);
        buf.write_f64::<LittleEndian>(2.5).unwrap();
        assert_eq!(parse(&buf).unwrap().as_number(), Some(2.5));

        let mut buf = Vec::new();
        put_i32(&mut buf, tag::STRING);
        put_str(&mut buf, "padW");
        assert_eq!(parse(&buf).unwrap().as_bytes(), Some(&b"padW"[..]));
    }

    #[test]
    fn self_referencing_table_resolves() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TABLE);
        put_i32(&mut buf, 1);
        put_i32(&mut buf, 1);
        put_i32(&mut buf, tag::STRING);
        put_str(&mut buf, "me");
        put_i32(&mut buf, tag::TABLE);
        put_i32(&mut buf, 1);
        let obj = parse(&buf).unwrap();
        let t = obj.as_table().unwrap();
        let inner = t.get("me").unwrap();
        assert!(Rc::ptr_eq(t, inner.as_table().unwrap()));
        drop(inner);
        obj.release();
    }

    #[test]
    fn dangling_backreference_is_corruption() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TABLE);
        put_i32(&mut buf, 7);
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut buf = Vec::new();
        put_i32(&mut buf, 42);
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn functions_are_not_implemented() {
        for t in [tag::FUNCTION, tag::LEGACY_RECUR_FUNCTION, tag::RECUR_FUNCTION] {
            let mut buf = Vec::new();
            put_i32(&mut buf, t);
            assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::NotImplemented);
        }
    }

    #[test]
    fn unknown_class_is_not_implemented() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "image.Thing");
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::NotImplemented);
    }

    #[test]
    fn unknown_scalar_type_is_corruption() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "torch.HalfStorage");
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn short_read_in_table_is_read_error() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TABLE);
        put_i32(&mut buf, 1);
        put_i32(&mut buf, 3);
        put_i32(&mut buf, tag::NIL);
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::ReadFile);
    }

    #[test]
    fn four_byte_longs_are_sign_extended() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "torch.LongStorage");
        put_i32(&mut buf, 2);
        put_i32(&mut buf, -3);
        put_i32(&mut buf, 9);
        let options = ReaderOptions {
            long_size: LongSize::Four,
        };
        let obj = Reader::new(&buf[..], options).read_object().unwrap();
        let Object::Storage(s) = obj else {
            panic!("expected storage, got {obj:?}");
        };
        assert_eq!(s.data.to_i64_vec(), Some(vec![-3, 9]));
    }

    #[test]
    fn class_without_version_header() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "torch.ByteStorage");
        buf.write_i64::<LittleEndian>(2).unwrap();
        buf.extend_from_slice(&[7, 8]);
        let obj = parse(&buf).unwrap();
        let Object::Storage(s) = obj else {
            panic!("expected storage");
        };
        assert_eq!(s.data.to_i64_vec(), Some(vec![7, 8]));
    }

    fn float_tensor_header(buf: &mut Vec<u8>, offset: i64) {
        put_i32(buf, tag::TORCH);
        put_i32(buf, 1);
        put_str(buf, "V 1");
        put_str(buf, "torch.FloatTensor");
        put_i32(buf, 0);
        buf.write_i64::<LittleEndian>(offset).unwrap();
    }

    #[test]
    fn out_of_range_tensor_offset_is_corruption() {
        let mut buf = Vec::new();
        float_tensor_header(&mut buf, i64::MIN);
        put_i32(&mut buf, tag::NIL);
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn empty_tensor_without_storage() {
        let mut buf = Vec::new();
        float_tensor_header(&mut buf, 1);
        put_i32(&mut buf, tag::NIL);
        let Object::Tensor(t) = parse(&buf).unwrap() else {
            panic!("expected tensor");
        };
        assert_eq!(t.offset, 0);
        assert!(t.storage.is_none());
    }

    #[test]
    fn oversized_storage_fails_as_short_read() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "torch.ByteStorage");
        buf.write_i64::<LittleEndian>(1 << 33).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::ReadFile);
    }

    #[test]
    fn storage_size_overflow_is_corruption() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "torch.DoubleStorage");
        buf.write_i64::<LittleEndian>(i64::MAX).unwrap();
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn typed_storages_decode_little_endian() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "torch.ShortStorage");
        buf.write_i64::<LittleEndian>(2).unwrap();
        buf.write_i16::<LittleEndian>(-2).unwrap();
        buf.write_i16::<LittleEndian>(300).unwrap();
        let Object::Storage(s) = parse(&buf).unwrap() else {
            panic!("expected storage");
        };
        assert_eq!(s.data.to_i64_vec(), Some(vec![-2, 300]));
    }

    #[test]
    fn module_must_hold_a_table() {
        let mut buf = Vec::new();
        put_i32(&mut buf, tag::TORCH);
        put_i32(&mut buf, 1);
        put_str(&mut buf, "V 1");
        put_str(&mut buf, "nn.ReLU");
        put_i32(&mut buf, tag::NUMBER);
        buf.write_f64::<LittleEndian>(1.0).unwrap();
        assert_eq!(parse(&buf).unwrap_err().kind(), ErrorKind::Corrupted);
    }
}
