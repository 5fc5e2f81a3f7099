//! Serializer emitting backreferences for shared objects.

use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use byteorder::{LittleEndian, WriteBytesExt};

use super::object::{ModuleObject, Object, StorageData, StorageObject, Table, TensorObject};
use super::{LongSize, WriterOptions, tag};
use crate::error::{Error, Result};

const VERSION: &str = "V 1";

/// Writes object trees in the format understood by [`Reader`](super::Reader).
///
/// An object written twice through the same `Writer` (same `Rc`) is emitted as
/// a backreference the second time.
pub struct Writer<W> {
    inner: W,
    options: WriterOptions,
    next: i32,
    seen: HashMap<usize, i32>,
}

impl<W: Write> Writer<W> {
    /// Wraps a byte sink.
    pub fn new(inner: W, options: WriterOptions) -> Self {
        Self {
            inner,
            options,
            next: 1,
            seen: HashMap::new(),
        }
    }

    /// Writes `obj` and everything reachable from it.
    ///
    /// # Errors
    ///
    /// [`Error::ReadFile`] on I/O failure, [`Error::WrongObject`] if a value
    /// does not fit the configured long width.
    pub fn write_object(&mut self, obj: &Object) -> Result<()> {
        match obj {
            Object::Nil => self.write_i32(tag::NIL),
            Object::Number(n) => {
                self.write_i32(tag::NUMBER)?;
                Ok(self.inner.write_f64::<LittleEndian>(*n)?)
            }
            Object::String(s) => {
                self.write_i32(tag::STRING)?;
                self.write_bytes(s)
            }
            Object::Boolean(b) => {
                self.write_i32(tag::BOOLEAN)?;
                self.write_i32(i32::from(*b))
            }
            Object::Table(t) => self.write_table(t),
            Object::Storage(s) => self.write_storage(s),
            Object::Tensor(t) => self.write_tensor(t),
            Object::Module(m) => self.write_module(m),
        }
    }

    fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.inner.write_i32::<LittleEndian>(v)?)
    }

    fn write_long(&mut self, v: i64) -> Result<()> {
        match self.options.long_size {
            LongSize::Eight => Ok(self.inner.write_i64::<LittleEndian>(v)?),
            LongSize::Four => {
                let v = i32::try_from(v).map_err(|_| {
                    Error::WrongObject(format!("{v} does not fit a 4-byte long"))
                })?;
                self.write_i32(v)
            }
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| Error::WrongObject(format!("length {len} does not fit 32 bits")))?;
        self.write_i32(len)
    }

    fn write_bytes(&mut self, s: &[u8]) -> Result<()> {
        self.write_len(s.len())?;
        Ok(self.inner.write_all(s)?)
    }

    /// Writes the tag and index of a table or torch record. Returns `false`
    /// when a backreference was written and no body must follow.
    fn header<T>(&mut self, record_tag: i32, rc: &Rc<T>) -> Result<bool> {
        self.write_i32(record_tag)?;
        let key = Rc::as_ptr(rc).cast::<()>() as usize;
        if let Some(&idx) = self.seen.get(&key) {
            self.write_i32(idx)?;
            return Ok(false);
        }
        let idx = self.next;
        self.next += 1;
        self.seen.insert(key, idx);
        self.write_i32(idx)?;
        Ok(true)
    }

    fn write_table(&mut self, t: &Rc<Table>) -> Result<()> {
        if !self.header(tag::TABLE, t)? {
            return Ok(());
        }
        let records: Vec<(Object, Object)> = t.records().to_vec();
        self.write_len(records.len())?;
        for (k, v) in &records {
            self.write_object(k)?;
            self.write_object(v)?;
        }
        Ok(())
    }

    fn write_class(&mut self, class: &str) -> Result<()> {
        self.write_bytes(VERSION.as_bytes())?;
        self.write_bytes(class.as_bytes())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn write_storage(&mut self, s: &Rc<StorageObject>) -> Result<()> {
        if !self.header(tag::TORCH, s)? {
            return Ok(());
        }
        self.write_class(&format!("torch.{}Storage", s.data.scalar_type().name()))?;
        self.write_long(s.data.len() as i64)?;
        let w = &mut self.inner;
        match &s.data {
            StorageData::Byte(v) => w.write_all(v)?,
            StorageData::Char(v) => v.iter().try_for_each(|&x| w.write_i8(x))?,
            StorageData::Short(v) => v
                .iter()
                .try_for_each(|&x| w.write_i16::<LittleEndian>(x))?,
            StorageData::Int(v) => v
                .iter()
                .try_for_each(|&x| w.write_i32::<LittleEndian>(x))?,
            StorageData::Long(v) => {
                for &x in v {
                    self.write_long(x)?;
                }
            }
            StorageData::Float(st) => st
                .borrow()
                .iter()
                .try_for_each(|&x| w.write_f32::<LittleEndian>(x))?,
            StorageData::Double(v) => v
                .iter()
                .try_for_each(|&x| w.write_f64::<LittleEndian>(x))?,
        }
        Ok(())
    }

    fn write_tensor(&mut self, t: &Rc<TensorObject>) -> Result<()> {
        if !self.header(tag::TORCH, t)? {
            return Ok(());
        }
        self.write_class(&format!("torch.{}Tensor", t.scalar_type.name()))?;
        self.write_len(t.ndim())?;
        for &s in t.size.iter().chain(&t.stride) {
            self.write_long(s)?;
        }
        self.write_long(t.offset + 1)?;
        match &t.storage {
            Some(s) => self.write_storage(s),
            None => self.write_i32(tag::NIL),
        }
    }

    fn write_module(&mut self, m: &Rc<ModuleObject>) -> Result<()> {
        if !self.header(tag::TORCH, m)? {
            return Ok(());
        }
        self.write_class(m.name())?;
        match m.table() {
            Some(t) => self.write_table(t),
            None => self.write_empty_table(),
        }
    }

    /// An empty table body under a fresh index that nothing can refer back to.
    fn write_empty_table(&mut self) -> Result<()> {
        self.write_i32(tag::TABLE)?;
        let idx = self.next;
        self.next += 1;
        self.write_i32(idx)?;
        self.write_len(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Reader, ReaderOptions};

    fn round_trip(obj: &Object, long_size: LongSize) -> Object {
        let mut bytes = Vec::new();
        Writer::new(&mut bytes, WriterOptions { long_size })
            .write_object(obj)
            .unwrap();
        Reader::new(&bytes[..], ReaderOptions { long_size })
            .read_object()
            .unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        let obj = round_trip(&Object::Boolean(true), LongSize::Eight);
        assert!(matches!(obj, Object::Boolean(true)));
        let obj = round_trip(&Object::Nil, LongSize::Eight);
        assert!(matches!(obj, Object::Nil));
    }

    #[test]
    fn long_storage_round_trips_in_both_widths() {
        for long_size in [LongSize::Four, LongSize::Eight] {
            let obj = round_trip(
                &Object::Storage(StorageObject::long(vec![-1, 0, 7])),
                long_size,
            );
            let Object::Storage(s) = obj else {
                panic!("expected storage");
            };
            assert_eq!(s.data.to_i64_vec(), Some(vec![-1, 0, 7]));
        }
    }

    #[test]
    fn narrow_longs_reject_large_values() {
        let mut bytes = Vec::new();
        let err = Writer::new(&mut bytes, WriterOptions { long_size: LongSize::Four })
            .write_object(&Object::Storage(StorageObject::long(vec![1 << 40])))
            .unwrap_err();
        assert!(matches!(err, Error::WrongObject(_)));
    }

    #[test]
    fn modules_without_tables_get_distinct_indices() {
        let list = Table::new();
        for i in 1..=3 {
            list.push(
                Object::Number(f64::from(i)),
                Object::Module(ModuleObject::pending("nn.ReLU".to_string())),
            );
        }
        let obj = round_trip(&Object::Table(list), LongSize::Eight);
        let records = obj.as_table().unwrap().records().to_vec();
        let tables: Vec<_> = records
            .iter()
            .map(|(_, v)| match v {
                Object::Module(m) => Rc::clone(m.table().unwrap()),
                other => panic!("expected module, got {other:?}"),
            })
            .collect();
        assert_eq!(tables.len(), 3);
        assert!(tables.iter().all(|t| t.records().is_empty()));
        assert!(!Rc::ptr_eq(&tables[0], &tables[1]));
        assert!(!Rc::ptr_eq(&tables[1], &tables[2]));
        obj.release();
    }

    #[test]
    fn repeated_storage_becomes_a_backreference() {
        let storage = StorageObject::long(vec![1, 2]);
        let t = Table::new();
        t.push(Object::Number(1.0), Object::Storage(Rc::clone(&storage)));
        t.push(Object::Number(2.0), Object::Storage(storage));
        let obj = round_trip(&Object::Table(t), LongSize::Eight);
        let records = obj.as_table().unwrap().records().to_vec();
        let (Object::Storage(a), Object::Storage(b)) = (&records[0].1, &records[1].1) else {
            panic!("expected storages");
        };
        assert!(Rc::ptr_eq(a, b));
    }
}
