//! Binary trace format shared by the recording runtime and the search driver.
//!
//! All integers are written in native byte order with `usize` quantities widened
//! to 8 bytes. There is no version field.
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::string::FromUtf8Error;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use fxhash::FxHashMap;
use thiserror::Error;

use crate::execution::{InputVar, SymbolicExecution};
use crate::expr::{BinaryOp, CompareOp, Expr, InvalidOp, Node, SymExpr, UnaryOp};
use crate::memory::{MemElem, SymbolicMemory, BLOCK_SIZE};
use crate::object::{ObjectTracker, SymbolicObject};
use crate::path::SymbolicPath;
use crate::value::{self, CType, Location, Value};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(io::Error),
    #[error("unexpected end of trace")]
    UnexpectedEof,
    #[error("unknown expression tag {0}")]
    InvalidTag(u8),
    #[error(transparent)]
    InvalidType(#[from] value::Error),
    #[error(transparent)]
    InvalidOp(#[from] InvalidOp),
    #[error("string field is not valid UTF-8")]
    Utf8(#[from] FromUtf8Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(e)
        }
    }
}

pub struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_len(&mut self, n: usize) -> Result<(), Error> {
        self.inner.write_u64::<NativeEndian>(n as u64)?;
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        self.write_len(s.len())?;
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn write_value(&mut self, v: &Value) -> Result<(), Error> {
        self.inner.write_i64::<NativeEndian>(v.integral)?;
        self.inner.write_f64::<NativeEndian>(v.floating)?;
        self.inner.write_i32::<NativeEndian>(v.ty.tag() as i32)?;
        self.inner.write_all(&[0u8; 4])?;
        Ok(())
    }

    pub fn write_expr(&mut self, e: &SymExpr) -> Result<(), Error> {
        self.write_value(&e.value())?;
        self.write_len(e.size())?;
        self.inner.write_u64::<NativeEndian>(e.uid())?;
        self.inner.write_u8(e.node().tag())?;

        match e.node() {
            Node::Atomic(var) => self.inner.write_u32::<NativeEndian>(*var)?,
            Node::Compare(op, l, r) => {
                self.inner.write_u8(op.as_u8())?;
                self.write_expr(l)?;
                self.write_expr(r)?;
            }
            Node::Binary(op, l, r) => {
                self.inner.write_u8(op.as_u8())?;
                self.write_expr(l)?;
                self.write_expr(r)?;
            }
            Node::Unary(op, child) => {
                self.inner.write_u8(op.as_u8())?;
                self.write_expr(child)?;
            }
            Node::Deref {
                manager,
                snapshot,
                addr,
            } => {
                self.write_len(*manager)?;
                self.write_len(*snapshot)?;
                self.write_expr(addr)?;
            }
            Node::Const => (),
        }
        Ok(())
    }

    pub fn write_memory(&mut self, mem: &SymbolicMemory) -> Result<(), Error> {
        self.write_len(mem.len())?;
        for (addr, elem) in mem.blocks() {
            self.inner.write_u64::<NativeEndian>(addr)?;
            self.inner.write_u32::<NativeEndian>(elem.bitmap())?;
            for e in elem.slots().iter().flatten() {
                self.write_expr(e)?;
            }
        }
        Ok(())
    }

    pub fn write_object(&mut self, obj: &SymbolicObject) -> Result<(), Error> {
        self.inner.write_u64::<NativeEndian>(obj.start())?;
        self.write_len(obj.size())?;
        self.write_len(obj.manager_idx())?;
        self.write_len(obj.snapshot_idx())?;
        self.write_memory(obj.mem())?;

        self.write_len(obj.writes().len())?;
        for (addr, value) in obj.writes() {
            self.write_expr(addr)?;
            self.write_expr(value)?;
        }
        Ok(())
    }

    pub fn write_tracker(&mut self, tracker: &ObjectTracker) -> Result<(), Error> {
        let managers = tracker.snapshot_manager();
        self.write_len(managers.len())?;
        for snapshots in managers {
            self.write_len(snapshots.len())?;
            for obj in snapshots {
                self.write_object(obj)?;
            }
        }
        Ok(())
    }

    pub fn write_path(&mut self, path: &SymbolicPath) -> Result<(), Error> {
        self.write_len(path.branches().len())?;
        for bid in path.branches() {
            self.inner.write_i32::<NativeEndian>(*bid)?;
        }

        self.write_len(path.constraints().len())?;
        for idx in path.constraints_idx() {
            self.write_len(*idx)?;
        }

        for (constraint, loc) in path.constraints().iter().zip(path.locations()) {
            self.inner.write_i32::<NativeEndian>(loc.lineno)?;
            self.write_str(&loc.fname)?;
            self.write_expr(constraint)?;
        }
        Ok(())
    }

    pub fn write_execution(&mut self, ex: &SymbolicExecution) -> Result<(), Error> {
        self.write_len(ex.num_vars())?;
        for (var, input) in ex.vars().iter().zip(ex.inputs()) {
            self.write_str(&var.name)?;
            self.inner.write_u64::<NativeEndian>(var.old_value)?;
            self.inner.write_u8(var.index_size)?;
            self.inner.write_u8(var.h)?;
            self.inner.write_u8(var.l)?;
            self.write_expr(&var.expr)?;
            self.inner.write_i32::<NativeEndian>(var.location.lineno)?;
            self.write_str(&var.location.fname)?;
            self.inner.write_i8(var.ty.tag())?;

            match var.ty {
                CType::Float => self.inner.write_f32::<NativeEndian>(input.floating as f32)?,
                CType::Double => self.inner.write_f64::<NativeEndian>(input.floating)?,
                _ => self.inner.write_i64::<NativeEndian>(input.integral)?,
            }
        }

        self.write_tracker(ex.tracker())?;
        self.write_path(ex.path())?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Serialized-id to handle arena for one parse.
///
/// Shared subtrees are written out in full at every occurrence; a repeated id
/// resolves to the handle built the first time.
#[derive(Debug, Default)]
pub struct ReadTable {
    handles: FxHashMap<u64, SymExpr>,
}

impl ReadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&SymExpr> {
        self.handles.get(&id)
    }

    fn intern(&mut self, id: u64, e: SymExpr) -> SymExpr {
        self.handles.entry(id).or_insert(e).clone()
    }
}

pub struct Reader<R: Read> {
    inner: R,
    table: ReadTable,
}

impl<R: Read> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            table: ReadTable::new(),
        }
    }

    pub fn table(&self) -> &ReadTable {
        &self.table
    }

    fn read_len(&mut self) -> Result<usize, Error> {
        Ok(self.inner.read_u64::<NativeEndian>()? as usize)
    }

    fn read_str(&mut self) -> Result<String, Error> {
        let len = self.read_len()?;
        let mut buf = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(Error::UnexpectedEof);
        }
        Ok(String::from_utf8(buf)?)
    }

    pub fn read_value(&mut self) -> Result<Value, Error> {
        let integral = self.inner.read_i64::<NativeEndian>()?;
        let floating = self.inner.read_f64::<NativeEndian>()?;
        let tag = self.inner.read_i32::<NativeEndian>()?;
        let mut pad = [0u8; 4];
        self.inner.read_exact(&mut pad)?;
        Ok(Value::new(integral, floating, CType::from_tag(tag as i64)?))
    }

    pub fn read_expr(&mut self) -> Result<SymExpr, Error> {
        let value = self.read_value()?;
        let size = self.read_len()?;
        let id = self.inner.read_u64::<NativeEndian>()?;
        let tag = self.inner.read_u8()?;

        let node = match tag {
            Node::ATOMIC_TAG => Node::Atomic(self.inner.read_u32::<NativeEndian>()?),
            Node::COMPARE_TAG => {
                let op = CompareOp::from_u8(self.inner.read_u8()?)?;
                let l = self.read_expr()?;
                let r = self.read_expr()?;
                Node::Compare(op, l, r)
            }
            Node::BINARY_TAG => {
                let op = BinaryOp::from_u8(self.inner.read_u8()?)?;
                let l = self.read_expr()?;
                let r = self.read_expr()?;
                Node::Binary(op, l, r)
            }
            Node::UNARY_TAG => {
                let op = UnaryOp::from_u8(self.inner.read_u8()?)?;
                Node::Unary(op, self.read_expr()?)
            }
            Node::DEREF_TAG => {
                let manager = self.read_len()?;
                let snapshot = self.read_len()?;
                let addr = self.read_expr()?;
                Node::Deref {
                    manager,
                    snapshot,
                    addr,
                }
            }
            Node::CONST_TAG => Node::Const,
            t => return Err(Error::InvalidTag(t)),
        };

        let e = SymExpr::from(Expr::new(node, size, value));
        Ok(self.table.intern(id, e))
    }

    pub fn read_memory(&mut self) -> Result<SymbolicMemory, Error> {
        let mut mem = SymbolicMemory::new();
        let count = self.read_len()?;
        for _ in 0..count {
            let addr = self.inner.read_u64::<NativeEndian>()?;
            let bitmap = self.inner.read_u32::<NativeEndian>()?;

            let mut elem = MemElem::new();
            for i in 0..BLOCK_SIZE {
                if bitmap & (1 << i) != 0 {
                    elem[i] = Some(self.read_expr()?);
                }
            }
            mem.insert_block(addr, elem);
        }
        Ok(mem)
    }

    pub fn read_object(&mut self) -> Result<SymbolicObject, Error> {
        let start = self.inner.read_u64::<NativeEndian>()?;
        let size = self.read_len()?;
        let manager_idx = self.read_len()?;
        let snapshot_idx = self.read_len()?;
        let mem = self.read_memory()?;

        let count = self.read_len()?;
        let mut writes = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let addr = self.read_expr()?;
            let value = self.read_expr()?;
            writes.push((addr, value));
        }

        Ok(SymbolicObject::from_parts(
            start,
            size,
            manager_idx,
            snapshot_idx,
            mem,
            writes,
        ))
    }

    pub fn read_tracker(&mut self) -> Result<ObjectTracker, Error> {
        let managers = self.read_len()?;
        let mut snapshot_manager = Vec::with_capacity(managers.min(1 << 16));
        for _ in 0..managers {
            let count = self.read_len()?;
            let snapshots = (0..count)
                .map(|_| self.read_object())
                .collect::<Result<Vec<_>, _>>()?;
            snapshot_manager.push(snapshots);
        }
        Ok(ObjectTracker::from_snapshots(snapshot_manager))
    }

    pub fn read_path(&mut self) -> Result<SymbolicPath, Error> {
        let count = self.read_len()?;
        let branches = (0..count)
            .map(|_| self.inner.read_i32::<NativeEndian>())
            .collect::<Result<Vec<_>, _>>()?;

        let count = self.read_len()?;
        let constraints_idx = (0..count)
            .map(|_| self.read_len())
            .collect::<Result<Vec<_>, _>>()?;

        let mut constraints = Vec::with_capacity(count.min(1 << 16));
        let mut locations = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let lineno = self.inner.read_i32::<NativeEndian>()?;
            let fname = self.read_str()?;
            locations.push(Location::new(fname, lineno));
            constraints.push(self.read_expr()?);
        }

        Ok(SymbolicPath::from_parts(
            branches,
            constraints_idx,
            constraints,
            locations,
        ))
    }

    pub fn read_execution(&mut self) -> Result<SymbolicExecution, Error> {
        let count = self.read_len()?;
        let mut vars = Vec::with_capacity(count.min(1 << 16));
        let mut inputs = Vec::with_capacity(count.min(1 << 16));

        for _ in 0..count {
            let name = self.read_str()?;
            let old_value = self.inner.read_u64::<NativeEndian>()?;
            let index_size = self.inner.read_u8()?;
            let h = self.inner.read_u8()?;
            let l = self.inner.read_u8()?;
            let expr = self.read_expr()?;
            let lineno = self.inner.read_i32::<NativeEndian>()?;
            let fname = self.read_str()?;
            let ty = CType::from_tag(self.inner.read_i8()? as i64)?;

            let input = match ty {
                CType::Float => {
                    Value::new(0, self.inner.read_f32::<NativeEndian>()? as f64, ty)
                }
                CType::Double => Value::new(0, self.inner.read_f64::<NativeEndian>()?, ty),
                _ => Value::new(self.inner.read_i64::<NativeEndian>()?, 0.0, ty),
            };

            vars.push(InputVar {
                name,
                ty,
                location: Location::new(fname, lineno),
                old_value,
                h,
                l,
                index_size,
                expr,
            });
            inputs.push(input);
        }

        let tracker = self.read_tracker()?;
        let path = self.read_path()?;

        Ok(SymbolicExecution::from_parts(vars, inputs, tracker, path))
    }
}

pub fn write_execution_file<P: AsRef<Path>>(path: P, ex: &SymbolicExecution) -> Result<(), Error> {
    let file = File::create(path)?;
    Writer::new(BufWriter::new(file)).write_execution(ex)
}

pub fn read_execution_file<P: AsRef<Path>>(path: P) -> Result<SymbolicExecution, Error> {
    let file = File::open(path)?;
    Reader::new(BufReader::new(file)).read_execution()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<F>(f: F) -> Vec<u8>
    where
        F: FnOnce(&mut Writer<&mut Vec<u8>>) -> Result<(), Error>,
    {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        f(&mut w).unwrap();
        buf
    }

    #[test]
    fn value_layout() {
        let buf = encode(|w| w.write_value(&Value::integral(-3, CType::Char)));
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[..8], &(-3i64).to_ne_bytes());
        assert_eq!(&buf[16..20], &1i32.to_ne_bytes());
    }

    #[test]
    fn atomic_layout() {
        let x = SymExpr::atomic(7, 4, Value::integral(1, CType::Int));
        let buf = encode(|w| w.write_expr(&x));
        assert_eq!(buf.len(), 24 + 8 + 8 + 1 + 4);
        assert_eq!(buf[40], Node::ATOMIC_TAG);
        assert_eq!(&buf[41..45], &7u32.to_ne_bytes());
    }

    #[test]
    fn shared_subtrees_reuse_handles() {
        let x = SymExpr::atomic(0, 4, Value::integral(1, CType::Int));
        let sum = SymExpr::binary(Value::integral(2, CType::Int), BinaryOp::Add, x.clone(), x);
        let buf = encode(|w| w.write_expr(&sum));

        let mut r = Reader::new(&buf[..]);
        let parsed = r.read_expr().unwrap();
        assert_eq!(parsed, sum);
        // the sum and one entry for the twice-written leaf
        assert_eq!(r.table().len(), 2);
    }

    #[test]
    fn bad_tag_is_rejected() {
        let mut buf = encode(|w| w.write_expr(&SymExpr::constant(Value::integral(1, CType::Int))));
        buf[40] = 9;
        match Reader::new(&buf[..]).read_expr() {
            Err(Error::InvalidTag(9)) => (),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn truncated_input() {
        let buf = encode(|w| w.write_expr(&SymExpr::atomic(0, 1, Value::integral(0, CType::Char))));
        match Reader::new(&buf[..buf.len() - 2]).read_expr() {
            Err(Error::UnexpectedEof) => (),
            r => panic!("unexpected {:?}", r),
        }
    }
}
