//! `extern "C"` entry points called by instrumented programs.
//!
//! The instrumentation describes the program as a stack machine: loads push
//! values, operators pop their operands and push the result, stores pop into
//! memory and branches pop their condition. Every call forwards to one
//! process-global [`SymbolicInterpreter`]; the recorded execution is written
//! to `szd_execution` when the program exits.
//!
//! # Safety
//!
//! Every pointer argument must be valid for the access the entry point makes:
//! input functions write through `x`, strings must be NUL terminated or null.
//!
//! Malformed instrumentation aborts the process. Unknown type tags,
//! operators of the wrong kind, stack underflow, null caller or callee names,
//! inputs before `__CrownInit` and unsupported bitfield union sizes all panic
//! inside an `extern "C"` function, and a panic cannot unwind across that
//! boundary. So does failing to read `input` or to write `szd_execution`.
#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short, c_uchar, c_uint, c_ulong, c_ulonglong, c_ushort};

use fxhash::FxHashMap as HashMap;
use parking_lot::{const_mutex, Mutex};

use crate::codec;
use crate::config;
use crate::expr::{BinaryOp, CompareOp, PointerOp, UnaryOp};
use crate::input;
use crate::interpreter::{InputDecl, SymbolicInterpreter};
use crate::value::{CType, Location, Value};

extern "C" {
    fn atexit(cb: extern "C" fn()) -> c_int;
    fn malloc(size: usize) -> *mut c_void;
}

/// Operator numbering used by the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiOp {
    Binary(BinaryOp),
    Compare(CompareOp),
    Unary(UnaryOp),
    Pointer(PointerOp),
}

impl AbiOp {
    pub fn decode(op: c_int) -> Option<Self> {
        Some(match op {
            0..=12 => Self::Binary(BinaryOp::from_u8(op as u8).ok()?),
            13 => Self::Compare(CompareOp::Eq),
            14 => Self::Compare(CompareOp::Neq),
            15 => Self::Compare(CompareOp::Gt),
            16 => Self::Compare(CompareOp::SGt),
            17 => Self::Compare(CompareOp::Le),
            18 => Self::Compare(CompareOp::SLe),
            19 => Self::Compare(CompareOp::Lt),
            20 => Self::Compare(CompareOp::SLt),
            21 => Self::Compare(CompareOp::Ge),
            22 => Self::Compare(CompareOp::SGe),
            23 => Self::Binary(BinaryOp::Concrete),
            24 => Self::Unary(UnaryOp::Negate),
            25 => Self::Unary(UnaryOp::BitwiseNot),
            26 => Self::Unary(UnaryOp::LogicalNot),
            27 => Self::Unary(UnaryOp::UnsignedCast),
            28 => Self::Unary(UnaryOp::SignedCast),
            29..=33 => Self::Pointer(PointerOp::from_u8((op - 29) as u8).ok()?),
            _ => return None,
        })
    }
}

struct Runtime {
    interpreter: SymbolicInterpreter,
    /// Cleared while inside a callee that was not instrumented.
    enable_symbolic: bool,
    caller: String,
    callee: String,
    /// Symbolic pointer input value to the block allocated for it.
    pointers: HashMap<u64, u64>,
}

static RUNTIME: Mutex<Option<Runtime>> = const_mutex(None);

fn with_runtime<R, F: FnOnce(&mut Runtime) -> R>(f: F) -> Option<R> {
    RUNTIME.lock().as_mut().map(f)
}

/// Run `f` on the interpreter unless symbolic tracing is suspended.
fn traced<F: FnOnce(&mut SymbolicInterpreter)>(f: F) {
    with_runtime(|rt| {
        if rt.enable_symbolic {
            f(&mut rt.interpreter)
        }
    });
}

fn ctype(ty: c_int) -> CType {
    match CType::from_tag(ty as i64) {
        Ok(ty) => ty,
        Err(e) => panic!("{}", e),
    }
}

fn value(ty: c_int, val: c_longlong, fp_val: f64) -> Value {
    Value::new(val, fp_val, ctype(ty))
}

unsafe fn string(s: *const c_char) -> String {
    if s.is_null() {
        String::new()
    } else {
        CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}

extern "C" fn write_execution() {
    let rt = RUNTIME.lock().take();
    if let Some(mut rt) = rt {
        rt.interpreter.exit();
        let ex = rt.interpreter.into_execution();
        if let Err(e) = codec::write_execution_file(config::EXECUTION_FILE, &ex) {
            panic!("cannot write {}: {}", config::EXECUTION_FILE, e);
        }
    }
}

#[no_mangle]
pub extern "C" fn __CrownInit(_id: c_int) {
    let inputs = match input::read_inputs(config::INPUT_FILE) {
        Ok(inputs) => inputs,
        Err(e) => panic!("cannot read {}: {}", config::INPUT_FILE, e),
    };

    *RUNTIME.lock() = Some(Runtime {
        interpreter: SymbolicInterpreter::with_inputs(inputs),
        enable_symbolic: true,
        caller: String::new(),
        callee: String::new(),
        pointers: HashMap::default(),
    });

    let registered = unsafe { atexit(write_execution) };
    assert_eq!(registered, 0, "cannot register exit handler");
}

/// Track a global and record its initial contents element by element.
#[no_mangle]
pub unsafe extern "C" fn __CrownRegGlobal(_id: c_int, addr: c_ulong, size: c_ulong, ty: c_int) {
    let ty = ctype(ty);
    let addr = addr as u64;
    let size = size as usize;

    traced(|si| {
        si.alloc(addr, size);

        let elem = ty.size();
        if elem == 0 {
            return;
        }

        for i in 0..size / elem {
            let at = addr + (elem * i) as u64;
            let p = at as *const u8;
            let (val, fp_val) = match ty {
                CType::Boolean => ((p.read() != 0) as i64, 0.0),
                CType::UChar => (p.read() as i64, 0.0),
                CType::Char => (p.read() as i8 as i64, 0.0),
                CType::UShort => ((p as *const u16).read_unaligned() as i64, 0.0),
                CType::Short => ((p as *const i16).read_unaligned() as i64, 0.0),
                CType::UInt => ((p as *const u32).read_unaligned() as i64, 0.0),
                CType::Int => ((p as *const i32).read_unaligned() as i64, 0.0),
                CType::ULong | CType::ULongLong | CType::Pointer => {
                    ((p as *const u64).read_unaligned() as i64, 0.0)
                }
                CType::Long | CType::LongLong => ((p as *const i64).read_unaligned(), 0.0),
                CType::Float => (0, (p as *const f32).read_unaligned() as f64),
                CType::Double => (0, (p as *const f64).read_unaligned()),
                _ => (0, 0.0),
            };

            si.load(0, Value::integral(at as i64, CType::ULong));
            si.load(0, Value::new(val, fp_val, ty));
            si.write(at);
        }
    });
}

#[no_mangle]
pub extern "C" fn __CrownAlloc(_id: c_int, addr: c_ulong, size: c_ulong) {
    traced(|si| si.alloc(addr as u64, size as usize));
}

#[no_mangle]
pub extern "C" fn __CrownFree(_id: c_int, addr: c_ulong) {
    traced(|si| si.free(addr as u64));
}

#[no_mangle]
pub extern "C" fn __CrownLoad(_id: c_int, addr: c_ulong, ty: c_int, val: c_longlong, fp_val: f64) {
    traced(|si| si.load(addr as u64, value(ty, val, fp_val)));
}

#[no_mangle]
pub extern "C" fn __CrownDeref(_id: c_int, addr: c_ulong, ty: c_int, val: c_longlong, fp_val: f64) {
    traced(|si| si.deref(addr as u64, value(ty, val, fp_val)));
}

#[no_mangle]
pub extern "C" fn __CrownStore(_id: c_int, addr: c_ulong) {
    traced(|si| si.store(addr as u64));
}

#[no_mangle]
pub extern "C" fn __CrownWrite(_id: c_int, addr: c_ulong) {
    traced(|si| si.write(addr as u64));
}

#[no_mangle]
pub extern "C" fn __CrownClearStack(_id: c_int) {
    traced(|si| si.clear_stack());
}

#[no_mangle]
pub extern "C" fn __CrownApply1(_id: c_int, op: c_int, ty: c_int, val: c_longlong, fp_val: f64) {
    let op = match AbiOp::decode(op) {
        Some(AbiOp::Unary(op)) => op,
        _ => panic!("operator {} is not unary", op),
    };
    traced(|si| si.apply_unary(op, value(ty, val, fp_val)));
}

#[no_mangle]
pub extern "C" fn __CrownApply2(_id: c_int, op: c_int, ty: c_int, val: c_longlong, fp_val: f64) {
    let op = AbiOp::decode(op);
    traced(|si| match op {
        Some(AbiOp::Binary(op)) => si.apply_binary(op, value(ty, val, fp_val)),
        Some(AbiOp::Compare(op)) => si.apply_compare(op, value(ty, val, fp_val)),
        _ => panic!("operator {:?} is not binary", op),
    });
}

#[no_mangle]
pub extern "C" fn __CrownPtrApply2(_id: c_int, op: c_int, size: c_ulong, val: c_longlong) {
    let op = match AbiOp::decode(op) {
        Some(AbiOp::Pointer(op)) => op,
        _ => panic!("operator {} is not a pointer operator", op),
    };
    traced(|si| si.apply_bin_ptr(op, size as usize, val));
}

#[no_mangle]
pub unsafe extern "C" fn __CrownBranch(
    _id: c_int,
    bid: c_int,
    taken: c_uchar,
    line: c_uint,
    fname: *const c_char,
    _exp: *const c_char,
) {
    let fname = string(fname);
    traced(|si| si.branch(bid, taken != 0, line as i32 - 1, &fname));
}

#[no_mangle]
pub extern "C" fn __CrownCall(_id: c_int, _fid: c_uint) {
    traced(|si| si.call());
}

#[no_mangle]
pub extern "C" fn __CrownReturn(_id: c_int) {
    traced(|si| si.ret());
}

#[no_mangle]
pub extern "C" fn __CrownHandleReturn(_id: c_int, ty: c_int, val: c_longlong, fp_val: f64) {
    traced(|si| si.handle_return(value(ty, val, fp_val)));
}

#[no_mangle]
pub unsafe extern "C" fn __CrownSetCallerCalleeName(_id: c_int, caller: *const c_char, callee: *const c_char) {
    assert!(!caller.is_null() && !callee.is_null());
    let (caller, callee) = (string(caller), string(callee));
    with_runtime(|rt| {
        if rt.enable_symbolic {
            rt.caller = caller;
            rt.callee = callee;
        }
    });
}

/// Back in `caller` after a call: resume tracing if it was suspended there.
#[no_mangle]
pub unsafe extern "C" fn __CrownEnableSymbolic(_id: c_int, caller: *const c_char) {
    let caller = string(caller);
    with_runtime(|rt| {
        if rt.caller == caller {
            rt.enable_symbolic = true;
        }
    });
}

/// Entering `callee`: suspend tracing unless it is the function the last
/// instrumented call site named.
#[no_mangle]
pub unsafe extern "C" fn __CrownCheckSymbolic(_id: c_int, callee: *const c_char) {
    let callee = string(callee);
    with_runtime(|rt| {
        if rt.enable_symbolic && callee != "main" && rt.callee != callee {
            rt.enable_symbolic = false;
        }
    });
}

fn new_input(ty: CType, addr: u64, decl: InputDecl, init: Option<Value>) -> Value {
    match with_runtime(|rt| rt.interpreter.new_input(ty, addr, decl, init)) {
        Some(v) => v,
        None => panic!("symbolic input before __CrownInit"),
    }
}

unsafe fn decl(var: *const c_char, cnt: c_int, ln: c_int, fname: *const c_char) -> InputDecl {
    InputDecl::new(format!("{}_{}", string(var), cnt), Location::new(string(fname), ln))
}

macro_rules! integral_input {
    ($name:ident, $init:ident, $t:ty, $ty:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            x: *mut $t,
            cnt: c_int,
            ln: c_int,
            fname: *const c_char,
            var: *const c_char,
        ) {
            let v = new_input($ty, x as u64, decl(var, cnt, ln, fname), None);
            *x = v.integral as $t;
        }

        #[no_mangle]
        pub unsafe extern "C" fn $init(
            x: *mut $t,
            val: $t,
            cnt: c_int,
            ln: c_int,
            fname: *const c_char,
            var: *const c_char,
        ) {
            let init = Value::integral(val as i64, $ty);
            let v = new_input($ty, x as u64, decl(var, cnt, ln, fname), Some(init));
            *x = v.integral as $t;
        }
    };
}

macro_rules! float_input {
    ($name:ident, $init:ident, $t:ty, $ty:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            x: *mut $t,
            cnt: c_int,
            ln: c_int,
            fname: *const c_char,
            var: *const c_char,
        ) {
            let v = new_input($ty, x as u64, decl(var, cnt, ln, fname), None);
            *x = v.floating as $t;
        }

        #[no_mangle]
        pub unsafe extern "C" fn $init(
            x: *mut $t,
            val: $t,
            cnt: c_int,
            ln: c_int,
            fname: *const c_char,
            var: *const c_char,
        ) {
            let init = Value::floating(val as f64, $ty);
            let v = new_input($ty, x as u64, decl(var, cnt, ln, fname), Some(init));
            *x = v.floating as $t;
        }
    };
}

integral_input!(__CrownUChar, __CrownUCharInit, c_uchar, CType::UChar);
integral_input!(__CrownChar, __CrownCharInit, c_char, CType::Char);
integral_input!(__CrownUShort, __CrownUShortInit, c_ushort, CType::UShort);
integral_input!(__CrownShort, __CrownShortInit, c_short, CType::Short);
integral_input!(__CrownUInt, __CrownUIntInit, c_uint, CType::UInt);
integral_input!(__CrownInt, __CrownIntInit, c_int, CType::Int);
integral_input!(__CrownULong, __CrownULongInit, c_ulong, CType::ULong);
integral_input!(__CrownLong, __CrownLongInit, c_long, CType::Long);
integral_input!(__CrownULongLong, __CrownULongLongInit, c_ulonglong, CType::ULongLong);
integral_input!(__CrownLongLong, __CrownLongLongInit, c_longlong, CType::LongLong);
float_input!(__CrownFloat, __CrownFloatInit, f32, CType::Float);
float_input!(__CrownDouble, __CrownDoubleInit, f64, CType::Double);

/// A symbolic pointer: null stays null, every other value gets a fresh block
/// of `size` bytes, shared by all inputs that take the same value.
#[no_mangle]
pub unsafe extern "C" fn __CrownPointer(
    x: *mut *mut c_void,
    size: c_longlong,
    cnt: c_int,
    ln: c_int,
    fname: *const c_char,
    var: *const c_char,
) {
    let v = new_input(CType::Pointer, x as u64, decl(var, cnt, ln, fname), None);
    let raw = v.integral as u64;
    if raw == 0 {
        *x = std::ptr::null_mut();
        return;
    }

    let block = with_runtime(|rt| rt.pointers.get(&raw).copied()).flatten();
    let block = match block {
        Some(block) => block,
        None => {
            let block = malloc(size.max(0) as usize) as u64;
            with_runtime(|rt| rt.pointers.insert(raw, block));
            block
        }
    };
    *x = block as *mut c_void;
}

/// Bit window of a struct bitfield within one of its bytes.
fn byte_window(lowest: c_int, highest: c_int) -> (u8, u8) {
    let h = ((highest - 1) % 8 + 1) as u8;
    let l = (lowest % 8) as u8;
    (h, l)
}

/// Make the bitfield `[lowest, highest)` of the storage at `x` symbolic.
///
/// Struct members (`union_size == 0`) become one input per byte they
/// touch; the outer bytes are partial windows and inner bytes plain
/// `unsigned char` inputs. Union members become one input over the whole
/// `union_size`-byte storage.
#[no_mangle]
pub unsafe extern "C" fn __CrownBitField(
    x: *mut u8,
    union_size: c_char,
    lowest: c_int,
    highest: c_int,
    cnt: c_int,
    ln: c_int,
    fname: *const c_char,
    var: *const c_char,
) -> c_ulonglong {
    let name = string(var);
    let location = Location::new(string(fname), ln);
    let byte_name = |i: usize| format!("{}[{}]_{}", name, i, cnt);

    if union_size == 0 {
        let lo = (lowest / 8) as usize;
        let hi = if highest % 8 == 0 {
            (highest / 8 - 1) as usize
        } else {
            (highest / 8) as usize
        };
        let index_size = (hi - lo + 1) as u8;
        let (h, l) = byte_window(lowest, highest);

        let byte_input = |i: usize, ty: CType, window: Option<(u8, u8)>| {
            let p = x.add(i);
            let mut d = InputDecl::new(byte_name(i), location.clone());
            if let Some((h, l)) = window {
                d = d.bitfield(*p as u64, h, l, index_size);
            }
            *p = new_input(ty, p as u64, d, None).integral as u8;
        };

        if lo == hi {
            byte_input(lo, CType::BitfieldChar, Some((h, l)));
        } else {
            byte_input(lo, CType::BitfieldChar, Some((8, l)));
            for i in lo + 1..hi {
                byte_input(i, CType::UChar, None);
            }
            byte_input(hi, CType::BitfieldChar, Some((h, 0)));
        }
    } else {
        let (h, l) = (highest as u8, lowest as u8);
        let d = |old: u64| {
            InputDecl::new(format!("{}_{}", name, cnt), location.clone()).bitfield(old, h, l, 0)
        };

        match union_size {
            1 => *x = new_input(CType::BitfieldChar, x as u64, d(*x as u64), None).integral as u8,
            2 => {
                let p = x as *mut u16;
                let old = p.read_unaligned();
                let v = new_input(CType::BitfieldUnionShort, x as u64, d(old as u64), None);
                p.write_unaligned(v.integral as u16);
            }
            4 => {
                let p = x as *mut u32;
                let old = p.read_unaligned();
                let v = new_input(CType::BitfieldUnionInt, x as u64, d(old as u64), None);
                p.write_unaligned(v.integral as u32);
            }
            8 => {
                let p = x as *mut u64;
                let old = p.read_unaligned();
                let v = new_input(CType::BitfieldUnionLongLong, x as u64, d(old), None);
                p.write_unaligned(v.integral as u64);
            }
            _ => panic!("unsupported bitfield union size {}", union_size),
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_operator_table() {
        assert_eq!(AbiOp::decode(0), Some(AbiOp::Binary(BinaryOp::Add)));
        assert_eq!(AbiOp::decode(9), Some(AbiOp::Binary(BinaryOp::SShr)));
        assert_eq!(AbiOp::decode(16), Some(AbiOp::Compare(CompareOp::SGt)));
        assert_eq!(AbiOp::decode(21), Some(AbiOp::Compare(CompareOp::Ge)));
        assert_eq!(AbiOp::decode(23), Some(AbiOp::Binary(BinaryOp::Concrete)));
        assert_eq!(AbiOp::decode(25), Some(AbiOp::Unary(UnaryOp::BitwiseNot)));
        assert_eq!(AbiOp::decode(28), Some(AbiOp::Unary(UnaryOp::SignedCast)));
        assert_eq!(AbiOp::decode(33), Some(AbiOp::Pointer(PointerOp::SubPp)));
        assert_eq!(AbiOp::decode(34), None);
        assert_eq!(AbiOp::decode(-1), None);
    }

    #[test]
    fn struct_bitfield_windows() {
        // bits 3..7 of the first byte
        assert_eq!(byte_window(3, 7), (7, 3));
        // a field ending on a byte boundary covers the whole top byte
        assert_eq!(byte_window(4, 16), (8, 4));
    }
}
