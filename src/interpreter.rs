//! Recording-side stack machine.
//!
//! The instrumented program evaluates every expression in postfix order and
//! reports each step here. Each stack slot carries the concrete result and,
//! when it depends on an input, the symbolic expression describing it.
//!
//! Contract violations (stack underflow, malformed pointer arithmetic) mean the
//! instrumentation is broken and panic.
use crate::execution::{bit_window, InputVar, SymbolicExecution};
use crate::expr::{BinaryOp, CompareOp, PointerOp, SymExpr, UnaryOp};
use crate::memory::SymbolicMemory;
use crate::object::{ObjectTracker, SymbolicObject};
use crate::path::{BranchId, CALL_BRANCH, RETURN_BRANCH};
use crate::value::{CType, Location, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcreteOrSymbolic {
    Concrete(Value),
    Symbolic(Value, SymExpr),
}

impl ConcreteOrSymbolic {
    /// Constant expressions carry no symbolic information and stay concrete.
    pub fn new(value: Value, expr: Option<SymExpr>) -> Self {
        match expr {
            Some(e) if !e.is_concrete() => Self::Symbolic(value, e),
            _ => Self::Concrete(value),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Self::Concrete(v) | Self::Symbolic(v, _) => *v,
        }
    }

    pub fn expr(&self) -> Option<&SymExpr> {
        match self {
            Self::Concrete(_) => None,
            Self::Symbolic(_, e) => Some(e),
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(..))
    }

    /// The slot as an expression, materialising concrete slots as constants.
    pub fn into_expr(self) -> SymExpr {
        match self {
            Self::Concrete(v) => SymExpr::constant(v),
            Self::Symbolic(_, e) => e,
        }
    }

    fn with_value(self, value: Value) -> Self {
        match self {
            Self::Concrete(_) => Self::Concrete(value),
            Self::Symbolic(_, e) => Self::Symbolic(value, e),
        }
    }

    /// Bytes covered when the slot is stored; aggregates carry their size as
    /// the concrete value.
    fn store_size(&self) -> usize {
        let v = self.value();
        if v.ty != CType::Struct {
            v.ty.size()
        } else if v.integral != 0 {
            v.integral as usize
        } else {
            4
        }
    }
}

/// Declaration-site details of a symbolic input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputDecl {
    pub name: String,
    pub location: Location,
    pub old_value: u64,
    pub h: u8,
    pub l: u8,
    pub index_size: u8,
}

impl InputDecl {
    pub fn new<S: Into<String>>(name: S, location: Location) -> Self {
        Self {
            name: name.into(),
            location,
            ..Self::default()
        }
    }

    pub fn bitfield(mut self, old_value: u64, h: u8, l: u8, index_size: u8) -> Self {
        self.old_value = old_value;
        self.h = h;
        self.l = l;
        self.index_size = index_size;
        self
    }
}

#[derive(Debug, Default)]
pub struct SymbolicInterpreter {
    stack: Vec<ConcreteOrSymbolic>,
    mem: SymbolicMemory,
    ex: SymbolicExecution,
    num_inputs: usize,
    return_value: bool,
}

impl SymbolicInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An interpreter replaying the given concrete inputs, in order.
    pub fn with_inputs(inputs: Vec<Value>) -> Self {
        Self {
            ex: SymbolicExecution::with_inputs(inputs),
            ..Self::default()
        }
    }

    pub fn execution(&self) -> &SymbolicExecution {
        &self.ex
    }

    pub fn into_execution(self) -> SymbolicExecution {
        self.ex
    }

    pub fn memory(&self) -> &SymbolicMemory {
        &self.mem
    }

    pub fn tracker(&self) -> &ObjectTracker {
        self.ex.tracker()
    }

    pub fn stack(&self) -> &[ConcreteOrSymbolic] {
        &self.stack
    }

    fn pop(&mut self, what: &str) -> ConcreteOrSymbolic {
        match self.stack.pop() {
            Some(slot) => slot,
            None => panic!("{}: symbolic stack underflow", what),
        }
    }

    fn top_mut(&mut self, what: &str) -> &mut ConcreteOrSymbolic {
        match self.stack.last_mut() {
            Some(slot) => slot,
            None => panic!("{}: symbolic stack underflow", what),
        }
    }

    fn require(&self, n: usize, what: &str) {
        assert!(
            self.stack.len() >= n,
            "{}: needs {} stack elements, found {}",
            what,
            n,
            self.stack.len()
        );
    }

    pub fn push_concrete(&mut self, value: Value) {
        self.stack.push(ConcreteOrSymbolic::Concrete(value));
    }

    pub fn push_symbolic(&mut self, expr: Option<SymExpr>, value: Value) {
        self.stack.push(ConcreteOrSymbolic::new(value, expr));
    }

    pub fn clear_stack(&mut self) {
        tracing::trace!(depth = self.stack.len(), "clear stack");
        self.stack.clear();
        self.return_value = false;
    }

    // Read through the tracked object owning `addr`, else plain memory.
    fn read(&mut self, addr: u64, value: Value) -> Option<SymExpr> {
        let tracker = self.ex.tracker_mut();
        match tracker.find(addr).map(|obj| obj.read(addr, value)) {
            Some(e) => {
                tracker.set_dereferenced(addr, true);
                e
            }
            None => self.mem.read(addr, value),
        }
    }

    // The object epoch a store to `addr` must go into; a dereferenced object
    // is frozen first so earlier reads keep seeing the old contents.
    fn target_object(&mut self, addr: u64) -> Option<&mut SymbolicObject> {
        let tracker = self.ex.tracker_mut();
        tracker.find(addr)?;
        if tracker.is_dereferenced(addr) {
            tracker.store_and_get_new_obj(addr)
        } else {
            tracker.find_mut(addr)
        }
    }

    fn store_slot(&mut self, sym_addr: Option<SymExpr>, addr: u64, slot: ConcreteOrSymbolic) {
        let size = slot.store_size();
        match self.target_object(addr) {
            Some(obj) => obj.write(sym_addr, addr, slot.into_expr()),
            None => match slot {
                ConcreteOrSymbolic::Symbolic(_, e) => self.mem.write(addr, e),
                ConcreteOrSymbolic::Concrete(_) => self.mem.concretize(addr, size),
            },
        }
    }

    pub fn load(&mut self, addr: u64, value: Value) {
        let e = self.read(addr, value);
        tracing::trace!(addr, value = value.integral, symbolic = e.is_some(), "load");
        self.push_symbolic(e, value);
    }

    /// `*p` where the address operand is on top of the stack.
    pub fn deref(&mut self, addr: u64, value: Value) {
        let ptr = self.pop("deref");

        let tracker = self.ex.tracker_mut();
        let sym = match (ptr, tracker.find(addr)) {
            (ConcreteOrSymbolic::Symbolic(_, p), Some(obj)) => Some(SymExpr::deref(
                value,
                obj.manager_idx(),
                obj.snapshot_idx(),
                p,
            )),
            _ => None,
        };

        match sym {
            Some(e) => {
                tracker.set_dereferenced(addr, true);
                self.push_symbolic(Some(e), value);
            }
            None => self.load(addr, value),
        }
    }

    pub fn store(&mut self, addr: u64) {
        let slot = self.pop("store");
        tracing::trace!(addr, symbolic = slot.is_symbolic(), "store");
        self.store_slot(None, addr, slot);
    }

    /// Store through a computed address; the address expression sits below the value.
    pub fn write(&mut self, addr: u64) {
        self.require(2, "write");
        let slot = self.pop("write");
        let dest = self.pop("write");
        tracing::trace!(addr, symbolic = slot.is_symbolic(), "write");
        self.store_slot(dest.expr().cloned(), addr, slot);
    }

    pub fn apply_unary(&mut self, op: UnaryOp, value: Value) {
        let slot = self.pop("unary operator");
        let result = match slot {
            ConcreteOrSymbolic::Symbolic(_, e) => {
                ConcreteOrSymbolic::Symbolic(value, SymExpr::unary(value, op, e))
            }
            ConcreteOrSymbolic::Concrete(_) => ConcreteOrSymbolic::Concrete(value),
        };
        self.stack.push(result);
    }

    pub fn apply_binary(&mut self, op: BinaryOp, value: Value) {
        self.require(2, "binary operator");
        let b = self.pop("binary operator");
        let a = self.pop("binary operator");

        let result = if op == BinaryOp::Concrete || !(a.is_symbolic() || b.is_symbolic()) {
            ConcreteOrSymbolic::Concrete(value)
        } else {
            let e = SymExpr::binary(value, op, a.into_expr(), b.into_expr());
            ConcreteOrSymbolic::Symbolic(value, e)
        };
        self.stack.push(result);
    }

    pub fn apply_compare(&mut self, op: CompareOp, value: Value) {
        self.require(2, "comparison");
        let b = self.pop("comparison");
        let a = self.pop("comparison");

        let result = if a.is_symbolic() || b.is_symbolic() {
            let e = SymExpr::compare(value, op, a.into_expr(), b.into_expr());
            ConcreteOrSymbolic::Symbolic(value, e)
        } else {
            ConcreteOrSymbolic::Concrete(value)
        };
        self.stack.push(result);
    }

    // Widen the index on top of the stack to a long and multiply it by `size`.
    fn scale_up_by(&mut self, signed: bool, size: usize) {
        let (cast, ty) = if signed {
            (UnaryOp::SignedCast, CType::Long)
        } else {
            (UnaryOp::UnsignedCast, CType::ULong)
        };

        let slot = self.pop("pointer scaling");
        let concrete = slot.value().integral;
        let scaled = Value::integral(concrete.wrapping_mul(size as i64), ty);

        let result = match slot {
            ConcreteOrSymbolic::Symbolic(_, mut e) => {
                if e.size() != ty.size() {
                    e = SymExpr::unary(Value::integral(concrete, ty), cast, e);
                }
                let factor = SymExpr::constant(Value::integral(size as i64, ty));
                ConcreteOrSymbolic::Symbolic(scaled, SymExpr::binary(scaled, BinaryOp::Mul, e, factor))
            }
            ConcreteOrSymbolic::Concrete(_) => ConcreteOrSymbolic::Concrete(scaled),
        };
        self.stack.push(result);
    }

    /// Pointer arithmetic with element size `size`; `value` is the program's result.
    pub fn apply_bin_ptr(&mut self, op: PointerOp, size: usize, value: i64) {
        self.require(2, "pointer operator");
        let ty = if op == PointerOp::SubPp {
            CType::Long
        } else {
            CType::ULong
        };
        let result = Value::new(value, 0.0, ty);

        let n = self.stack.len();
        if !(self.stack[n - 2].is_symbolic() || self.stack[n - 1].is_symbolic()) {
            self.stack.pop();
            *self.top_mut("pointer operator") = ConcreteOrSymbolic::Concrete(result);
            return;
        }

        match op {
            PointerOp::AddPi | PointerOp::SAddPi => {
                if size > 1 {
                    self.scale_up_by(op == PointerOp::SAddPi, size);
                }
                self.apply_binary(BinaryOp::Add, result);
            }
            PointerOp::SubPi | PointerOp::SSubPi => {
                if size > 1 {
                    self.scale_up_by(op == PointerOp::SSubPi, size);
                }
                self.apply_binary(BinaryOp::Sub, result);
            }
            PointerOp::SubPp => {
                let n = self.stack.len();
                let bytes = self.stack[n - 2]
                    .value()
                    .integral
                    .wrapping_sub(self.stack[n - 1].value().integral);
                self.apply_binary(BinaryOp::Sub, Value::new(bytes, 0.0, ty));

                if size > 1 {
                    assert!(
                        size.is_power_of_two(),
                        "pointer difference over {}-byte elements is not a power of two",
                        size
                    );
                    let shift = SymExpr::constant(Value::integral(size.trailing_zeros() as i64, ty));
                    let diff = self.pop("pointer operator").into_expr();
                    let e = SymExpr::binary(result, BinaryOp::SShr, diff, shift);
                    self.stack.push(ConcreteOrSymbolic::new(result, Some(e)));
                }
            }
        }

        let top = self.top_mut("pointer operator");
        *top = top.clone().with_value(result);
    }

    pub fn call(&mut self) {
        self.ex.path_mut().push(CALL_BRANCH);
    }

    pub fn ret(&mut self) {
        self.ex.path_mut().push(RETURN_BRANCH);
        assert!(
            self.stack.len() <= 1,
            "return with {} stack elements",
            self.stack.len()
        );
        self.return_value = self.stack.len() == 1;
    }

    /// After a call site: keep the callee's value if it was instrumented,
    /// otherwise replace the stale arguments with the concrete result.
    pub fn handle_return(&mut self, value: Value) {
        if self.return_value {
            assert_eq!(self.stack.len(), 1, "instrumented return leaves one value");
            self.return_value = false;
        } else {
            self.clear_stack();
            self.push_concrete(value);
        }
    }

    pub fn branch(&mut self, bid: BranchId, taken: bool, lineno: i32, fname: &str) {
        assert_eq!(
            self.stack.len(),
            1,
            "branch {} expects exactly one stack element",
            bid
        );

        match self.pop("branch") {
            ConcreteOrSymbolic::Symbolic(_, e) => {
                let constraint = if e.is_predicate() {
                    if taken {
                        e
                    } else {
                        SymExpr::unary(Value::integral(1, CType::Int), UnaryOp::LogicalNot, e)
                    }
                } else {
                    let op = if taken { CompareOp::Neq } else { CompareOp::Eq };
                    let zero = SymExpr::constant_sized(e.size(), Value::new(0, 0.0, e.value().ty));
                    SymExpr::compare(Value::integral(1, CType::Int), op, e, zero)
                };

                tracing::trace!(bid, taken, %constraint, "symbolic branch");
                self.ex
                    .path_mut()
                    .push_constraint(bid, constraint, Location::new(fname, lineno));
            }
            ConcreteOrSymbolic::Concrete(_) => self.ex.path_mut().push(bid),
        }
    }

    pub fn alloc(&mut self, addr: u64, size: usize) {
        self.ex.tracker_mut().add_region(addr, size);
    }

    pub fn free(&mut self, addr: u64) {
        self.ex.tracker_mut().free(addr);
    }

    /// Program exit: move every live object into the snapshot history.
    pub fn exit(&mut self) {
        self.ex.tracker_mut().store_all_obj_and_remove();
    }

    /// Register the next symbolic input stored at `addr` and return the
    /// concrete value the program should continue with.
    pub fn new_input(&mut self, ty: CType, addr: u64, decl: InputDecl, init: Option<Value>) -> Value {
        assert!(ty != CType::Struct, "aggregate inputs are not supported");

        let idx = self.num_inputs;
        let value = match self.ex.supplied_input(idx) {
            Some(supplied) if ty.is_bitfield() => {
                let mask = bit_window(decl.l, decl.h);
                let merged = (supplied.integral as u64 & mask) | (decl.old_value & !mask);
                Value::new(merged as i64, 0.0, ty)
            }
            Some(supplied) => supplied,
            None => init.unwrap_or_else(|| Value::new(decl.old_value as i64, 0.0, ty)),
        };

        let size = ty.size();
        let atomic = SymExpr::atomic(idx as u32, size, value);
        // a bitfield over concrete storage is pinned to its old raw value
        let expr = match self.read(addr, value) {
            Some(e) => e,
            None if ty.is_bitfield() => {
                SymExpr::constant_sized(size, Value::new(decl.old_value as i64, 0.0, ty))
            }
            None => atomic.clone(),
        };

        tracing::trace!(idx, name = %decl.name, ty = %ty, "new input");
        self.ex.push_var(
            InputVar {
                name: decl.name,
                ty,
                location: decl.location,
                old_value: decl.old_value,
                h: decl.h,
                l: decl.l,
                index_size: decl.index_size,
                expr,
            },
            value,
        );

        self.store_slot(None, addr, ConcreteOrSymbolic::Symbolic(value, atomic));
        self.num_inputs += 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Node;

    fn int(v: i64) -> Value {
        Value::integral(v, CType::Int)
    }

    fn decl(name: &str) -> InputDecl {
        InputDecl::new(name, Location::new("t.c", 1))
    }

    #[test]
    fn concrete_operations_stay_concrete() {
        let mut si = SymbolicInterpreter::new();
        si.load(0x1000, int(2));
        si.load(0x1004, int(3));
        si.apply_binary(BinaryOp::Add, int(5));
        assert_eq!(si.stack(), &[ConcreteOrSymbolic::Concrete(int(5))]);

        si.branch(1, true, 10, "t.c");
        assert!(si.execution().path().constraints().is_empty());
        assert_eq!(si.execution().path().branches(), &[1]);
    }

    #[test]
    fn symbolic_input_flows_into_constraint() {
        let mut si = SymbolicInterpreter::new();
        let v = si.new_input(CType::Int, 0x1000, decl("x_1"), None);
        assert_eq!(v, Value::new(0, 0.0, CType::Int));

        si.load(0x1000, int(0));
        si.load(0x2000, int(5));
        si.apply_compare(CompareOp::SGt, int(0));
        si.branch(7, false, 3, "t.c");

        let path = si.execution().path();
        assert_eq!(path.constraints().len(), 1);
        assert_eq!(path.constraints()[0].to_string(), "! (x0 > 5)");
        assert_eq!(path.locations()[0], Location::new("t.c", 3));
    }

    #[test]
    fn non_predicate_branch_compares_with_zero() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Char, 0x1000, decl("c_1"), None);
        si.load(0x1000, Value::integral(0, CType::Char));
        si.branch(2, false, 1, "t.c");
        assert_eq!(si.execution().path().constraints()[0].to_string(), "(x0 == 0)");
    }

    #[test]
    fn concrete_marker_drops_symbolic_state() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Int, 0x1000, decl("x_1"), None);
        si.load(0x1000, int(0));
        si.load(0x2000, int(1));
        si.apply_binary(BinaryOp::Concrete, int(9));
        assert_eq!(si.stack(), &[ConcreteOrSymbolic::Concrete(int(9))]);
    }

    #[test]
    fn store_concrete_forgets_symbolic() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Int, 0x1000, decl("x_1"), None);
        si.push_concrete(int(4));
        si.store(0x1000);
        assert!(si.memory().read(0x1000, int(4)).is_none());
    }

    #[test]
    fn replayed_inputs_and_init_values() {
        let mut si = SymbolicInterpreter::with_inputs(vec![int(6)]);
        assert_eq!(si.new_input(CType::Int, 0x1000, decl("x_1"), None).integral, 6);
        let y = si.new_input(
            CType::Short,
            0x1004,
            decl("y_1"),
            Some(Value::integral(-2, CType::Short)),
        );
        assert_eq!(y.integral, -2);
        assert_eq!(si.execution().inputs().len(), 2);
    }

    #[test]
    fn bitfield_replay_keeps_sibling_bits() {
        // byte 0xb0: field a is bits [0, 4), sibling b holds 0xb in [4, 8)
        let mut si = SymbolicInterpreter::with_inputs(vec![Value::integral(0x0f, CType::BitfieldChar)]);
        let v = si.new_input(
            CType::BitfieldChar,
            0x1000,
            decl("s[0]_1").bitfield(0xb0, 4, 0, 1),
            None,
        );
        assert_eq!(v.integral, 0xbf);
    }

    #[test]
    fn pointer_arithmetic_scales_index() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Int, 0x1000, decl("i_1"), None);
        si.push_concrete(Value::integral(0x4000, CType::Pointer));
        si.load(0x1000, int(2));
        si.apply_bin_ptr(PointerOp::SAddPi, 4, 0x4008);

        let top = &si.stack()[0];
        assert_eq!(top.value(), Value::new(0x4008, 0.0, CType::ULong));
        let e = top.expr().unwrap();
        match e.node() {
            Node::Binary(BinaryOp::Add, _, idx) => {
                assert_eq!(idx.to_string(), "((long) x0 * 4)");
            }
            n => panic!("unexpected node {:?}", n),
        }
    }

    #[test]
    fn pointer_difference_shifts() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Pointer, 0x1000, decl("p_1"), None);
        si.load(0x1000, Value::integral(0x4010, CType::Pointer));
        si.push_concrete(Value::integral(0x4000, CType::Pointer));
        si.apply_bin_ptr(PointerOp::SubPp, 8, 2);

        let e = si.stack()[0].expr().unwrap().clone();
        assert_eq!(e.to_string(), "((x0 - 16384) >> 3)");
        assert_eq!(e.value().integral, 2);
    }

    #[test]
    #[should_panic]
    fn pointer_difference_needs_power_of_two() {
        let mut si = SymbolicInterpreter::new();
        si.new_input(CType::Pointer, 0x1000, decl("p_1"), None);
        si.load(0x1000, Value::integral(0x4018, CType::Pointer));
        si.push_concrete(Value::integral(0x4000, CType::Pointer));
        si.apply_bin_ptr(PointerOp::SubPp, 12, 2);
    }

    #[test]
    fn uninstrumented_return_replaces_stack() {
        let mut si = SymbolicInterpreter::new();
        si.push_concrete(int(1));
        si.push_concrete(int(2));
        si.handle_return(int(3));
        assert_eq!(si.stack(), &[ConcreteOrSymbolic::Concrete(int(3))]);

        si.clear_stack();
        si.call();
        si.push_concrete(int(4));
        si.ret();
        si.handle_return(int(4));
        assert_eq!(si.stack().len(), 1);
        assert_eq!(si.execution().path().branches(), &[CALL_BRANCH, RETURN_BRANCH]);
    }

    #[test]
    #[should_panic]
    fn store_underflow_panics() {
        SymbolicInterpreter::new().store(0x1000);
    }
}
