use std::fmt;
use std::ops::Deref;

use hashconsing::{consign, HConsed, HashConsign};

use thiserror::Error;

use crate::value::{CType, Value};

consign! {
    let EXPR = consign(100 * 1024 /* = capacity */) for Expr;
}

#[derive(Debug, Error)]
#[error("invalid {kind} operator {op}")]
pub struct InvalidOp {
    pub kind: &'static str,
    pub op: u8,
}

macro_rules! op_enum {
    ($(#[$attr:meta])* $name:ident, $kind:literal { $($variant:ident = $n:literal => $s:literal),+ $(,)? }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $n),+
        }

        impl $name {
            pub fn from_u8(op: u8) -> Result<Self, InvalidOp> {
                match op {
                    $($n => Ok(Self::$variant),)+
                    _ => Err(InvalidOp { kind: $kind, op }),
                }
            }

            pub fn as_u8(self) -> u8 {
                self as u8
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

op_enum! {
    /// Comparison operators; each pair `(2k, 2k+1)` are negations of each other.
    CompareOp, "compare" {
        Eq = 0 => "==",
        Neq = 1 => "!=",
        Gt = 2 => ">",
        Le = 3 => "<=",
        Lt = 4 => "<",
        Ge = 5 => ">=",
        SGt = 6 => ">",
        SLe = 7 => "<=",
        SLt = 8 => "<",
        SGe = 9 => ">=",
    }
}

op_enum! {
    BinaryOp, "binary" {
        Add = 0 => "+",
        Sub = 1 => "-",
        Mul = 2 => "*",
        Div = 3 => "/",
        SDiv = 4 => "/",
        Mod = 5 => "%",
        SMod = 6 => "%",
        Shl = 7 => "<<",
        Shr = 8 => ">>>",
        SShr = 9 => ">>",
        And = 10 => "&",
        Or = 11 => "|",
        Xor = 12 => "^",
        Concat = 13 => "@",
        Extract = 14 => "<-->",
        Concrete = 15 => "?",
    }
}

op_enum! {
    UnaryOp, "unary" {
        Negate = 0 => "-",
        LogicalNot = 1 => "!",
        BitwiseNot = 2 => "~",
        UnsignedCast = 3 => "u_cast",
        SignedCast = 4 => "s_cast",
    }
}

op_enum! {
    /// Pointer arithmetic; only consumed by the interpreter.
    PointerOp, "pointer" {
        AddPi = 0 => "+",
        SAddPi = 1 => "+",
        SubPi = 2 => "-",
        SSubPi = 3 => "-",
        SubPp = 4 => "-",
    }
}

impl CompareOp {
    pub fn negate(self) -> Self {
        // pairs differ only in the low bit
        match Self::from_u8(self.as_u8() ^ 1) {
            Ok(op) => op,
            Err(_) => unreachable!(),
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::SGt | Self::SLe | Self::SLt | Self::SGe)
    }
}

impl UnaryOp {
    pub fn is_cast(self) -> bool {
        matches!(self, Self::UnsignedCast | Self::SignedCast)
    }
}

impl BinaryOp {
    /// Operators whose operand widening must sign-extend.
    pub fn is_signed(self) -> bool {
        matches!(self, Self::SShr | Self::SMod)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SymExpr(HConsed<Expr>);

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl Deref for SymExpr {
    type Target = Expr;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl From<Expr> for SymExpr {
    fn from(e: Expr) -> Self {
        Self(EXPR.mk(e))
    }
}

impl From<HConsed<Expr>> for SymExpr {
    fn from(e: HConsed<Expr>) -> Self {
        Self(e)
    }
}

impl From<Value> for SymExpr {
    fn from(v: Value) -> Self {
        SymExpr::constant(v)
    }
}

/// The closed set of expression shapes; discriminants are the serialized tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Node {
    Atomic(u32) = 0,                             // input variable
    Compare(CompareOp, SymExpr, SymExpr) = 1,    // T * T -> bool
    Binary(BinaryOp, SymExpr, SymExpr) = 2,      // T * T -> T
    Unary(UnaryOp, SymExpr) = 3,                 // T -> T
    Deref {
        manager: usize,
        snapshot: usize,
        addr: SymExpr,
    } = 4, // OBJ[manager][snapshot][addr]
    Const = 5,
}

impl Node {
    pub const ATOMIC_TAG: u8 = 0;
    pub const COMPARE_TAG: u8 = 1;
    pub const BINARY_TAG: u8 = 2;
    pub const UNARY_TAG: u8 = 3;
    pub const DEREF_TAG: u8 = 4;
    pub const CONST_TAG: u8 = 5;

    pub fn tag(&self) -> u8 {
        match self {
            Node::Atomic(_) => Self::ATOMIC_TAG,
            Node::Compare(..) => Self::COMPARE_TAG,
            Node::Binary(..) => Self::BINARY_TAG,
            Node::Unary(..) => Self::UNARY_TAG,
            Node::Deref { .. } => Self::DEREF_TAG,
            Node::Const => Self::CONST_TAG,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expr {
    value: Value,
    size: usize,
    node: Node,
}

impl Expr {
    pub fn new(node: Node, size: usize, value: Value) -> Self {
        Self { value, size, node }
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self.node, Node::Const)
    }

    pub fn is_predicate(&self) -> bool {
        matches!(self.node, Node::Compare(..))
    }

    fn fmt_const(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.value;
        if v.ty.is_float() {
            write!(f, "{}", v.floating)
        } else if v.integral < 0x4000_0000 {
            write!(f, "{}", v.integral)
        } else {
            write!(f, "{:#x}", v.integral)
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, names: Option<&[String]>) -> fmt::Result {
        match &self.node {
            Node::Atomic(var) => match names.and_then(|ns| ns.get(*var as usize)) {
                Some(name) => f.write_str(name),
                None => write!(f, "x{}", var),
            },
            Node::Const => self.fmt_const(f),
            Node::Compare(op, l, r) => {
                f.write_str("(")?;
                l.fmt_with(f, names)?;
                write!(f, " {} ", op)?;
                r.fmt_with(f, names)?;
                f.write_str(")")
            }
            Node::Binary(op, l, r) => {
                f.write_str("(")?;
                l.fmt_with(f, names)?;
                write!(f, " {} ", op)?;
                r.fmt_with(f, names)?;
                f.write_str(")")
            }
            Node::Unary(op, e) => {
                if op.is_cast() {
                    write!(f, "({}) ", self.value.ty)?;
                } else {
                    write!(f, "{} ", op)?;
                }
                e.fmt_with(f, names)
            }
            Node::Deref {
                manager,
                snapshot,
                addr,
            } => {
                write!(f, "(a!{}{}[ ", manager, snapshot)?;
                addr.fmt_with(f, names)?;
                f.write_str(" ])")
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, None)
    }
}

/// Display adaptor resolving atomic variables to their declared names.
pub struct Named<'a> {
    expr: &'a Expr,
    names: &'a [String],
}

impl<'a> fmt::Display for Named<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.expr.fmt_with(f, Some(self.names))
    }
}

fn byte_mask(n: usize) -> u64 {
    if n >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * n)) - 1
    }
}

fn extract_integral(v: i64, i: usize, n: usize) -> i64 {
    let shifted = if i >= 8 { 0 } else { (v as u64) >> (8 * i) };
    (shifted & byte_mask(n)) as i64
}

impl SymExpr {
    /// Stable identity used for structural sharing on the wire.
    pub fn uid(&self) -> u64 {
        self.0.uid()
    }

    pub fn constant(value: Value) -> SymExpr {
        Self::constant_sized(value.size(), value)
    }

    pub fn constant_sized(size: usize, value: Value) -> SymExpr {
        Expr::new(Node::Const, size, value).into()
    }

    pub fn atomic(var: u32, size: usize, value: Value) -> SymExpr {
        Expr::new(Node::Atomic(var), size, value).into()
    }

    pub fn unary(value: Value, op: UnaryOp, e: SymExpr) -> SymExpr {
        Expr::new(Node::Unary(op, e), value.size(), value).into()
    }

    pub fn binary(value: Value, op: BinaryOp, l: SymExpr, r: SymExpr) -> SymExpr {
        Expr::new(Node::Binary(op, l, r), value.size(), value).into()
    }

    pub fn compare(value: Value, op: CompareOp, l: SymExpr, r: SymExpr) -> SymExpr {
        Expr::new(Node::Compare(op, l, r), value.size(), value).into()
    }

    /// `*addr` against snapshot `(manager, snapshot)` of a tracked object.
    pub fn deref(value: Value, manager: usize, snapshot: usize, addr: SymExpr) -> SymExpr {
        Expr::new(
            Node::Deref {
                manager,
                snapshot,
                addr,
            },
            value.size(),
            value,
        )
        .into()
    }

    pub fn const_deref(value: Value, manager: usize, snapshot: usize, addr: u64) -> SymExpr {
        let addr = SymExpr::constant(Value::integral(addr as i64, CType::ULong));
        Self::deref(value, manager, snapshot, addr)
    }

    /// Byte concatenation; `high` occupies the more significant bytes.
    pub fn concatenate(high: SymExpr, low: SymExpr) -> SymExpr {
        let shift = 8 * low.size();
        let high_bits = if shift >= 64 {
            0
        } else {
            (high.value().integral as u64) << shift
        };
        let integral = high_bits.wrapping_add(low.value().integral as u64 & byte_mask(low.size()));
        let value = Value::integral(integral as i64, CType::ULong);
        let size = high.size() + low.size();
        Expr::new(Node::Binary(BinaryOp::Concat, high, low), size, value).into()
    }

    /// Bytes `[i, i+n)` of a concrete value of `size` bytes.
    pub fn extract_value_bytes(size: usize, value: Value, i: usize, n: usize) -> SymExpr {
        assert!(i + n <= size, "extract [{}, {}) outside {} bytes", i, i + n, size);
        let mut v = value;
        v.integral = extract_integral(value.integral, i, n);
        Self::constant_sized(n, v)
    }

    /// Bytes `[i, i+n)` of `e`.
    pub fn extract_bytes(e: SymExpr, i: usize, n: usize) -> SymExpr {
        assert!(
            i + n <= e.size(),
            "extract [{}, {}) outside {} bytes",
            i,
            i + n,
            e.size()
        );
        if e.is_concrete() {
            return Self::extract_value_bytes(e.size(), e.value(), i, n);
        }

        let value = Value::integral(extract_integral(e.value().integral, i, n), CType::ULong);
        let start = SymExpr::constant(Value::integral(i as i64, CType::ULong));
        Expr::new(Node::Binary(BinaryOp::Extract, e, start), n, value).into()
    }

    pub fn named<'a>(&'a self, names: &'a [String]) -> Named<'a> {
        Named {
            expr: &**self,
            names,
        }
    }
}
