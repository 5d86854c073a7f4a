use std::fmt;
use std::os::raw::c_int;

use z3::ast::{Array, Ast, Bool, Dynamic, Float, BV};
use z3::{Config, Context, SatResult, Solver as Z3Backend, Sort};
use z3_sys::{Z3_ast, Z3_context, Z3_sort};

use fxhash::FxHashMap as HashMap;

use tracing::{debug, trace};

use super::{Assignment, Error, Solver};

use crate::execution::{InputVar, SymbolicExecution};
use crate::expr::{BinaryOp, CompareOp, Node, SymExpr, UnaryOp};
use crate::object::ObjectTracker;
use crate::value::{self, CType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FpSort {
    Single,
    Double,
}

impl FpSort {
    fn of(ty: CType) -> Option<Self> {
        match ty {
            CType::Float => Some(Self::Single),
            CType::Double => Some(Self::Double),
            _ => None,
        }
    }
}

/// Element sort of an object array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Range {
    Bits(u32),
    Fp(FpSort),
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bits(n) => write!(f, "bv{}", n),
            Self::Fp(FpSort::Single) => f.write_str("f32"),
            Self::Fp(FpSort::Double) => f.write_str("f64"),
        }
    }
}

#[derive(Debug, Clone)]
enum Term<'ctx> {
    Bool(Bool<'ctx>),
    BitVec(BV<'ctx>),
    Float(Float<'ctx>, FpSort),
}

impl<'ctx> Term<'ctx> {
    fn sort_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::BitVec(_) => "bit-vector",
            Self::Float(..) => "floating-point",
        }
    }
}

type ArrayKey = (usize, usize, u32, Range);

fn bits(size: usize) -> u32 {
    8 * size.max(1) as u32
}

fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn resize<'ctx>(bv: BV<'ctx>, width: u32, signed: bool) -> BV<'ctx> {
    let size = bv.get_size();
    if size > width {
        bv.extract(width - 1, 0)
    } else if size < width && signed {
        bv.sign_ext(width - size)
    } else if size < width {
        bv.zero_ext(width - size)
    } else {
        bv
    }
}

fn equalize<'ctx>(a: BV<'ctx>, b: BV<'ctx>, signed: bool) -> (BV<'ctx>, BV<'ctx>) {
    let width = a.get_size().max(b.get_size());
    (resize(a, width, signed), resize(b, width, signed))
}

/// Lowers the expressions of one execution into a z3 solver.
///
/// The object tracker that `Deref` nodes index into is held explicitly, so
/// several contexts over different executions can coexist.
pub struct SolverContext<'ctx> {
    context: &'ctx Context,
    solver: Z3Backend<'ctx>,
    tracker: &'ctx ObjectTracker,
    rne: Dynamic<'ctx>,
    rtz: Dynamic<'ctx>,
    vars: HashMap<u32, Term<'ctx>>,
    terms: HashMap<u64, Term<'ctx>>,
    arrays: HashMap<ArrayKey, Array<'ctx>>,
}

impl<'ctx> SolverContext<'ctx> {
    pub fn new(context: &'ctx Context, tracker: &'ctx ObjectTracker) -> Self {
        let raw = context.get_z3_context();
        let (rne, rtz) = unsafe {
            (
                Dynamic::wrap(context, z3_sys::Z3_mk_fpa_round_nearest_ties_to_even(raw)),
                Dynamic::wrap(context, z3_sys::Z3_mk_fpa_round_toward_zero(raw)),
            )
        };

        Self {
            context,
            solver: Z3Backend::new(context),
            tracker,
            rne,
            rtz,
            vars: HashMap::default(),
            terms: HashMap::default(),
            arrays: HashMap::default(),
        }
    }

    fn raw(&self) -> Z3_context {
        self.context.get_z3_context()
    }

    fn wrap<T: Ast<'ctx>>(&self, ast: Z3_ast) -> T {
        unsafe { T::wrap(self.context, ast) }
    }

    /// Declare `x<i>` for every input and pin what the inputs may not change:
    /// bits outside a bitfield's window and non-finite floats.
    pub fn declare_all(&mut self, vars: &[InputVar]) -> Result<(), Error> {
        for (idx, var) in vars.iter().enumerate() {
            let name = format!("x{}", idx);
            let term = match var.ty {
                CType::Float => Term::Float(
                    Float::new_const_float32(self.context, name),
                    FpSort::Single,
                ),
                CType::Double => Term::Float(
                    Float::new_const_double(self.context, name),
                    FpSort::Double,
                ),
                ty => Term::BitVec(BV::new_const(self.context, name, bits(ty.size()))),
            };
            self.vars.insert(idx as u32, term);
        }

        // pins may mention any input, so they follow the declarations
        for (idx, var) in vars.iter().enumerate() {
            match self.vars.get(&(idx as u32)).cloned() {
                Some(Term::BitVec(x)) if var.ty.is_bitfield() => self.pin_bitfield(&x, var)?,
                Some(Term::Float(x, _)) => self.exclude_non_finite(&x),
                _ => (),
            }
        }
        Ok(())
    }

    fn pin_bitfield(&mut self, x: &BV<'ctx>, var: &InputVar) -> Result<(), Error> {
        let width = x.get_size();
        let (l, h) = (var.l as u32, var.h as u32);
        if l == 0 && h >= width {
            return Ok(());
        }

        let old = self.lower(&var.expr)?;
        let old = resize(self.to_bv(old, var.expr.size(), &var.expr)?, width, false);
        let full = width_mask(width);

        if l > 0 {
            let mask = BV::from_u64(self.context, ((1u64 << l) - 1) & full, width);
            self.solver
                .assert(&x.bvand(&mask)._eq(&old.bvand(&mask)));
        }
        if h < width {
            let mask = BV::from_u64(self.context, (u64::MAX << h) & full, width);
            self.solver
                .assert(&x.bvand(&mask)._eq(&old.bvand(&mask)));
        }
        Ok(())
    }

    fn exclude_non_finite(&self, x: &Float<'ctx>) {
        let (ctx, ast) = (self.raw(), x.get_z3_ast());
        let (nan, inf) = unsafe {
            (
                z3_sys::Z3_mk_fpa_is_nan(ctx, ast),
                z3_sys::Z3_mk_fpa_is_infinite(ctx, ast),
            )
        };
        self.solver.assert(&self.wrap::<Bool>(nan).not());
        self.solver.assert(&self.wrap::<Bool>(inf).not());
    }

    pub fn assert_constraint(&mut self, constraint: &SymExpr) -> Result<(), Error> {
        let term = self.lower(constraint)?;
        let cond = self.to_bool(term)?;
        trace!("assert {}", constraint);
        self.solver.assert(&cond);
        Ok(())
    }

    pub fn check(&self) -> SatResult {
        self.solver.check()
    }

    /// Decode the model of the last successful check.
    pub fn assignment(&self, vars: &[InputVar]) -> Result<Option<Assignment>, Error> {
        let model = match self.solver.get_model() {
            Some(model) => model,
            None => return Ok(None),
        };

        let mut soln = Assignment::new();
        for (idx, var) in vars.iter().enumerate() {
            let term = self
                .vars
                .get(&(idx as u32))
                .ok_or(Error::UnknownVariable(idx as u32))?;

            let value = match term {
                Term::Float(x, sort) => {
                    let v = model.eval(x, true).ok_or(Error::ModelEval(idx))?;
                    let (sign, exp, sig) = self.fp_numeral(&v).ok_or(Error::ModelEval(idx))?;
                    match sort {
                        FpSort::Single => Value::floating(
                            value::set_float_by_ints(sign, exp, sig) as f64,
                            CType::Float,
                        ),
                        FpSort::Double => Value::floating(
                            value::set_double_by_ints(sign, exp, sig),
                            CType::Double,
                        ),
                    }
                }
                Term::BitVec(x) => {
                    let x = if x.get_size() > 64 {
                        x.extract(63, 0)
                    } else {
                        x.clone()
                    };
                    let v = model
                        .eval(&x, true)
                        .and_then(|v| v.as_u64())
                        .ok_or(Error::ModelEval(idx))?;
                    Value::integral(var.ty.cast_integral(v as i64), var.ty)
                }
                Term::Bool(_) => return Err(Error::ModelEval(idx)),
            };
            soln.insert(idx, value);
        }
        Ok(Some(soln))
    }

    fn fp_numeral(&self, f: &Float<'ctx>) -> Option<(bool, i64, u64)> {
        let (ctx, ast) = (self.raw(), f.get_z3_ast());
        let mut sign: c_int = 0;
        let mut exp = 0i64;
        let mut sig = 0u64;
        let ok = unsafe {
            z3_sys::Z3_fpa_get_numeral_sign(ctx, ast, &mut sign)
                && z3_sys::Z3_fpa_get_numeral_exponent_int64(ctx, ast, &mut exp, true)
                && z3_sys::Z3_fpa_get_numeral_significand_uint64(ctx, ast, &mut sig)
        };
        if ok {
            Some((sign != 0, exp, sig))
        } else {
            None
        }
    }

    fn lower(&mut self, e: &SymExpr) -> Result<Term<'ctx>, Error> {
        if let Some(term) = self.terms.get(&e.uid()) {
            return Ok(term.clone());
        }

        let term = match e.node() {
            Node::Atomic(var) => self
                .vars
                .get(var)
                .cloned()
                .ok_or(Error::UnknownVariable(*var))?,
            Node::Const => self.lower_const(e),
            Node::Compare(op, l, r) => self.lower_compare(e, *op, l, r)?,
            Node::Binary(op, l, r) => self.lower_binary(e, *op, l, r)?,
            Node::Unary(op, child) => self.lower_unary(e, *op, child)?,
            Node::Deref {
                manager,
                snapshot,
                addr,
            } => self.lower_deref(e, *manager, *snapshot, addr)?,
        };

        self.terms.insert(e.uid(), term.clone());
        Ok(term)
    }

    fn lower_const(&self, e: &SymExpr) -> Term<'ctx> {
        let v = e.value();
        match v.ty {
            CType::Float => Term::Float(
                Float::from_f32(self.context, v.floating as f32),
                FpSort::Single,
            ),
            CType::Double => Term::Float(Float::from_f64(self.context, v.floating), FpSort::Double),
            _ => Term::BitVec(BV::from_i64(self.context, v.integral, bits(e.size()))),
        }
    }

    fn to_bv(&self, term: Term<'ctx>, size: usize, e: &SymExpr) -> Result<BV<'ctx>, Error> {
        match term {
            Term::BitVec(bv) => Ok(bv),
            Term::Bool(b) => {
                let width = bits(size);
                Ok(b.ite(
                    &BV::from_u64(self.context, 1, width),
                    &BV::from_u64(self.context, 0, width),
                ))
            }
            Term::Float(..) => Err(Error::SortMismatch(e.to_string())),
        }
    }

    fn to_bool(&self, term: Term<'ctx>) -> Result<Bool<'ctx>, Error> {
        match term {
            Term::Bool(b) => Ok(b),
            Term::BitVec(bv) => {
                let zero = BV::from_u64(self.context, 0, bv.get_size());
                Ok(bv._eq(&zero).not())
            }
            Term::Float(f, _) => {
                let is_zero = unsafe { z3_sys::Z3_mk_fpa_is_zero(self.raw(), f.get_z3_ast()) };
                Ok(self.wrap::<Bool>(is_zero).not())
            }
        }
    }

    fn lower_compare(
        &mut self,
        e: &SymExpr,
        op: CompareOp,
        l: &SymExpr,
        r: &SymExpr,
    ) -> Result<Term<'ctx>, Error> {
        let lt = self.lower(l)?;
        let rt = self.lower(r)?;

        let cond = match (lt, rt) {
            (Term::Float(a, sa), Term::Float(b, sb)) => {
                if sa != sb {
                    return Err(Error::SortMismatch(e.to_string()));
                }
                self.fp_compare(op, &a, &b)
            }
            (Term::Float(..), _) | (_, Term::Float(..)) => {
                return Err(Error::SortMismatch(e.to_string()))
            }
            (lt, rt) => {
                let (a, b) = equalize(
                    self.to_bv(lt, l.size(), e)?,
                    self.to_bv(rt, r.size(), e)?,
                    op.is_signed(),
                );
                match op {
                    CompareOp::Eq => a._eq(&b),
                    CompareOp::Neq => a._eq(&b).not(),
                    CompareOp::Gt => a.bvugt(&b),
                    CompareOp::Le => a.bvule(&b),
                    CompareOp::Lt => a.bvult(&b),
                    CompareOp::Ge => a.bvuge(&b),
                    CompareOp::SGt => a.bvsgt(&b),
                    CompareOp::SLe => a.bvsle(&b),
                    CompareOp::SLt => a.bvslt(&b),
                    CompareOp::SGe => a.bvsge(&b),
                }
            }
        };
        Ok(Term::Bool(cond))
    }

    fn fp_compare(&self, op: CompareOp, a: &Float<'ctx>, b: &Float<'ctx>) -> Bool<'ctx> {
        let (ctx, a, b) = (self.raw(), a.get_z3_ast(), b.get_z3_ast());
        let ast = unsafe {
            match op {
                CompareOp::Eq | CompareOp::Neq => z3_sys::Z3_mk_fpa_eq(ctx, a, b),
                CompareOp::Gt | CompareOp::SGt => z3_sys::Z3_mk_fpa_gt(ctx, a, b),
                CompareOp::Le | CompareOp::SLe => z3_sys::Z3_mk_fpa_leq(ctx, a, b),
                CompareOp::Lt | CompareOp::SLt => z3_sys::Z3_mk_fpa_lt(ctx, a, b),
                CompareOp::Ge | CompareOp::SGe => z3_sys::Z3_mk_fpa_geq(ctx, a, b),
            }
        };
        let cond: Bool = self.wrap(ast);
        if op == CompareOp::Neq {
            cond.not()
        } else {
            cond
        }
    }

    fn lower_binary(
        &mut self,
        e: &SymExpr,
        op: BinaryOp,
        l: &SymExpr,
        r: &SymExpr,
    ) -> Result<Term<'ctx>, Error> {
        if op == BinaryOp::Extract {
            // the right operand is the concrete start byte
            let inner = self.lower(l)?;
            let inner = self.to_bv(inner, l.size(), e)?;
            let start = 8 * r.value().integral as u32;
            let end = start + bits(e.size()) - 1;
            return Ok(Term::BitVec(inner.extract(end, start)));
        }

        let lt = self.lower(l)?;
        let rt = self.lower(r)?;

        match (lt, rt) {
            (Term::Float(a, sa), Term::Float(b, sb)) => {
                if sa != sb {
                    return Err(Error::SortMismatch(e.to_string()));
                }
                Ok(Term::Float(self.fp_binary(op, &a, &b)?, sa))
            }
            (Term::Float(..), _) | (_, Term::Float(..)) => Err(Error::SortMismatch(e.to_string())),
            (lt, rt) => {
                let a = self.to_bv(lt, l.size(), e)?;
                let b = self.to_bv(rt, r.size(), e)?;
                if op == BinaryOp::Concat {
                    return Ok(Term::BitVec(a.concat(&b)));
                }

                let (a, b) = equalize(a, b, op.is_signed());
                let bv = match op {
                    BinaryOp::Add => a.bvadd(&b),
                    BinaryOp::Sub => a.bvsub(&b),
                    BinaryOp::Mul => a.bvmul(&b),
                    BinaryOp::Div => a.bvudiv(&b),
                    BinaryOp::SDiv => a.bvsdiv(&b),
                    BinaryOp::Mod => a.bvurem(&b),
                    BinaryOp::SMod => a.bvsrem(&b),
                    BinaryOp::Shl => a.bvshl(&b),
                    BinaryOp::Shr => a.bvlshr(&b),
                    BinaryOp::SShr => a.bvashr(&b),
                    BinaryOp::And => a.bvand(&b),
                    BinaryOp::Or => a.bvor(&b),
                    BinaryOp::Xor => a.bvxor(&b),
                    BinaryOp::Concat | BinaryOp::Extract | BinaryOp::Concrete => {
                        return Err(Error::UnsupportedOp {
                            op: op.as_str(),
                            sort: "bit-vector",
                        })
                    }
                };
                Ok(Term::BitVec(bv))
            }
        }
    }

    fn fp_binary(
        &self,
        op: BinaryOp,
        a: &Float<'ctx>,
        b: &Float<'ctx>,
    ) -> Result<Float<'ctx>, Error> {
        let (ctx, rm) = (self.raw(), self.rne.get_z3_ast());
        let (a, b) = (a.get_z3_ast(), b.get_z3_ast());
        let ast = unsafe {
            match op {
                BinaryOp::Add => z3_sys::Z3_mk_fpa_add(ctx, rm, a, b),
                BinaryOp::Sub => z3_sys::Z3_mk_fpa_sub(ctx, rm, a, b),
                BinaryOp::Mul => z3_sys::Z3_mk_fpa_mul(ctx, rm, a, b),
                BinaryOp::Div | BinaryOp::SDiv => z3_sys::Z3_mk_fpa_div(ctx, rm, a, b),
                BinaryOp::Mod | BinaryOp::SMod => z3_sys::Z3_mk_fpa_rem(ctx, a, b),
                _ => {
                    return Err(Error::UnsupportedOp {
                        op: op.as_str(),
                        sort: "floating-point",
                    })
                }
            }
        };
        Ok(self.wrap(ast))
    }

    fn lower_unary(&mut self, e: &SymExpr, op: UnaryOp, child: &SymExpr) -> Result<Term<'ctx>, Error> {
        let term = self.lower(child)?;

        match op {
            UnaryOp::Negate => match term {
                Term::Float(f, sort) => {
                    let ast = unsafe { z3_sys::Z3_mk_fpa_neg(self.raw(), f.get_z3_ast()) };
                    Ok(Term::Float(self.wrap(ast), sort))
                }
                term => Ok(Term::BitVec(self.to_bv(term, child.size(), e)?.bvneg())),
            },
            UnaryOp::LogicalNot => Ok(Term::Bool(self.to_bool(term)?.not())),
            UnaryOp::BitwiseNot => match term {
                Term::Float(..) => Err(Error::UnsupportedOp {
                    op: op.as_str(),
                    sort: term.sort_name(),
                }),
                term => Ok(Term::BitVec(self.to_bv(term, child.size(), e)?.bvnot())),
            },
            UnaryOp::UnsignedCast => self.cast(e, term, child, false),
            UnaryOp::SignedCast => self.cast(e, term, child, true),
        }
    }

    fn fp_sort(&self, sort: FpSort) -> Z3_sort {
        unsafe {
            match sort {
                FpSort::Single => z3_sys::Z3_mk_fpa_sort_single(self.raw()),
                FpSort::Double => z3_sys::Z3_mk_fpa_sort_double(self.raw()),
            }
        }
    }

    fn cast(
        &self,
        e: &SymExpr,
        term: Term<'ctx>,
        child: &SymExpr,
        signed: bool,
    ) -> Result<Term<'ctx>, Error> {
        let ctx = self.raw();
        let target = FpSort::of(e.value().ty);

        match (term, target) {
            (Term::Float(f, from), Some(to)) if from == to => Ok(Term::Float(f, from)),
            (Term::Float(f, _), Some(to)) => {
                let ast = unsafe {
                    z3_sys::Z3_mk_fpa_to_fp_float(
                        ctx,
                        self.rne.get_z3_ast(),
                        f.get_z3_ast(),
                        self.fp_sort(to),
                    )
                };
                Ok(Term::Float(self.wrap(ast), to))
            }
            (Term::Float(f, _), None) => {
                // C truncates toward zero
                let (rm, width) = (self.rtz.get_z3_ast(), bits(e.size()));
                let ast = unsafe {
                    if signed {
                        z3_sys::Z3_mk_fpa_to_sbv(ctx, rm, f.get_z3_ast(), width)
                    } else {
                        z3_sys::Z3_mk_fpa_to_ubv(ctx, rm, f.get_z3_ast(), width)
                    }
                };
                Ok(Term::BitVec(self.wrap(ast)))
            }
            (term, Some(to)) => {
                let bv = self.to_bv(term, child.size(), e)?;
                let (rm, sort) = (self.rne.get_z3_ast(), self.fp_sort(to));
                let ast = unsafe {
                    if signed {
                        z3_sys::Z3_mk_fpa_to_fp_signed(ctx, rm, bv.get_z3_ast(), sort)
                    } else {
                        z3_sys::Z3_mk_fpa_to_fp_unsigned(ctx, rm, bv.get_z3_ast(), sort)
                    }
                };
                Ok(Term::Float(self.wrap(ast), to))
            }
            (term, None) => {
                let bv = self.to_bv(term, child.size(), e)?;
                Ok(Term::BitVec(resize(bv, bits(e.size()), signed)))
            }
        }
    }

    fn lower_deref(
        &mut self,
        e: &SymExpr,
        manager: usize,
        snapshot: usize,
        addr: &SymExpr,
    ) -> Result<Term<'ctx>, Error> {
        let tracker = self.tracker;
        let object = tracker
            .snapshot(manager, snapshot)
            .ok_or(Error::MissingSnapshot { manager, snapshot })?;

        let addr_bits = bits(addr.size());
        let a = self.lower(addr)?;
        let a = resize(self.to_bv(a, addr.size(), e)?, addr_bits, false);

        let range = match FpSort::of(e.value().ty) {
            Some(sort) => Range::Fp(sort),
            None => Range::Bits(bits(e.size())),
        };
        let array = self.object_array(manager, snapshot, addr_bits, range)?;

        // the address must stay inside the object
        let start = BV::from_u64(self.context, object.start(), addr_bits);
        let end = BV::from_u64(self.context, object.end(), addr_bits);
        self.solver.assert(&a.bvuge(&start));
        self.solver.assert(&a.bvult(&end));

        let v = array.select(&a);
        match range {
            Range::Fp(sort) => Ok(Term::Float(self.wrap(v.get_z3_ast()), sort)),
            Range::Bits(_) => v
                .as_bv()
                .map(Term::BitVec)
                .ok_or_else(|| Error::SortMismatch(e.to_string())),
        }
    }

    /// Array of snapshot `(manager, snapshot)`: the previous snapshot's array
    /// with this snapshot's symbolic writes stored on top.
    fn object_array(
        &mut self,
        manager: usize,
        snapshot: usize,
        addr_bits: u32,
        range: Range,
    ) -> Result<Array<'ctx>, Error> {
        let key = (manager, snapshot, addr_bits, range);
        if let Some(array) = self.arrays.get(&key) {
            return Ok(array.clone());
        }

        let tracker = self.tracker;
        let object = tracker
            .snapshot(manager, snapshot)
            .ok_or(Error::MissingSnapshot { manager, snapshot })?;

        let mut array = if snapshot == 0 {
            let elem = match range {
                Range::Bits(n) => Sort::bitvector(self.context, n),
                Range::Fp(FpSort::Single) => Sort::float32(self.context),
                Range::Fp(FpSort::Double) => Sort::double(self.context),
            };
            Array::new_const(
                self.context,
                format!("a{}_{}_{}", manager, addr_bits, range),
                &Sort::bitvector(self.context, addr_bits),
                &elem,
            )
        } else {
            self.object_array(manager, snapshot - 1, addr_bits, range)?
        };

        for (index, value) in object.writes() {
            let i = self.lower(index)?;
            let i = resize(self.to_bv(i, index.size(), index)?, addr_bits, false);
            let v = self.lower(value)?;

            array = match (range, v) {
                (Range::Fp(sort), Term::Float(f, s)) if sort == s => array.store(&i, &f),
                (Range::Bits(n), v) => {
                    let v = self.to_bv(v, value.size(), value)?;
                    array.store(&i, &resize(v, n, value.value().ty.is_signed()))
                }
                _ => return Err(Error::SortMismatch(value.to_string())),
            };
        }

        self.arrays.insert(key, array.clone());
        Ok(array)
    }
}

/// The z3-backed [`Solver`]; every query gets a fresh solver in a shared
/// context.
pub struct Z3Solver {
    context: Context,
}

impl Default for Z3Solver {
    fn default() -> Self {
        Self::new()
    }
}

impl Z3Solver {
    pub fn new() -> Self {
        let mut config = Config::new();
        config.set_model_generation(true);
        Self {
            context: Context::new(&config),
        }
    }
}

impl Solver for Z3Solver {
    fn solve(
        &mut self,
        ex: &SymbolicExecution,
        constraints: &[SymExpr],
    ) -> Result<Option<Assignment>, Error> {
        let mut cx = SolverContext::new(&self.context, ex.tracker());
        cx.declare_all(ex.vars())?;
        for constraint in constraints {
            cx.assert_constraint(constraint)?;
        }

        match cx.check() {
            SatResult::Sat => cx.assignment(ex.vars()),
            SatResult::Unsat => {
                debug!(constraints = constraints.len(), "unsat");
                Ok(None)
            }
            SatResult::Unknown => {
                debug!(constraints = constraints.len(), "solver gave up");
                Ok(None)
            }
        }
    }
}
