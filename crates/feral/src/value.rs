//! Tagged heap values with reference counts.
//!
//! Every runtime value is a [`Var`]: a shared cell carrying a payload
//! ([`VarKind`]), a type tag ([`Type`]), and provenance (source id + byte
//! offset) for error reporting. The strong count of the cell is the value's
//! reference count: cloning a `Var` is `iref`, dropping one is `dref`, and
//! the payload is destroyed when the last clone goes away.
//!
//! Containers (`vec`, `map`, `struct` attributes, scopes, the operand
//! stack) own their elements by holding clones. `copy()` is shallow: a new
//! container cell whose elements are shared. `set()` adopts another value's
//! payload in place, which is what reference-bound parameters rely on.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::bytecode::Bytecode;
use crate::srcfile::SrcFile;
use crate::vars::Vars;
use crate::vm::NativeFn;

// ---------------------------------------------------------------------------
// Type identity
// ---------------------------------------------------------------------------

static NEXT_CUSTOM_TYPE: AtomicU32 = AtomicU32::new(0);

/// Process-stable identity of a value's concrete variant.
///
/// Intrinsic variants have fixed tags; struct definitions and native opaque
/// types allocate a fresh `Custom` tag via [`Type::new_custom`]. The `All`
/// sentinel owns the method frame that applies to every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    All,
    Nil,
    Bool,
    Int,
    Flt,
    Str,
    Vec,
    Map,
    Fn,
    Src,
    Custom(u32),
}

impl Type {
    /// Allocate a fresh custom type tag (struct definitions, native types).
    pub fn new_custom() -> Type {
        Type::Custom(NEXT_CUSTOM_TYPE.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Function values
// ---------------------------------------------------------------------------

/// Parameter-list marker of a function value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnMarker {
    /// Plain positional parameters; each binds a shallow copy of its argument.
    None,
    /// Trailing positionals are collected into a `vec` bound to the last
    /// parameter.
    Variadic,
    /// Parameters bind the caller-side cell directly, so assignment inside
    /// the body writes through.
    Reference,
}

/// Body of a function value: a range in its source's instruction stream, or
/// a native handler.
#[derive(Clone)]
pub enum FnBody {
    Script { begin: usize, end: usize },
    Native(NativeFn),
}

/// A callable value. Function values are immutable once constructed.
#[derive(Clone)]
pub struct FnVal {
    /// Canonical path of the defining source; empty for free native functions.
    pub src_path: String,
    /// Source id of the defining unit.
    pub src_id: usize,
    pub params: Vec<String>,
    /// Per-parameter default fragments, executed at bind time when the
    /// caller omits the argument.
    pub defaults: Vec<Option<Arc<Bytecode>>>,
    pub marker: FnMarker,
    pub body: FnBody,
    /// Whether positional 0 is the implicit receiver.
    pub is_member: bool,
}

impl FnVal {
    /// Number of parameters that must be supplied by the caller.
    pub fn required(&self) -> usize {
        self.params
            .iter()
            .zip(&self.defaults)
            .take_while(|(_, d)| d.is_none())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Source values
// ---------------------------------------------------------------------------

/// A loaded source module: immutable file + code, mutable vars frame.
///
/// The registry owns the canonical `src` value per path; scopes and imports
/// hold clones. The vars cell is the only mutable part, and it never owns
/// the registry entry back, keeping the graph acyclic.
#[derive(Clone)]
pub struct SrcVal {
    pub file: Arc<SrcFile>,
    pub vars: Rc<RefCell<Vars>>,
}

// ---------------------------------------------------------------------------
// Native opaque objects
// ---------------------------------------------------------------------------

/// Payload of a native-defined opaque type (file handles, byte buffers, …).
#[derive(Clone)]
pub struct NativeObj {
    pub ty: Type,
    pub data: Rc<RefCell<dyn Any>>,
}

// ---------------------------------------------------------------------------
// VarKind / Var
// ---------------------------------------------------------------------------

/// Closed set of payload variants.
#[derive(Clone)]
pub enum VarKind {
    Nil,
    Bool(bool),
    Int(BigInt),
    Flt(f64),
    Str(String),
    Vec(Vec<Var>),
    Map(IndexMap<String, Var>),
    Struct(IndexMap<String, Var>),
    Fn(Rc<FnVal>),
    Src(SrcVal),
    Native(NativeObj),
}

struct VarCell {
    kind: VarKind,
    ty: Type,
    src_id: usize,
    idx: usize,
}

/// A reference-counted heap value.
#[derive(Clone)]
pub struct Var(Rc<RefCell<VarCell>>);

impl Var {
    /// Create a value with `ref_count = 1` and the intrinsic type of its kind.
    pub fn new(kind: VarKind, src_id: usize, idx: usize) -> Var {
        let ty = intrinsic_type(&kind);
        Var(Rc::new(RefCell::new(VarCell { kind, ty, src_id, idx })))
    }

    /// Create a value carrying a custom type tag (struct instances, native
    /// opaque objects).
    pub fn with_type(kind: VarKind, ty: Type, src_id: usize, idx: usize) -> Var {
        Var(Rc::new(RefCell::new(VarCell { kind, ty, src_id, idx })))
    }

    pub fn nil(src_id: usize, idx: usize) -> Var {
        Var::new(VarKind::Nil, src_id, idx)
    }

    pub fn bool(b: bool, src_id: usize, idx: usize) -> Var {
        Var::new(VarKind::Bool(b), src_id, idx)
    }

    pub fn int(i: impl Into<BigInt>, src_id: usize, idx: usize) -> Var {
        Var::new(VarKind::Int(i.into()), src_id, idx)
    }

    pub fn flt(f: f64, src_id: usize, idx: usize) -> Var {
        Var::new(VarKind::Flt(f), src_id, idx)
    }

    pub fn str(s: impl Into<String>, src_id: usize, idx: usize) -> Var {
        Var::new(VarKind::Str(s.into()), src_id, idx)
    }

    /// Strong count of the underlying cell.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Whether two `Var`s are the same cell.
    pub fn same(&self, other: &Var) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn type_of(&self) -> Type {
        self.0.borrow().ty
    }

    pub fn src_id(&self) -> usize {
        self.0.borrow().src_id
    }

    pub fn idx(&self) -> usize {
        self.0.borrow().idx
    }

    /// Whether the value may be the target of a call instruction.
    pub fn callable(&self) -> bool {
        matches!(self.0.borrow().kind, VarKind::Fn(_))
    }

    /// Whether method lookup consults the attribute table before the type.
    pub fn attr_based(&self) -> bool {
        matches!(
            self.0.borrow().kind,
            VarKind::Struct(_) | VarKind::Src(_)
        )
    }

    /// Run `f` against the payload.
    pub fn with_kind<R>(&self, f: impl FnOnce(&VarKind) -> R) -> R {
        f(&self.0.borrow().kind)
    }

    /// Run `f` against the payload mutably.
    pub fn with_kind_mut<R>(&self, f: impl FnOnce(&mut VarKind) -> R) -> R {
        f(&mut self.0.borrow_mut().kind)
    }

    /// Clone the payload out of the cell.
    pub fn kind(&self) -> VarKind {
        self.0.borrow().kind.clone()
    }

    pub fn as_fn(&self) -> Option<Rc<FnVal>> {
        match &self.0.borrow().kind {
            VarKind::Fn(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn as_src(&self) -> Option<SrcVal> {
        match &self.0.borrow().kind {
            VarKind::Src(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<String> {
        match &self.0.borrow().kind {
            VarKind::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<BigInt> {
        match &self.0.borrow().kind {
            VarKind::Int(i) => Some(i.clone()),
            _ => None,
        }
    }

    /// Shallow copy: containers produce a new cell with shared elements.
    pub fn copy(&self, src_id: usize, idx: usize) -> Var {
        let cell = self.0.borrow();
        Var::with_type(cell.kind.clone(), cell.ty, src_id, idx)
    }

    /// Deep copy for thread forking: every reachable cell is re-created.
    pub fn deep_copy(&self, src_id: usize, idx: usize) -> Var {
        let cell = self.0.borrow();
        let kind = match &cell.kind {
            VarKind::Vec(items) => {
                VarKind::Vec(items.iter().map(|v| v.deep_copy(src_id, idx)).collect())
            }
            VarKind::Map(m) => VarKind::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy(src_id, idx)))
                    .collect(),
            ),
            VarKind::Struct(m) => VarKind::Struct(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy(src_id, idx)))
                    .collect(),
            ),
            VarKind::Src(s) => VarKind::Src(SrcVal {
                file: s.file.clone(),
                vars: Rc::new(RefCell::new(s.vars.borrow().thread_copy(src_id, idx))),
            }),
            other => other.clone(),
        };
        Var::with_type(kind, cell.ty, src_id, idx)
    }

    /// In-place assignment: this cell adopts `from`'s payload and type.
    pub fn set(&self, from: &Var) {
        if self.same(from) {
            return;
        }
        let (kind, ty) = {
            let src = from.0.borrow();
            (src.kind.clone(), src.ty)
        };
        let mut dst = self.0.borrow_mut();
        dst.kind = kind;
        dst.ty = ty;
    }

    /// Replace the payload in place (compound assignment on mutable
    /// variants).
    pub fn adopt_kind(&self, kind: VarKind) {
        let ty = intrinsic_type(&kind);
        let mut cell = self.0.borrow_mut();
        cell.kind = kind;
        cell.ty = ty;
    }

    /// Truthiness of the value.
    pub fn to_bool(&self) -> bool {
        match &self.0.borrow().kind {
            VarKind::Nil => false,
            VarKind::Bool(b) => *b,
            VarKind::Int(i) => *i != BigInt::from(0),
            VarKind::Flt(f) => *f != 0.0,
            VarKind::Str(s) => !s.is_empty(),
            VarKind::Vec(v) => !v.is_empty(),
            VarKind::Map(m) => !m.is_empty(),
            _ => true,
        }
    }

    /// Display form of the value.
    pub fn to_str(&self) -> String {
        match &self.0.borrow().kind {
            VarKind::Nil => "nil".to_string(),
            VarKind::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            VarKind::Int(i) => i.to_string(),
            VarKind::Flt(f) => format_flt(*f),
            VarKind::Str(s) => s.clone(),
            VarKind::Vec(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_str()).collect();
                format!("[{}]", parts.join(", "))
            }
            VarKind::Map(m) => {
                let parts: Vec<String> =
                    m.iter().map(|(k, v)| format!("{}: {}", k, v.to_str())).collect();
                format!("{{{}}}", parts.join(", "))
            }
            VarKind::Struct(m) => {
                let parts: Vec<String> =
                    m.iter().map(|(k, v)| format!("{} = {}", k, v.to_str())).collect();
                format!("struct{{{}}}", parts.join(", "))
            }
            VarKind::Fn(f) => {
                if f.src_path.is_empty() {
                    "function(native)".to_string()
                } else {
                    format!("function({})", f.src_path)
                }
            }
            VarKind::Src(s) => format!("source({})", s.file.path()),
            VarKind::Native(_) => "native-object".to_string(),
        }
    }

    /// Structural equality: containers compare element-wise, numbers compare
    /// widened, opaque values compare by cell identity.
    pub fn equals(&self, other: &Var) -> bool {
        if self.same(other) {
            return true;
        }
        let a = self.0.borrow();
        let b = other.0.borrow();
        match (&a.kind, &b.kind) {
            (VarKind::Nil, VarKind::Nil) => true,
            (VarKind::Bool(x), VarKind::Bool(y)) => x == y,
            (VarKind::Int(x), VarKind::Int(y)) => x == y,
            (VarKind::Flt(x), VarKind::Flt(y)) => x == y,
            (VarKind::Int(x), VarKind::Flt(y)) | (VarKind::Flt(y), VarKind::Int(x)) => {
                x.to_f64().is_some_and(|v| v == *y)
            }
            (VarKind::Str(x), VarKind::Str(y)) => x == y,
            (VarKind::Vec(x), VarKind::Vec(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(p, q)| p.equals(q))
            }
            (VarKind::Map(x), VarKind::Map(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| v.equals(w)))
            }
            (VarKind::Struct(x), VarKind::Struct(y)) => {
                a.ty == b.ty
                    && x.len() == y.len()
                    && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| v.equals(w)))
            }
            _ => false,
        }
    }

    // --- attribute operations (attr-bearing variants only) ---

    pub fn attr_exists(&self, name: &str) -> bool {
        match &self.0.borrow().kind {
            VarKind::Struct(m) => m.contains_key(name),
            VarKind::Src(s) => s.vars.borrow().exists(name),
            _ => false,
        }
    }

    pub fn attr_get(&self, name: &str) -> Option<Var> {
        match &self.0.borrow().kind {
            VarKind::Struct(m) => m.get(name).cloned(),
            VarKind::Src(s) => s.vars.borrow().get(name),
            _ => None,
        }
    }

    /// Insert or replace an attribute. Returns false when the variant does
    /// not carry an attribute table.
    pub fn attr_set(&self, name: &str, val: Var) -> bool {
        match &mut self.0.borrow_mut().kind {
            VarKind::Struct(m) => {
                m.insert(name.to_string(), val);
                true
            }
            VarKind::Src(s) => {
                s.vars.borrow_mut().add_or_replace(name, val);
                true
            }
            _ => false,
        }
    }
}

/// Intrinsic type tag of a payload variant.
fn intrinsic_type(kind: &VarKind) -> Type {
    match kind {
        VarKind::Nil => Type::Nil,
        VarKind::Bool(_) => Type::Bool,
        VarKind::Int(_) => Type::Int,
        VarKind::Flt(_) => Type::Flt,
        VarKind::Str(_) => Type::Str,
        VarKind::Vec(_) => Type::Vec,
        VarKind::Map(_) => Type::Map,
        VarKind::Struct(_) => Type::new_custom(),
        VarKind::Fn(_) => Type::Fn,
        VarKind::Src(_) => Type::Src,
        VarKind::Native(obj) => obj.ty,
    }
}

/// Format a float the way the language prints it: integral values keep one
/// decimal so they stay visually distinct from ints.
fn format_flt(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}
