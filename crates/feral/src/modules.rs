//! Built-in native modules.
//!
//! These are the modules every installation ships compiled in: `core` and
//! `utils` (loaded by [`Vm::load_core_mods`]), the `str`, `vec`, and `map`
//! method sets, and `json`. They register through the same descriptor
//! surface an out-of-tree shared object would use, so [`Vm::nmod_load`]
//! consults this table before touching the dynamic linker.
//!
//! Operators are methods: `1 + 2` is a member call of `+` on the left
//! operand, dispatched through the type-function table that `core` fills.

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::dynlib::NativeFnDesc;
use crate::error::Error;
use crate::operators::{ArithOp, CmpOp, arith_binop, compare, negate};
use crate::value::{Type, Var, VarKind};
use crate::vm::{FnData, Vm, int_to_usize};

/// Initializer of a built-in module; mirrors `init_<name>` of the shared
/// object ABI.
pub type ModInitFn = fn(&mut Vm, usize, usize) -> bool;

/// Look up a built-in module by leaf name.
pub fn builtin(name: &str) -> Option<ModInitFn> {
    match name {
        "core" => Some(init_core),
        "utils" => Some(init_utils),
        "str" => Some(init_str),
        "vec" => Some(init_vec),
        "map" => Some(init_map),
        "json" => Some(init_json),
        _ => None,
    }
}

// ===========================================================================
// core
// ===========================================================================

pub fn init_core(vm: &mut Vm, src_id: usize, idx: usize) -> bool {
    vm.gadd_native_fn(NativeFnDesc::variadic("println", 0, core_println));
    vm.gadd_native_fn(NativeFnDesc::variadic("print", 0, core_print));
    vm.gadd_native_fn(NativeFnDesc::variadic("exit", 0, core_exit));
    vm.gadd_native_fn(NativeFnDesc::new("type_of", 1, core_type_of));
    vm.gadd_native_fn(NativeFnDesc::new("copy", 1, core_copy));
    vm.gadd_native_fn(NativeFnDesc::new("mload", 1, core_mload));

    for ty in [Type::Int, Type::Flt] {
        vm.add_native_typefn(ty, NativeFnDesc::new("+", 1, core_add), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("-", 1, core_sub), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("*", 1, core_mul), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("/", 1, core_div), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("%", 1, core_mod), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("+=", 1, core_add_assign), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("-=", 1, core_sub_assign), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("*=", 1, core_mul_assign), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("/=", 1, core_div_assign), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("%=", 1, core_mod_assign), src_id, idx);
        vm.add_native_typefn(ty, NativeFnDesc::new("u-", 0, core_neg), src_id, idx);
        add_cmp_typefns(vm, ty, src_id, idx);
    }

    vm.add_native_typefn(Type::Str, NativeFnDesc::new("+", 1, core_add), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("*", 1, core_mul), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("+=", 1, core_add_assign), src_id, idx);
    add_cmp_typefns(vm, Type::Str, src_id, idx);

    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("+", 1, core_add), src_id, idx);

    vm.add_native_typefn(Type::All, NativeFnDesc::new("==", 1, all_eq), src_id, idx);
    vm.add_native_typefn(Type::All, NativeFnDesc::new("!=", 1, all_ne), src_id, idx);
    vm.add_native_typefn(Type::All, NativeFnDesc::new("str", 0, all_str), src_id, idx);
    vm.add_native_typefn(Type::All, NativeFnDesc::new("!", 0, all_not), src_id, idx);
    true
}

fn add_cmp_typefns(vm: &mut Vm, ty: Type, src_id: usize, idx: usize) {
    vm.add_native_typefn(ty, NativeFnDesc::new("<", 1, core_lt), src_id, idx);
    vm.add_native_typefn(ty, NativeFnDesc::new("<=", 1, core_le), src_id, idx);
    vm.add_native_typefn(ty, NativeFnDesc::new(">", 1, core_gt), src_id, idx);
    vm.add_native_typefn(ty, NativeFnDesc::new(">=", 1, core_ge), src_id, idx);
}

fn core_println(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let text: String = fd.args.iter().map(|a| a.to_str()).collect();
    vm.write_out(&text);
    vm.write_out("\n");
    Some(vm.nil.clone())
}

fn core_print(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let text: String = fd.args.iter().map(|a| a.to_str()).collect();
    vm.write_out(&text);
    Some(vm.nil.clone())
}

fn core_exit(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let code = fd
        .args
        .first()
        .and_then(|a| a.as_int())
        .and_then(|i| i.to_i32())
        .unwrap_or(0);
    vm.exit_called = true;
    vm.exit_code = code;
    Some(vm.nil.clone())
}

fn core_type_of(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let name = vm.type_name_of(&fd.args[0]);
    Some(Var::str(name, fd.src_id, fd.idx))
}

fn core_copy(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(fd.args[0].copy(fd.src_id, fd.idx))
}

fn core_mload(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let spec = match fd.args[0].as_str() {
        Some(s) => s,
        None => {
            let t = vm.type_name_of(&fd.args[0]);
            let err = Error::Dispatch(format!("expected string module name, found: {}", t));
            vm.fail_err(fd.src_id, fd.idx, err);
            return None;
        }
    };
    if !vm.nmod_load(&spec, fd.src_id, fd.idx) {
        return None;
    }
    Some(vm.nil.clone())
}

// --- arithmetic ---

fn binop(vm: &mut Vm, fd: &FnData, op: ArithOp) -> Option<Var> {
    let res = fd.args[0].with_kind(|a| fd.args[1].with_kind(|b| arith_binop(op, a, b)));
    match res {
        Ok(kind) => Some(Var::new(kind, fd.src_id, fd.idx)),
        Err(err) => {
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn binop_assign(vm: &mut Vm, fd: &FnData, op: ArithOp) -> Option<Var> {
    let res = fd.args[0].with_kind(|a| fd.args[1].with_kind(|b| arith_binop(op, a, b)));
    match res {
        Ok(kind) => {
            fd.args[0].adopt_kind(kind);
            Some(fd.args[0].clone())
        }
        Err(err) => {
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn cmp(vm: &mut Vm, fd: &FnData, op: CmpOp) -> Option<Var> {
    let res = fd.args[0].with_kind(|a| fd.args[1].with_kind(|b| compare(op, a, b)));
    match res {
        Ok(true) => Some(vm.tru.clone()),
        Ok(false) => Some(vm.fals.clone()),
        Err(err) => {
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn core_add(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop(vm, fd, ArithOp::Add)
}
fn core_sub(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop(vm, fd, ArithOp::Sub)
}
fn core_mul(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop(vm, fd, ArithOp::Mul)
}
fn core_div(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop(vm, fd, ArithOp::Div)
}
fn core_mod(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop(vm, fd, ArithOp::Mod)
}
fn core_add_assign(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop_assign(vm, fd, ArithOp::Add)
}
fn core_sub_assign(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop_assign(vm, fd, ArithOp::Sub)
}
fn core_mul_assign(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop_assign(vm, fd, ArithOp::Mul)
}
fn core_div_assign(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop_assign(vm, fd, ArithOp::Div)
}
fn core_mod_assign(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    binop_assign(vm, fd, ArithOp::Mod)
}
fn core_lt(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    cmp(vm, fd, CmpOp::Lt)
}
fn core_le(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    cmp(vm, fd, CmpOp::Le)
}
fn core_gt(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    cmp(vm, fd, CmpOp::Gt)
}
fn core_ge(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    cmp(vm, fd, CmpOp::Ge)
}

fn core_neg(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    match fd.args[0].with_kind(negate) {
        Ok(kind) => Some(Var::new(kind, fd.src_id, fd.idx)),
        Err(err) => {
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn all_eq(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(if fd.args[0].equals(&fd.args[1]) {
        vm.tru.clone()
    } else {
        vm.fals.clone()
    })
}

fn all_ne(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(if fd.args[0].equals(&fd.args[1]) {
        vm.fals.clone()
    } else {
        vm.tru.clone()
    })
}

fn all_str(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(Var::str(fd.args[0].to_str(), fd.src_id, fd.idx))
}

fn all_not(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(if fd.args[0].to_bool() {
        vm.fals.clone()
    } else {
        vm.tru.clone()
    })
}

// ===========================================================================
// utils
// ===========================================================================

pub fn init_utils(vm: &mut Vm, _src_id: usize, _idx: usize) -> bool {
    vm.gadd_native_fn(NativeFnDesc::variadic("range", 1, utils_range));
    vm.gadd_native_fn(NativeFnDesc::variadic("assert", 1, utils_assert));
    vm.gadd_native_fn(NativeFnDesc::new("struct_new", 0, utils_struct_new));
    vm.gadd_native_fn(NativeFnDesc::new("int", 1, utils_int));
    true
}

fn utils_range(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let mut bounds = Vec::with_capacity(3);
    for arg in &fd.args {
        match arg.as_int() {
            Some(i) => bounds.push(i),
            None => {
                let t = vm.type_name_of(arg);
                let err = Error::Dispatch(format!("range() expects integers, found: {}", t));
                vm.fail_err(fd.src_id, fd.idx, err);
                return None;
            }
        }
    }
    let (start, stop, step) = match bounds.len() {
        1 => (BigInt::from(0), bounds[0].clone(), BigInt::from(1)),
        2 => (bounds[0].clone(), bounds[1].clone(), BigInt::from(1)),
        3 => (bounds[0].clone(), bounds[1].clone(), bounds[2].clone()),
        n => {
            let err = Error::Dispatch(format!("range() takes 1 to 3 arguments, found {}", n));
            vm.fail_err(fd.src_id, fd.idx, err);
            return None;
        }
    };
    if step == BigInt::from(0) {
        vm.fail_err(fd.src_id, fd.idx, Error::Domain("range() step cannot be zero".to_string()));
        return None;
    }
    let mut items = Vec::new();
    let ascending = step > BigInt::from(0);
    let mut cur = start;
    while (ascending && cur < stop) || (!ascending && cur > stop) {
        items.push(Var::int(cur.clone(), fd.src_id, fd.idx));
        cur += &step;
    }
    Some(Var::new(VarKind::Vec(items), fd.src_id, fd.idx))
}

fn utils_assert(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    if fd.args[0].to_bool() {
        return Some(vm.nil.clone());
    }
    let msg = fd
        .args
        .get(1)
        .map(|m| m.to_str())
        .unwrap_or_else(|| "condition was false".to_string());
    vm.fail_err(fd.src_id, fd.idx, Error::AssertionFailed(msg));
    None
}

fn utils_struct_new(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let v = Var::new(VarKind::Struct(IndexMap::new()), fd.src_id, fd.idx);
    vm.set_typename(v.type_of(), "struct");
    Some(v)
}

fn utils_int(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let arg = &fd.args[0];
    let parsed = arg.with_kind(|k| match k {
        VarKind::Int(i) => Some(i.clone()),
        VarKind::Flt(f) if f.is_finite() => BigInt::from_f64(f.trunc()),
        VarKind::Str(s) => s.trim().parse::<BigInt>().ok(),
        VarKind::Bool(b) => Some(BigInt::from(if *b { 1 } else { 0 })),
        _ => None,
    });
    match parsed {
        Some(i) => Some(Var::int(i, fd.src_id, fd.idx)),
        None => {
            let err = Error::Domain(format!("cannot convert '{}' to int", arg.to_str()));
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

// ===========================================================================
// str
// ===========================================================================

pub fn init_str(vm: &mut Vm, src_id: usize, idx: usize) -> bool {
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("len", 0, str_len), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("clear", 0, str_clear), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("empty", 0, str_empty), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("front", 0, str_front), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("back", 0, str_back), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("push", 1, str_push), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("pop", 0, str_pop), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("ischat", 2, str_ischat), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("set", 2, str_set), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("insert", 2, str_insert), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("erase", 1, str_erase), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("find", 1, str_find), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("rfind", 1, str_rfind), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("substr", 2, str_substr), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("lastidx", 0, str_lastidx), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("trim", 0, str_trim), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("upper", 0, str_upper), src_id, idx);
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("lower", 0, str_lower), src_id, idx);
    vm.add_native_typefn(
        Type::Str,
        NativeFnDesc::new("split_native", 1, str_split),
        src_id,
        idx,
    );
    vm.add_native_typefn(
        Type::Str,
        NativeFnDesc::new("starts_with", 1, str_starts_with),
        src_id,
        idx,
    );
    vm.add_native_typefn(
        Type::Str,
        NativeFnDesc::new("ends_with", 1, str_ends_with),
        src_id,
        idx,
    );
    vm.add_native_typefn(
        Type::Str,
        NativeFnDesc::new("getBinStrFromHexStr", 0, str_hex_to_bin),
        src_id,
        idx,
    );
    vm.add_native_typefn(
        Type::Str,
        NativeFnDesc::new("getUTF8CharFromBinStr", 0, str_utf8_from_bin),
        src_id,
        idx,
    );
    vm.add_native_typefn(Type::Str, NativeFnDesc::new("byt", 0, str_byt), src_id, idx);
    vm.add_native_typefn(Type::Int, NativeFnDesc::new("chr", 0, int_chr), src_id, idx);
    true
}

fn want_str(vm: &mut Vm, fd: &FnData, i: usize, ctx: &str) -> Option<String> {
    match fd.args[i].as_str() {
        Some(s) => Some(s),
        None => {
            let t = vm.type_name_of(&fd.args[i]);
            let err =
                Error::Dispatch(format!("expected string argument for {}, found: {}", ctx, t));
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn want_idx(vm: &mut Vm, fd: &FnData, i: usize, ctx: &str) -> Option<usize> {
    match int_to_usize(&fd.args[i]) {
        Some(n) => Some(n),
        None => {
            let t = vm.type_name_of(&fd.args[i]);
            let err =
                Error::Dispatch(format!("expected integer index for {}, found: {}", ctx, t));
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

fn recv_str(fd: &FnData) -> String {
    fd.args[0].as_str().unwrap_or_default()
}

fn str_len(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(Var::int(recv_str(fd).len() as i64, fd.src_id, fd.idx))
}

fn str_clear(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k {
            s.clear();
        }
    });
    Some(vm.nil.clone())
}

fn str_empty(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(if recv_str(fd).is_empty() { vm.tru.clone() } else { vm.fals.clone() })
}

fn str_front(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let s = recv_str(fd);
    match s.as_bytes().first() {
        Some(b) => Some(Var::str((*b as char).to_string(), fd.src_id, fd.idx)),
        None => Some(vm.nil.clone()),
    }
}

fn str_back(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let s = recv_str(fd);
    match s.as_bytes().last() {
        Some(b) => Some(Var::str((*b as char).to_string(), fd.src_id, fd.idx)),
        None => Some(vm.nil.clone()),
    }
}

fn str_push(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let addend = want_str(vm, fd, 1, "string.push()")?;
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k {
            s.push_str(&addend);
        }
    });
    Some(fd.args[0].clone())
}

fn str_pop(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k {
            s.pop();
        }
    });
    Some(fd.args[0].clone())
}

// Whether the byte at a position is one of the given characters; the set
// may be a string or a single character code.
fn str_ischat(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "string.ischat()")?;
    let chars = fd.args[2].with_kind(|k| match k {
        VarKind::Str(s) => Some(s.clone()),
        VarKind::Int(i) => {
            let b = i.to_i64().map(|v| (v & 0xff) as u8).unwrap_or(0);
            Some((b as char).to_string())
        }
        _ => None,
    });
    let chars = match chars {
        Some(c) => c,
        None => {
            let t = vm.type_name_of(&fd.args[2]);
            let err = Error::Dispatch(format!(
                "expected string or integer characters for string.ischat(), found: {}",
                t
            ));
            vm.fail_err(fd.src_id, fd.idx, err);
            return None;
        }
    };
    let s = recv_str(fd);
    if pos >= s.len() {
        let err = Error::Domain(format!(
            "position {} is not within string of length {}",
            pos,
            s.len()
        ));
        vm.fail_err(fd.src_id, fd.idx, err);
        return None;
    }
    let b = s.as_bytes()[pos];
    Some(if chars.as_bytes().contains(&b) { vm.tru.clone() } else { vm.fals.clone() })
}

fn str_set(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "string.set()")?;
    let with = want_str(vm, fd, 2, "string.set()")?;
    let len = recv_str(fd).len();
    if pos >= len {
        let err = Error::Domain(format!(
            "position {} is not within string of length {}",
            pos, len
        ));
        vm.fail_err(fd.src_id, fd.idx, err);
        return None;
    }
    if let Some(b) = with.as_bytes().first() {
        fd.args[0].with_kind_mut(|k| {
            if let VarKind::Str(s) = k {
                let mut bytes = std::mem::take(s).into_bytes();
                bytes[pos] = *b;
                *s = String::from_utf8_lossy(&bytes).into_owned();
            }
        });
    }
    Some(fd.args[0].clone())
}

fn str_insert(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "string.insert()")?;
    let with = want_str(vm, fd, 2, "string.insert()")?;
    let len = recv_str(fd).len();
    if pos > len || !recv_str(fd).is_char_boundary(pos) {
        let err = Error::Domain(format!(
            "position {} is not valid in string of length {}",
            pos, len
        ));
        vm.fail_err(fd.src_id, fd.idx, err);
        return None;
    }
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k {
            s.insert_str(pos, &with);
        }
    });
    Some(fd.args[0].clone())
}

fn str_erase(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "string.erase()")?;
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k
            && pos < s.len()
            && s.is_char_boundary(pos)
        {
            s.remove(pos);
        }
    });
    Some(fd.args[0].clone())
}

fn str_find(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let what = want_str(vm, fd, 1, "string.find()")?;
    let s = recv_str(fd);
    let pos = match s.find(&what) {
        Some(p) => p as i64,
        None => -1,
    };
    Some(Var::int(pos, fd.src_id, fd.idx))
}

fn str_rfind(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let what = want_str(vm, fd, 1, "string.rfind()")?;
    let s = recv_str(fd);
    let pos = match s.rfind(&what) {
        Some(p) => p as i64,
        None => -1,
    };
    Some(Var::int(pos, fd.src_id, fd.idx))
}

fn str_substr(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "string.substr()")?;
    let len = want_idx(vm, fd, 2, "string.substr()")?;
    let s = recv_str(fd);
    let end = (pos + len).min(s.len());
    match s.get(pos..end) {
        Some(sub) => Some(Var::str(sub.to_string(), fd.src_id, fd.idx)),
        None => {
            let err = Error::Domain(format!(
                "position {} is not within string of length {}",
                pos,
                s.len()
            ));
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

// Index of the last byte, -1 for the empty string.
fn str_lastidx(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(Var::int(recv_str(fd).len() as i64 - 1, fd.src_id, fd.idx))
}

fn str_trim(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Str(s) = k {
            *s = s.trim().to_string();
        }
    });
    Some(fd.args[0].clone())
}

fn str_upper(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(Var::str(recv_str(fd).to_uppercase(), fd.src_id, fd.idx))
}

fn str_lower(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    Some(Var::str(recv_str(fd).to_lowercase(), fd.src_id, fd.idx))
}

fn str_split(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let delim = want_str(vm, fd, 1, "delimiter")?;
    let delim = match delim.chars().next() {
        Some(c) => c,
        None => {
            let err = Error::Domain("found empty delimiter for string split".to_string());
            vm.fail_err(fd.src_id, fd.idx, err);
            return None;
        }
    };
    // Empty segments are dropped, per split's contract.
    let items: Vec<Var> = recv_str(fd)
        .split(delim)
        .filter(|part| !part.is_empty())
        .map(|part| Var::str(part.to_string(), fd.src_id, fd.idx))
        .collect();
    Some(Var::new(VarKind::Vec(items), fd.src_id, fd.idx))
}

fn str_starts_with(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let with = want_str(vm, fd, 1, "string.starts_with()")?;
    Some(if recv_str(fd).starts_with(&with) { vm.tru.clone() } else { vm.fals.clone() })
}

fn str_ends_with(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let with = want_str(vm, fd, 1, "string.ends_with()")?;
    Some(if recv_str(fd).ends_with(&with) { vm.tru.clone() } else { vm.fals.clone() })
}

// Hex digits to their binary expansion, leading zeros stripped.
fn str_hex_to_bin(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let s = recv_str(fd);
    let mut bin = String::with_capacity(s.len() * 4);
    for ch in s.chars() {
        let digit = match ch.to_digit(16) {
            Some(d) => d,
            None => {
                let err =
                    Error::Domain(format!("expected hex string, found character: {}", ch));
                vm.fail_err(fd.src_id, fd.idx, err);
                return None;
            }
        };
        bin.push_str(&format!("{:04b}", digit));
    }
    let bin = bin.trim_start_matches('0').to_string();
    Some(Var::str(bin, fd.src_id, fd.idx))
}

// Binary digits (up to 21, the UTF-8 code point width) to the character
// they encode.
fn str_utf8_from_bin(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let s = recv_str(fd);
    if s.is_empty() {
        return Some(Var::str("", fd.src_id, fd.idx));
    }
    if s.len() > 21 {
        let err = Error::Domain(format!(
            "UTF-8 cannot be more than 21 bits, found bits: {}",
            s.len()
        ));
        vm.fail_err(fd.src_id, fd.idx, err);
        return None;
    }
    for ch in s.chars() {
        if ch != '0' && ch != '1' {
            let err = Error::Domain(format!("expected bin string, found character: {}", ch));
            vm.fail_err(fd.src_id, fd.idx, err);
            return None;
        }
    }
    let code = u32::from_str_radix(&s, 2).unwrap_or(0);
    match char::from_u32(code) {
        Some(ch) => Some(Var::str(ch.to_string(), fd.src_id, fd.idx)),
        None => {
            let err = Error::Domain(format!("{} is not a valid character code point", code));
            vm.fail_err(fd.src_id, fd.idx, err);
            None
        }
    }
}

// First byte of the string as an integer; 0 for the empty string.
fn str_byt(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let b = recv_str(fd).as_bytes().first().copied().unwrap_or(0);
    Some(Var::int(b as i64, fd.src_id, fd.idx))
}

// Integer (mod 256) to a one-byte string.
fn int_chr(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let b = fd.args[0]
        .as_int()
        .and_then(|i| i.to_i64())
        .map(|v| (v & 0xff) as u8)
        .unwrap_or(0);
    Some(Var::str((b as char).to_string(), fd.src_id, fd.idx))
}

// ===========================================================================
// vec
// ===========================================================================

pub fn init_vec(vm: &mut Vm, src_id: usize, idx: usize) -> bool {
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("len", 0, vec_len), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("empty", 0, vec_empty), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("push", 1, vec_push), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("pop", 0, vec_pop), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("front", 0, vec_front), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("back", 0, vec_back), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("at", 1, vec_at), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("insert", 2, vec_insert), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("erase", 1, vec_erase), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("find", 1, vec_find), src_id, idx);
    vm.add_native_typefn(Type::Vec, NativeFnDesc::new("slice", 2, vec_slice), src_id, idx);
    true
}

fn vec_len(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let len = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.len(),
        _ => 0,
    });
    Some(Var::int(len as i64, fd.src_id, fd.idx))
}

fn vec_empty(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let empty = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.is_empty(),
        _ => true,
    });
    Some(if empty { vm.tru.clone() } else { vm.fals.clone() })
}

fn vec_push(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let elem = fd.args[1].clone();
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Vec(v) = k {
            v.push(elem);
        }
    });
    Some(fd.args[0].clone())
}

fn vec_pop(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let popped = fd.args[0].with_kind_mut(|k| match k {
        VarKind::Vec(v) => v.pop(),
        _ => None,
    });
    Some(popped.unwrap_or_else(|| vm.nil.clone()))
}

fn vec_front(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let front = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.first().cloned(),
        _ => None,
    });
    Some(front.unwrap_or_else(|| vm.nil.clone()))
}

fn vec_back(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let back = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.last().cloned(),
        _ => None,
    });
    Some(back.unwrap_or_else(|| vm.nil.clone()))
}

fn vec_at(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "vec.at()")?;
    let elem = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.get(pos).cloned(),
        _ => None,
    });
    match elem {
        Some(e) => Some(e),
        None => {
            vm.fail_err(fd.src_id, fd.idx, Error::Domain(format!("index {} is out of range", pos)));
            None
        }
    }
}

fn vec_insert(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "vec.insert()")?;
    let elem = fd.args[2].clone();
    let len = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.len(),
        _ => 0,
    });
    if pos > len {
        vm.fail_err(fd.src_id, fd.idx, Error::Domain(format!("index {} is out of range", pos)));
        return None;
    }
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Vec(v) = k {
            v.insert(pos, elem);
        }
    });
    Some(fd.args[0].clone())
}

fn vec_erase(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let pos = want_idx(vm, fd, 1, "vec.erase()")?;
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Vec(v) = k
            && pos < v.len()
        {
            v.remove(pos);
        }
    });
    Some(fd.args[0].clone())
}

// New vec over `[begin, begin + len)`, elements shared with the receiver.
fn vec_slice(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let begin = want_idx(vm, fd, 1, "vec.slice()")?;
    let len = want_idx(vm, fd, 2, "vec.slice()")?;
    let items = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => {
            let begin = begin.min(v.len());
            let end = (begin + len).min(v.len());
            v[begin..end].to_vec()
        }
        _ => Vec::new(),
    });
    Some(Var::new(VarKind::Vec(items), fd.src_id, fd.idx))
}

fn vec_find(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let found = fd.args[0].with_kind(|k| match k {
        VarKind::Vec(v) => v.iter().position(|e| e.equals(&fd.args[1])),
        _ => None,
    });
    let pos = found.map(|p| p as i64).unwrap_or(-1);
    Some(Var::int(pos, fd.src_id, fd.idx))
}

// ===========================================================================
// map
// ===========================================================================

pub fn init_map(vm: &mut Vm, src_id: usize, idx: usize) -> bool {
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("len", 0, map_len), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("empty", 0, map_empty), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("insert", 2, map_insert), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("erase", 1, map_erase), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("get", 1, map_get), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("find", 1, map_find), src_id, idx);
    vm.add_native_typefn(Type::Map, NativeFnDesc::new("keys", 0, map_keys), src_id, idx);
    true
}

fn map_len(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let len = fd.args[0].with_kind(|k| match k {
        VarKind::Map(m) => m.len(),
        _ => 0,
    });
    Some(Var::int(len as i64, fd.src_id, fd.idx))
}

fn map_empty(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let empty = fd.args[0].with_kind(|k| match k {
        VarKind::Map(m) => m.is_empty(),
        _ => true,
    });
    Some(if empty { vm.tru.clone() } else { vm.fals.clone() })
}

fn map_insert(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let key = fd.args[1].to_str();
    let val = fd.args[2].clone();
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Map(m) = k {
            m.insert(key, val);
        }
    });
    Some(fd.args[0].clone())
}

fn map_erase(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let key = fd.args[1].to_str();
    fd.args[0].with_kind_mut(|k| {
        if let VarKind::Map(m) = k {
            // Preserve insertion order of the remaining entries.
            m.shift_remove(&key);
        }
    });
    Some(fd.args[0].clone())
}

fn map_get(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let key = fd.args[1].to_str();
    let val = fd.args[0].with_kind(|k| match k {
        VarKind::Map(m) => m.get(&key).cloned(),
        _ => None,
    });
    Some(val.unwrap_or_else(|| vm.nil.clone()))
}

fn map_find(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let key = fd.args[1].to_str();
    let found = fd.args[0].with_kind(|k| match k {
        VarKind::Map(m) => m.contains_key(&key),
        _ => false,
    });
    Some(if found { vm.tru.clone() } else { vm.fals.clone() })
}

fn map_keys(_vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let keys = fd.args[0].with_kind(|k| match k {
        VarKind::Map(m) => m
            .keys()
            .map(|key| Var::str(key.clone(), fd.src_id, fd.idx))
            .collect(),
        _ => Vec::new(),
    });
    Some(Var::new(VarKind::Vec(keys), fd.src_id, fd.idx))
}

// ===========================================================================
// json
// ===========================================================================

/// Registered into the importing source's module scope, like any
/// out-of-tree native module would be.
pub fn init_json(vm: &mut Vm, _src_id: usize, _idx: usize) -> bool {
    vm.add_native_fn(NativeFnDesc::new("loads", 1, json_loads));
    vm.add_native_fn(NativeFnDesc::new("dumps", 1, json_dumps));
    true
}

fn json_loads(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let text = want_str(vm, fd, 0, "json.loads()")?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(val) => Some(json_to_var(&val, fd.src_id, fd.idx)),
        Err(e) => {
            vm.fail_err(fd.src_id, fd.idx, Error::Domain(format!("json parse error: {}", e)));
            None
        }
    }
}

fn json_dumps(vm: &mut Vm, fd: &FnData) -> Option<Var> {
    let json = var_to_json(&fd.args[0]);
    match serde_json::to_string(&json) {
        Ok(s) => Some(Var::str(s, fd.src_id, fd.idx)),
        Err(e) => {
            vm.fail_err(fd.src_id, fd.idx, Error::Domain(format!("json dump error: {}", e)));
            None
        }
    }
}

fn json_to_var(val: &serde_json::Value, src_id: usize, idx: usize) -> Var {
    match val {
        serde_json::Value::Null => Var::nil(src_id, idx),
        serde_json::Value::Bool(b) => Var::bool(*b, src_id, idx),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Var::int(i, src_id, idx)
            } else {
                Var::flt(n.as_f64().unwrap_or(0.0), src_id, idx)
            }
        }
        serde_json::Value::String(s) => Var::str(s.clone(), src_id, idx),
        serde_json::Value::Array(arr) => Var::new(
            VarKind::Vec(arr.iter().map(|v| json_to_var(v, src_id, idx)).collect()),
            src_id,
            idx,
        ),
        serde_json::Value::Object(obj) => Var::new(
            VarKind::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), json_to_var(v, src_id, idx)))
                    .collect(),
            ),
            src_id,
            idx,
        ),
    }
}

fn var_to_json(val: &Var) -> serde_json::Value {
    val.with_kind(|k| match k {
        VarKind::Nil => serde_json::Value::Null,
        VarKind::Bool(b) => serde_json::Value::Bool(*b),
        VarKind::Int(i) => match i.to_i64() {
            Some(n) => serde_json::Value::Number(n.into()),
            None => serde_json::Value::String(i.to_string()),
        },
        VarKind::Flt(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        VarKind::Str(s) => serde_json::Value::String(s.clone()),
        VarKind::Vec(items) => serde_json::Value::Array(items.iter().map(var_to_json).collect()),
        VarKind::Map(m) | VarKind::Struct(m) => serde_json::Value::Object(
            m.iter().map(|(k2, v)| (k2.clone(), var_to_json(v))).collect(),
        ),
        VarKind::Fn(_) | VarKind::Src(_) | VarKind::Native(_) => serde_json::Value::Null,
    })
}
