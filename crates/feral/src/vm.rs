//! The bytecode virtual machine.
//!
//! This module owns all mutable runtime state: the operand stack, the
//! source registry and stack, call frames, the type-function table, the
//! globals, and the fails stack. Execution is a fetch-decode-execute loop
//! over a flat instruction array; every other module (`operators`,
//! `modules`, `dynlib`) is a helper the loop or the native functions call
//! into.
//!
//! The module loader lives here too: `fmod_load` resolves and executes
//! script imports exactly once per VM, `nmod_load` consults the built-in
//! module table and then the dynamic linker.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use num_traits::ToPrimitive;

use crate::bytecode::{Bytecode, Const, Op};
use crate::dynlib::{DynLib, NATIVE_ABI_VERSION, NativeFnDesc, RawDeinitFn, fmod_ext, nmod_ext};
use crate::error::{E_EXEC_FAIL, E_OK, Error, Result};
use crate::modules;
use crate::srcfile::SrcFile;
use crate::value::{FnBody, FnMarker, FnVal, SrcVal, Type, Var, VarKind};
use crate::vars::{VarFrame, Vars};

/// Default bound on the call-frame depth, containing runaway recursion.
pub const EXEC_STACK_MAX_DEFAULT: usize = 2048;

/// View a native function receives for one call: the call site's
/// provenance and the argument array. For member calls, `args[0]` is the
/// receiver.
pub struct FnData {
    pub src_id: usize,
    pub idx: usize,
    pub args: Vec<Var>,
}

/// A native function body. Returning `None` signals failure; the function
/// must have recorded the fail value via [`Vm::fail`] (or one of its
/// variants) before returning it.
pub type NativeFn = fn(&mut Vm, &FnData) -> Option<Var>;

/// Host-supplied loader: `(path, dir, flags, is_main)` to a compiled source
/// unit. The external parser and code generator live behind this seam.
pub type SrcLoadFn = fn(&str, &str, u32, bool) -> Result<Arc<SrcFile>>;

// ---------------------------------------------------------------------------
// Execution bookkeeping
// ---------------------------------------------------------------------------

/// One call record.
struct CallFrame {
    ret_bc: Arc<Bytecode>,
    ret_ip: usize,
    ret_end: usize,
    /// Whether the call pushed the callee's defining source.
    pushed_src: bool,
    /// Loop-stack depth at entry; `break`/`continue` cannot reach below it.
    loops_marker: usize,
}

/// A loop region opened by `PushLoop`.
struct LoopMark {
    vars_depth: usize,
}

/// An open `PushFail` region.
struct FailHandler {
    catch_ip: usize,
    name_idx: u32,
    frame_depth: usize,
    vars_depth: usize,
    stack_len: usize,
    loops_len: usize,
    exec_depth: usize,
}

/// Per-`exec` machine state: the instruction cursor plus the call and loop
/// stacks of this invocation.
struct ExecState {
    cur: Arc<Bytecode>,
    ip: usize,
    end: usize,
    frames: Vec<CallFrame>,
    loops: Vec<LoopMark>,
}

// ---------------------------------------------------------------------------
// Vm
// ---------------------------------------------------------------------------

/// The virtual machine.
pub struct Vm {
    /// Singletons owned by the VM; never destroyed before teardown.
    pub tru: Var,
    pub fals: Var,
    pub nil: Var,

    /// Operand stack.
    exec_stack: Vec<Var>,
    /// Registry of loaded source units, keyed by canonical path.
    all_srcs: IndexMap<String, Var>,
    /// Stack of executing sources; the top is the current source.
    src_stack: Vec<Var>,

    /// Type-function table: per-type method frames plus the `all` frame.
    typefns: HashMap<Type, Rc<RefCell<VarFrame>>>,
    typenames: HashMap<Type, String>,
    /// Module-independent bindings added via `gadd`.
    globals: HashMap<String, Var>,

    /// Raised values not yet consumed by a protected region.
    fails: Vec<Var>,
    fail_handlers: Vec<FailHandler>,
    exec_depth: usize,

    pub exit_called: bool,
    pub exit_code: i32,
    exec_stack_count: usize,
    exec_stack_max: usize,
    pub exec_stack_count_exceeded: bool,
    exec_flags: u32,
    is_thread_copy: bool,

    /// Script and native module search paths.
    inc_locs: Vec<String>,
    dll_locs: Vec<String>,
    self_bin: String,
    self_base: String,

    dlib: Rc<RefCell<DynLib>>,
    dll_deinit: Vec<(String, RawDeinitFn)>,
    /// Native modules already initialized in this VM (built-ins by leaf
    /// name, shared objects by resolved path).
    nmods_loaded: HashSet<String>,

    src_load_fn: Option<SrcLoadFn>,
    /// Script arguments exposed to native modules.
    pub src_args: Var,

    /// Captured print output; the host drains it.
    out: String,
    /// Formatted diagnostics for failures that reached the driver.
    diags: Vec<String>,
}

impl Vm {
    // env: FERAL_PATHS
    pub fn new(self_bin: &str, self_base: &str, args: Vec<String>, flags: u32) -> Vm {
        let arg_vars: Vec<Var> = args.into_iter().map(|a| Var::str(a, 0, 0)).collect();

        let mut inc_locs = Vec::new();
        let mut dll_locs = Vec::new();
        for path in env::var("FERAL_PATHS").unwrap_or_default().split(';') {
            if path.is_empty() {
                continue;
            }
            inc_locs.push(format!("{}/include/feral", path));
            dll_locs.push(format!("{}/lib/feral", path));
        }
        inc_locs.push(format!("{}/include/feral", self_base));
        dll_locs.push(format!("{}/lib/feral", self_base));

        let mut vm = Vm {
            tru: Var::bool(true, 0, 0),
            fals: Var::bool(false, 0, 0),
            nil: Var::nil(0, 0),
            exec_stack: Vec::new(),
            all_srcs: IndexMap::new(),
            src_stack: Vec::new(),
            typefns: HashMap::new(),
            typenames: HashMap::new(),
            globals: HashMap::new(),
            fails: Vec::new(),
            fail_handlers: Vec::new(),
            exec_depth: 0,
            exit_called: false,
            exit_code: 0,
            exec_stack_count: 0,
            exec_stack_max: EXEC_STACK_MAX_DEFAULT,
            exec_stack_count_exceeded: false,
            exec_flags: flags,
            is_thread_copy: false,
            inc_locs,
            dll_locs,
            self_bin: self_bin.to_string(),
            self_base: self_base.to_string(),
            dlib: Rc::new(RefCell::new(DynLib::new())),
            dll_deinit: Vec::new(),
            nmods_loaded: HashSet::new(),
            src_load_fn: None,
            src_args: Var::new(VarKind::Vec(arg_vars), 0, 0),
            out: String::new(),
            diags: Vec::new(),
        };
        vm.init_typenames();
        vm.typefns
            .insert(Type::All, Rc::new(RefCell::new(VarFrame::new())));
        vm
    }

    fn init_typenames(&mut self) {
        self.set_typename(Type::All, "all");
        self.set_typename(Type::Nil, "nil");
        self.set_typename(Type::Bool, "bool");
        self.set_typename(Type::Int, "int");
        self.set_typename(Type::Flt, "flt");
        self.set_typename(Type::Str, "str");
        self.set_typename(Type::Vec, "vec");
        self.set_typename(Type::Map, "map");
        self.set_typename(Type::Fn, "fn");
        self.set_typename(Type::Src, "src");
    }

    // --- host configuration ---

    pub fn set_src_load_fn(&mut self, f: SrcLoadFn) {
        self.src_load_fn = Some(f);
    }

    pub fn set_exec_stack_max(&mut self, max: usize) {
        self.exec_stack_max = max;
    }

    pub fn exec_flags(&self) -> u32 {
        self.exec_flags
    }

    pub fn self_bin(&self) -> &str {
        &self.self_bin
    }

    pub fn self_base(&self) -> &str {
        &self.self_base
    }

    pub fn is_thread_copy(&self) -> bool {
        self.is_thread_copy
    }

    /// Drain captured print output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.out)
    }

    /// Drain diagnostics produced by failures that reached the driver.
    pub fn take_diags(&mut self) -> Vec<String> {
        std::mem::take(&mut self.diags)
    }

    pub fn write_out(&mut self, text: &str) {
        self.out.push_str(text);
    }

    // --- source registry & stack ---

    /// Register (if new) and push a source unit. A second registration by
    /// the same canonical path shares the existing unit.
    pub fn add_src(&mut self, file: Arc<SrcFile>, idx: usize) {
        let path = file.path().to_string();
        if !self.all_srcs.contains_key(&path) {
            let src = Var::new(
                VarKind::Src(SrcVal {
                    file,
                    vars: Rc::new(RefCell::new(Vars::new())),
                }),
                0,
                idx,
            );
            self.all_srcs.insert(path.clone(), src);
        }
        let src = self.all_srcs[&path].clone();
        self.src_stack.push(src);
    }

    /// Look up a registered source unit by canonical path.
    pub fn get_src(&self, path: &str) -> Option<Var> {
        self.all_srcs.get(path).cloned()
    }

    /// Push an already-registered source by path.
    pub fn push_src(&mut self, path: &str) {
        let src = self.all_srcs[path].clone();
        self.src_stack.push(src);
    }

    pub fn pop_src(&mut self) {
        self.src_stack.pop();
    }

    pub fn current_source(&self) -> Var {
        self.src_stack
            .last()
            .expect("source stack is empty")
            .clone()
    }

    fn current_src_val(&self) -> SrcVal {
        self.current_source()
            .as_src()
            .expect("top of source stack is not a source")
    }

    pub fn current_vars(&self) -> Rc<RefCell<Vars>> {
        self.current_src_val().vars
    }

    fn current_src_id(&self) -> usize {
        self.src_stack
            .last()
            .and_then(|s| s.as_src())
            .map(|s| s.file.id())
            .unwrap_or(0)
    }

    fn src_by_id(&self, src_id: usize) -> Option<Arc<SrcFile>> {
        self.all_srcs
            .values()
            .filter_map(|v| v.as_src())
            .map(|s| s.file)
            .find(|f| f.id() == src_id)
    }

    // --- type-function table ---

    pub fn set_typename(&mut self, ty: Type, name: &str) {
        self.typenames.insert(ty, name.to_string());
    }

    pub fn type_name(&self, ty: Type) -> String {
        match self.typenames.get(&ty) {
            Some(n) => n.clone(),
            None => format!("typeid<{:?}>", ty),
        }
    }

    pub fn type_name_of(&self, val: &Var) -> String {
        self.type_name(val.type_of())
    }

    /// Add a method to a type's frame. Rejects duplicates.
    pub fn add_typefn(&mut self, ty: Type, name: &str, fn_val: Var) -> bool {
        let frame = self
            .typefns
            .entry(ty)
            .or_insert_with(|| Rc::new(RefCell::new(VarFrame::new())));
        frame.borrow_mut().add(name, fn_val)
    }

    /// Register a native method on a type through the versioned descriptor.
    pub fn add_native_typefn(&mut self, ty: Type, desc: NativeFnDesc, src_id: usize, idx: usize) {
        let fn_val = self.native_fn_var(&desc, "", src_id, true, idx);
        self.add_typefn(ty, desc.name, fn_val);
    }

    /// Resolve a method by type, falling back to the `all` frame. Attribute
    /// lookup (step 1 of the dispatch order) happens at the call site.
    pub fn get_typefn(&self, val: &Var, name: &str) -> Option<Var> {
        if let Some(frame) = self.typefns.get(&val.type_of())
            && let Some(f) = frame.borrow().get(name)
        {
            return Some(f);
        }
        self.typefns.get(&Type::All)?.borrow().get(name)
    }

    // --- globals ---

    /// Add a global binding. Existing names are kept.
    pub fn gadd(&mut self, name: &str, val: Var) {
        if self.globals.contains_key(name) {
            return;
        }
        self.globals.insert(name.to_string(), val);
    }

    pub fn gget(&self, name: &str) -> Option<Var> {
        self.globals.get(name).cloned()
    }

    /// Register a free native function as a global.
    pub fn gadd_native_fn(&mut self, desc: NativeFnDesc) {
        let fn_val = self.native_fn_var(&desc, "", 0, false, 0);
        self.gadd(desc.name, fn_val);
    }

    /// Register a native function into the current source's module scope.
    /// This is the registration surface `init_*` entry points use.
    pub fn add_native_fn(&mut self, desc: NativeFnDesc) {
        let src = self.current_src_val();
        let fn_val =
            self.native_fn_var(&desc, src.file.path(), src.file.id(), false, 0);
        src.vars.borrow_mut().addm(desc.name, fn_val);
    }

    fn native_fn_var(
        &self,
        desc: &NativeFnDesc,
        src_path: &str,
        src_id: usize,
        is_member: bool,
        idx: usize,
    ) -> Var {
        let f = FnVal {
            src_path: src_path.to_string(),
            src_id,
            params: vec![String::new(); desc.arity],
            defaults: vec![None; desc.arity],
            marker: if desc.variadic {
                FnMarker::Variadic
            } else {
                FnMarker::None
            },
            body: FnBody::Native(desc.handler),
            is_member,
        };
        Var::new(VarKind::Fn(Rc::new(f)), src_id, idx)
    }

    // --- failure recording ---

    /// Record a failure. With an open protected region the value is queued
    /// on the fails stack; otherwise (or after `exit`) it becomes a
    /// formatted diagnostic for the driver.
    pub fn fail(&mut self, src_id: usize, idx: usize, msg: &str) {
        if self.fail_handlers.is_empty() || self.exit_called {
            self.emit_diag(src_id, idx, msg);
        } else {
            self.fails.push(Var::str(msg, src_id, idx));
        }
    }

    /// Record a failure carrying an arbitrary value. Driver-bound raised
    /// values surface as [`Error::Raised`]; caught ones travel as-is.
    pub fn fail_val(&mut self, src_id: usize, idx: usize, val: Var) {
        if self.fail_handlers.is_empty() || self.exit_called {
            let msg = Error::Raised(val.to_str()).to_string();
            self.emit_diag(src_id, idx, &msg);
        } else {
            self.fails.push(val);
        }
    }

    /// Record a typed failure; the error's display form is what a
    /// protected region binds or the driver prints.
    pub fn fail_err(&mut self, src_id: usize, idx: usize, err: Error) {
        self.fail(src_id, idx, &err.to_string());
    }

    fn emit_diag(&mut self, src_id: usize, idx: usize, msg: &str) {
        match self.src_by_id(src_id) {
            Some(file) => self.diags.push(file.fail(idx, msg).to_string()),
            None => self.diags.push(format!("error: {}", msg)),
        }
    }

    // --- module resolution & loading ---

    /// Probe for a module file per the resolution rules: `~` expands to
    /// `HOME`, a leading `.` resolves against the current source's
    /// directory, `/` is absolute, anything else walks `locs` in order.
    /// Returns the canonical path and its directory.
    pub fn mod_exists(&self, locs: &[String], spec: &str, ext: &str) -> Option<(String, String)> {
        let mut m = spec.to_string();
        let first = m.chars().next()?;
        if first != '~' && first != '/' && first != '.' {
            for loc in locs {
                let cand = format!("{}/{}{}", loc, m, ext);
                if Path::new(&cand).exists() {
                    return canonicalize(&cand);
                }
            }
            return None;
        }
        if first == '~' {
            m.remove(0);
            let home = env::var("HOME").unwrap_or_default();
            m.insert_str(0, &home);
        } else if first == '.' {
            // A relative import needs an executing source to anchor on.
            let anchor = self.src_stack.last()?.as_src()?;
            m.remove(0);
            m.insert_str(0, anchor.file.dir());
        }
        let cand = format!("{}{}", m, ext);
        if Path::new(&cand).exists() {
            canonicalize(&cand)
        } else {
            None
        }
    }

    /// Import a script module. Resolution failure and load failure are
    /// recorded as failures of the importing instruction; on success the
    /// registered `src` value is returned. The module's top level runs at
    /// most once per VM.
    pub fn fmod_load(&mut self, spec: &str, src_id: usize, idx: usize) -> Option<Var> {
        let compiled = self.exec_flags & crate::FLAG_COMPILED != 0;
        let ext = fmod_ext(compiled);
        let locs = self.inc_locs.clone();
        let (path, dir) = match self.mod_exists(&locs, spec, ext) {
            Some(hit) => hit,
            None => {
                let err = Error::ModuleNotFound(format!("{}{}", spec, ext), locs);
                self.fail_err(src_id, idx, err);
                return None;
            }
        };

        if let Some(src) = self.all_srcs.get(&path) {
            return Some(src.clone());
        }

        let load = match self.src_load_fn {
            Some(f) => f,
            None => {
                let err = Error::Exec("no source load function installed".to_string());
                self.fail_err(src_id, idx, err);
                return None;
            }
        };
        let file = match load(&path, &dir, self.exec_flags, false) {
            Ok(f) => f,
            Err(e) => {
                self.fail(src_id, idx, &format!("could not load import '{}': {}", path, e));
                return None;
            }
        };

        let bc = file.bytecode().clone();
        self.add_src(file, 0);
        let res = self.exec(&bc);
        self.pop_src();
        if res != E_OK && !self.exit_called {
            self.fail_err(src_id, idx, Error::Exec(format!("import '{}' failed", path)));
            return None;
        }
        Some(self.all_srcs[&path].clone())
    }

    /// Load a native module: the built-in table first, then a
    /// `libferal<leaf>` shared object through the dynamic linker.
    pub fn nmod_load(&mut self, spec: &str, src_id: usize, idx: usize) -> bool {
        let leaf = spec.rsplit('/').next().unwrap_or(spec).to_string();

        if let Some(init) = modules::builtin(&leaf) {
            if self.nmods_loaded.contains(&leaf) {
                return true;
            }
            if !init(self, src_id, idx) {
                self.fail_err(src_id, idx, Error::InitFailed(leaf));
                return false;
            }
            self.nmods_loaded.insert(leaf);
            return true;
        }

        let mut mod_file = spec.to_string();
        let insert_at = mod_file.rfind('/').map(|p| p + 1).unwrap_or(0);
        mod_file.insert_str(insert_at, "libferal");

        let locs = self.dll_locs.clone();
        let (path, _dir) = match self.mod_exists(&locs, &mod_file, nmod_ext()) {
            Some(hit) => hit,
            None => {
                let err = Error::ModuleNotFound(format!("{}{}", mod_file, nmod_ext()), locs);
                self.fail_err(src_id, idx, err);
                return false;
            }
        };

        if self.dlib.borrow().fexists(&path) {
            return true;
        }
        if self.dlib.borrow_mut().load(&path).is_err() {
            self.fail_err(src_id, idx, Error::LoadFail(path));
            return false;
        }

        let abi = self.dlib.borrow().get_abi(&path, &format!("feral_abi_{}", leaf));
        if let Some(abi) = abi {
            // SAFETY: symbol type is part of the versioned ABI contract.
            let got = unsafe { abi() };
            if got != NATIVE_ABI_VERSION {
                self.dlib.borrow_mut().unload(&path);
                let err = Error::AbiMismatch {
                    file: path,
                    got,
                    expected: NATIVE_ABI_VERSION,
                };
                self.fail_err(src_id, idx, err);
                return false;
            }
        }

        let init = self.dlib.borrow().get_init(&path, &format!("init_{}", leaf));
        let init = match init {
            Some(f) => f,
            None => {
                self.dlib.borrow_mut().unload(&path);
                let err = Error::InitMissing {
                    file: path,
                    symbol: format!("init_{}", leaf),
                };
                self.fail_err(src_id, idx, err);
                return false;
            }
        };
        // SAFETY: init_* follows the versioned ABI; the VM pointer is valid
        // for the duration of the call.
        if !unsafe { init(self as *mut Vm, src_id, idx) } {
            self.dlib.borrow_mut().unload(&path);
            self.fail_err(src_id, idx, Error::InitFailed(path));
            return false;
        }
        let deinit = self.dlib.borrow().get_deinit(&path, &format!("deinit_{}", leaf));
        if let Some(deinit) = deinit {
            self.dll_deinit.push((path.clone(), deinit));
        }
        self.nmods_loaded.insert(path);
        true
    }

    /// Load the modules every VM starts with.
    pub fn load_core_mods(&mut self) -> bool {
        for m in ["core", "utils"] {
            if !self.nmod_load(m, 0, 0) {
                return false;
            }
        }
        true
    }

    // --- thread fork ---

    /// Produce a VM with independent mutable state. Source code, the
    /// library table, type names and the type-function table are shared;
    /// every vars frame and the globals are deep-cloned snapshots.
    pub fn thread_copy(&self, src_id: usize, idx: usize) -> Vm {
        let mut vm = Vm {
            tru: Var::bool(true, 0, 0),
            fals: Var::bool(false, 0, 0),
            nil: Var::nil(0, 0),
            exec_stack: Vec::new(),
            all_srcs: IndexMap::new(),
            src_stack: Vec::new(),
            typefns: self.typefns.clone(),
            typenames: self.typenames.clone(),
            globals: self
                .globals
                .iter()
                .map(|(k, v)| (k.clone(), v.deep_copy(src_id, idx)))
                .collect(),
            fails: Vec::new(),
            fail_handlers: Vec::new(),
            exec_depth: 0,
            exit_called: false,
            exit_code: 0,
            exec_stack_count: 0,
            exec_stack_max: self.exec_stack_max,
            exec_stack_count_exceeded: false,
            exec_flags: self.exec_flags,
            is_thread_copy: true,
            inc_locs: self.inc_locs.clone(),
            dll_locs: self.dll_locs.clone(),
            self_bin: self.self_bin.clone(),
            self_base: self.self_base.clone(),
            dlib: self.dlib.clone(),
            dll_deinit: Vec::new(),
            nmods_loaded: self.nmods_loaded.clone(),
            src_load_fn: self.src_load_fn,
            src_args: self.src_args.clone(),
            out: String::new(),
            diags: Vec::new(),
        };
        for (path, src) in &self.all_srcs {
            vm.all_srcs.insert(path.clone(), src.deep_copy(src_id, idx));
        }
        for src in &self.src_stack {
            if let Some(s) = src.as_src() {
                let path = s.file.path().to_string();
                let copy = vm.all_srcs[&path].clone();
                vm.src_stack.push(copy);
            }
        }
        vm
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a compiled instruction stream against the current source.
    /// Returns an exit code: `E_OK`, `E_EXEC_FAIL` for an uncaught failure,
    /// or the code passed to `exit`.
    pub fn exec(&mut self, bc: &Arc<Bytecode>) -> i32 {
        self.exec_depth += 1;
        let mut st = ExecState {
            cur: bc.clone(),
            ip: 0,
            end: bc.len(),
            frames: Vec::new(),
            loops: Vec::new(),
        };
        let code = self.run(&mut st);
        // Leave no half-unwound frames behind, whatever the outcome.
        while let Some(fr) = st.frames.pop() {
            self.current_vars().borrow_mut().pop_fn();
            if fr.pushed_src {
                self.pop_src();
            }
            self.exec_stack_count -= 1;
        }
        while let Some(h) = self.fail_handlers.last() {
            if h.exec_depth != self.exec_depth {
                break;
            }
            self.fail_handlers.pop();
        }
        self.exec_depth -= 1;
        code
    }

    /// The fetch-decode-execute loop.
    fn run(&mut self, st: &mut ExecState) -> i32 {
        let depth = self.exec_depth;
        loop {
            if self.exit_called {
                return self.exit_code;
            }
            if st.ip >= st.end {
                match st.frames.pop() {
                    Some(fr) => {
                        // Fell off a function body: implicit nil return.
                        self.current_vars().borrow_mut().pop_fn();
                        if fr.pushed_src {
                            self.pop_src();
                        }
                        self.exec_stack_count -= 1;
                        st.loops.truncate(fr.loops_marker);
                        st.cur = fr.ret_bc;
                        st.ip = fr.ret_ip;
                        st.end = fr.ret_end;
                        self.exec_stack.push(self.nil.clone());
                        continue;
                    }
                    None => return E_OK,
                }
            }

            let op = st.cur.ops[st.ip].clone();
            let idx = st.cur.spans[st.ip];
            st.ip += 1;

            let ok = self.dispatch(op, idx, st);
            if !ok && !self.unwind(st, depth) {
                if self.exit_called {
                    return self.exit_code;
                }
                return E_EXEC_FAIL;
            }
        }
    }

    /// Execute one instruction. Returns false when the instruction failed
    /// (the fail value or diagnostic has been recorded).
    fn dispatch(&mut self, op: Op, idx: usize, st: &mut ExecState) -> bool {
        let src_id = self.current_src_id();
        match op {
            Op::LoadConst(i) => {
                let val = match &st.cur.consts[i as usize] {
                    Const::Nil => self.nil.clone(),
                    Const::Bool(true) => self.tru.clone(),
                    Const::Bool(false) => self.fals.clone(),
                    Const::Int(n) => Var::int(n.clone(), src_id, idx),
                    Const::Flt(f) => Var::flt(*f, src_id, idx),
                    Const::Str(s) => Var::str(s.clone(), src_id, idx),
                };
                self.exec_stack.push(val);
            }

            Op::LoadName(i) => {
                let name = &st.cur.names[i as usize];
                let found = self
                    .current_vars()
                    .borrow()
                    .get(name)
                    .or_else(|| self.gget(name));
                match found {
                    Some(v) => self.exec_stack.push(v),
                    None => {
                        let err = Error::Exec(format!("undefined name: {}", name));
                        self.fail_err(src_id, idx, err);
                        return false;
                    }
                }
            }

            Op::CreateBinding(i) => {
                let name = st.cur.names[i as usize].clone();
                let val = self.pop_stack();
                if !self.current_vars().borrow_mut().add(&name, val) {
                    self.fail_err(
                        src_id,
                        idx,
                        Error::Exec(format!("name '{}' already exists in this scope", name)),
                    );
                    return false;
                }
            }

            Op::Assign => {
                let val = self.pop_stack();
                let target = self.pop_stack();
                if target.same(&self.nil) || target.same(&self.tru) || target.same(&self.fals) {
                    let err = Error::Exec("cannot mutate an immutable value".to_string());
                    self.fail_err(src_id, idx, err);
                    return false;
                }
                target.set(&val);
                self.exec_stack.push(target);
            }

            Op::Unload => {
                self.pop_stack();
            }

            Op::PushBlock => self.current_vars().borrow_mut().push(),
            Op::PopBlock => self.current_vars().borrow_mut().pop(),

            Op::Jump(r) => st.ip = rel_target(st.ip, r),
            Op::JumpTrue(r) => {
                if self.pop_stack().to_bool() {
                    st.ip = rel_target(st.ip, r);
                }
            }
            Op::JumpFalse(r) => {
                if !self.pop_stack().to_bool() {
                    st.ip = rel_target(st.ip, r);
                }
            }

            Op::BuildVec(n) => {
                let start = self.exec_stack.len().saturating_sub(n as usize);
                let items: Vec<Var> = self.exec_stack.drain(start..).collect();
                self.exec_stack.push(Var::new(VarKind::Vec(items), src_id, idx));
            }

            Op::BuildMap(n) => {
                let start = self.exec_stack.len().saturating_sub(2 * n as usize);
                let raw: Vec<Var> = self.exec_stack.drain(start..).collect();
                let mut map = IndexMap::with_capacity(n as usize);
                for pair in raw.chunks(2) {
                    map.insert(pair[0].to_str(), pair[1].clone());
                }
                self.exec_stack.push(Var::new(VarKind::Map(map), src_id, idx));
            }

            Op::AttrGet(i) => {
                let name = &st.cur.names[i as usize];
                let obj = self.pop_stack();
                match obj.attr_get(name) {
                    Some(v) => self.exec_stack.push(v),
                    None => {
                        let err = Error::Dispatch(format!(
                            "type '{}' has no attribute '{}'",
                            self.type_name_of(&obj),
                            name
                        ));
                        self.fail_err(src_id, idx, err);
                        return false;
                    }
                }
            }

            Op::AttrSet(i) => {
                let name = st.cur.names[i as usize].clone();
                let val = self.pop_stack();
                let obj = self.pop_stack();
                if !obj.attr_set(&name, val) {
                    let err = Error::Dispatch(format!(
                        "type '{}' does not support attributes",
                        self.type_name_of(&obj)
                    ));
                    self.fail_err(src_id, idx, err);
                    return false;
                }
                self.exec_stack.push(obj);
            }

            Op::Import => {
                let spec_var = self.pop_stack();
                let spec = match spec_var.as_str() {
                    Some(s) => s,
                    None => {
                        let err =
                            Error::Dispatch("import expects a string module spec".to_string());
                        self.fail_err(src_id, idx, err);
                        return false;
                    }
                };
                match self.fmod_load(&spec, src_id, idx) {
                    Some(src) => self.exec_stack.push(src),
                    None => return false,
                }
            }

            Op::MakeFn(i) => {
                let template = &st.cur.fns[i as usize];
                let src = self.current_src_val();
                let f = FnVal {
                    src_path: src.file.path().to_string(),
                    src_id: src.file.id(),
                    params: template.params.clone(),
                    defaults: template.defaults.clone(),
                    marker: template.marker,
                    body: FnBody::Script {
                        begin: template.body_begin,
                        end: template.body_end,
                    },
                    is_member: false,
                };
                self.exec_stack
                    .push(Var::new(VarKind::Fn(Rc::new(f)), src_id, idx));
            }

            Op::Return => {
                let retval = self.pop_stack();
                match st.frames.pop() {
                    Some(fr) => {
                        self.current_vars().borrow_mut().pop_fn();
                        if fr.pushed_src {
                            self.pop_src();
                        }
                        self.exec_stack_count -= 1;
                        st.loops.truncate(fr.loops_marker);
                        st.cur = fr.ret_bc;
                        st.ip = fr.ret_ip;
                        st.end = fr.ret_end;
                        self.exec_stack.push(retval);
                    }
                    None => {
                        let err = Error::Exec("return outside a function".to_string());
                        self.fail_err(src_id, idx, err);
                        return false;
                    }
                }
            }

            Op::Continue(r) => {
                let marker = st.frames.last().map(|f| f.loops_marker).unwrap_or(0);
                if st.loops.len() <= marker {
                    self.fail_err(src_id, idx, Error::Exec("continue outside a loop".to_string()));
                    return false;
                }
                let vars_depth = st.loops.last().expect("loop stack underflow").vars_depth;
                self.current_vars().borrow_mut().truncate(vars_depth);
                st.ip = rel_target(st.ip, r);
            }

            Op::Break(r) => {
                let marker = st.frames.last().map(|f| f.loops_marker).unwrap_or(0);
                if st.loops.len() <= marker {
                    self.fail_err(src_id, idx, Error::Exec("break outside a loop".to_string()));
                    return false;
                }
                let mark = st.loops.pop().expect("loop stack underflow");
                self.current_vars().borrow_mut().truncate(mark.vars_depth);
                st.ip = rel_target(st.ip, r);
            }

            Op::PushLoop => st.loops.push(LoopMark {
                vars_depth: self.current_vars().borrow().depth(),
            }),
            Op::PopLoop => {
                st.loops.pop();
            }

            Op::Raise => {
                let val = self.pop_stack();
                self.fail_val(src_id, idx, val);
                return false;
            }

            Op::PushFail(r, name_idx) => {
                self.fail_handlers.push(FailHandler {
                    catch_ip: rel_target(st.ip, r),
                    name_idx,
                    frame_depth: st.frames.len(),
                    vars_depth: self.current_vars().borrow().depth(),
                    stack_len: self.exec_stack.len(),
                    loops_len: st.loops.len(),
                    exec_depth: self.exec_depth,
                });
            }

            Op::PopFail => {
                self.fail_handlers.pop();
            }

            Op::Call(n) => {
                let args = self.pop_args(n as usize);
                let callee = self.pop_stack();
                return self.setup_call(st, callee, args, None, src_id, idx);
            }

            Op::CallMember(name_i, n) => {
                let name = st.cur.names[name_i as usize].clone();
                let args = self.pop_args(n as usize);
                let recv = self.pop_stack();
                // Dispatch order: attribute table, then type frame, then all.
                let target = if recv.attr_based() && recv.attr_exists(&name) {
                    recv.attr_get(&name)
                } else {
                    self.get_typefn(&recv, &name)
                };
                let target = match target {
                    Some(t) => t,
                    None => {
                        let err = Error::Dispatch(format!(
                            "no member function '{}' for type '{}'",
                            name,
                            self.type_name_of(&recv)
                        ));
                        self.fail_err(src_id, idx, err);
                        return false;
                    }
                };
                return self.setup_call(st, target, args, Some(recv), src_id, idx);
            }

            Op::Nop => {}
        }
        true
    }

    // --- call mechanism ---

    /// Resolve a callee, verify arity, bind arguments, and either push a
    /// call frame (script body) or invoke the native handler.
    ///
    /// `recv` is the receiver of a member call; it becomes positional 0
    /// when the callee declares itself a member function.
    fn setup_call(
        &mut self,
        st: &mut ExecState,
        callee: Var,
        mut args: Vec<Var>,
        recv: Option<Var>,
        src_id: usize,
        idx: usize,
    ) -> bool {
        let f = match callee.as_fn() {
            Some(f) => f,
            None => {
                let err = Error::Dispatch(format!(
                    "type '{}' is not callable",
                    self.type_name_of(&callee)
                ));
                self.fail_err(src_id, idx, err);
                return false;
            }
        };
        if f.is_member
            && let Some(recv) = recv
        {
            args.insert(0, recv);
        }

        match &f.body {
            FnBody::Native(handler) => {
                let given = args.len() - if f.is_member { 1 } else { 0 };
                let ok = if f.marker == FnMarker::Variadic {
                    given >= f.params.len()
                } else {
                    given == f.params.len()
                };
                if !ok {
                    let err = Error::Dispatch(format!(
                        "expected {} argument(s), found {}",
                        f.params.len(),
                        given
                    ));
                    self.fail_err(src_id, idx, err);
                    return false;
                }
                let fd = FnData { src_id, idx, args };
                match handler(self, &fd) {
                    Some(v) => {
                        self.exec_stack.push(v);
                        true
                    }
                    None => false,
                }
            }

            FnBody::Script { begin, end } => {
                self.exec_stack_count += 1;
                if self.exec_stack_count >= self.exec_stack_max {
                    self.exec_stack_count -= 1;
                    self.exec_stack_count_exceeded = true;
                    self.fail_err(src_id, idx, Error::StackExceeded(self.exec_stack_max));
                    return false;
                }

                let nparams = f.params.len();
                let fixed = if f.marker == FnMarker::Variadic {
                    nparams.saturating_sub(1)
                } else {
                    nparams
                };
                if args.len() > fixed && f.marker != FnMarker::Variadic {
                    self.exec_stack_count -= 1;
                    let err = Error::Dispatch(format!(
                        "expected at most {} argument(s), found {}",
                        fixed,
                        args.len()
                    ));
                    self.fail_err(src_id, idx, err);
                    return false;
                }

                // Bind arguments before touching the scope so that default
                // fragments (which may themselves call functions) cannot
                // disturb the staged bindings.
                let mut bound: Vec<(String, Var)> = Vec::with_capacity(nparams);
                for i in 0..fixed {
                    let val = if i < args.len() {
                        if f.marker == FnMarker::Reference {
                            args[i].clone()
                        } else {
                            args[i].copy(src_id, idx)
                        }
                    } else if let Some(default_bc) = &f.defaults[i] {
                        let code = self.exec(default_bc);
                        if code != E_OK || self.exit_called {
                            self.exec_stack_count -= 1;
                            if !self.exit_called {
                                let err = Error::Exec(format!(
                                    "default value for '{}' failed",
                                    f.params[i]
                                ));
                                self.fail_err(src_id, idx, err);
                            }
                            return false;
                        }
                        self.pop_stack()
                    } else {
                        self.exec_stack_count -= 1;
                        let err = Error::Dispatch(format!(
                            "missing required argument '{}'",
                            f.params[i]
                        ));
                        self.fail_err(src_id, idx, err);
                        return false;
                    };
                    bound.push((f.params[i].clone(), val));
                }
                if f.marker == FnMarker::Variadic {
                    let extra: Vec<Var> = args
                        .get(fixed..)
                        .map(|s| s.to_vec())
                        .unwrap_or_default();
                    bound.push((
                        f.params[nparams - 1].clone(),
                        Var::new(VarKind::Vec(extra), src_id, idx),
                    ));
                }

                // Switch to the defining source if the callee lives elsewhere.
                let pushed_src = f.src_id != self.current_src_id()
                    && self.all_srcs.contains_key(&f.src_path);
                if pushed_src {
                    let src_path = f.src_path.clone();
                    self.push_src(&src_path);
                }

                {
                    let vars = self.current_vars();
                    let mut v = vars.borrow_mut();
                    for (name, val) in bound {
                        v.stash(&name, val);
                    }
                    v.push_fn();
                }

                st.frames.push(CallFrame {
                    ret_bc: st.cur.clone(),
                    ret_ip: st.ip,
                    ret_end: st.end,
                    pushed_src,
                    loops_marker: st.loops.len(),
                });
                let target_bc = self.current_src_val().file.bytecode().clone();
                st.cur = target_bc;
                st.ip = *begin;
                st.end = *end;
                true
            }
        }
    }

    // --- failure unwinding ---

    /// Unwind to the innermost protected region of this `exec` invocation.
    /// Returns false when no such region exists (the failure escapes to the
    /// driver).
    fn unwind(&mut self, st: &mut ExecState, depth: usize) -> bool {
        if self.exit_called {
            return false;
        }
        match self.fail_handlers.last() {
            Some(h) if h.exec_depth == depth => {}
            _ => return false,
        }
        let h = self.fail_handlers.pop().expect("handler stack underflow");

        while st.frames.len() > h.frame_depth {
            let fr = st.frames.pop().expect("frame stack underflow");
            self.current_vars().borrow_mut().pop_fn();
            if fr.pushed_src {
                self.pop_src();
            }
            self.exec_stack_count -= 1;
            st.cur = fr.ret_bc;
            st.ip = fr.ret_ip;
            st.end = fr.ret_end;
            st.loops.truncate(fr.loops_marker);
        }

        self.exec_stack.truncate(h.stack_len);
        st.loops.truncate(h.loops_len);

        let fail_val = self.fails.pop().unwrap_or_else(|| self.nil.clone());
        let name = st.cur.names[h.name_idx as usize].clone();
        let vars = self.current_vars();
        let mut v = vars.borrow_mut();
        v.truncate(h.vars_depth);
        v.push();
        v.add(&name, fail_val);
        drop(v);

        st.ip = h.catch_ip;
        true
    }

    // --- small helpers ---

    fn pop_stack(&mut self) -> Var {
        self.exec_stack.pop().unwrap_or_else(|| self.nil.clone())
    }

    fn pop_args(&mut self, n: usize) -> Vec<Var> {
        let start = self.exec_stack.len().saturating_sub(n);
        self.exec_stack.drain(start..).collect()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.is_thread_copy {
            return;
        }
        for (_, deinit) in &self.dll_deinit {
            let deinit = *deinit;
            // SAFETY: deinit_* follows the versioned ABI and the library is
            // still loaded; forks never reach here.
            unsafe { deinit() };
        }
    }
}

/// Compute the absolute target of a relative jump. `ip` has already been
/// advanced past the jump instruction.
fn rel_target(ip: usize, rel: i32) -> usize {
    ((ip as i64 - 1) + rel as i64) as usize
}

/// Canonicalize a probed path, returning it with its directory.
fn canonicalize(path: &str) -> Option<(String, String)> {
    let abs = std::fs::canonicalize(path).ok()?;
    let dir = abs.parent()?.to_string_lossy().to_string();
    Some((abs.to_string_lossy().to_string(), dir))
}

// Keep the widening helper in scope for native modules that convert ints.
pub(crate) fn int_to_usize(v: &Var) -> Option<usize> {
    v.as_int().and_then(|i| i.to_usize())
}
