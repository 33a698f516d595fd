//! Feral - the core of a small dynamically-typed embeddable scripting language
//!
//! This crate is the execution stack of the language: the reference-counted
//! value model, the stack-based bytecode virtual machine, and the
//! module/import subsystem for both script modules and native shared-object
//! modules. The lexer, parser, and code generator are external collaborators:
//! the host hands the VM compiled [`Bytecode`] through a [`SrcFile`] and a
//! [`SrcLoadFn`].
//!
//! # Quick Start
//!
//! ```
//! use feral::{Bytecode, Const, Op, SrcFile, Vm};
//!
//! // Assemble `println(6 * 7);` the way the code generator would.
//! let mut bc = Bytecode::new();
//! bc.emit_load("println", 0);
//! bc.emit_const(Const::Int(6.into()), 0);
//! bc.emit_const(Const::Int(7.into()), 4);
//! bc.emit_member_call("*", 1, 4);
//! bc.add(Op::Call(1), 0);
//! bc.add(Op::Unload, 0);
//!
//! let file = SrcFile::new("main.fer", ".", "println(6 * 7);", bc, true);
//!
//! let mut vm = Vm::new("feral", "/usr/local", vec![], 0);
//! assert!(vm.load_core_mods());
//! vm.add_src(file.clone(), 0);
//! let code = vm.exec(file.bytecode());
//! assert_eq!(code, 0);
//! assert_eq!(vm.take_output(), "42\n");
//! ```
//!
//! # Value model
//!
//! Every runtime value is a [`Var`]: a reference-counted cell with a tagged
//! payload, provenance for error reporting, and (for structs and sources)
//! an attribute table. `nil`, `true`, and `false` are VM-owned singletons.
//! Integers are arbitrary precision; mixed `int`/`flt` arithmetic widens to
//! `flt`.
//!
//! # Method dispatch
//!
//! `value.name(...)` resolves in order: the value's attribute table (for
//! attr-based values), the type's frame in the type-function table, then
//! the `all` frame. Operators are methods: the `core` built-in module
//! registers `+`, `<`, `==`, … as type functions.
//!
//! # Modules
//!
//! `import 'spec'` resolves per the leading character (`~` for `HOME`, `.`
//! relative to the importing source, `/` absolute, otherwise the search
//! paths from `FERAL_PATHS` and the install prefix), loads through the
//! host's [`SrcLoadFn`], and runs the module's top level exactly once per
//! VM. Native modules are `libferal<name>` shared objects loaded through
//! the dynamic linker; the built-in set (`core`, `utils`, `str`, `vec`,
//! `map`, `json`) is compiled in and consulted first.
//!
//! # Failure handling
//!
//! `raise` pushes any value onto the fails stack. A protected region
//! (`PushFail` … `PopFail`) catches failures raised inside it, binds the
//! value, and resumes at its catch offset; uncaught failures unwind to the
//! driver as formatted diagnostics with source context.

mod bytecode;
mod diagnostic;
mod dynlib;
mod error;
mod modules;
mod operators;
mod srcfile;
mod value;
mod vars;
mod vm;

pub use bytecode::{Bytecode, Const, FnTemplate, Op};
pub use diagnostic::Diagnostic;
pub use dynlib::{
    DynLib, NATIVE_ABI_VERSION, NativeFnDesc, RawAbiFn, RawDeinitFn, RawInitFn, fmod_ext, nmod_ext,
};
pub use error::{E_EXEC_FAIL, E_FAIL, E_OK, E_PARSE_FAIL, Error, Result};
pub use modules::ModInitFn;
pub use srcfile::SrcFile;
pub use value::{FnBody, FnMarker, FnVal, NativeObj, SrcVal, Type, Var, VarKind};
pub use vars::{VarFrame, Vars};
pub use vm::{EXEC_STACK_MAX_DEFAULT, FnData, NativeFn, SrcLoadFn, Vm};

/// Execution flag: script modules resolve with the compiled extension.
pub const FLAG_COMPILED: u32 = 1 << 0;
