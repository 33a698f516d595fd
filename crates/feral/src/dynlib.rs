//! Dynamic loading of native modules.
//!
//! Native modules are shared objects named `libferal<name>` with the
//! platform extension. Each exports `init_<name>`, may export
//! `deinit_<name>`, and may export `feral_abi_<name>` returning the ABI
//! version it was built against. Function registration inside `init_*`
//! goes through [`NativeFnDesc`], so the handler signature can evolve
//! behind the version number without re-teaching every module.
//!
//! The library table is owned by the main VM and shared with thread forks;
//! forks never unload.

use std::collections::HashMap;

use libloading::Library;

use crate::error::{Error, Result};
use crate::vm::{NativeFn, Vm};

/// Version of the host↔module registration contract.
pub const NATIVE_ABI_VERSION: u32 = 1;

/// Descriptor a native module registers for each of its functions.
#[derive(Clone)]
pub struct NativeFnDesc {
    pub name: &'static str,
    /// Number of declared parameters, excluding the receiver for methods.
    pub arity: usize,
    /// Whether extra trailing arguments are collected into a `vec`.
    pub variadic: bool,
    pub handler: NativeFn,
}

impl NativeFnDesc {
    pub fn new(name: &'static str, arity: usize, handler: NativeFn) -> NativeFnDesc {
        NativeFnDesc { name, arity, variadic: false, handler }
    }

    pub fn variadic(name: &'static str, arity: usize, handler: NativeFn) -> NativeFnDesc {
        NativeFnDesc { name, arity, variadic: true, handler }
    }
}

/// `init_<name>` entry point of a shared object.
pub type RawInitFn = unsafe extern "C" fn(vm: *mut Vm, src_id: usize, idx: usize) -> bool;
/// Optional `deinit_<name>`, run at owning-VM teardown.
pub type RawDeinitFn = unsafe extern "C" fn();
/// Optional `feral_abi_<name>`, the ABI version the object was built for.
pub type RawAbiFn = unsafe extern "C" fn() -> u32;

/// Shared-library extension for this platform.
pub fn nmod_ext() -> &'static str {
    if cfg!(target_os = "macos") { ".dylib" } else { ".so" }
}

/// Script extension, selected by the `compiled` flag.
pub fn fmod_ext(compiled: bool) -> &'static str {
    if compiled { ".cfer" } else { ".fer" }
}

/// Table of loaded shared objects, keyed by resolved path.
#[derive(Default)]
pub struct DynLib {
    libs: HashMap<String, Library>,
}

impl DynLib {
    pub fn new() -> DynLib {
        DynLib::default()
    }

    pub fn fexists(&self, path: &str) -> bool {
        self.libs.contains_key(path)
    }

    pub fn load(&mut self, path: &str) -> Result<()> {
        if self.libs.contains_key(path) {
            return Ok(());
        }
        // SAFETY: loading runs the object's initializers; the module is
        // trusted host-side code by the embedding contract.
        let lib = unsafe { Library::new(path) }.map_err(|_| Error::LoadFail(path.to_string()))?;
        self.libs.insert(path.to_string(), lib);
        Ok(())
    }

    pub fn unload(&mut self, path: &str) {
        self.libs.remove(path);
    }

    pub fn get_init(&self, path: &str, symbol: &str) -> Option<RawInitFn> {
        self.get_symbol::<RawInitFn>(path, symbol)
    }

    pub fn get_deinit(&self, path: &str, symbol: &str) -> Option<RawDeinitFn> {
        self.get_symbol::<RawDeinitFn>(path, symbol)
    }

    pub fn get_abi(&self, path: &str, symbol: &str) -> Option<RawAbiFn> {
        self.get_symbol::<RawAbiFn>(path, symbol)
    }

    fn get_symbol<T: Copy>(&self, path: &str, symbol: &str) -> Option<T> {
        let lib = self.libs.get(path)?;
        let name = format!("{}\0", symbol);
        // SAFETY: the symbol types are part of the versioned ABI contract;
        // the fn pointer stays valid while the library remains in the table.
        unsafe { lib.get::<T>(name.as_bytes()).ok().map(|sym| *sym) }
    }
}
