//! Source units.
//!
//! A [`SrcFile`] is one fully resolved module: canonical path, monotonic id,
//! directory, raw code, and compiled bytecode. The id is assigned at
//! registration and is what instructions carry as provenance. The mutable
//! module-vars frame lives in the enclosing `src` value, not here; a
//! `SrcFile` is immutable once built and can be shared read-only across
//! thread-forked VMs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bytecode::Bytecode;
use crate::diagnostic::Diagnostic;

static NEXT_SRC_ID: AtomicUsize = AtomicUsize::new(0);

pub struct SrcFile {
    path: String,
    dir: String,
    id: usize,
    code: String,
    bytecode: Arc<Bytecode>,
    is_main: bool,
}

impl SrcFile {
    pub fn new(
        path: impl Into<String>,
        dir: impl Into<String>,
        code: impl Into<String>,
        bytecode: Bytecode,
        is_main: bool,
    ) -> Arc<SrcFile> {
        Arc::new(SrcFile {
            path: path.into(),
            dir: dir.into(),
            id: NEXT_SRC_ID.fetch_add(1, Ordering::Relaxed),
            code: code.into(),
            bytecode: Arc::new(bytecode),
            is_main,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    /// Format a failure at byte offset `idx` with source context.
    pub fn fail(&self, idx: usize, msg: &str) -> Diagnostic {
        Diagnostic::at_offset(&self.path, &self.code, idx, msg)
    }
}
