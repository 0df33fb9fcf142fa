//! Shader sources and the program cache.
//!
//! Programs are requested by stage file names. [`ProgramCache::load`]
//! resolves each file through a [`SourceResolver`], prepends the caller's
//! header, expands `#include` directives and compiles through the backend.
//! Identical requests share one program and bump its usage count.

mod cache;
mod source;

pub use cache::{LiveProgram, ProgramCache, StageSource};
pub use source::{
    preprocess, FileSystemResolver, LineMap, MemoryResolver, Preprocessed, SourceFile,
    SourceResolver, SourceStamp, HEADER_NAME,
};

/// A cached program, as handed out by [`ProgramCache::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(u64);

impl ProgramHandle {
    /// Handles count up from 1 and are never reused.
    pub fn raw(self) -> u64 {
        self.0
    }
}
