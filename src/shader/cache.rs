use std::collections::{BTreeMap, HashMap};

use crate::backend::{GpuBackend, ProgramId, ShaderStage, StageId};
use crate::config::RuntimeConfig;
use crate::error::{ProgramError, ShaderDiagnostic};
use crate::shader::source::{preprocess, FileSystemResolver, LineMap, SourceFile, SourceResolver};
use crate::shader::ProgramHandle;

/// One stage of a program request: which stage, from which file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub file: String,
}

impl StageSource {
    /// `file` is resolved through the cache's [`SourceResolver`].
    pub fn new(stage: ShaderStage, file: impl Into<String>) -> Self {
        Self {
            stage,
            file: file.into(),
        }
    }

    /// Shorthand for [`StageSource::new`] with a vertex stage.
    pub fn vertex(file: impl Into<String>) -> Self {
        Self::new(ShaderStage::Vertex, file)
    }

    pub fn fragment(file: impl Into<String>) -> Self {
        Self::new(ShaderStage::Fragment, file)
    }

    pub fn compute(file: impl Into<String>) -> Self {
        Self::new(ShaderStage::Compute, file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    stages: Vec<StageSource>,
    /// `None` when programs are keyed by file names only.
    header: Option<String>,
    has_header: bool,
    process_includes: bool,
}

struct CompiledStage {
    id: StageId,
    /// Stage file followed by its includes.
    files: Vec<SourceFile>,
    text: String,
}

struct CacheEntry {
    key: ProgramKey,
    label: String,
    header: String,
    program: ProgramId,
    stages: Vec<CompiledStage>,
    usage: u32,
}

struct Built {
    program: ProgramId,
    stages: Vec<CompiledStage>,
}

/// A program still held at the time of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProgram {
    pub handle: ProgramHandle,
    pub label: String,
    pub usage: u32,
}

/// Reference-counted cache of linked programs.
///
/// Requests with the same stage files, header and include flag share one
/// program; each [`load`](ProgramCache::load) must be paired with a
/// [`dispose`](ProgramCache::dispose). Sources are read through a
/// [`SourceResolver`] so that hot reload can compare timestamps.
pub struct ProgramCache {
    resolver: Box<dyn SourceResolver>,
    caching: bool,
    key_by_header: bool,
    entries: BTreeMap<ProgramHandle, CacheEntry>,
    index: HashMap<ProgramKey, ProgramHandle>,
    next_handle: u64,
}

impl ProgramCache {
    /// An empty cache with caching and header keys enabled.
    pub fn new(resolver: Box<dyn SourceResolver>) -> Self {
        Self {
            resolver,
            caching: true,
            key_by_header: true,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_handle: 1,
        }
    }

    /// A cache reading from the configured search paths.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let resolver = FileSystemResolver::new(
            config.shader_search_paths.clone(),
            config.include_root.clone(),
        );
        Self::new(Box::new(resolver))
            .with_caching(config.program_caching)
            .with_header_keys(config.key_programs_by_header)
    }

    /// With caching off, every load builds a fresh program.
    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching = enabled;
        self
    }

    /// Whether the header text is part of the cache key. When off only its
    /// presence is, and a request may reuse a program built with another
    /// header.
    pub fn with_header_keys(mut self, enabled: bool) -> Self {
        self.key_by_header = enabled;
        self
    }

    /// Replaces where sources come from. Loaded programs keep their code
    /// until rebuilt.
    pub fn set_resolver(&mut self, resolver: Box<dyn SourceResolver>) {
        self.resolver = resolver;
    }

    pub fn resolver(&self) -> &dyn SourceResolver {
        self.resolver.as_ref()
    }

    /// Loads, or reuses, the program built from `stages`.
    pub fn load(
        &mut self,
        backend: &mut dyn GpuBackend,
        stages: &[StageSource],
        header: &str,
        process_includes: bool,
    ) -> Result<ProgramHandle, ProgramError> {
        if stages.is_empty() {
            return Err(ProgramError::NoStages);
        }
        let key = ProgramKey {
            stages: stages.to_vec(),
            header: self.key_by_header.then(|| header.to_string()),
            has_header: !header.is_empty(),
            process_includes,
        };

        if self.caching {
            if let Some(&handle) = self.index.get(&key) {
                if let Some(entry) = self.entries.get_mut(&handle) {
                    entry.usage += 1;
                    log::debug!("program `{}` reused (usage {})", entry.label, entry.usage);
                    return Ok(handle);
                }
            }
        }

        let label = program_label(stages);
        let built = self
            .build(backend, &label, stages, header, process_includes)
            .inspect_err(|e| log::error!("{e}"))?;

        let handle = ProgramHandle(self.next_handle);
        self.next_handle += 1;
        if self.caching {
            self.index.insert(key.clone(), handle);
        }
        log::debug!("program `{label}` loaded as {handle:?}");
        self.entries.insert(
            handle,
            CacheEntry {
                key,
                label,
                header: header.to_string(),
                program: built.program,
                stages: built.stages,
                usage: 1,
            },
        );
        Ok(handle)
    }

    /// Drops one use of `handle`. The last use destroys the program.
    ///
    /// Returns `false` for handles the cache does not know.
    pub fn dispose(&mut self, backend: &mut dyn GpuBackend, handle: ProgramHandle) -> bool {
        let Some(entry) = self.entries.get_mut(&handle) else {
            log::error!("dispose of unknown program {handle:?}");
            return false;
        };
        entry.usage -= 1;
        if entry.usage > 0 {
            return true;
        }
        if let Some(entry) = self.entries.remove(&handle) {
            if self.index.get(&entry.key) == Some(&handle) {
                self.index.remove(&entry.key);
            }
            log::debug!("program `{}` destroyed", entry.label);
            destroy(backend, entry.program, entry.stages);
        }
        true
    }

    /// Recompiles every program from its files.
    ///
    /// Each failure is logged and leaves the previous program in place.
    /// Returns whether all of them succeeded.
    pub fn rebuild_all_from_file(&mut self, backend: &mut dyn GpuBackend) -> bool {
        let handles: Vec<ProgramHandle> = self.entries.keys().copied().collect();
        let mut all_ok = true;
        for handle in handles {
            if let Err(e) = self.rebuild(backend, handle) {
                log::error!("rebuilding {handle:?} failed: {e}");
                all_ok = false;
            }
        }
        all_ok
    }

    /// Rebuilds the programs whose sources, or includes, changed since they
    /// were compiled. Returns the ones successfully rebuilt.
    pub fn rebuild_modified(&mut self, backend: &mut dyn GpuBackend) -> Vec<ProgramHandle> {
        let stale: Vec<ProgramHandle> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .stages
                    .iter()
                    .flat_map(|stage| &stage.files)
                    .any(|file| self.resolver.is_modified(file))
            })
            .map(|(handle, _)| *handle)
            .collect();

        let mut rebuilt = Vec::new();
        for handle in stale {
            match self.rebuild(backend, handle) {
                Ok(()) => {
                    if let Some(entry) = self.entries.get(&handle) {
                        log::info!("reloaded program `{}`", entry.label);
                    }
                    rebuilt.push(handle);
                }
                Err(e) => log::error!("hot reload of {handle:?} failed, keeping the old program: {e}"),
            }
        }
        rebuilt
    }

    fn rebuild(&mut self, backend: &mut dyn GpuBackend, handle: ProgramHandle) -> Result<(), ProgramError> {
        let entry = self
            .entries
            .get(&handle)
            .ok_or(ProgramError::UnknownHandle(handle))?;
        let built = self.build(
            backend,
            &entry.label,
            &entry.key.stages,
            &entry.header,
            entry.key.process_includes,
        )?;
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(ProgramError::UnknownHandle(handle))?;
        let old_program = std::mem::replace(&mut entry.program, built.program);
        let old_stages = std::mem::replace(&mut entry.stages, built.stages);
        destroy(backend, old_program, old_stages);
        Ok(())
    }

    fn build(
        &self,
        backend: &mut dyn GpuBackend,
        label: &str,
        stages: &[StageSource],
        header: &str,
        process_includes: bool,
    ) -> Result<Built, ProgramError> {
        let mut compiled: Vec<CompiledStage> = Vec::with_capacity(stages.len());
        for source in stages {
            match self.compile(backend, label, source, header, process_includes) {
                Ok(stage) => compiled.push(stage),
                Err(e) => {
                    discard(backend, compiled);
                    return Err(e);
                }
            }
        }
        let ids: Vec<StageId> = compiled.iter().map(|stage| stage.id).collect();
        match backend.link_program(label, &ids) {
            Ok(program) => Ok(Built {
                program,
                stages: compiled,
            }),
            Err(diagnostic) => {
                discard(backend, compiled);
                Err(ProgramError::Link {
                    label: label.to_string(),
                    log: diagnostic.message,
                })
            }
        }
    }

    fn compile(
        &self,
        backend: &mut dyn GpuBackend,
        label: &str,
        source: &StageSource,
        header: &str,
        process_includes: bool,
    ) -> Result<CompiledStage, ProgramError> {
        let file = self.resolver.resolve(&source.file)?;
        let pre = preprocess(self.resolver.as_ref(), file, header, process_includes)?;
        let stage_label = format!("{label}:{}", source.file);
        let id = backend
            .compile_stage(source.stage, &stage_label, &pre.text)
            .map_err(|diagnostic| ProgramError::Compile {
                stage: source.stage,
                file: source.file.clone(),
                log: remap(&diagnostic, &pre.lines),
            })?;
        Ok(CompiledStage {
            id,
            files: pre.files,
            text: pre.text,
        })
    }

    /// Outstanding loads of `handle`.
    pub fn usage_count(&self, handle: ProgramHandle) -> Option<u32> {
        self.entries.get(&handle).map(|entry| entry.usage)
    }

    /// The backend program behind `handle`. Changes on every rebuild.
    pub fn program_id(&self, handle: ProgramHandle) -> Option<ProgramId> {
        self.entries.get(&handle).map(|entry| entry.program)
    }

    /// Stage file names joined by `#`.
    pub fn label(&self, handle: ProgramHandle) -> Option<&str> {
        self.entries.get(&handle).map(|entry| entry.label.as_str())
    }

    /// The preprocessed text `stage` was compiled from.
    pub fn stage_source(&self, handle: ProgramHandle, stage: ShaderStage) -> Option<&str> {
        let entry = self.entries.get(&handle)?;
        entry
            .key
            .stages
            .iter()
            .zip(&entry.stages)
            .find(|(source, _)| source.stage == stage)
            .map(|(_, compiled)| compiled.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every program still held, in load order.
    pub fn live_handles(&self) -> Vec<LiveProgram> {
        self.entries
            .iter()
            .map(|(handle, entry)| LiveProgram {
                handle: *handle,
                label: entry.label.clone(),
                usage: entry.usage,
            })
            .collect()
    }

    /// Destroys every program regardless of usage.
    pub fn clear(&mut self, backend: &mut dyn GpuBackend) {
        self.index.clear();
        for (_, entry) in std::mem::take(&mut self.entries) {
            destroy(backend, entry.program, entry.stages);
        }
    }

    /// Forgets every program without touching the backend that made them.
    pub(crate) fn forget(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}

fn program_label(stages: &[StageSource]) -> String {
    stages
        .iter()
        .map(|stage| stage.file.as_str())
        .collect::<Vec<_>>()
        .join("#")
}

fn discard(backend: &mut dyn GpuBackend, stages: Vec<CompiledStage>) {
    for stage in stages {
        backend.destroy_stage(stage.id);
    }
}

fn destroy(backend: &mut dyn GpuBackend, program: ProgramId, stages: Vec<CompiledStage>) {
    backend.destroy_program(program);
    discard(backend, stages);
}

/// Points a diagnostic at the file and line it came from.
fn remap(diagnostic: &ShaderDiagnostic, lines: &LineMap) -> String {
    match diagnostic.line.and_then(|line| lines.resolve(line)) {
        Some((file, line)) => format!("{file}:{line}: {}", diagnostic.message),
        None => diagnostic.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::wgsl::tests::{FRAGMENT, VERTEX};
    use crate::backend::HeadlessBackend;
    use crate::shader::MemoryResolver;

    fn setup() -> (HeadlessBackend, MemoryResolver, ProgramCache) {
        let files = MemoryResolver::new()
            .with("a.vert", VERTEX)
            .with("a.frag", FRAGMENT);
        let cache = ProgramCache::new(Box::new(files.clone()));
        (HeadlessBackend::new(), files, cache)
    }

    fn stages() -> Vec<StageSource> {
        vec![StageSource::vertex("a.vert"), StageSource::fragment("a.frag")]
    }

    #[test]
    fn identical_loads_share_a_program() {
        let (mut gpu, _, mut cache) = setup();
        let first = cache.load(&mut gpu, &stages(), "", true).unwrap();
        let second = cache.load(&mut gpu, &stages(), "", true).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.usage_count(first), Some(2));
        assert_eq!(gpu.live_objects().programs, 1);
        assert_eq!(cache.label(first), Some("a.vert#a.frag"));
    }

    #[test]
    fn last_dispose_destroys() {
        let (mut gpu, _, mut cache) = setup();
        let handle = cache.load(&mut gpu, &stages(), "", true).unwrap();
        cache.load(&mut gpu, &stages(), "", true).unwrap();
        assert!(cache.dispose(&mut gpu, handle));
        assert_eq!(cache.usage_count(handle), Some(1));
        assert!(cache.dispose(&mut gpu, handle));
        assert_eq!(cache.usage_count(handle), None);
        assert!(gpu.live_objects().is_empty());
        assert!(!cache.dispose(&mut gpu, handle));
    }

    #[test]
    fn include_flag_is_part_of_the_key() {
        let (mut gpu, _, mut cache) = setup();
        let with = cache.load(&mut gpu, &stages(), "", true).unwrap();
        let without = cache.load(&mut gpu, &stages(), "", false).unwrap();
        assert_ne!(with, without);
    }

    #[test]
    fn disabled_caching_always_compiles() {
        let (mut gpu, files, _) = setup();
        let mut cache = ProgramCache::new(Box::new(files)).with_caching(false);
        let a = cache.load(&mut gpu, &stages(), "", true).unwrap();
        let b = cache.load(&mut gpu, &stages(), "", true).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
        cache.dispose(&mut gpu, a);
        cache.dispose(&mut gpu, b);
        assert!(gpu.live_objects().is_empty());
    }

    #[test]
    fn compile_errors_point_at_the_source_file() {
        let (mut gpu, files, mut cache) = setup();
        files.insert("common.wgsl", "fn helper() -> f32 { return 1.0 }\nfn broken( {\n");
        files.insert("bad.frag", "#include \"common.wgsl\"\n@fragment fn fs() {}");
        let err = cache
            .load(
                &mut gpu,
                &[StageSource::vertex("a.vert"), StageSource::fragment("bad.frag")],
                "",
                true,
            )
            .unwrap_err();
        match err {
            ProgramError::Compile { stage, file, log } => {
                assert_eq!(stage, ShaderStage::Fragment);
                assert_eq!(file, "bad.frag");
                assert!(log.starts_with("common.wgsl:"), "{log}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(cache.is_empty());
        assert!(gpu.live_objects().is_empty());
    }

    #[test]
    fn link_errors_release_compiled_stages() {
        let (mut gpu, files, mut cache) = setup();
        files.insert(
            "far.frag",
            "@fragment fn fs(@location(5) x: f32) -> @location(0) vec4f { return vec4f(x); }",
        );
        let err = cache
            .load(
                &mut gpu,
                &[StageSource::vertex("a.vert"), StageSource::fragment("far.frag")],
                "",
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ProgramError::Link { .. }));
        assert!(gpu.live_objects().is_empty());
    }

    #[test]
    fn missing_files_and_empty_requests_fail() {
        let (mut gpu, _, mut cache) = setup();
        assert!(matches!(
            cache.load(&mut gpu, &[StageSource::vertex("nope.vert")], "", true),
            Err(ProgramError::Source(_))
        ));
        assert!(matches!(cache.load(&mut gpu, &[], "", true), Err(ProgramError::NoStages)));
    }

    #[test]
    fn rebuild_keeps_old_program_on_failure() {
        let (mut gpu, files, mut cache) = setup();
        let handle = cache.load(&mut gpu, &stages(), "", true).unwrap();
        let before = cache.program_id(handle);

        files.insert("a.frag", "this is not wgsl");
        assert!(!cache.rebuild_all_from_file(&mut gpu));
        assert_eq!(cache.program_id(handle), before);

        files.insert("a.frag", FRAGMENT);
        assert!(cache.rebuild_all_from_file(&mut gpu));
        assert_ne!(cache.program_id(handle), before);
        assert_eq!(gpu.live_objects().programs, 1);
        assert_eq!(gpu.live_objects().stages, 2);
    }

    #[test]
    fn only_modified_programs_reload() {
        let (mut gpu, files, mut cache) = setup();
        files.insert("b.frag", FRAGMENT);
        let a = cache.load(&mut gpu, &stages(), "", true).unwrap();
        let b = cache
            .load(&mut gpu, &[StageSource::vertex("a.vert"), StageSource::fragment("b.frag")], "", true)
            .unwrap();
        assert!(cache.rebuild_modified(&mut gpu).is_empty());

        files.insert("b.frag", FRAGMENT);
        assert_eq!(cache.rebuild_modified(&mut gpu), vec![b]);
        assert!(cache.rebuild_modified(&mut gpu).is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn stage_source_includes_header() {
        let (mut gpu, _, mut cache) = setup();
        let handle = cache
            .load(&mut gpu, &stages(), "const GAIN: f32 = 2.0;", true)
            .unwrap();
        let text = cache.stage_source(handle, ShaderStage::Fragment).unwrap();
        assert!(text.starts_with("// BEGIN HEADER\nconst GAIN: f32 = 2.0;\n"));
        assert!(cache.stage_source(handle, ShaderStage::Compute).is_none());
    }
}
