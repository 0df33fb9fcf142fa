use crate::backend::GpuCapabilities;
use crate::error::{ProcessError, ProgramError};
use crate::gpu::GraphicsContext;
use crate::shader::{ProgramHandle, SourceFile, StageSource};

/// Builds the header every program of a processor starts with.
///
/// The generator sees the device limits, so programs can size arrays by
/// what the device offers instead of hard-coding them.
pub type HeaderGenerator = fn(&GpuCapabilities) -> String;

/// Device limits as WGSL constants.
///
/// Declares `MAX_COLOR_TARGETS` and `MAX_SAMPLING_SLOTS`. This is the
/// generator a [`ProgramHelper`] starts with.
pub fn default_header(caps: &GpuCapabilities) -> String {
    format!(
        "const MAX_COLOR_TARGETS: u32 = {}u;\nconst MAX_SAMPLING_SLOTS: u32 = {}u;\n",
        caps.max_color_attachments, caps.max_sampling_slots
    )
}

/// The program a shading processor owns.
///
/// Loads through the context's [`ProgramCache`](crate::ProgramCache), swaps
/// in a rebuilt program only once it compiled, and releases its reference on
/// [`dispose`](Self::dispose).
///
/// The header of every build is the generator's output followed by the
/// defines; changing the defines is how a processor parametrizes its
/// program. After a failed build the helper remembers the stage files it
/// tried, so [`sources_changed`](Self::sources_changed) can tell when
/// another attempt is worth making.
///
/// # Example
///
/// ```
/// use phalanx::processors::{ProgramHelper, COPY_FRAGMENT, FULLSCREEN_VERTEX};
/// use phalanx::{GraphicsContext, HeadlessBackend, MemoryResolver, RuntimeConfig, StageSource};
///
/// let files = MemoryResolver::new()
///     .with("fullscreen.vert", FULLSCREEN_VERTEX)
///     .with("copy.frag", COPY_FRAGMENT);
/// let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
/// gfx.programs_mut().set_resolver(Box::new(files));
///
/// let mut program = ProgramHelper::new(vec![
///     StageSource::vertex("fullscreen.vert"),
///     StageSource::fragment("copy.frag"),
/// ]);
/// program.rebuild(&mut gfx).unwrap();
/// program.activate(&mut gfx).unwrap();
/// program.deactivate(&mut gfx).unwrap();
///
/// program.dispose(&mut gfx);
/// assert!(gfx.shutdown().is_clean());
/// ```
pub struct ProgramHelper {
    stages: Vec<StageSource>,
    generator: HeaderGenerator,
    defines: String,
    process_includes: bool,
    handle: Option<ProgramHandle>,
    /// Stage files as they were when the last build failed; `None` for
    /// files that could not be found.
    failed_sources: Option<Vec<(String, Option<SourceFile>)>>,
}

impl ProgramHelper {
    /// A helper for `stages` with the [`default_header`] and include
    /// processing on. Nothing is loaded until [`rebuild`](Self::rebuild).
    pub fn new(stages: Vec<StageSource>) -> Self {
        Self {
            stages,
            generator: default_header,
            defines: String::new(),
            process_includes: true,
            handle: None,
            failed_sources: None,
        }
    }

    /// Replaces the header generator.
    pub fn with_generator(mut self, generator: HeaderGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Turns `#include` expansion on or off for every build.
    pub fn with_includes(mut self, enabled: bool) -> Self {
        self.process_includes = enabled;
        self
    }

    /// Text appended to the generated header. Returns whether it changed;
    /// the caller then rebuilds.
    pub fn set_defines(&mut self, defines: impl Into<String>) -> bool {
        let defines = defines.into();
        if defines == self.defines {
            return false;
        }
        self.defines = defines;
        true
    }

    /// The text currently appended to the header.
    pub fn defines(&self) -> &str {
        &self.defines
    }

    /// The stage files the program is built from.
    pub fn stages(&self) -> &[StageSource] {
        &self.stages
    }

    /// The header the next build uses on a device with `caps`.
    pub fn header(&self, caps: &GpuCapabilities) -> String {
        let mut header = (self.generator)(caps);
        if !self.defines.is_empty() {
            header.push_str(&self.defines);
            if !self.defines.ends_with('\n') {
                header.push('\n');
            }
        }
        header
    }

    /// The loaded program, or `None` before the first successful build.
    pub fn handle(&self) -> Option<ProgramHandle> {
        self.handle
    }

    /// Loads the program with the current header.
    ///
    /// On failure the previous program, if any, stays in place.
    pub fn rebuild(&mut self, gfx: &mut GraphicsContext) -> Result<ProgramHandle, ProgramError> {
        let header = self.header(gfx.capabilities());
        let handle = match gfx.load_program(&self.stages, &header, self.process_includes) {
            Ok(handle) => handle,
            Err(e) => {
                let resolver = gfx.programs().resolver();
                let snapshot = self
                    .stages
                    .iter()
                    .map(|stage| (stage.file.clone(), resolver.resolve(&stage.file).ok()))
                    .collect();
                self.failed_sources = Some(snapshot);
                return Err(e);
            }
        };
        self.failed_sources = None;
        if let Some(old) = self.handle.replace(handle) {
            gfx.dispose_program(old);
        }
        Ok(handle)
    }

    /// Whether a stage file changed since the last failed build. Edits to
    /// included files are not seen here.
    pub fn sources_changed(&self, gfx: &GraphicsContext) -> bool {
        let Some(failed) = &self.failed_sources else {
            return false;
        };
        let resolver = gfx.programs().resolver();
        failed.iter().any(|(name, file)| match file {
            Some(file) => resolver.is_modified(file),
            None => resolver.resolve(name).is_ok(),
        })
    }

    /// Releases the program. Call it from
    /// [`Processor::deinitialize`](crate::Processor::deinitialize).
    pub fn dispose(&mut self, gfx: &mut GraphicsContext) {
        if let Some(handle) = self.handle.take() {
            gfx.dispose_program(handle);
        }
    }

    /// Makes the program current.
    pub fn activate(&self, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        let handle = self
            .handle
            .ok_or_else(|| ProcessError::Message("program is not loaded".into()))?;
        gfx.use_program(Some(handle))
    }

    /// Leaves no program current.
    pub fn deactivate(&self, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        gfx.use_program(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::wgsl::tests::{FRAGMENT, VERTEX};
    use crate::backend::HeadlessBackend;
    use crate::config::RuntimeConfig;
    use crate::shader::MemoryResolver;

    fn context() -> (GraphicsContext, MemoryResolver) {
        let files = MemoryResolver::new()
            .with("fill.vert", VERTEX)
            .with("fill.frag", FRAGMENT);
        let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
        gfx.programs_mut().set_resolver(Box::new(files.clone()));
        (gfx, files)
    }

    fn helper() -> ProgramHelper {
        ProgramHelper::new(vec![
            StageSource::vertex("fill.vert"),
            StageSource::fragment("fill.frag"),
        ])
    }

    #[test]
    fn header_carries_limits_and_defines() {
        let mut program = helper();
        assert!(program.set_defines("const GAIN: f32 = 2.0;"));
        assert!(!program.set_defines("const GAIN: f32 = 2.0;"));
        let header = program.header(&GpuCapabilities::default());
        assert!(header.starts_with("const MAX_COLOR_TARGETS: u32 = 8u;"));
        assert!(header.ends_with("const GAIN: f32 = 2.0;\n"));

        fn fixed(_: &GpuCapabilities) -> String {
            "const FIXED: u32 = 1u;\n".into()
        }
        let custom = helper().with_generator(fixed);
        assert_eq!(custom.header(&GpuCapabilities::default()), "const FIXED: u32 = 1u;\n");
    }

    #[test]
    fn includes_can_be_left_to_the_compiler() {
        let (mut gfx, files) = context();
        files.insert("inc.frag", "#include \"fill.frag\"\n");
        let stages = vec![StageSource::vertex("fill.vert"), StageSource::fragment("inc.frag")];
        let mut expanded = ProgramHelper::new(stages.clone());
        expanded.rebuild(&mut gfx).unwrap();
        let mut raw = ProgramHelper::new(stages).with_includes(false);
        assert!(raw.rebuild(&mut gfx).is_err());
        expanded.dispose(&mut gfx);
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn rebuild_swaps_and_dispose_releases() {
        let (mut gfx, _files) = context();
        let mut program = helper();
        let first = program.rebuild(&mut gfx).unwrap();
        program.set_defines("const GAIN: f32 = 2.0;");
        let second = program.rebuild(&mut gfx).unwrap();
        assert_ne!(first, second);
        assert_eq!(gfx.programs().len(), 1);
        assert!(gfx.programs().stage_source(second, crate::backend::ShaderStage::Fragment).unwrap().contains("GAIN"));

        program.activate(&mut gfx).unwrap();
        program.dispose(&mut gfx);
        assert!(program.handle().is_none());
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn failed_rebuild_keeps_the_old_program() {
        let (mut gfx, files) = context();
        let mut program = helper();
        let first = program.rebuild(&mut gfx).unwrap();
        files.insert("fill.frag", "fn broken(");
        program.set_defines("const X: u32 = 1u;");
        assert!(program.rebuild(&mut gfx).is_err());
        assert_eq!(program.handle(), Some(first));
        program.dispose(&mut gfx);
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn failed_builds_remember_their_sources() {
        let (mut gfx, files) = context();
        let mut program = ProgramHelper::new(vec![
            StageSource::vertex("fill.vert"),
            StageSource::fragment("late.frag"),
        ]);
        assert!(!program.sources_changed(&gfx));
        assert!(program.rebuild(&mut gfx).is_err());
        assert!(!program.sources_changed(&gfx));

        files.insert("late.frag", "fn broken(");
        assert!(program.sources_changed(&gfx));
        assert!(program.rebuild(&mut gfx).is_err());
        assert!(!program.sources_changed(&gfx));

        files.insert("late.frag", FRAGMENT);
        assert!(program.sources_changed(&gfx));
        program.rebuild(&mut gfx).unwrap();
        assert!(!program.sources_changed(&gfx));
        program.dispose(&mut gfx);
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn activate_without_program_is_an_error() {
        let (mut gfx, _files) = context();
        assert!(matches!(
            helper().activate(&mut gfx),
            Err(ProcessError::Message(_))
        ));
    }
}
