//! The graphics context every GPU-touching operation goes through.
//!
//! [`GraphicsContext`] owns the backend, the capabilities queried from it at
//! creation, the [`SlotAllocator`], the [`ProgramCache`] and the binding of
//! the currently active shared surface container. It is created once and
//! passed by `&mut` to surface containers, processors and the evaluator.
//!
//! # Example
//!
//! ```
//! use phalanx::{GraphicsContext, HeadlessBackend, RuntimeConfig};
//!
//! let mut ctx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
//! let slot = ctx.acquire_slot(false).unwrap();
//! assert_eq!(slot.slot(), 0);
//! drop(slot);
//!
//! let report = ctx.shutdown();
//! assert!(report.is_clean());
//! ```

use std::fmt;

use crate::backend::{
    AttachmentPoint, FramebufferId, GpuBackend, GpuCapabilities, LiveObjects, TextureId,
};
use crate::config::RuntimeConfig;
use crate::error::{BackendError, ProcessError, ProgramError, SlotError};
use crate::shader::{LiveProgram, ProgramCache, ProgramHandle, StageSource};
use crate::slots::{SlotAllocator, SlotClaim};

/// Identity of a [`SurfaceContainer`](crate::SurfaceContainer), issued by
/// the context that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

impl ContainerId {
    /// The number behind the id, for logs and debug labels.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// The shared container currently holding the render binding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SharedBinding {
    pub owner: ContainerId,
    pub framebuffer: FramebufferId,
    pub points: Vec<AttachmentPoint>,
}

/// Owner of the backend and the per-device resource managers.
///
/// The context is `!Send`: slot claims share the allocator's table.
pub struct GraphicsContext {
    backend: Box<dyn GpuBackend>,
    caps: GpuCapabilities,
    config: RuntimeConfig,
    slots: SlotAllocator,
    programs: ProgramCache,
    shared: Option<SharedBinding>,
    next_container: u64,
}

impl GraphicsContext {
    /// Creates a context on `backend`.
    ///
    /// Capabilities are queried once here. The slot allocator is sized to
    /// the device's sampling slots, capped by the
    /// configured `max_sampling_slots`, and the program cache takes its
    /// search paths and keying policy from `config`.
    pub fn new(backend: impl GpuBackend + 'static, config: RuntimeConfig) -> Self {
        Self::from_boxed(Box::new(backend), config)
    }

    /// Like [`new`](Self::new), for a backend chosen at runtime.
    pub fn from_boxed(backend: Box<dyn GpuBackend>, config: RuntimeConfig) -> Self {
        let caps = backend.capabilities();
        let slots = SlotAllocator::new(sampling_slots(&caps, &config));
        let programs = ProgramCache::from_config(&config);
        log::debug!(
            "graphics context on `{}`: {} sampling slots, surfaces up to {}, {} color targets",
            caps.vendor,
            slots.capacity(),
            caps.max_surface_size,
            caps.max_color_attachments
        );
        Self {
            backend,
            caps,
            config,
            slots,
            programs,
            shared: None,
            next_container: 1,
        }
    }

    /// Device limits queried when the backend was installed.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.caps
    }

    /// The configuration the context was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The device behind the context.
    ///
    /// Draw calls and clears go straight to the backend; everything that
    /// owns GPU objects across frames goes through the context instead.
    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    /// Mutable access to the device, e.g. for `clear` and `draw_fullscreen`.
    pub fn backend_mut(&mut self) -> &mut dyn GpuBackend {
        self.backend.as_mut()
    }

    /// The backend as its concrete type, if it is a `B`.
    pub fn backend_as<B: GpuBackend + 'static>(&self) -> Option<&B> {
        self.backend.as_any().downcast_ref()
    }

    /// The sampling-slot table of this device.
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// Claims the lowest free sampling slot. See [`SlotAllocator::acquire`].
    pub fn acquire_slot(&self, keep: bool) -> Result<SlotClaim, SlotError> {
        self.slots.acquire(keep)
    }

    /// Binds `texture` at the slot `claim` holds and makes it the active slot.
    pub fn bind_texture(&mut self, claim: &SlotClaim, texture: Option<TextureId>) -> Result<(), BackendError> {
        self.backend.select_sampling_slot(claim.slot());
        self.backend.bind_texture(claim.slot(), texture)
    }

    /// Forgets all slot claims and returns the device to slot 0.
    pub fn reset_sampling_slots(&mut self) {
        self.slots.cleanup();
        self.backend.select_sampling_slot(0);
    }

    /// The shared program cache.
    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Mutable access to the program cache, e.g. to install a
    /// [`SourceResolver`](crate::SourceResolver).
    pub fn programs_mut(&mut self) -> &mut ProgramCache {
        &mut self.programs
    }

    /// Loads a program through the cache, compiling it on first use.
    ///
    /// Two requests with the same stages and header share one program; each
    /// successful call must be paired with a
    /// [`dispose_program`](Self::dispose_program).
    ///
    /// # Errors
    ///
    /// Missing files, include errors and compiler diagnostics come back as
    /// [`ProgramError`]. Nothing is cached on failure.
    pub fn load_program(
        &mut self,
        stages: &[StageSource],
        header: &str,
        process_includes: bool,
    ) -> Result<ProgramHandle, ProgramError> {
        self.programs
            .load(self.backend.as_mut(), stages, header, process_includes)
    }

    /// Drops one reference to the program. Returns `false` for handles the
    /// cache does not know.
    pub fn dispose_program(&mut self, handle: ProgramHandle) -> bool {
        self.programs.dispose(self.backend.as_mut(), handle)
    }

    /// Recompiles every cached program from its files. Returns whether all
    /// of them compiled; failed ones keep their previous build.
    pub fn rebuild_all_programs(&mut self) -> bool {
        self.programs.rebuild_all_from_file(self.backend.as_mut())
    }

    /// Recompiles programs whose files, or included files, changed since
    /// they were loaded, and returns the ones that now run the new source.
    pub fn rebuild_modified_programs(&mut self) -> Vec<ProgramHandle> {
        self.programs.rebuild_modified(self.backend.as_mut())
    }

    /// Makes the program behind `handle` current, or none.
    pub fn use_program(&mut self, handle: Option<ProgramHandle>) -> Result<(), ProcessError> {
        let program = match handle {
            Some(handle) => Some(
                self.programs
                    .program_id(handle)
                    .ok_or(ProgramError::UnknownHandle(handle))?,
            ),
            None => None,
        };
        self.backend.use_program(program)?;
        Ok(())
    }

    pub(crate) fn next_container_id(&mut self) -> ContainerId {
        let id = ContainerId(self.next_container);
        self.next_container += 1;
        id
    }

    pub(crate) fn shared_binding(&self) -> Option<&SharedBinding> {
        self.shared.as_ref()
    }

    pub(crate) fn set_shared_binding(&mut self, binding: Option<SharedBinding>) {
        self.shared = binding;
    }

    /// The shared container that currently owns the render binding.
    pub fn active_shared_container(&self) -> Option<ContainerId> {
        self.shared.as_ref().map(|binding| binding.owner)
    }

    /// What is still alive right now.
    pub fn leak_report(&self) -> LeakReport {
        LeakReport {
            programs: self.programs.live_handles(),
            slot_claims: self.slots.num_live(),
            backend: self.backend.live_objects(),
        }
    }

    /// Swaps in a new backend, e.g. after the device was lost.
    ///
    /// Programs and slot claims belong to the old device and are dropped
    /// after being reported. Returns that report.
    pub fn recreate(&mut self, backend: Box<dyn GpuBackend>) -> LeakReport {
        let report = self.leak_report();
        report.log();
        self.programs.forget();
        self.shared = None;
        self.backend = backend;
        self.caps = self.backend.capabilities();
        self.slots.init(sampling_slots(&self.caps, &self.config));
        log::info!("graphics context recreated on `{}`", self.caps.vendor);
        report
    }

    /// Tears the context down and reports, and logs, whatever was not
    /// released.
    pub fn shutdown(mut self) -> LeakReport {
        let report = self.leak_report();
        report.log();
        self.programs.clear(self.backend.as_mut());
        self.slots.cleanup();
        report
    }
}

fn sampling_slots(caps: &GpuCapabilities, config: &RuntimeConfig) -> u32 {
    match config.max_sampling_slots {
        Some(limit) => limit.min(caps.max_sampling_slots),
        None => caps.max_sampling_slots,
    }
}

/// Resources still held when a context was shut down or recreated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Programs whose usage count never reached zero.
    pub programs: Vec<LiveProgram>,
    /// Sampling-slot claims still held.
    pub slot_claims: u32,
    /// Textures, framebuffers and shader objects the device still holds.
    pub backend: LiveObjects,
}

impl LeakReport {
    /// Whether nothing was left behind.
    pub fn is_clean(&self) -> bool {
        self.programs.is_empty() && self.slot_claims == 0 && self.backend.is_empty()
    }

    fn log(&self) {
        for program in &self.programs {
            log::error!(
                "program `{}` still alive with usage count {}",
                program.label,
                program.usage
            );
        }
        if self.slot_claims > 0 {
            log::error!("{} sampling slot claims still alive", self.slot_claims);
        }
        if !self.backend.is_empty() {
            log::error!("backend objects still alive: {self}");
        }
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} programs, {} slot claims, {} textures, {} framebuffers, {} stages, {} linked programs",
            self.programs.len(),
            self.slot_claims,
            self.backend.textures,
            self.backend.framebuffers,
            self.backend.stages,
            self.backend.programs
        )
    }
}
