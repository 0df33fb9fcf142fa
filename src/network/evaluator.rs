use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::EvaluatorError;
use crate::gpu::GraphicsContext;
use crate::network::{negotiate_sizes, InvalidationLevel, ProcessorId, ProcessorNetwork};

/// Hooks around every processor the evaluator runs.
///
/// Wrappers observe; they get the network by shared reference and cannot
/// change what runs. [`ProcessTimer`] is the one shipped with the crate.
/// Every hook has an empty default.
pub trait ProcessWrapper {
    /// Called once at the start of a pass, before initialization.
    fn before_network_process(&mut self, network: &ProcessorNetwork) {
        let _ = network;
    }

    fn before_process(&mut self, network: &ProcessorNetwork, id: ProcessorId) {
        let _ = (network, id);
    }

    fn after_process(&mut self, network: &ProcessorNetwork, id: ProcessorId) {
        let _ = (network, id);
    }

    /// Called once at the end of a pass.
    fn after_network_process(&mut self, network: &ProcessorNetwork) {
        let _ = network;
    }
}

/// Logs how long each processor and each pass took.
#[derive(Debug, Default)]
pub struct ProcessTimer {
    pass_start: Option<Instant>,
    started: HashMap<ProcessorId, Instant>,
    last_pass: Vec<(ProcessorId, Duration)>,
}

impl ProcessTimer {
    /// A timer with no measurements yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations measured during the most recent pass, in visit order.
    pub fn last_pass(&self) -> &[(ProcessorId, Duration)] {
        &self.last_pass
    }
}

impl ProcessWrapper for ProcessTimer {
    fn before_network_process(&mut self, _network: &ProcessorNetwork) {
        self.last_pass.clear();
        self.pass_start = Some(Instant::now());
    }

    fn before_process(&mut self, _network: &ProcessorNetwork, id: ProcessorId) {
        self.started.insert(id, Instant::now());
    }

    fn after_process(&mut self, network: &ProcessorNetwork, id: ProcessorId) {
        if let Some(start) = self.started.remove(&id) {
            let elapsed = start.elapsed();
            log::debug!(
                "`{}` processed in {:.3} ms",
                network.processor_name(id).unwrap_or_default(),
                elapsed.as_secs_f64() * 1000.0
            );
            self.last_pass.push((id, elapsed));
        }
    }

    fn after_network_process(&mut self, _network: &ProcessorNetwork) {
        if let Some(start) = self.pass_start.take() {
            log::debug!(
                "network pass took {:.3} ms",
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
    }
}

/// What happened during one evaluator pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Processors whose `process` succeeded, in rendering order.
    pub processed: Vec<ProcessorId>,
    /// Invalid processors that could not run; they are retried next pass.
    pub not_ready: Vec<ProcessorId>,
    /// Processors whose program rebuild or `process` returned an error.
    /// Their level is reset anyway, so they run again only once invalidated.
    pub failed: Vec<ProcessorId>,
}

impl FrameReport {
    /// Whether the pass had nothing to do.
    pub fn is_idle(&self) -> bool {
        self.processed.is_empty() && self.not_ready.is_empty() && self.failed.is_empty()
    }
}

/// Drives a [`ProcessorNetwork`] one frame at a time.
///
/// Each [`process`](Self::process) call:
///
/// 1. initializes processors that are not yet initialized
/// 2. recomputes the rendering order if connections changed
/// 3. negotiates render sizes and resizes surface containers
/// 4. visits the rendering order, running every ready processor whose level
///    is above [`InvalidationLevel::Valid`] and resetting it afterwards
///
/// # Example
///
/// ```
/// use glam::{UVec2, Vec4};
/// use phalanx::processors::{Canvas, ImageSource};
/// use phalanx::{GraphicsContext, HeadlessBackend, NetworkEvaluator, ProcessorNetwork, RuntimeConfig};
///
/// let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
/// let mut network = ProcessorNetwork::new();
/// let source = network.add("source", ImageSource::new(UVec2::new(4, 4), Vec4::X)).unwrap();
/// let canvas = network.add("canvas", Canvas::new()).unwrap();
/// network.connect_ports(source, "image", canvas, "image").unwrap();
///
/// let mut evaluator = NetworkEvaluator::new();
/// let report = evaluator.process(&mut network, &mut gfx).unwrap();
/// assert_eq!(report.processed, vec![source, canvas]);
///
/// // Nothing changed, nothing runs.
/// assert!(evaluator.process(&mut network, &mut gfx).unwrap().is_idle());
///
/// evaluator.deinitialize_network(&mut network, &mut gfx);
/// assert!(gfx.shutdown().is_clean());
/// ```
#[derive(Default)]
pub struct NetworkEvaluator {
    order: Vec<ProcessorId>,
    wrappers: Vec<Box<dyn ProcessWrapper>>,
    locked: bool,
    pending: bool,
}

impl NetworkEvaluator {
    /// An unlocked evaluator with no wrappers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a wrapper; wrappers run in the order they were added.
    pub fn add_process_wrapper(&mut self, wrapper: impl ProcessWrapper + 'static) {
        self.wrappers.push(Box::new(wrapper));
    }

    /// Refuses passes until [`unlock`](Self::unlock).
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Allows passes again. A pass requested while locked is not replayed;
    /// check [`has_pending`](Self::has_pending).
    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether a pass was requested while locked.
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// The order of the last pass.
    pub fn rendering_order(&self) -> &[ProcessorId] {
        &self.order
    }

    /// Runs one pass over the network.
    pub fn process(
        &mut self,
        network: &mut ProcessorNetwork,
        gfx: &mut GraphicsContext,
    ) -> Result<FrameReport, EvaluatorError> {
        if self.locked {
            self.pending = true;
            log::debug!("evaluator locked, pass deferred");
            return Err(EvaluatorError::Locked);
        }
        self.locked = true;
        self.pending = false;
        let report = self.run_pass(network, gfx);
        self.locked = false;
        Ok(report)
    }

    /// Invalidates everything with [`InvalidationLevel::InvalidResult`] and
    /// runs a pass.
    pub fn force_update(
        &mut self,
        network: &mut ProcessorNetwork,
        gfx: &mut GraphicsContext,
    ) -> Result<FrameReport, EvaluatorError> {
        self.invalidate_processors(network, InvalidationLevel::InvalidResult);
        self.process(network, gfx)
    }

    /// Raises every processor to at least `level`.
    pub fn invalidate_processors(&self, network: &mut ProcessorNetwork, level: InvalidationLevel) {
        for id in network.processors().to_vec() {
            network.invalidate(id, level);
        }
    }

    /// Initializes every processor that is not yet initialized. Returns
    /// whether all of them are initialized afterwards.
    ///
    /// A processor whose `initialize` failed is logged once and skipped on
    /// later calls until one of its properties changes, it is invalidated
    /// with [`InvalidationLevel::InvalidProgram`] or above, or
    /// [`Processor::retry_initialize`](crate::Processor::retry_initialize)
    /// asks for another attempt.
    pub fn initialize_network(&mut self, network: &mut ProcessorNetwork, gfx: &mut GraphicsContext) -> bool {
        let mut ok = true;
        for id in network.processors().to_vec() {
            if network.is_initialized(id) {
                continue;
            }
            if !network.should_initialize(id, gfx) {
                ok = false;
                continue;
            }
            if let Err(e) = network.initialize_processor(id, gfx) {
                log::error!(
                    "failed to initialize `{}`: {e}",
                    network.processor_name(id).unwrap_or_default()
                );
                ok = false;
            }
        }
        ok
    }

    /// Deinitializes every initialized processor, releasing its surface
    /// container. Returns whether all of them succeeded.
    pub fn deinitialize_network(&mut self, network: &mut ProcessorNetwork, gfx: &mut GraphicsContext) -> bool {
        let mut ok = true;
        for id in network.processors().to_vec() {
            if !network.is_initialized(id) {
                continue;
            }
            if let Err(e) = network.deinitialize_processor(id, gfx) {
                log::error!(
                    "failed to deinitialize `{}`: {e}",
                    network.processor_name(id).unwrap_or_default()
                );
                ok = false;
            }
        }
        self.order.clear();
        ok
    }

    /// Rebuilds programs whose source files changed and invalidates the
    /// network if any were rebuilt.
    pub fn check_hot_reload(&mut self, network: &mut ProcessorNetwork, gfx: &mut GraphicsContext) -> bool {
        let rebuilt = gfx.rebuild_modified_programs();
        if rebuilt.is_empty() {
            return false;
        }
        log::info!("{} programs rebuilt from modified sources", rebuilt.len());
        self.invalidate_processors(network, InvalidationLevel::InvalidResult);
        true
    }

    fn run_pass(&mut self, network: &mut ProcessorNetwork, gfx: &mut GraphicsContext) -> FrameReport {
        let mut report = FrameReport::default();
        for wrapper in &mut self.wrappers {
            wrapper.before_network_process(network);
        }

        self.initialize_network(network, gfx);

        let mut reorder = network.take_topology_dirty();
        for id in network.processors().to_vec() {
            if network.level(id) >= Some(InvalidationLevel::InvalidPorts) {
                network.set_level(id, InvalidationLevel::InvalidProgram);
                reorder = true;
            }
        }
        if reorder {
            self.order = network.rendering_order();
            log::debug!(
                "rendering order: {:?}",
                self.order
                    .iter()
                    .map(|id| network.processor_name(*id).unwrap_or_default())
                    .collect::<Vec<_>>()
            );
        }

        negotiate_sizes(network);
        for id in self.order.clone() {
            if let Err(e) = network.resize_container(id, gfx) {
                log::error!(
                    "failed to resize `{}`: {e}",
                    network.processor_name(id).unwrap_or_default()
                );
            }
        }

        for id in self.order.clone() {
            let Some(level) = network.level(id) else {
                continue;
            };
            if level.is_valid() {
                continue;
            }
            if !network.is_ready(id) {
                log::trace!(
                    "`{}` not ready, retried next pass",
                    network.processor_name(id).unwrap_or_default()
                );
                report.not_ready.push(id);
                continue;
            }

            for wrapper in &mut self.wrappers {
                wrapper.before_process(network, id);
            }
            let result = if level.needs_program_rebuild() {
                network
                    .rebuild_programs(id, gfx)
                    .and_then(|()| network.process_processor(id, gfx))
            } else {
                network.process_processor(id, gfx)
            };
            for wrapper in &mut self.wrappers {
                wrapper.after_process(network, id);
            }

            match result {
                Ok(()) => report.processed.push(id),
                Err(e) => {
                    log::error!(
                        "processor `{}` failed: {e}",
                        network.processor_name(id).unwrap_or_default()
                    );
                    report.failed.push(id);
                }
            }
            network.set_level(id, InvalidationLevel::Valid);
        }

        for wrapper in &mut self.wrappers {
            wrapper.after_network_process(network);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    use glam::{UVec2, Vec4};

    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::config::RuntimeConfig;
    use crate::error::{ProcessError, PropertyError};
    use crate::network::{PortSpec, ProcessContext, Processor, ProcessorContext, PropertyValue};

    #[derive(Default)]
    struct Calls {
        attempts: u32,
        initialized: u32,
        rebuilt: u32,
        processed: Vec<InvalidationLevel>,
    }

    struct Recorder {
        specs: Vec<PortSpec>,
        calls: Rc<RefCell<Calls>>,
        fail_init: bool,
        fail_process: bool,
        native: Option<UVec2>,
    }

    impl Recorder {
        fn new(specs: Vec<PortSpec>, calls: &Rc<RefCell<Calls>>) -> Self {
            Self {
                specs,
                calls: Rc::clone(calls),
                fail_init: false,
                fail_process: false,
                native: None,
            }
        }
    }

    impl Processor for Recorder {
        fn type_name(&self) -> &'static str {
            "Recorder"
        }

        fn ports(&self) -> Vec<PortSpec> {
            self.specs.clone()
        }

        fn initialize(&mut self, _ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
            self.calls.borrow_mut().attempts += 1;
            if self.fail_init {
                return Err(ProcessError::Message("no device".into()));
            }
            self.calls.borrow_mut().initialized += 1;
            Ok(())
        }

        fn rebuild_programs(&mut self, _ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
            self.calls.borrow_mut().rebuilt += 1;
            Ok(())
        }

        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            self.calls.borrow_mut().processed.push(ctx.level());
            if self.fail_process {
                return Err(ProcessError::Message("boom".into()));
            }
            if ctx.output("out").is_some() {
                ctx.activate_outport("out")?;
                ctx.clear(Some(Vec4::ONE), Some(1.0))?;
            }
            Ok(())
        }

        fn native_size(&self, _port: &str) -> Option<UVec2> {
            self.native
        }

        fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<InvalidationLevel, PropertyError> {
            match name {
                "fail_init" => {
                    self.fail_init = value.expect_with(name, PropertyValue::as_bool, "bool")?;
                    Ok(InvalidationLevel::InvalidResult)
                }
                _ => Err(PropertyError::Unknown(name.to_owned())),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Setup {
        gfx: GraphicsContext,
        network: ProcessorNetwork,
        source: ProcessorId,
        sink: ProcessorId,
        source_calls: Rc<RefCell<Calls>>,
        sink_calls: Rc<RefCell<Calls>>,
    }

    fn setup(size: UVec2) -> Setup {
        let gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
        let mut network = ProcessorNetwork::new();
        let source_calls = Rc::new(RefCell::new(Calls::default()));
        let sink_calls = Rc::new(RefCell::new(Calls::default()));
        let mut source = Recorder::new(vec![PortSpec::render_out("out").origin()], &source_calls);
        source.native = Some(size);
        let source = network.add("source", source).unwrap();
        let sink = network
            .add("sink", Recorder::new(vec![PortSpec::render_in("in")], &sink_calls))
            .unwrap();
        network.connect_ports(source, "out", sink, "in").unwrap();
        Setup {
            gfx,
            network,
            source,
            sink,
            source_calls,
            sink_calls,
        }
    }

    impl Setup {
        fn teardown(mut self) {
            NetworkEvaluator::new().deinitialize_network(&mut self.network, &mut self.gfx);
            assert!(self.gfx.shutdown().is_clean());
        }
    }

    #[test]
    fn first_pass_initializes_rebuilds_and_processes_in_order() {
        let mut s = setup(UVec2::new(4, 4));
        let mut evaluator = NetworkEvaluator::new();
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(report.processed, vec![s.source, s.sink]);
        assert_eq!(evaluator.rendering_order(), &[s.source, s.sink]);
        assert_eq!(s.source_calls.borrow().initialized, 1);
        assert_eq!(s.source_calls.borrow().rebuilt, 1);
        assert_eq!(
            s.sink_calls.borrow().processed,
            vec![InvalidationLevel::InvalidProgram]
        );
        assert_eq!(s.network.level(s.sink), Some(InvalidationLevel::Valid));
        let out = s.network.port(s.source, "out").unwrap();
        assert!(s.network.has_valid_result(out));
        s.teardown();
    }

    #[test]
    fn only_invalid_processors_run() {
        let mut s = setup(UVec2::new(4, 4));
        let mut evaluator = NetworkEvaluator::new();
        evaluator.process(&mut s.network, &mut s.gfx).unwrap();

        s.network.invalidate(s.sink, InvalidationLevel::InvalidResult);
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(report.processed, vec![s.sink]);
        assert_eq!(s.sink_calls.borrow().rebuilt, 1);
        assert_eq!(s.source_calls.borrow().processed.len(), 1);

        let report = evaluator.force_update(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(report.processed, vec![s.source, s.sink]);
        s.teardown();
    }

    #[test]
    fn zero_sized_processors_are_skipped_and_retried() {
        let mut s = setup(UVec2::ZERO);
        let mut evaluator = NetworkEvaluator::new();
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert!(report.processed.is_empty());
        assert_eq!(report.not_ready, vec![s.source, s.sink]);
        assert_eq!(s.network.level(s.source), Some(InvalidationLevel::InvalidProgram));

        let out = s.network.port(s.source, "out").unwrap();
        s.network.request_size(out, UVec2::new(2, 2)).unwrap();
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(report.processed, vec![s.source, s.sink]);
        s.teardown();
    }

    #[test]
    fn failed_initialization_leaves_the_processor_unready() {
        let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut network = ProcessorNetwork::new();
        let mut broken = Recorder::new(vec![PortSpec::render_in("in").optional()], &calls);
        broken.fail_init = true;
        let id = network.add("broken", broken).unwrap();

        let mut evaluator = NetworkEvaluator::new();
        assert!(!evaluator.initialize_network(&mut network, &mut gfx));
        let report = evaluator.process(&mut network, &mut gfx).unwrap();
        assert_eq!(report.not_ready, vec![id]);
        assert!(network.container(id).is_none());
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn failed_initialization_waits_for_a_change() {
        let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut network = ProcessorNetwork::new();
        let mut broken = Recorder::new(vec![PortSpec::render_in("in").optional()], &calls);
        broken.fail_init = true;
        let id = network.add("broken", broken).unwrap();

        let mut evaluator = NetworkEvaluator::new();
        for _ in 0..3 {
            evaluator.process(&mut network, &mut gfx).unwrap();
        }
        assert_eq!(calls.borrow().attempts, 1);

        network.invalidate(id, InvalidationLevel::InvalidResult);
        evaluator.process(&mut network, &mut gfx).unwrap();
        assert_eq!(calls.borrow().attempts, 1);

        network.invalidate(id, InvalidationLevel::InvalidProgram);
        evaluator.process(&mut network, &mut gfx).unwrap();
        evaluator.process(&mut network, &mut gfx).unwrap();
        assert_eq!(calls.borrow().attempts, 2);

        network
            .set_property(id, "fail_init", PropertyValue::Bool(false))
            .unwrap();
        evaluator.process(&mut network, &mut gfx).unwrap();
        assert_eq!(calls.borrow().attempts, 3);
        assert!(network.is_initialized(id));

        evaluator.deinitialize_network(&mut network, &mut gfx);
        assert!(gfx.shutdown().is_clean());
    }

    #[test]
    fn process_errors_do_not_abort_the_pass() {
        let mut s = setup(UVec2::new(4, 4));
        s.network.processor_as_mut::<Recorder>(s.source).unwrap().fail_process = true;
        let mut evaluator = NetworkEvaluator::new();
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(report.failed, vec![s.source]);
        assert_eq!(report.processed, vec![s.sink]);
        let out = s.network.port(s.source, "out").unwrap();
        assert!(!s.network.has_valid_result(out));
        s.teardown();
    }

    #[test]
    fn locked_evaluator_defers_the_pass() {
        let mut s = setup(UVec2::new(4, 4));
        let mut evaluator = NetworkEvaluator::new();
        evaluator.lock();
        assert!(evaluator.is_locked());
        assert_eq!(
            evaluator.process(&mut s.network, &mut s.gfx),
            Err(EvaluatorError::Locked)
        );
        assert!(evaluator.has_pending());
        evaluator.unlock();
        assert!(!evaluator.is_locked());
        evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert!(!evaluator.has_pending());
        s.teardown();
    }

    #[test]
    fn timer_sees_every_processed_processor() {
        struct Shared(Rc<RefCell<Vec<ProcessorId>>>);
        impl ProcessWrapper for Shared {
            fn after_process(&mut self, _network: &ProcessorNetwork, id: ProcessorId) {
                self.0.borrow_mut().push(id);
            }
        }

        let mut s = setup(UVec2::new(4, 4));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut evaluator = NetworkEvaluator::new();
        evaluator.add_process_wrapper(ProcessTimer::new());
        evaluator.add_process_wrapper(Shared(Rc::clone(&seen)));
        evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(*seen.borrow(), vec![s.source, s.sink]);
        s.teardown();
    }

    #[test]
    fn adding_a_processor_recomputes_the_order() {
        let mut s = setup(UVec2::new(4, 4));
        let mut evaluator = NetworkEvaluator::new();
        evaluator.process(&mut s.network, &mut s.gfx).unwrap();

        let calls = Rc::new(RefCell::new(Calls::default()));
        let tap = s
            .network
            .add("tap", Recorder::new(vec![PortSpec::render_in("in")], &calls))
            .unwrap();
        s.network.connect_ports(s.source, "out", tap, "in").unwrap();
        let report = evaluator.process(&mut s.network, &mut s.gfx).unwrap();
        assert_eq!(evaluator.rendering_order(), &[s.source, s.sink, tap]);
        assert_eq!(report.processed, vec![tap]);
        s.teardown();
    }
}
