use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use glam::UVec2;
use hecs::World;

use crate::error::{NetworkError, ProcessError};
use crate::event::{EventResponse, InteractionEvent};
use crate::gpu::GraphicsContext;
use crate::network::context::ProcessContext;
use crate::network::port::{DataSlot, Node, Port, RenderState};
use crate::network::{
    InvalidationLevel, PortDirection, PortId, PortImage, PortKind, PortSpec, Processor,
    ProcessorContext, ProcessorId, PropertyValue, SizePolicy,
};
use crate::surface::SurfaceContainer;

/// The arena owning processors, ports and connections.
///
/// Connections always run from an outport to an inport of another
/// processor, and the graph stays acyclic: [`connect`](Self::connect)
/// refuses an edge that would close a cycle.
///
/// # Example
///
/// ```
/// use phalanx::processors::{Canvas, ImageSource};
/// use phalanx::{InvalidationLevel, ProcessorNetwork};
/// use glam::{UVec2, Vec4};
///
/// let mut network = ProcessorNetwork::new();
/// let source = network
///     .add("source", ImageSource::new(UVec2::new(64, 32), Vec4::ONE))
///     .unwrap();
/// let canvas = network.add("canvas", Canvas::new()).unwrap();
/// network.connect_ports(source, "image", canvas, "image").unwrap();
///
/// assert_eq!(network.successors(source), vec![canvas]);
/// assert_eq!(network.level(canvas), Some(InvalidationLevel::InvalidPorts));
/// ```
pub struct ProcessorNetwork {
    pub(crate) world: World,
    pub(crate) processors: Vec<ProcessorId>,
    pub(crate) behaviors: HashMap<ProcessorId, Box<dyn Processor>>,
    containers: HashMap<ProcessorId, SurfaceContainer>,
    next_seq: u64,
    topology_dirty: bool,
}

impl Default for ProcessorNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorNetwork {
    /// An empty network.
    pub fn new() -> Self {
        Self {
            world: World::new(),
            processors: Vec::new(),
            behaviors: HashMap::new(),
            containers: HashMap::new(),
            next_seq: 0,
            topology_dirty: false,
        }
    }

    /// Adds a processor and spawns the ports it declares.
    ///
    /// The processor starts uninitialized at [`InvalidationLevel::InvalidPorts`].
    pub fn add_processor(
        &mut self,
        name: impl Into<String>,
        processor: Box<dyn Processor>,
    ) -> Result<ProcessorId, NetworkError> {
        let name = name.into();
        let specs = processor.ports();
        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(NetworkError::DuplicatePort {
                    processor: name,
                    port: spec.name.clone(),
                });
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = ProcessorId(self.world.spawn((Node {
            name: name.clone(),
            type_name: processor.type_name(),
            seq,
            ports: Vec::with_capacity(specs.len()),
            level: InvalidationLevel::InvalidPorts,
            initialized: false,
            init_failed: false,
        },)));

        let mut ports = Vec::with_capacity(specs.len());
        let mut next_target = 0;
        for spec in specs {
            let port = Port {
                owner: id,
                connections: Vec::new(),
                spec,
            };
            let entity = match port.spec.kind {
                PortKind::Render => {
                    let target = if port.spec.owns_target() {
                        next_target += 1;
                        Some(next_target - 1)
                    } else {
                        None
                    };
                    self.world.spawn((
                        port,
                        RenderState {
                            target,
                            ..RenderState::default()
                        },
                    ))
                }
                PortKind::Data(_) => self.world.spawn((port, DataSlot::default())),
            };
            ports.push(PortId(entity));
        }
        if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
            node.ports = ports;
        }

        log::debug!("added processor `{name}` ({})", processor.type_name());
        self.behaviors.insert(id, processor);
        self.processors.push(id);
        self.topology_dirty = true;
        Ok(id)
    }

    /// Adds a processor by value. See [`add_processor`](Self::add_processor).
    ///
    /// # Errors
    ///
    /// [`NetworkError::DuplicatePort`] when two of the declared ports share
    /// a name.
    pub fn add<P: Processor>(&mut self, name: impl Into<String>, processor: P) -> Result<ProcessorId, NetworkError> {
        self.add_processor(name, Box::new(processor))
    }

    /// Disconnects, deinitializes and despawns a processor.
    ///
    /// A failing `deinitialize` is logged; whatever it leaked shows up in
    /// the context's leak report.
    pub fn remove_processor(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), NetworkError> {
        let ports = self.ports_of(id)?;
        for &port in &ports {
            for other in self.connections(port) {
                let result = if self.direction(port) == Some(PortDirection::Out) {
                    self.disconnect(port, other)
                } else {
                    self.disconnect(other, port)
                };
                if let Err(e) = result {
                    log::warn!("removing `{}`: {e}", self.label(port));
                }
            }
        }

        if self.is_initialized(id) {
            if let Err(e) = self.deinitialize_processor(id, gfx) {
                log::error!("processor `{}` failed to deinitialize: {e}", self.display_name(id));
            }
        }
        if let Some(mut container) = self.containers.remove(&id) {
            container.destroy(gfx);
        }

        for port in ports {
            let _ = self.world.despawn(port.0);
        }
        let _ = self.world.despawn(id.0);
        self.behaviors.remove(&id);
        self.processors.retain(|p| *p != id);
        self.topology_dirty = true;
        Ok(())
    }

    /// Connects outport `out` to inport `input`.
    pub fn connect(&mut self, out: PortId, input: PortId) -> Result<(), NetworkError> {
        let (out_owner, in_owner) = {
            let from = self.port_ref(out)?;
            let to = self.port_ref(input)?;
            if from.spec.direction != PortDirection::Out || to.spec.direction != PortDirection::In {
                return Err(NetworkError::Direction {
                    from: self.label(out),
                    to: self.label(input),
                });
            }
            if from.spec.kind != to.spec.kind {
                return Err(NetworkError::TypeMismatch {
                    from: self.label(out),
                    to: self.label(input),
                });
            }
            if from.spec.private {
                return Err(NetworkError::PrivatePort(self.label(out)));
            }
            if to.spec.private {
                return Err(NetworkError::PrivatePort(self.label(input)));
            }
            if from.owner == to.owner {
                return Err(NetworkError::SameProcessor);
            }
            if from.connections.contains(&input) {
                return Err(NetworkError::AlreadyConnected);
            }
            if !to.spec.multi_input && !to.connections.is_empty() {
                return Err(NetworkError::InputOccupied(self.label(input)));
            }
            (from.owner, to.owner)
        };
        if self.reaches(in_owner, out_owner) {
            return Err(NetworkError::Cycle);
        }

        if let Ok(port) = self.world.query_one_mut::<&mut Port>(out.0) {
            port.connections.push(input);
        }
        if let Ok(port) = self.world.query_one_mut::<&mut Port>(input.0) {
            port.connections.push(out);
        }
        log::debug!("connected `{}` -> `{}`", self.label(out), self.label(input));
        self.invalidate(in_owner, InvalidationLevel::InvalidPorts);
        self.topology_dirty = true;
        Ok(())
    }

    /// Connects ports addressed by processor and port name.
    pub fn connect_ports(
        &mut self,
        from: ProcessorId,
        out: &str,
        to: ProcessorId,
        input: &str,
    ) -> Result<(), NetworkError> {
        let out = self.require_port(from, out)?;
        let input = self.require_port(to, input)?;
        self.connect(out, input)
    }

    /// Removes the edge `out -> input`.
    ///
    /// A render inport falls back to size zero without an origin until the
    /// next negotiation.
    pub fn disconnect(&mut self, out: PortId, input: PortId) -> Result<(), NetworkError> {
        let consumer = {
            let from = self.port_ref(out)?;
            let to = self.port_ref(input)?;
            if !from.connections.contains(&input) {
                return Err(NetworkError::NotConnected);
            }
            to.owner
        };
        if let Ok(port) = self.world.query_one_mut::<&mut Port>(out.0) {
            port.connections.retain(|p| *p != input);
        }
        if let Ok(port) = self.world.query_one_mut::<&mut Port>(input.0) {
            port.connections.retain(|p| *p != out);
        }
        if let Ok(state) = self.world.query_one_mut::<&mut RenderState>(input.0) {
            state.size = UVec2::ZERO;
            state.origin = None;
            state.valid_result = false;
        }
        log::debug!("disconnected `{}` -> `{}`", self.label(out), self.label(input));
        self.invalidate(consumer, InvalidationLevel::InvalidPorts);
        self.topology_dirty = true;
        Ok(())
    }

    /// Processors in insertion order.
    pub fn processors(&self) -> &[ProcessorId] {
        &self.processors
    }

    /// Number of processors.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether the network holds no processor.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Ports in declaration order.
    pub fn ports_of(&self, id: ProcessorId) -> Result<Vec<PortId>, NetworkError> {
        Ok(self.node_ref(id)?.ports.clone())
    }

    /// The processor's port named `name`.
    pub fn port(&self, id: ProcessorId, name: &str) -> Option<PortId> {
        let node = self.world.get::<&Node>(id.0).ok()?;
        node.ports.iter().copied().find(|port| {
            self.world
                .get::<&Port>(port.0)
                .map(|p| p.spec.name == name)
                .unwrap_or(false)
        })
    }

    /// The declaration the port was spawned from.
    pub fn port_spec(&self, port: PortId) -> Option<PortSpec> {
        self.world.get::<&Port>(port.0).ok().map(|p| p.spec.clone())
    }

    /// The processor that declared the port.
    pub fn port_owner(&self, port: PortId) -> Option<ProcessorId> {
        self.world.get::<&Port>(port.0).ok().map(|p| p.owner)
    }

    /// Ports on the other end of the port's edges, in connection order.
    pub fn connections(&self, port: PortId) -> Vec<PortId> {
        self.world
            .get::<&Port>(port.0)
            .map(|p| p.connections.clone())
            .unwrap_or_default()
    }

    /// Producers feeding the processor, in inport order, each once.
    pub fn predecessors(&self, id: ProcessorId) -> Vec<ProcessorId> {
        self.neighbors(id, PortDirection::In)
    }

    /// Consumers of the processor's outports, each once.
    pub fn successors(&self, id: ProcessorId) -> Vec<ProcessorId> {
        self.neighbors(id, PortDirection::Out)
    }

    /// Whether the processor anchors the rendering order: it has no
    /// outports, or it asks to be kept.
    pub fn is_end_processor(&self, id: ProcessorId) -> bool {
        let Some(behavior) = self.behaviors.get(&id) else {
            return false;
        };
        if behavior.is_end_processor() {
            return true;
        }
        self.ports_of(id)
            .unwrap_or_default()
            .into_iter()
            .all(|port| match self.world.get::<&Port>(port.0) {
                Ok(p) => p.spec.direction == PortDirection::In || p.spec.private,
                Err(_) => true,
            })
    }

    /// The negotiated size of a render port.
    pub fn port_size(&self, port: PortId) -> Option<UVec2> {
        self.world.get::<&RenderState>(port.0).ok().map(|s| s.size)
    }

    /// The origin port the render port took its size from.
    pub fn size_origin(&self, port: PortId) -> Option<PortId> {
        self.world.get::<&RenderState>(port.0).ok().and_then(|s| s.origin)
    }

    /// Whether the render port's image was written since it was last
    /// invalidated.
    pub fn has_valid_result(&self, port: PortId) -> bool {
        self.world
            .get::<&RenderState>(port.0)
            .map(|s| s.valid_result)
            .unwrap_or(false)
    }

    /// How stale the processor's outputs are. `None` for unknown ids.
    pub fn level(&self, id: ProcessorId) -> Option<InvalidationLevel> {
        self.world.get::<&Node>(id.0).ok().map(|n| n.level)
    }

    /// The instance name given to [`add`](Self::add).
    pub fn processor_name(&self, id: ProcessorId) -> Option<String> {
        self.world.get::<&Node>(id.0).ok().map(|n| n.name.clone())
    }

    /// The processor's [`Processor::type_name`].
    pub fn type_name(&self, id: ProcessorId) -> Option<&'static str> {
        self.world.get::<&Node>(id.0).ok().map(|n| n.type_name)
    }

    /// Whether `initialize` ran and succeeded. Processors are initialized
    /// by the evaluator at the start of a pass.
    pub fn is_initialized(&self, id: ProcessorId) -> bool {
        self.world
            .get::<&Node>(id.0)
            .map(|n| n.initialized)
            .unwrap_or(false)
    }

    /// The processor behind `id`.
    pub fn processor(&self, id: ProcessorId) -> Option<&dyn Processor> {
        self.behaviors.get(&id).map(|b| b.as_ref())
    }

    /// The processor as its concrete type.
    pub fn processor_as<P: Processor>(&self, id: ProcessorId) -> Option<&P> {
        self.behaviors.get(&id)?.as_any().downcast_ref()
    }

    /// The processor as its concrete type, mutably.
    ///
    /// Changes made here bypass invalidation; prefer
    /// [`set_property`](Self::set_property) for anything that affects output.
    pub fn processor_as_mut<P: Processor>(&mut self, id: ProcessorId) -> Option<&mut P> {
        self.behaviors.get_mut(&id)?.as_any_mut().downcast_mut()
    }

    /// The processor's surface container, once it is initialized.
    pub fn container(&self, id: ProcessorId) -> Option<&SurfaceContainer> {
        self.containers.get(&id)
    }

    /// Applies a property and invalidates the processor as far as the
    /// processor says the change requires.
    pub fn set_property(
        &mut self,
        id: ProcessorId,
        name: &str,
        value: PropertyValue,
    ) -> Result<InvalidationLevel, NetworkError> {
        let behavior = self
            .behaviors
            .get_mut(&id)
            .ok_or(NetworkError::UnknownProcessor(id))?;
        let level = behavior.set_property(name, value)?;
        if !level.is_valid() {
            self.clear_init_failure(id);
        }
        self.invalidate(id, level);
        Ok(level)
    }

    /// The current value of a property, if the processor has one by that
    /// name.
    pub fn property(&self, id: ProcessorId, name: &str) -> Option<PropertyValue> {
        self.behaviors.get(&id)?.property(name)
    }

    /// Sets the size an origin or static port asks for, e.g. after a
    /// window resize. Takes effect at the next negotiation.
    pub fn request_size(&mut self, port: PortId, size: UVec2) -> Result<(), NetworkError> {
        let policy = self.port_ref(port)?.spec.policy;
        if policy == SizePolicy::Receiver {
            log::warn!(
                "size request on receiver `{}` ignored, receivers take their origin's size",
                self.label(port)
            );
            return Ok(());
        }
        let state = self
            .world
            .query_one_mut::<&mut RenderState>(port.0)
            .map_err(|_| NetworkError::UnknownPort(port))?;
        state.requested = Some(size);
        Ok(())
    }

    /// Offers `event` to the processor, then upstream through its inports.
    ///
    /// Each processor sees the event at most once. Distribution stops at the
    /// first processor that accepts it.
    pub fn distribute_event(&mut self, id: ProcessorId, event: &mut InteractionEvent) -> EventResponse {
        let mut queue = VecDeque::from([id]);
        let mut visited = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(behavior) = self.behaviors.get_mut(&current) {
                if behavior.on_event(event).is_accepted() {
                    return EventResponse::Accepted;
                }
            }
            queue.extend(self.predecessors(current));
        }
        EventResponse::Continue
    }

    /// Raises the level of the processor and of everything downstream of
    /// it to at least `level`.
    pub fn invalidate(&mut self, id: ProcessorId, level: InvalidationLevel) {
        if level.is_valid() {
            return;
        }
        let mut stack = vec![id];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let ports = match self.world.query_one_mut::<&mut Node>(current.0) {
                Ok(node) => {
                    node.level = node.level.max(level);
                    if level >= InvalidationLevel::InvalidProgram {
                        node.init_failed = false;
                    }
                    node.ports.clone()
                }
                Err(_) => continue,
            };
            for port in ports {
                let owns_target = self
                    .world
                    .get::<&Port>(port.0)
                    .map(|p| p.spec.owns_target())
                    .unwrap_or(false);
                if owns_target {
                    if let Ok(state) = self.world.query_one_mut::<&mut RenderState>(port.0) {
                        state.valid_result = false;
                    }
                }
            }
            stack.extend(self.successors(current));
        }
    }

    /// The size the processor renders at: that of its first outport or
    /// private render port, else that of its first render inport.
    pub fn render_size(&self, id: ProcessorId) -> UVec2 {
        let ports = self.ports_of(id).unwrap_or_default();
        let render: Vec<(PortSpec, UVec2)> = ports
            .iter()
            .filter_map(|port| {
                let spec = self.port_spec(*port)?;
                let size = self.port_size(*port)?;
                Some((spec, size))
            })
            .collect();
        render
            .iter()
            .find(|(spec, _)| spec.owns_target())
            .or_else(|| render.iter().find(|(spec, _)| spec.is_input()))
            .map(|(_, size)| *size)
            .unwrap_or(UVec2::ZERO)
    }

    /// Whether the processor can run this frame.
    ///
    /// It must be initialized and agree itself; every required inport must
    /// be connected; no connected render port, private port or required
    /// render inport may be of zero size.
    pub fn is_ready(&self, id: ProcessorId) -> bool {
        if !self.is_initialized(id) {
            return false;
        }
        match self.behaviors.get(&id) {
            Some(behavior) if behavior.is_ready() => {}
            _ => return false,
        }
        for port in self.ports_of(id).unwrap_or_default() {
            let Ok(p) = self.world.get::<&Port>(port.0) else {
                return false;
            };
            let connected = !p.connections.is_empty();
            if p.spec.is_input() && !p.spec.optional && !connected {
                return false;
            }
            if !p.spec.is_render() {
                continue;
            }
            let zero = self
                .port_size(port)
                .map(|size| size.x == 0 || size.y == 0)
                .unwrap_or(true);
            let checked = if p.spec.is_input() {
                connected && !p.spec.optional
            } else {
                connected || p.spec.private
            };
            if checked && zero {
                return false;
            }
        }
        true
    }

    /// End processors and everything upstream of them, producers first.
    ///
    /// Ties are broken by insertion order.
    pub fn rendering_order(&self) -> Vec<ProcessorId> {
        let mut included = HashSet::new();
        let mut stack: Vec<ProcessorId> = self
            .processors
            .iter()
            .copied()
            .filter(|id| self.is_end_processor(*id))
            .collect();
        while let Some(id) = stack.pop() {
            if included.insert(id) {
                stack.extend(self.predecessors(id));
            }
        }

        let mut pending: HashMap<ProcessorId, usize> = included
            .iter()
            .map(|id| {
                let count = self
                    .predecessors(*id)
                    .into_iter()
                    .filter(|p| included.contains(p))
                    .count();
                (*id, count)
            })
            .collect();
        let mut ready: BTreeMap<u64, ProcessorId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| (self.seq(*id), *id))
            .collect();

        let mut order = Vec::with_capacity(included.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(id);
            for next in self.successors(id) {
                if let Some(count) = pending.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(self.seq(next), next);
                    }
                }
            }
        }
        order
    }

    pub(crate) fn take_topology_dirty(&mut self) -> bool {
        std::mem::take(&mut self.topology_dirty)
    }

    pub(crate) fn set_level(&mut self, id: ProcessorId, level: InvalidationLevel) {
        if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
            node.level = level;
        }
    }

    /// Creates the processor's surface container and runs its `initialize`
    /// hook. On failure the container is destroyed again.
    pub(crate) fn initialize_processor(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        if self.is_initialized(id) {
            log::warn!("processor `{}` is already initialized", self.display_name(id));
            return Ok(());
        }
        let name = self.node_ref(id)?.name.clone();

        let targets: Vec<(usize, PortSpec)> = self
            .ports_of(id)?
            .into_iter()
            .filter_map(|port| {
                let target = self.world.get::<&RenderState>(port.0).ok()?.target?;
                Some((target, self.port_spec(port)?))
            })
            .collect();
        if !targets.is_empty() {
            let mut container = SurfaceContainer::new(gfx, targets.len(), true);
            let defaults = gfx.config().render_port_attributes();
            for (target, spec) in &targets {
                container.initialize_target(*target, spec.attributes.unwrap_or(defaults));
            }
            container.attach_context(gfx)?;
            self.containers.insert(id, container);
        }

        let behavior = self
            .behaviors
            .get_mut(&id)
            .ok_or(NetworkError::UnknownProcessor(id))?;
        let result = behavior.initialize(&mut ProcessorContext::new(gfx, id, &name));
        match result {
            Ok(()) => {
                if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
                    node.initialized = true;
                    node.init_failed = false;
                }
                // Consumers may have run without this processor's output.
                self.invalidate(id, InvalidationLevel::InvalidResult);
                log::debug!("initialized processor `{name}`");
                Ok(())
            }
            Err(e) => {
                if let Some(mut container) = self.containers.remove(&id) {
                    container.destroy(gfx);
                }
                if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
                    node.init_failed = true;
                }
                Err(e)
            }
        }
    }

    /// Whether a failed `initialize` should run again: something changed
    /// since, or the processor asks for it.
    pub(crate) fn should_initialize(&self, id: ProcessorId, gfx: &GraphicsContext) -> bool {
        let failed = self.world.get::<&Node>(id.0).map(|n| n.init_failed).unwrap_or(false);
        !failed || self.behaviors.get(&id).is_some_and(|b| b.retry_initialize(gfx))
    }

    fn clear_init_failure(&mut self, id: ProcessorId) {
        if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
            node.init_failed = false;
        }
    }

    pub(crate) fn deinitialize_processor(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        let name = self.node_ref(id)?.name.clone();
        if let Ok(node) = self.world.query_one_mut::<&mut Node>(id.0) {
            node.initialized = false;
            node.level = node.level.max(InvalidationLevel::InvalidProgram);
        }
        let result = match self.behaviors.get_mut(&id) {
            Some(behavior) => behavior.deinitialize(&mut ProcessorContext::new(gfx, id, &name)),
            None => Err(NetworkError::UnknownProcessor(id).into()),
        };
        if let Some(mut container) = self.containers.remove(&id) {
            container.destroy(gfx);
        }
        result
    }

    pub(crate) fn rebuild_programs(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        let name = self.node_ref(id)?.name.clone();
        let behavior = self
            .behaviors
            .get_mut(&id)
            .ok_or(NetworkError::UnknownProcessor(id))?;
        behavior.rebuild_programs(&mut ProcessorContext::new(gfx, id, &name))
    }

    /// Resizes the processor's container to its render size.
    pub(crate) fn resize_container(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        let size = self.render_size(id);
        if let Some(container) = self.containers.get_mut(&id) {
            container.set_size(gfx, size)?;
        }
        Ok(())
    }

    /// Runs `before_process`, `process` and `after_process`, then marks
    /// written render outports valid and publishes data outputs.
    pub(crate) fn process_processor(&mut self, id: ProcessorId, gfx: &mut GraphicsContext) -> Result<(), ProcessError> {
        let (name, level, ports) = {
            let node = self.node_ref(id)?;
            (node.name.clone(), node.level, node.ports.clone())
        };
        let size = self.render_size(id);

        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        let mut data_in = Vec::new();
        let mut data_ports = Vec::new();
        for &port in &ports {
            let p = self.port_ref(port)?;
            match (p.spec.kind, p.spec.direction) {
                (PortKind::Render, PortDirection::Out) => {
                    if let Some(target) = self.world.get::<&RenderState>(port.0).ok().and_then(|s| s.target) {
                        outputs.push((p.spec.name.clone(), target));
                    }
                }
                (PortKind::Render, PortDirection::In) => {
                    let images = p
                        .connections
                        .iter()
                        .filter_map(|producer| self.port_image(*producer))
                        .collect();
                    inputs.push((p.spec.name.clone(), images));
                }
                (PortKind::Data(_), PortDirection::In) => {
                    let values = p
                        .connections
                        .iter()
                        .filter_map(|producer| {
                            self.world.get::<&DataSlot>(producer.0).ok()?.value.clone()
                        })
                        .collect();
                    data_in.push((p.spec.name.clone(), values));
                }
                (PortKind::Data(_), PortDirection::Out) => {
                    data_ports.push((p.spec.name.clone(), port));
                }
            }
        }

        let behavior = self
            .behaviors
            .get_mut(&id)
            .ok_or(NetworkError::UnknownProcessor(id))?;
        behavior.before_process(&mut ProcessorContext::new(gfx, id, &name))?;
        let outcome = {
            let container = self.containers.get_mut(&id);
            let mut ctx = ProcessContext::new(gfx, container, id, &name, size, level, outputs, inputs, data_in);
            let result = behavior.process(&mut ctx);
            let deactivated = ctx.deactivate();
            result?;
            deactivated?;
            ctx.finish()
        };
        behavior.after_process(&mut ProcessorContext::new(gfx, id, &name))?;

        for &port in &ports {
            let written = self
                .world
                .get::<&Port>(port.0)
                .map(|p| outcome.written.contains(&p.spec.name))
                .unwrap_or(false);
            if written {
                if let Ok(state) = self.world.query_one_mut::<&mut RenderState>(port.0) {
                    state.valid_result = true;
                }
            }
        }
        for (port_name, value) in outcome.data {
            match data_ports.iter().find(|(port, _)| *port == port_name) {
                Some((_, port)) => {
                    if let Ok(slot) = self.world.query_one_mut::<&mut DataSlot>(port.0) {
                        slot.value = Some(value);
                    }
                }
                None => log::warn!("processor `{name}` wrote unknown data port `{port_name}`"),
            }
        }
        Ok(())
    }

    /// The image behind a render outport.
    fn port_image(&self, port: PortId) -> Option<PortImage> {
        let owner = self.port_owner(port)?;
        let state = self.world.get::<&RenderState>(port.0).ok()?;
        let target = state.target?;
        let container = self.containers.get(&owner)?;
        Some(PortImage {
            color: container.color_texture(target),
            depth: container.depth_texture(target),
            size: container.size(),
            valid: state.valid_result,
        })
    }

    pub(crate) fn seq(&self, id: ProcessorId) -> u64 {
        self.world.get::<&Node>(id.0).map(|n| n.seq).unwrap_or(u64::MAX)
    }

    fn neighbors(&self, id: ProcessorId, direction: PortDirection) -> Vec<ProcessorId> {
        let mut out = Vec::new();
        for port in self.ports_of(id).unwrap_or_default() {
            let Ok(p) = self.world.get::<&Port>(port.0) else {
                continue;
            };
            if p.spec.direction != direction {
                continue;
            }
            for other in &p.connections {
                if let Some(owner) = self.port_owner(*other) {
                    if !out.contains(&owner) {
                        out.push(owner);
                    }
                }
            }
        }
        out
    }

    /// Whether `to` is reachable from `from` along connections.
    fn reaches(&self, from: ProcessorId, to: ProcessorId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.successors(current));
            }
        }
        false
    }

    fn direction(&self, port: PortId) -> Option<PortDirection> {
        self.world.get::<&Port>(port.0).ok().map(|p| p.spec.direction)
    }

    fn require_port(&self, id: ProcessorId, name: &str) -> Result<PortId, NetworkError> {
        self.node_ref(id)?;
        self.port(id, name).ok_or_else(|| NetworkError::NoSuchPort {
            processor: self.display_name(id),
            port: name.to_owned(),
        })
    }

    fn node_ref(&self, id: ProcessorId) -> Result<hecs::Ref<'_, Node>, NetworkError> {
        self.world
            .get::<&Node>(id.0)
            .map_err(|_| NetworkError::UnknownProcessor(id))
    }

    fn port_ref(&self, port: PortId) -> Result<hecs::Ref<'_, Port>, NetworkError> {
        self.world
            .get::<&Port>(port.0)
            .map_err(|_| NetworkError::UnknownPort(port))
    }

    fn display_name(&self, id: ProcessorId) -> String {
        self.processor_name(id).unwrap_or_else(|| format!("{id:?}"))
    }

    /// `processor.port`, for messages.
    pub(crate) fn label(&self, port: PortId) -> String {
        match self.world.get::<&Port>(port.0) {
            Ok(p) => format!("{}.{}", self.display_name(p.owner), p.spec.name),
            Err(_) => format!("{port:?}"),
        }
    }
}

impl Drop for ProcessorNetwork {
    fn drop(&mut self) {
        let live = self.containers.len();
        if live > 0 {
            log::error!("processor network dropped with {live} initialized processors, deinitialize it first");
        }
    }
}
