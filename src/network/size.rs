//! Render-port size negotiation.
//!
//! Origin and static ports take the size their owner asks for. Receivers are
//! grouped into components: two receivers belong together when an edge joins
//! them or when they sit on the same processor. Origin and static ports bound
//! a component without belonging to it. The origin found first upstream of
//! the component's earliest processor decides the size of every receiver
//! inside.

use std::collections::{HashMap, HashSet};

use glam::UVec2;

use crate::network::port::{Node, Port, RenderState};
use crate::network::{InvalidationLevel, PortDirection, PortId, ProcessorId, ProcessorNetwork, SizePolicy};

#[derive(Debug, Clone)]
struct RenderPortInfo {
    id: PortId,
    owner: ProcessorId,
    name: String,
    direction: PortDirection,
    policy: SizePolicy,
    /// Render ports on the other end of this port's edges.
    connections: Vec<PortId>,
}

/// Settles the size of every render port in the network.
///
/// Running it twice without changes in between leaves every size as it is
/// and invalidates nothing. Processors whose render ports change size are
/// invalidated with [`InvalidationLevel::InvalidResult`].
pub fn negotiate_sizes(network: &mut ProcessorNetwork) {
    let (ports, siblings) = collect(network);
    let by_id: HashMap<PortId, &RenderPortInfo> = ports.iter().map(|p| (p.id, p)).collect();
    let mut changed: Vec<ProcessorId> = Vec::new();
    let mut sizes: HashMap<PortId, (UVec2, Option<PortId>)> = HashMap::new();

    for port in ports.iter().filter(|p| p.policy != SizePolicy::Receiver) {
        let requested = network
            .world
            .get::<&RenderState>(port.id.0)
            .ok()
            .and_then(|state| state.requested);
        let native = network
            .behaviors
            .get(&port.owner)
            .and_then(|behavior| behavior.native_size(&port.name));
        let size = requested.or(native).unwrap_or(UVec2::ZERO);
        let origin = (port.policy == SizePolicy::Origin).then_some(port.id);
        sizes.insert(port.id, (size, origin));
        if apply(network, port.id, size, origin) && !changed.contains(&port.owner) {
            changed.push(port.owner);
        }
    }

    let mut visited: HashSet<PortId> = HashSet::new();
    for start in ports.iter().filter(|p| p.policy == SizePolicy::Receiver) {
        if visited.contains(&start.id) {
            continue;
        }
        let component = component_of(start, &by_id, &siblings, &mut visited);
        let Some(chosen) = authority(network, &component, &by_id, &siblings, &sizes) else {
            continue;
        };
        if !chosen.overruled.is_empty() {
            let others: Vec<String> = chosen.overruled.iter().map(|p| network.label(*p)).collect();
            log::warn!(
                "conflicting size origins: using `{}` at {}x{} over {}",
                chosen.origin.map(|p| network.label(p)).unwrap_or_default(),
                chosen.size.x,
                chosen.size.y,
                others.join(", ")
            );
        }
        for port in &component {
            if apply(network, *port, chosen.size, chosen.origin) {
                if let Some(info) = by_id.get(port) {
                    if !changed.contains(&info.owner) {
                        changed.push(info.owner);
                    }
                }
            }
        }
    }

    for id in changed {
        log::trace!("render size of `{}` changed", network.processor_name(id).unwrap_or_default());
        network.invalidate(id, InvalidationLevel::InvalidResult);
    }
}

/// Render ports in processor order then declaration order, and the render
/// ports of each processor.
fn collect(network: &ProcessorNetwork) -> (Vec<RenderPortInfo>, HashMap<ProcessorId, Vec<PortId>>) {
    let mut ports = Vec::new();
    let mut siblings: HashMap<ProcessorId, Vec<PortId>> = HashMap::new();
    for &id in &network.processors {
        let Ok(node) = network.world.get::<&Node>(id.0) else {
            continue;
        };
        for &port in &node.ports {
            let Ok(p) = network.world.get::<&Port>(port.0) else {
                continue;
            };
            if !p.spec.is_render() {
                continue;
            }
            siblings.entry(id).or_default().push(port);
            ports.push(RenderPortInfo {
                id: port,
                owner: id,
                name: p.spec.name.clone(),
                direction: p.spec.direction,
                policy: p.spec.policy,
                connections: p.connections.clone(),
            });
        }
    }
    (ports, siblings)
}

/// All receivers linked to `start`, by edges or by sharing a processor.
fn component_of(
    start: &RenderPortInfo,
    by_id: &HashMap<PortId, &RenderPortInfo>,
    siblings: &HashMap<ProcessorId, Vec<PortId>>,
    visited: &mut HashSet<PortId>,
) -> Vec<PortId> {
    let mut component = Vec::new();
    let mut stack = vec![start.id];
    while let Some(current) = stack.pop() {
        if !visited.insert(current) {
            continue;
        }
        component.push(current);
        let Some(info) = by_id.get(&current) else {
            continue;
        };
        let linked = info
            .connections
            .iter()
            .chain(siblings.get(&info.owner).into_iter().flatten());
        for next in linked {
            let is_receiver = by_id
                .get(next)
                .is_some_and(|other| other.policy == SizePolicy::Receiver);
            if is_receiver && !visited.contains(next) {
                stack.push(*next);
            }
        }
    }
    component
}

/// What a component takes its size from.
#[derive(Debug)]
struct Authority {
    size: UVec2,
    origin: Option<PortId>,
    /// Other origins touching the component that ask for a different size.
    overruled: Vec<PortId>,
}

/// The size and origin a component takes, if anything touches it.
///
/// The origin reached first when walking upstream from the inputs of the
/// earliest-added processor of the component, in declaration order, wins.
/// Without one, candidates are ranked by the processor's insertion order,
/// then by the port declaration order; for each receiver its edges are
/// ranked in connection order.
fn authority(
    network: &ProcessorNetwork,
    component: &[PortId],
    by_id: &HashMap<PortId, &RenderPortInfo>,
    siblings: &HashMap<ProcessorId, Vec<PortId>>,
    sizes: &HashMap<PortId, (UVec2, Option<PortId>)>,
) -> Option<Authority> {
    let members: HashSet<PortId> = component.iter().copied().collect();
    let mut owners: Vec<ProcessorId> = Vec::new();
    for port in component {
        if let Some(info) = by_id.get(port) {
            if !owners.contains(&info.owner) {
                owners.push(info.owner);
            }
        }
    }
    owners.sort_by_key(|id| network.seq(*id));

    let mut candidates: Vec<PortId> = Vec::new();
    for owner in &owners {
        for port in siblings.get(owner).into_iter().flatten() {
            if members.contains(port) {
                if let Some(info) = by_id.get(port) {
                    for other in &info.connections {
                        if sizes.contains_key(other) && !candidates.contains(other) {
                            candidates.push(*other);
                        }
                    }
                }
            } else if sizes.contains_key(port) && !candidates.contains(port) {
                candidates.push(*port);
            }
        }
    }

    let origins: Vec<PortId> = candidates
        .iter()
        .copied()
        .filter(|port| by_id.get(port).is_some_and(|p| p.policy == SizePolicy::Origin))
        .collect();
    let upstream = owners.first().and_then(|first| {
        let mut seen = HashSet::new();
        origin_upstream(*first, &members, by_id, siblings, &mut seen)
    });
    let Some(chosen) = upstream.or_else(|| origins.first().copied()) else {
        return candidates.first().and_then(|port| sizes.get(port)).map(|(size, _)| Authority {
            size: *size,
            origin: None,
            overruled: Vec::new(),
        });
    };
    let (size, origin) = sizes.get(&chosen).copied()?;
    let overruled = origins
        .iter()
        .copied()
        .filter(|port| *port != chosen && sizes.get(port).is_some_and(|(other, _)| *other != size))
        .collect();
    Some(Authority { size, origin, overruled })
}

/// The first origin reached from `owner`'s render inputs in declaration
/// order, following producers depth first through receivers of the component.
fn origin_upstream(
    owner: ProcessorId,
    members: &HashSet<PortId>,
    by_id: &HashMap<PortId, &RenderPortInfo>,
    siblings: &HashMap<ProcessorId, Vec<PortId>>,
    seen: &mut HashSet<ProcessorId>,
) -> Option<PortId> {
    if !seen.insert(owner) {
        return None;
    }
    for port in siblings.get(&owner).into_iter().flatten() {
        let Some(info) = by_id.get(port) else {
            continue;
        };
        if info.direction != PortDirection::In {
            continue;
        }
        if info.policy == SizePolicy::Origin {
            return Some(info.id);
        }
        if !members.contains(port) {
            continue;
        }
        for other in &info.connections {
            let Some(producer) = by_id.get(other) else {
                continue;
            };
            match producer.policy {
                SizePolicy::Origin => return Some(producer.id),
                SizePolicy::Receiver if members.contains(other) => {
                    if let Some(found) = origin_upstream(producer.owner, members, by_id, siblings, seen) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Writes the negotiated state and reports whether the size changed.
fn apply(network: &mut ProcessorNetwork, port: PortId, size: UVec2, origin: Option<PortId>) -> bool {
    match network.world.query_one_mut::<&mut RenderState>(port.0) {
        Ok(state) => {
            state.origin = origin;
            if state.size == size {
                false
            } else {
                state.size = size;
                true
            }
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use proptest::prelude::*;

    use super::*;
    use crate::error::ProcessError;
    use crate::network::{PortSpec, ProcessContext, Processor};

    struct Node2 {
        specs: Vec<PortSpec>,
        native: Option<UVec2>,
    }

    impl Processor for Node2 {
        fn type_name(&self) -> &'static str {
            "Node2"
        }

        fn ports(&self) -> Vec<PortSpec> {
            self.specs.clone()
        }

        fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
            Ok(())
        }

        fn native_size(&self, _port: &str) -> Option<UVec2> {
            self.native
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn source(network: &mut ProcessorNetwork, name: &str, size: UVec2, spec: PortSpec) -> ProcessorId {
        network
            .add(
                name,
                Node2 {
                    specs: vec![spec],
                    native: Some(size),
                },
            )
            .unwrap()
    }

    fn filter(network: &mut ProcessorNetwork, name: &str) -> ProcessorId {
        network
            .add(
                name,
                Node2 {
                    specs: vec![PortSpec::render_in("in"), PortSpec::render_out("out")],
                    native: None,
                },
            )
            .unwrap()
    }

    fn sink(network: &mut ProcessorNetwork, name: &str, specs: Vec<PortSpec>) -> ProcessorId {
        network.add(name, Node2 { specs, native: None }).unwrap()
    }

    fn size_of(network: &ProcessorNetwork, id: ProcessorId, port: &str) -> UVec2 {
        network.port_size(network.port(id, port).unwrap()).unwrap()
    }

    fn settle(network: &mut ProcessorNetwork) {
        for id in network.processors().to_vec() {
            network.set_level(id, InvalidationLevel::Valid);
        }
    }

    /// Negotiates, then reports how the component holding `port` was sized.
    fn authority_at(network: &mut ProcessorNetwork, id: ProcessorId, port: &str) -> Option<Authority> {
        negotiate_sizes(network);
        let port = network.port(id, port)?;
        let (ports, siblings) = collect(network);
        let by_id: HashMap<PortId, &RenderPortInfo> = ports.iter().map(|p| (p.id, p)).collect();
        let sizes: HashMap<PortId, (UVec2, Option<PortId>)> = ports
            .iter()
            .filter(|p| p.policy != SizePolicy::Receiver)
            .map(|p| {
                let size = network.port_size(p.id).unwrap_or_default();
                (p.id, (size, (p.policy == SizePolicy::Origin).then_some(p.id)))
            })
            .collect();
        let component = component_of(by_id.get(&port)?, &by_id, &siblings, &mut HashSet::new());
        authority(network, &component, &by_id, &siblings, &sizes)
    }

    #[test]
    fn receivers_take_the_origin_size_through_a_chain() {
        let mut network = ProcessorNetwork::new();
        let src = source(&mut network, "src", UVec2::new(400, 300), PortSpec::render_out("out").origin());
        let mid = filter(&mut network, "mid");
        let end = sink(&mut network, "end", vec![PortSpec::render_in("in")]);
        network.connect_ports(src, "out", mid, "in").unwrap();
        network.connect_ports(mid, "out", end, "in").unwrap();

        negotiate_sizes(&mut network);
        let origin = network.port(src, "out");
        for (id, port) in [(src, "out"), (mid, "in"), (mid, "out"), (end, "in")] {
            assert_eq!(size_of(&network, id, port), UVec2::new(400, 300));
            assert_eq!(network.size_origin(network.port(id, port).unwrap()), origin);
        }
    }

    #[test]
    fn static_ports_size_without_an_origin() {
        let mut network = ProcessorNetwork::new();
        let src = source(&mut network, "src", UVec2::new(32, 16), PortSpec::render_out("out").static_size());
        let end = sink(&mut network, "end", vec![PortSpec::render_in("in")]);
        network.connect_ports(src, "out", end, "in").unwrap();
        negotiate_sizes(&mut network);
        assert_eq!(size_of(&network, end, "in"), UVec2::new(32, 16));
        assert_eq!(network.size_origin(network.port(end, "in").unwrap()), None);
    }

    #[test]
    fn origin_inports_size_the_producers_upstream() {
        let mut network = ProcessorNetwork::new();
        let producer = filter(&mut network, "producer");
        let canvas = sink(
            &mut network,
            "canvas",
            vec![
                PortSpec::render_in("in").origin(),
                PortSpec::render_private("scratch"),
            ],
        );
        network.connect_ports(producer, "out", canvas, "in").unwrap();
        let port = network.port(canvas, "in").unwrap();
        network.request_size(port, UVec2::new(640, 480)).unwrap();

        negotiate_sizes(&mut network);
        assert_eq!(size_of(&network, producer, "out"), UVec2::new(640, 480));
        assert_eq!(size_of(&network, producer, "in"), UVec2::new(640, 480));
        assert_eq!(size_of(&network, canvas, "scratch"), UVec2::new(640, 480));
        assert_eq!(network.render_size(producer), UVec2::new(640, 480));
    }

    #[test]
    fn conflicts_prefer_the_first_declared_input() {
        let mut network = ProcessorNetwork::new();
        let first = source(&mut network, "first", UVec2::new(10, 10), PortSpec::render_out("out").origin());
        let second = source(&mut network, "second", UVec2::new(20, 20), PortSpec::render_out("out").origin());
        let blend = sink(
            &mut network,
            "blend",
            vec![
                PortSpec::render_in("b"),
                PortSpec::render_in("a"),
                PortSpec::render_out("out"),
            ],
        );
        network.connect_ports(second, "out", blend, "a").unwrap();
        network.connect_ports(first, "out", blend, "b").unwrap();

        negotiate_sizes(&mut network);
        assert_eq!(size_of(&network, blend, "out"), UVec2::new(10, 10));
        assert_eq!(size_of(&network, blend, "a"), UVec2::new(10, 10));
        assert_eq!(
            network.size_origin(network.port(blend, "out").unwrap()),
            network.port(first, "out")
        );
    }

    #[test]
    fn conflicts_follow_the_first_input_through_a_chain() {
        let mut network = ProcessorNetwork::new();
        let first = source(&mut network, "first", UVec2::new(10, 10), PortSpec::render_out("out").origin());
        let second = source(&mut network, "second", UVec2::new(20, 20), PortSpec::render_out("out").origin());
        let blend = sink(
            &mut network,
            "blend",
            vec![
                PortSpec::render_in("b"),
                PortSpec::render_in("a"),
                PortSpec::render_out("out"),
            ],
        );
        let mid = filter(&mut network, "mid");
        network.connect_ports(first, "out", mid, "in").unwrap();
        network.connect_ports(mid, "out", blend, "b").unwrap();
        network.connect_ports(second, "out", blend, "a").unwrap();

        negotiate_sizes(&mut network);
        let origin = network.port(first, "out");
        for (id, port) in [(blend, "out"), (blend, "a"), (mid, "in"), (mid, "out")] {
            assert_eq!(size_of(&network, id, port), UVec2::new(10, 10));
            assert_eq!(network.size_origin(network.port(id, port).unwrap()), origin);
        }
        let chosen = authority_at(&mut network, blend, "out").unwrap();
        assert_eq!(chosen.overruled, vec![network.port(second, "out").unwrap()]);
    }

    #[test]
    fn origins_asking_for_the_same_size_do_not_conflict() {
        let mut network = ProcessorNetwork::new();
        let left = source(&mut network, "left", UVec2::new(64, 32), PortSpec::render_out("out").origin());
        let right = source(&mut network, "right", UVec2::new(64, 32), PortSpec::render_out("out").origin());
        let blend = sink(
            &mut network,
            "blend",
            vec![
                PortSpec::render_in("a"),
                PortSpec::render_in("b"),
                PortSpec::render_out("out"),
            ],
        );
        network.connect_ports(right, "out", blend, "b").unwrap();
        network.connect_ports(left, "out", blend, "a").unwrap();

        let chosen = authority_at(&mut network, blend, "out").unwrap();
        assert_eq!(chosen.size, UVec2::new(64, 32));
        assert_eq!(chosen.origin, network.port(left, "out"));
        assert!(chosen.overruled.is_empty());
    }

    #[test]
    fn untouched_receivers_keep_their_size() {
        let mut network = ProcessorNetwork::new();
        let src = source(&mut network, "src", UVec2::new(8, 8), PortSpec::render_out("out").origin());
        let mid = filter(&mut network, "mid");
        network.connect_ports(src, "out", mid, "in").unwrap();
        negotiate_sizes(&mut network);

        let out = network.port(src, "out").unwrap();
        let input = network.port(mid, "in").unwrap();
        network.disconnect(out, input).unwrap();
        negotiate_sizes(&mut network);
        assert_eq!(size_of(&network, mid, "in"), UVec2::ZERO);
        assert_eq!(size_of(&network, mid, "out"), UVec2::new(8, 8));
    }

    #[test]
    fn size_changes_invalidate_with_result_level() {
        let mut network = ProcessorNetwork::new();
        let src = source(&mut network, "src", UVec2::new(8, 8), PortSpec::render_out("out").origin());
        let mid = filter(&mut network, "mid");
        network.connect_ports(src, "out", mid, "in").unwrap();
        negotiate_sizes(&mut network);
        settle(&mut network);

        let out = network.port(src, "out").unwrap();
        network.request_size(out, UVec2::new(16, 16)).unwrap();
        negotiate_sizes(&mut network);
        assert_eq!(network.level(src), Some(InvalidationLevel::InvalidResult));
        assert_eq!(network.level(mid), Some(InvalidationLevel::InvalidResult));
        assert_eq!(size_of(&network, mid, "out"), UVec2::new(16, 16));
    }

    proptest! {
        #[test]
        fn negotiation_is_idempotent(
            sizes in prop::collection::vec((1u32..64, 1u32..64), 1..4),
            fan in prop::collection::vec(0usize..4, 1..6),
        ) {
            let mut network = ProcessorNetwork::new();
            let sources: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, (w, h))| {
                    source(&mut network, &format!("s{i}"), UVec2::new(*w, *h), PortSpec::render_out("out").origin())
                })
                .collect();
            let mut tails: Vec<ProcessorId> = sources.clone();
            for (i, pick) in fan.iter().enumerate() {
                let node = filter(&mut network, &format!("f{i}"));
                let producer = tails[pick % tails.len()];
                network.connect_ports(producer, "out", node, "in").unwrap();
                tails.push(node);
            }

            negotiate_sizes(&mut network);
            settle(&mut network);
            let snapshot: Vec<_> = network
                .processors()
                .iter()
                .flat_map(|id| network.ports_of(*id).unwrap())
                .map(|port| (network.port_size(port), network.size_origin(port)))
                .collect();

            negotiate_sizes(&mut network);
            let again: Vec<_> = network
                .processors()
                .iter()
                .flat_map(|id| network.ports_of(*id).unwrap())
                .map(|port| (network.port_size(port), network.size_origin(port)))
                .collect();
            prop_assert_eq!(snapshot, again);
            for id in network.processors() {
                prop_assert_eq!(network.level(*id), Some(InvalidationLevel::Valid));
            }
        }
    }
}
