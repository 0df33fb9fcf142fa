//! End-to-end runs of small networks on the headless backend.

use std::any::Any;

use glam::{UVec2, Vec4};
use phalanx::processors::{
    COPY_FRAGMENT, Canvas, FULLSCREEN_VERTEX, ImageSource, Passthrough, ShaderFilter,
};
use phalanx::*;

const MAGENTA: Vec4 = Vec4::new(1.0, 0.0, 1.0, 1.0);

fn context() -> (GraphicsContext, MemoryResolver) {
    let files = MemoryResolver::new()
        .with("fullscreen.vert", FULLSCREEN_VERTEX)
        .with("copy.frag", COPY_FRAGMENT);
    let mut gfx = GraphicsContext::new(HeadlessBackend::new(), RuntimeConfig::default());
    gfx.programs_mut().set_resolver(Box::new(files.clone()));
    (gfx, files)
}

fn render_ports(network: &ProcessorNetwork) -> Vec<PortId> {
    network
        .processors()
        .iter()
        .flat_map(|id| network.ports_of(*id).unwrap())
        .filter(|port| network.port_spec(*port).unwrap().is_render())
        .collect()
}

#[test]
fn three_node_chain_follows_the_source_size() {
    let (mut gfx, _files) = context();
    let mut network = ProcessorNetwork::new();
    let source = network
        .add("source", ImageSource::new(UVec2::new(400, 300), MAGENTA))
        .unwrap();
    let copy = network.add("copy", Passthrough::new()).unwrap();
    let canvas = network.add("canvas", Canvas::new()).unwrap();
    network.connect_ports(source, "image", copy, "input").unwrap();
    network.connect_ports(copy, "output", canvas, "image").unwrap();

    let mut evaluator = NetworkEvaluator::new();
    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert_eq!(report.processed, vec![source, copy, canvas]);
    for port in render_ports(&network) {
        assert_eq!(network.port_size(port), Some(UVec2::new(400, 300)));
    }
    let origin = network.port(source, "image");
    assert_eq!(network.size_origin(network.port(canvas, "image").unwrap()), origin);
    let sink: &Canvas = network.processor_as(canvas).unwrap();
    assert_eq!(sink.pixel(0, 0), Some(MAGENTA));
    assert_eq!(sink.pixel(399, 299), Some(MAGENTA));
    assert_eq!(network.processor_as::<Passthrough>(copy).unwrap().copies(), 1);

    // The canvas follows its source, so it refuses a size of its own.
    assert!(matches!(
        network.set_property(canvas, "size", PropertyValue::Size(UVec2::new(8, 8))),
        Err(NetworkError::Property(PropertyError::Unsupported { .. }))
    ));
    assert_eq!(network.level(canvas), Some(InvalidationLevel::Valid));

    network
        .set_property(source, "size", PropertyValue::Size(UVec2::new(800, 600)))
        .unwrap();
    for id in [source, copy, canvas] {
        assert_eq!(network.level(id), Some(InvalidationLevel::InvalidResult));
    }

    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert_eq!(report.processed, vec![source, copy, canvas]);
    for port in render_ports(&network) {
        assert_eq!(network.port_size(port), Some(UVec2::new(800, 600)));
    }
    let sink: &Canvas = network.processor_as(canvas).unwrap();
    assert_eq!(sink.last_size(), UVec2::new(800, 600));
    assert_eq!(sink.pixel(799, 599), Some(MAGENTA));
    assert_eq!(
        network.container(copy).unwrap().size(),
        UVec2::new(800, 600)
    );

    assert!(evaluator.deinitialize_network(&mut network, &mut gfx));
    assert!(gfx.shutdown().is_clean());
}

#[test]
fn sized_canvas_drives_the_network_like_a_window() {
    let (mut gfx, _files) = context();
    let mut network = ProcessorNetwork::new();
    let source = network
        .add("source", ImageSource::fixed(UVec2::new(16, 16), MAGENTA))
        .unwrap();
    let copy = network.add("copy", Passthrough::new()).unwrap();
    let canvas = network
        .add("canvas", Canvas::with_size(UVec2::new(32, 8)))
        .unwrap();
    network.connect_ports(source, "image", copy, "input").unwrap();
    network.connect_ports(copy, "output", canvas, "image").unwrap();

    let mut evaluator = NetworkEvaluator::new();
    evaluator.process(&mut network, &mut gfx).unwrap();
    let copy_out = network.port(copy, "output").unwrap();
    let copy_in = network.port(copy, "input").unwrap();
    assert_eq!(network.port_size(copy_out), Some(UVec2::new(32, 8)));
    assert_eq!(network.port_size(copy_in), Some(UVec2::new(32, 8)));
    assert_eq!(network.size_origin(copy_out), network.port(canvas, "image"));

    // The fixed source stays at its own size, so the passthrough clears.
    assert_eq!(network.processor_as::<Passthrough>(copy).unwrap().copies(), 0);
    let sink: &Canvas = network.processor_as(canvas).unwrap();
    assert_eq!(sink.pixel(0, 0), Some(Vec4::ZERO));

    let window = network.port(canvas, "image").unwrap();
    network.request_size(window, UVec2::new(64, 64)).unwrap();
    evaluator.process(&mut network, &mut gfx).unwrap();
    assert_eq!(network.port_size(copy_out), Some(UVec2::new(64, 64)));
    assert_eq!(
        network.processor_as::<Canvas>(canvas).unwrap().last_size(),
        UVec2::new(64, 64)
    );

    evaluator.deinitialize_network(&mut network, &mut gfx);
    assert!(gfx.shutdown().is_clean());
}

#[test]
fn shader_filter_draws_with_its_input_bound() {
    let (mut gfx, files) = context();
    let mut network = ProcessorNetwork::new();
    let source = network
        .add("source", ImageSource::new(UVec2::new(64, 32), MAGENTA))
        .unwrap();
    let filter = network
        .add("filter", ShaderFilter::new("fullscreen.vert", "copy.frag"))
        .unwrap();
    let canvas = network.add("canvas", Canvas::new()).unwrap();
    network.connect_ports(source, "image", filter, "input").unwrap();
    network.connect_ports(filter, "output", canvas, "image").unwrap();

    let mut evaluator = NetworkEvaluator::new();
    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert_eq!(report.processed, vec![source, filter, canvas]);

    let input = network.container(source).unwrap().color_texture(0).unwrap();
    let output = network.container(filter).unwrap().color_texture(0).unwrap();
    let backend: &HeadlessBackend = gfx.backend_as().unwrap();
    let draw = backend.draws().last().unwrap();
    assert_eq!(draw.inputs, vec![(0, input)]);
    assert_eq!(draw.targets, vec![output]);
    assert_eq!(draw.size, UVec2::new(64, 32));
    assert_eq!(backend.bound_texture(0), None);
    assert_eq!(gfx.slots().num_live(), 0);
    assert_eq!(gfx.programs().len(), 1);

    network
        .set_property(
            filter,
            "header",
            PropertyValue::Text("const GAIN: f32 = 2.0;".into()),
        )
        .unwrap();
    assert_eq!(network.level(filter), Some(InvalidationLevel::InvalidProgram));
    assert_eq!(network.level(source), Some(InvalidationLevel::Valid));
    evaluator.process(&mut network, &mut gfx).unwrap();
    assert_eq!(gfx.programs().len(), 1);
    let handle = network
        .processor_as::<ShaderFilter>(filter)
        .unwrap()
        .program()
        .handle()
        .unwrap();
    assert!(
        gfx.programs()
            .stage_source(handle, ShaderStage::Fragment)
            .unwrap()
            .contains("GAIN")
    );

    files.insert("copy.frag", format!("{COPY_FRAGMENT}\n// edited\n"));
    assert!(evaluator.check_hot_reload(&mut network, &mut gfx));
    for id in [source, filter, canvas] {
        assert_eq!(network.level(id), Some(InvalidationLevel::InvalidResult));
    }
    assert!(!evaluator.check_hot_reload(&mut network, &mut gfx));

    evaluator.deinitialize_network(&mut network, &mut gfx);
    assert!(gfx.shutdown().is_clean());
}

#[test]
fn broken_program_waits_for_its_source_to_be_fixed() {
    let (mut gfx, files) = context();
    files.insert("broken.frag", "@fragment fn fs( {");
    let mut network = ProcessorNetwork::new();
    let source = network
        .add("source", ImageSource::new(UVec2::new(8, 8), MAGENTA))
        .unwrap();
    let filter = network
        .add("filter", ShaderFilter::new("fullscreen.vert", "broken.frag"))
        .unwrap();
    network.connect_ports(source, "image", filter, "input").unwrap();
    let canvas = network.add("canvas", Canvas::new()).unwrap();
    network.connect_ports(filter, "output", canvas, "image").unwrap();

    let mut evaluator = NetworkEvaluator::new();
    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert!(!network.is_initialized(filter));
    assert!(report.not_ready.contains(&filter));
    assert!(report.processed.contains(&source));

    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert!(!network.is_initialized(filter));
    assert!(report.not_ready.contains(&filter));

    // Fixing the file is enough for the next pass to pick the filter up.
    files.insert("broken.frag", COPY_FRAGMENT);
    let report = evaluator.process(&mut network, &mut gfx).unwrap();
    assert!(network.is_initialized(filter));
    assert_eq!(report.processed, vec![filter, canvas]);
    let sink: &Canvas = network.processor_as(canvas).unwrap();
    assert_eq!(sink.pixel(0, 0), Some(MAGENTA));

    evaluator.deinitialize_network(&mut network, &mut gfx);
    assert!(gfx.shutdown().is_clean());
}

struct Leaky {
    handle: Option<ProgramHandle>,
}

impl Processor for Leaky {
    fn type_name(&self) -> &'static str {
        "Leaky"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::render_in("image").optional()]
    }

    fn initialize(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        let stages = [
            StageSource::vertex("fullscreen.vert"),
            StageSource::fragment("copy.frag"),
        ];
        self.handle = Some(ctx.gfx().load_program(&stages, "", false)?);
        Ok(())
    }

    fn deinitialize(&mut self, _ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        Err(ProcessError::Message("forgot to dispose".into()))
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn leak_report_names_programs_a_processor_failed_to_dispose() {
    let (mut gfx, _files) = context();
    let mut network = ProcessorNetwork::new();
    let leaky = network.add("leaky", Leaky { handle: None }).unwrap();
    let mut evaluator = NetworkEvaluator::new();
    evaluator.process(&mut network, &mut gfx).unwrap();
    assert!(network.is_initialized(leaky));

    network.remove_processor(leaky, &mut gfx).unwrap();
    assert!(network.is_empty());
    let report = gfx.shutdown();
    assert!(!report.is_clean());
    assert_eq!(report.programs.len(), 1);
    assert_eq!(report.programs[0].label, "fullscreen.vert#copy.frag");
    assert_eq!(report.programs[0].usage, 1);
}

struct Counter;

impl Processor for Counter {
    fn type_name(&self) -> &'static str {
        "Counter"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::data_out("count", "u32")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        ctx.set_output_data("count", 7u32);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct Reader {
    seen: Option<u32>,
    wrong_type: bool,
}

impl Processor for Reader {
    fn type_name(&self) -> &'static str {
        "Reader"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::data_in("count", "u32")]
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        self.seen = ctx.input_data::<u32>("count").map(|v| *v);
        self.wrong_type = ctx.input_data::<String>("count").is_some();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn data_ports_carry_typed_values() {
    let (mut gfx, _files) = context();
    let mut network = ProcessorNetwork::new();
    let counter = network.add("counter", Counter).unwrap();
    let reader = network.add("reader", Reader::default()).unwrap();
    network.connect_ports(counter, "count", reader, "count").unwrap();

    let mut evaluator = NetworkEvaluator::new();
    evaluator.process(&mut network, &mut gfx).unwrap();
    let reader: &Reader = network.processor_as(reader).unwrap();
    assert_eq!(reader.seen, Some(7));
    assert!(!reader.wrong_type);
    assert!(network.container(counter).is_none());
}

#[test]
fn events_reach_upstream_processors_through_the_canvas() {
    let (mut gfx, _files) = context();
    let mut network = ProcessorNetwork::new();
    let source = network
        .add("source", ImageSource::new(UVec2::new(4, 4), MAGENTA))
        .unwrap();
    let canvas = network.add("canvas", Canvas::new()).unwrap();
    network.connect_ports(source, "image", canvas, "image").unwrap();

    let mut event = InteractionEvent::MouseButton {
        button: MouseButton::Left,
        pressed: true,
        position: glam::Vec2::new(1.0, 2.0),
    };
    assert_eq!(
        network.distribute_event(canvas, &mut event),
        EventResponse::Continue
    );
    network
        .processor_as_mut::<Canvas>(canvas)
        .unwrap()
        .listeners_mut()
        .add_listener_front(|event: &mut InteractionEvent| {
            if event.position().is_some() {
                EventResponse::Accepted
            } else {
                EventResponse::Continue
            }
        });
    assert_eq!(
        network.distribute_event(canvas, &mut event),
        EventResponse::Accepted
    );

    NetworkEvaluator::new().deinitialize_network(&mut network, &mut gfx);
    assert!(gfx.shutdown().is_clean());
}
