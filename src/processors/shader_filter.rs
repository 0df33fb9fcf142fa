use std::any::Any;

use crate::error::{ProcessError, PropertyError};
use crate::gpu::GraphicsContext;
use crate::network::{
    InvalidationLevel, PortSpec, ProcessContext, Processor, ProcessorContext, PropertyValue,
};
use crate::processors::ProgramHelper;
use crate::shader::StageSource;

/// Fullscreen-triangle vertex stage passing `uv` to the fragment stage.
pub const FULLSCREEN_VERTEX: &str = r#"struct VsOut {
    @builtin(position) pos: vec4f,
    @location(0) uv: vec2f,
}

@vertex
fn vs(@builtin(vertex_index) i: u32) -> VsOut {
    let uv = vec2f(f32((i << 1u) & 2u), f32(i & 2u));
    var out: VsOut;
    out.pos = vec4f(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2f(uv.x, 1.0 - uv.y);
    return out;
}
"#;

/// Fragment stage copying the input color, which is bound at slot 0.
pub const COPY_FRAGMENT: &str = r#"@group(0) @binding(0) var input_color: texture_2d<f32>;

@fragment
fn fs(@builtin(position) pos: vec4f) -> @location(0) vec4f {
    return textureLoad(input_color, vec2i(pos.xy), 0);
}
"#;

/// Runs a fragment program over its input image.
///
/// The input color texture is bound at the first free sampling slot and the
/// input depth texture, if any, at the next one. Programs declare them as
/// group 0 texture bindings with the slot as binding number.
///
/// The `header` property is appended to the generated program header, so
/// changing it rebuilds the program. A program that fails to build is not
/// retried every frame: the next attempt waits until the header or one of
/// the stage files changes.
pub struct ShaderFilter {
    program: ProgramHelper,
    draws: u64,
}

impl ShaderFilter {
    pub const INPORT: &'static str = "input";
    pub const OUTPORT: &'static str = "output";

    /// A filter built from one vertex and one fragment stage file.
    pub fn new(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self::with_program(ProgramHelper::new(vec![
            StageSource::vertex(vertex),
            StageSource::fragment(fragment),
        ]))
    }

    pub fn with_program(program: ProgramHelper) -> Self {
        Self { program, draws: 0 }
    }

    pub fn program(&self) -> &ProgramHelper {
        &self.program
    }

    /// Frames drawn so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }
}

impl Processor for ShaderFilter {
    fn type_name(&self) -> &'static str {
        "ShaderFilter"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::render_in(Self::INPORT),
            PortSpec::render_out(Self::OUTPORT),
        ]
    }

    fn initialize(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        self.program.rebuild(ctx.gfx())?;
        Ok(())
    }

    fn deinitialize(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        self.program.dispose(ctx.gfx());
        Ok(())
    }

    fn rebuild_programs(&mut self, ctx: &mut ProcessorContext<'_>) -> Result<(), ProcessError> {
        self.program.rebuild(ctx.gfx())?;
        Ok(())
    }

    fn retry_initialize(&self, gfx: &GraphicsContext) -> bool {
        self.program.sources_changed(gfx)
    }

    fn is_ready(&self) -> bool {
        self.program.handle().is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let input = ctx.input(Self::INPORT).ok_or_else(|| {
            ProcessError::Message(format!("`{}` has no input image", ctx.name()))
        })?;

        let color = ctx.gfx().acquire_slot(false)?;
        ctx.gfx().bind_texture(&color, input.color)?;
        let depth = match input.depth {
            Some(texture) => {
                let claim = ctx.gfx().acquire_slot(false)?;
                ctx.gfx().bind_texture(&claim, Some(texture))?;
                Some(claim)
            }
            None => None,
        };

        ctx.activate_outport(Self::OUTPORT)?;
        self.program.activate(ctx.gfx())?;
        let drawn = ctx.gfx().backend_mut().draw_fullscreen();
        self.program.deactivate(ctx.gfx())?;

        ctx.gfx().bind_texture(&color, None)?;
        if let Some(claim) = depth {
            ctx.gfx().bind_texture(&claim, None)?;
        }
        drawn?;
        self.draws += 1;
        Ok(())
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<InvalidationLevel, PropertyError> {
        match name {
            "header" => {
                let text = value.expect_with(name, |v| v.as_text().map(str::to_owned), "text")?;
                if self.program.set_defines(text) {
                    Ok(InvalidationLevel::InvalidProgram)
                } else {
                    Ok(InvalidationLevel::Valid)
                }
            }
            _ => Err(PropertyError::Unknown(name.to_owned())),
        }
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        (name == "header").then(|| PropertyValue::Text(self.program.defines().to_owned()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
