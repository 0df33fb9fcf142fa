//! WGSL front end shared by the backends: parsing, validation, entry point
//! lookup and the interface checks done at link time.

use std::collections::BTreeSet;

use crate::backend::ShaderStage;
use crate::error::ShaderDiagnostic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Texture,
    Sampler { comparison: bool },
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResourceUse {
    pub group: u32,
    pub binding: u32,
    pub kind: ResourceKind,
}

/// A parsed and validated stage.
pub(crate) struct ParsedStage {
    pub stage: ShaderStage,
    pub module: naga::Module,
    pub entry_point: String,
    pub resources: Vec<ResourceUse>,
}

pub(crate) fn parse_stage(stage: ShaderStage, source: &str) -> Result<ParsedStage, ShaderDiagnostic> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| ShaderDiagnostic {
        message: e.emit_to_string(source),
        line: e.location(source).map(|loc| loc.line_number),
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator.validate(&module).map_err(|e| ShaderDiagnostic {
        message: e.emit_to_string(source),
        line: e.location(source).map(|loc| loc.line_number),
    })?;

    let naga_stage = stage.to_naga();
    let entry_point = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga_stage)
        .map(|ep| ep.name.clone())
        .ok_or_else(|| ShaderDiagnostic::new(format!("no {stage:?} entry point")))?;

    let resources = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let binding = var.binding.as_ref()?;
            let kind = match module.types[var.ty].inner {
                naga::TypeInner::Image { .. } => ResourceKind::Texture,
                naga::TypeInner::Sampler { comparison } => ResourceKind::Sampler { comparison },
                _ => ResourceKind::Other,
            };
            Some(ResourceUse {
                group: binding.group,
                binding: binding.binding,
                kind,
            })
        })
        .collect();

    Ok(ParsedStage {
        stage,
        module,
        entry_point,
        resources,
    })
}

/// Checks that a set of stages forms a program.
///
/// Every fragment input location must be written by the vertex stage.
pub(crate) fn check_link(stages: &[&ParsedStage]) -> Result<(), ShaderDiagnostic> {
    if stages.is_empty() {
        return Err(ShaderDiagnostic::new("a program needs at least one stage"));
    }
    let mut seen = BTreeSet::new();
    for stage in stages {
        if !seen.insert(stage.stage) {
            return Err(ShaderDiagnostic::new(format!(
                "{:?} stage attached twice",
                stage.stage
            )));
        }
    }
    if seen.contains(&ShaderStage::Compute) && seen.len() > 1 {
        return Err(ShaderDiagnostic::new(
            "a compute stage cannot be linked with graphics stages",
        ));
    }

    let vertex = stages.iter().find(|s| s.stage == ShaderStage::Vertex);
    let fragment = stages.iter().find(|s| s.stage == ShaderStage::Fragment);
    match (vertex, fragment) {
        (None, Some(_)) => Err(ShaderDiagnostic::new(
            "a fragment stage needs a vertex stage",
        )),
        (Some(vertex), Some(fragment)) => {
            let written = vertex_outputs(vertex);
            for location in fragment_inputs(fragment) {
                if !written.contains(&location) {
                    return Err(ShaderDiagnostic::new(format!(
                        "fragment input @location({location}) is not written by the vertex stage"
                    )));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn entry_point(stage: &ParsedStage) -> Option<&naga::EntryPoint> {
    stage
        .module
        .entry_points
        .iter()
        .find(|ep| ep.name == stage.entry_point)
}

fn vertex_outputs(stage: &ParsedStage) -> BTreeSet<u32> {
    let mut out = BTreeSet::new();
    if let Some(result) = entry_point(stage).and_then(|ep| ep.function.result.as_ref()) {
        collect_locations(&stage.module, result.ty, result.binding.as_ref(), &mut out);
    }
    out
}

fn fragment_inputs(stage: &ParsedStage) -> BTreeSet<u32> {
    let mut out = BTreeSet::new();
    if let Some(ep) = entry_point(stage) {
        for arg in &ep.function.arguments {
            collect_locations(&stage.module, arg.ty, arg.binding.as_ref(), &mut out);
        }
    }
    out
}

fn collect_locations(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
    out: &mut BTreeSet<u32>,
) {
    match binding {
        Some(naga::Binding::Location { location, .. }) => {
            out.insert(*location);
        }
        Some(naga::Binding::BuiltIn(_)) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = &module.types[ty].inner {
                for member in members {
                    if let Some(naga::Binding::Location { location, .. }) = &member.binding {
                        out.insert(*location);
                    }
                }
            }
        }
    }
}
