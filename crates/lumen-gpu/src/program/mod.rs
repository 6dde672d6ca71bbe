//! Programs: attached shader stages, linking, and uniform lookup.
//!
//! Linking assigns binding indices (uniform blocks first, one per stage that
//! has one, then opaque resources across all stages), substitutes them into
//! each stage's placeholders, compiles every stage, and builds the binding
//! layout. The result is an immutable [`LinkedProgram`] shared by every
//! render context.

pub mod pipeline;
pub mod uniforms;
pub mod vertex_layout;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::device::{BindPoint, BindingKind, BindingLayoutHandle, GpuDevice, LayoutBinding, StageMask};
use crate::error::{RenderError, RenderResult};
use crate::shader::{ResourceKind, ShaderId, ShaderRegistry, ShaderSource, ShaderStage, UniformSlot};

use pipeline::PipelineCache;
use vertex_layout::VertexLayout;

new_key_type! {
    pub struct ProgramId;
}

/// The fixed set of program kinds. Each kind has its own vertex layout and
/// accepts its own draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Mesh objects (`draw_triangles`).
    Objects,
    /// Point sprites (`draw_points`).
    Points,
    /// Line segments (`draw_lines`).
    Lines,
    /// Compute work such as skinning (`dispatch_compute`).
    Compute,
}

impl ProgramKind {
    pub fn is_compute(self) -> bool {
        self == ProgramKind::Compute
    }

    pub fn bind_point(self) -> BindPoint {
        if self.is_compute() {
            BindPoint::Compute
        } else {
            BindPoint::Graphics
        }
    }

    fn required_stages(self) -> &'static [ShaderStage] {
        match self {
            ProgramKind::Compute => &[ShaderStage::Compute],
            _ => &[ShaderStage::Vertex, ShaderStage::Fragment],
        }
    }
}

/// Handle returned by `get_uniform_location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation {
    pub program: ProgramId,
    pub index: u32,
}

/// What feeds a binding at draw time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    /// The uniform block of `stages[stage_index]`.
    UniformBlock { stage_index: usize },
    /// An opaque resource. `unit` is its default texture/buffer unit.
    Resource { name: String, kind: ResourceKind, unit: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: StageMask,
    pub source: BindingSource,
}

#[derive(Debug, Clone)]
pub struct LinkedStage {
    pub stage: ShaderStage,
    pub shader: ShaderId,
    pub block_binding: Option<u32>,
    pub block_size: u32,
    /// Source with binding indices substituted.
    pub text: String,
    pub spirv: Vec<u32>,
}

/// One staging entry of one stage's uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformTarget {
    pub stage_index: usize,
    pub slot: UniformSlot,
}

/// A uniform name as seen by callers. The same name declared in several
/// stages writes to every stage's block.
#[derive(Debug, Clone)]
pub struct UniformInfo {
    pub name: String,
    pub targets: SmallVec<[UniformTarget; 2]>,
    /// Index into [`LinkedProgram::bindings`] for opaque resources.
    pub resource: Option<usize>,
}

/// Link output. Immutable; relinking replaces it wholesale.
pub struct LinkedProgram {
    pub name: String,
    pub kind: ProgramKind,
    /// Distinguishes successive links of the same program.
    pub serial: u64,
    pub stages: Vec<LinkedStage>,
    pub bindings: Vec<ProgramBinding>,
    pub layout: BindingLayoutHandle,
    pub vertex_layout: VertexLayout,
    pub pipelines: PipelineCache,
    uniforms: Vec<UniformInfo>,
    names: HashMap<String, u32>,
}

impl LinkedProgram {
    pub fn uniform_index(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    pub fn uniform(&self, index: u32) -> Option<&UniformInfo> {
        self.uniforms.get(index as usize)
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&LinkedStage> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Uniform-block bindings in binding order, as (binding, stage index).
    pub fn block_bindings(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        self.bindings.iter().filter_map(|b| match b.source {
            BindingSource::UniformBlock { stage_index } => Some((b.binding, stage_index)),
            BindingSource::Resource { .. } => None,
        })
    }
}

/// A program handle's state. Shader sources are shared, never owned.
pub struct Program {
    pub name: String,
    pub kind: ProgramKind,
    shaders: Mutex<Vec<ShaderId>>,
    linked: RwLock<Option<Arc<LinkedProgram>>>,
    failed: AtomicBool,
}

impl Program {
    pub fn new(name: &str, kind: ProgramKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shaders: Mutex::new(Vec::new()),
            linked: RwLock::new(None),
            failed: AtomicBool::new(false),
        }
    }

    pub fn attach(&self, shader: ShaderId) {
        let mut shaders = self.shaders.lock();
        if !shaders.contains(&shader) {
            shaders.push(shader);
        }
    }

    pub fn attached(&self) -> Vec<ShaderId> {
        self.shaders.lock().clone()
    }

    pub fn linked(&self) -> Option<Arc<LinkedProgram>> {
        self.linked.read().clone()
    }

    /// Whether the last link attempt failed.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Link the attached stages. On success the new link replaces the old
    /// one, which is returned so its device objects can be retired. On
    /// failure the program is left unusable (and the old link is returned
    /// for retirement too).
    pub fn link(
        &self,
        device: &dyn GpuDevice,
        registry: &ShaderRegistry,
        serial: u64,
    ) -> (RenderResult<()>, Option<Arc<LinkedProgram>>) {
        let result = link_program(self, device, registry, serial);
        let mut slot = self.linked.write();
        match result {
            Ok(linked) => {
                self.failed.store(false, Ordering::Release);
                (Ok(()), slot.replace(Arc::new(linked)))
            }
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                (Err(e), slot.take())
            }
        }
    }

    /// Remove the current link (teardown or disposal).
    pub fn unlink(&self) -> Option<Arc<LinkedProgram>> {
        self.linked.write().take()
    }
}

fn link_program(
    program: &Program,
    device: &dyn GpuDevice,
    registry: &ShaderRegistry,
    serial: u64,
) -> RenderResult<LinkedProgram> {
    let fail = |message: String| RenderError::link(&program.name, message);

    let attached = program.attached();
    if attached.is_empty() {
        return Err(fail("no shaders attached".to_string()));
    }

    let mut sources: Vec<(ShaderId, Arc<ShaderSource>)> = Vec::with_capacity(attached.len());
    for id in attached {
        let source = registry
            .get(id)
            .ok_or_else(|| fail(format!("attached shader {:?} is not loaded", id)))?;
        if sources.iter().any(|(_, s)| s.stage == source.stage) {
            return Err(fail(format!("two {:?} stages attached", source.stage)));
        }
        sources.push((id, source));
    }
    sources.sort_by_key(|(_, s)| s.stage);

    let stages: Vec<ShaderStage> = sources.iter().map(|(_, s)| s.stage).collect();
    if stages != program.kind.required_stages() {
        return Err(fail(format!(
            "{:?} program needs stages {:?}, has {:?}",
            program.kind,
            program.kind.required_stages(),
            stages
        )));
    }

    // Uniform blocks first, then opaque resources across all stages.
    let mut bindings: Vec<ProgramBinding> = Vec::new();
    let mut block_bindings: Vec<Option<u32>> = vec![None; sources.len()];
    for (stage_index, (_, source)) in sources.iter().enumerate() {
        if source.has_block() {
            let binding = bindings.len() as u32;
            block_bindings[stage_index] = Some(binding);
            bindings.push(ProgramBinding {
                binding,
                kind: BindingKind::UniformBufferDynamic,
                stages: source.stage.into(),
                source: BindingSource::UniformBlock { stage_index },
            });
        }
    }
    for (_, source) in &sources {
        for resource in &source.resources {
            let existing = bindings.iter_mut().find(|b| {
                matches!(&b.source, BindingSource::Resource { name, .. } if *name == resource.name)
            });
            match existing {
                Some(binding) => {
                    if binding.kind != resource.kind.binding_kind() {
                        return Err(fail(format!(
                            "{} is declared with different types across stages",
                            resource.name
                        )));
                    }
                    binding.stages |= source.stage.into();
                }
                None => {
                    let unit = bindings
                        .iter()
                        .filter(|b| matches!(&b.source, BindingSource::Resource { kind, .. } if *kind == resource.kind))
                        .count() as u32;
                    bindings.push(ProgramBinding {
                        binding: bindings.len() as u32,
                        kind: resource.kind.binding_kind(),
                        stages: source.stage.into(),
                        source: BindingSource::Resource {
                            name: resource.name.clone(),
                            kind: resource.kind,
                            unit,
                        },
                    });
                }
            }
        }
    }

    let resource_binding = |name: &str| {
        bindings.iter().find_map(|b| match &b.source {
            BindingSource::Resource { name: n, .. } if n == name => Some(b.binding),
            _ => None,
        })
    };

    let mut linked_stages = Vec::with_capacity(sources.len());
    for (stage_index, (id, source)) in sources.iter().enumerate() {
        let text = source
            .bind(block_bindings[stage_index], resource_binding)
            .map_err(&fail)?;
        let spirv = device
            .compile_glsl(source.stage, &source.name, &text)
            .map_err(|e| fail(e.to_string()))?;
        linked_stages.push(LinkedStage {
            stage: source.stage,
            shader: *id,
            block_binding: block_bindings[stage_index],
            block_size: source.block_size,
            text,
            spirv,
        });
    }

    let layout_bindings: Vec<LayoutBinding> = bindings
        .iter()
        .map(|b| LayoutBinding {
            binding: b.binding,
            kind: b.kind,
            stages: b.stages,
        })
        .collect();
    let layout = device
        .create_binding_layout(&layout_bindings)
        .map_err(|e| fail(e.to_string()))?;

    // Caller-visible names: block entries merged across stages, then resources.
    let mut uniforms: Vec<UniformInfo> = Vec::new();
    let mut names: HashMap<String, u32> = HashMap::new();
    for (stage_index, (_, source)) in sources.iter().enumerate() {
        for slot in &source.uniforms {
            let index = *names.entry(slot.name.clone()).or_insert_with(|| {
                uniforms.push(UniformInfo {
                    name: slot.name.clone(),
                    targets: SmallVec::new(),
                    resource: None,
                });
                (uniforms.len() - 1) as u32
            });
            uniforms[index as usize].targets.push(UniformTarget {
                stage_index,
                slot: slot.clone(),
            });
        }
    }
    for (binding_index, binding) in bindings.iter().enumerate() {
        if let BindingSource::Resource { name, .. } = &binding.source {
            let index = *names.entry(name.clone()).or_insert_with(|| {
                uniforms.push(UniformInfo {
                    name: name.clone(),
                    targets: SmallVec::new(),
                    resource: None,
                });
                (uniforms.len() - 1) as u32
            });
            uniforms[index as usize].resource = Some(binding_index);
        }
    }

    log::debug!(
        "Program: linked {} ({:?}), {} bindings, {} uniforms",
        program.name,
        program.kind,
        bindings.len(),
        uniforms.len()
    );

    Ok(LinkedProgram {
        name: program.name.clone(),
        kind: program.kind,
        serial,
        stages: linked_stages,
        bindings,
        layout,
        vertex_layout: VertexLayout::for_kind(program.kind),
        pipelines: PipelineCache::new(),
        uniforms,
        names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;

    const VERTEX: &str = "uniform mat4 mvp;\nuniform vec4 color;\nin vec3 position;\nvoid main() { gl_Position = mvp * vec4(position, 1.0); }\n";
    const FRAGMENT: &str = "uniform vec4 color;\nuniform float scale;\nuniform sampler2D tex;\nuniform sampler2D lightmap;\nout vec4 o;\nvoid main() { o = color * scale; }\n";

    fn setup(kind: ProgramKind, sources: &[(ShaderStage, &str)]) -> (HeadlessDevice, ShaderRegistry, Program) {
        let device = HeadlessDevice::new();
        let registry = ShaderRegistry::new();
        let program = Program::new("test", kind);
        for (n, (stage, source)) in sources.iter().enumerate() {
            let id = registry
                .load_source(*stage, &format!("s{}", n), source, "")
                .unwrap();
            program.attach(id);
        }
        (device, registry, program)
    }

    // ========================================================================
    // Binding assignment
    // ========================================================================

    #[test]
    fn test_blocks_before_resources() {
        let (device, registry, program) = setup(
            ProgramKind::Objects,
            &[(ShaderStage::Fragment, FRAGMENT), (ShaderStage::Vertex, VERTEX)],
        );
        let (result, previous) = program.link(&device, &registry, 1);
        result.unwrap();
        assert!(previous.is_none());
        let linked = program.linked().unwrap();

        assert_eq!(linked.stages[0].stage, ShaderStage::Vertex);
        assert_eq!(linked.stages[0].block_binding, Some(0));
        assert_eq!(linked.stages[1].block_binding, Some(1));
        let kinds: Vec<BindingKind> = linked.bindings.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BindingKind::UniformBufferDynamic,
                BindingKind::UniformBufferDynamic,
                BindingKind::CombinedImageSampler,
                BindingKind::CombinedImageSampler,
            ]
        );
        assert!(matches!(
            linked.bindings[3].source,
            BindingSource::Resource { unit: 1, .. }
        ));
        assert!(linked.stages[1].text.contains("binding = 2) uniform sampler2D tex;"));
        assert!(!linked.stages[1].text.contains('@'));
    }

    #[test]
    fn test_shared_uniform_targets_both_stages() {
        let (device, registry, program) = setup(
            ProgramKind::Objects,
            &[(ShaderStage::Vertex, VERTEX), (ShaderStage::Fragment, FRAGMENT)],
        );
        program.link(&device, &registry, 1).0.unwrap();
        let linked = program.linked().unwrap();
        let color = linked.uniform(linked.uniform_index("color").unwrap()).unwrap();
        assert_eq!(color.targets.len(), 2);
        assert_eq!(color.targets[0].slot.offset, 64);
        assert_eq!(color.targets[1].slot.offset, 0);

        let tex = linked.uniform(linked.uniform_index("tex").unwrap()).unwrap();
        assert!(tex.targets.is_empty());
        assert_eq!(tex.resource, Some(2));
        assert!(linked.uniform_index("missing").is_none());
    }

    #[test]
    fn test_resource_shared_across_stages_gets_one_binding() {
        let vertex = "uniform sampler2D heightmap;\nvoid main() {}\n";
        let fragment = "uniform sampler2D heightmap;\nout vec4 o;\nvoid main() {}\n";
        let (device, registry, program) = setup(
            ProgramKind::Objects,
            &[(ShaderStage::Vertex, vertex), (ShaderStage::Fragment, fragment)],
        );
        program.link(&device, &registry, 1).0.unwrap();
        let linked = program.linked().unwrap();
        assert_eq!(linked.bindings.len(), 1);
        assert_eq!(linked.bindings[0].stages, StageMask::VERTEX | StageMask::FRAGMENT);
    }

    // ========================================================================
    // Failures
    // ========================================================================

    #[test]
    fn test_missing_stage_fails() {
        let (device, registry, program) = setup(ProgramKind::Objects, &[(ShaderStage::Vertex, VERTEX)]);
        let (result, _) = program.link(&device, &registry, 1);
        assert!(matches!(result, Err(RenderError::Link { .. })));
        assert!(program.is_failed());
        assert!(program.linked().is_none());
    }

    #[test]
    fn test_compile_failure_disables_program() {
        let (device, registry, program) = setup(
            ProgramKind::Objects,
            &[(ShaderStage::Vertex, VERTEX), (ShaderStage::Fragment, FRAGMENT)],
        );
        program.link(&device, &registry, 1).0.unwrap();
        device.fail_compiles_containing("lightmap");
        let (result, previous) = program.link(&device, &registry, 2);
        assert!(result.is_err());
        assert!(previous.is_some());
        assert!(program.linked().is_none());
    }

    #[test]
    fn test_compute_program_links_single_stage() {
        let compute = "layout(local_size_x = 64) in;\nbuffer Bones { mat4 bones[]; };\nbuffer Vertices { vec4 v[]; };\nuniform int count;\nvoid main() {}\n";
        let (device, registry, program) = setup(ProgramKind::Compute, &[(ShaderStage::Compute, compute)]);
        program.link(&device, &registry, 1).0.unwrap();
        let linked = program.linked().unwrap();
        assert_eq!(linked.bindings.len(), 3);
        assert!(matches!(
            linked.bindings[2].source,
            BindingSource::Resource { kind: ResourceKind::StorageBuffer, unit: 1, .. }
        ));
        assert!(linked.vertex_layout.bindings.is_empty());
    }

    #[test]
    fn test_link_is_deterministic() {
        let (device, registry, program) = setup(
            ProgramKind::Objects,
            &[(ShaderStage::Vertex, VERTEX), (ShaderStage::Fragment, FRAGMENT)],
        );
        program.link(&device, &registry, 1).0.unwrap();
        let first = program.linked().unwrap();
        program.link(&device, &registry, 2).0.unwrap();
        let second = program.linked().unwrap();
        assert_eq!(first.bindings, second.bindings);
        for (a, b) in first.stages.iter().zip(&second.stages) {
            assert_eq!(a.text, b.text);
        }
    }
}
