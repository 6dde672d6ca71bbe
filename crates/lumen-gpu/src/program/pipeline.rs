//! Render-state fingerprints and the lazily built pipeline cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::vertex_layout::VertexLayout;
use crate::device::{
    BindingLayoutHandle, ComputePipelineDesc, CullMode, DepthFunction, DeviceResult, FrontFace, GpuDevice,
    GraphicsPipelineDesc, PipelineHandle, RasterState, TextureFormat,
};
use crate::resources::texture::RenderTargetId;

/// Where a graphics draw renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputTarget {
    /// The backend-owned frame target.
    #[default]
    Frame,
    Target(RenderTargetId),
}

/// Cache key computed from render state. Two fingerprints are equal exactly
/// when every field is equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub blend: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
    pub target: OutputTarget,
}

impl Fingerprint {
    /// Key of a program's single compute pipeline.
    pub const COMPUTE: Fingerprint = Fingerprint {
        front_face: FrontFace::CounterClockwise,
        cull_mode: CullMode::None,
        blend: false,
        depth_test: false,
        depth_write: false,
        depth_function: DepthFunction::Always,
        target: OutputTarget::Frame,
    };

    pub fn raster(&self) -> RasterState {
        RasterState {
            cull_mode: self.cull_mode,
            front_face: self.front_face,
            blend: self.blend,
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            depth_function: self.depth_function,
        }
    }
}

/// Pipelines of one program, keyed by fingerprint. Entries are never
/// removed before the program is relinked or torn down.
#[derive(Default)]
pub struct PipelineCache {
    pipelines: RwLock<HashMap<Fingerprint, PipelineHandle>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `fingerprint`, building the pipeline under the write lock on a
    /// miss. Returns the pipeline and whether it was built by this call.
    pub fn get_or_build<F>(&self, fingerprint: Fingerprint, build: F) -> DeviceResult<(PipelineHandle, bool)>
    where
        F: FnOnce() -> DeviceResult<PipelineHandle>,
    {
        if let Some(pipeline) = self.pipelines.read().get(&fingerprint) {
            return Ok((*pipeline, false));
        }

        let mut pipelines = self.pipelines.write();
        if let Some(pipeline) = pipelines.get(&fingerprint) {
            return Ok((*pipeline, false));
        }
        let pipeline = build()?;
        pipelines.insert(fingerprint, pipeline);
        Ok((pipeline, true))
    }

    pub fn len(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every cached pipeline.
    pub fn drain(&self) -> Vec<PipelineHandle> {
        self.pipelines.write().drain().map(|(_, p)| p).collect()
    }
}

/// Attachment formats of an output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFormats {
    pub color: Option<TextureFormat>,
    pub depth: Option<TextureFormat>,
}

pub struct GraphicsBuild<'a> {
    pub name: &'a str,
    pub layout: BindingLayoutHandle,
    pub vertex_code: &'a [u32],
    pub fragment_code: &'a [u32],
    pub vertex_layout: &'a VertexLayout,
    pub formats: TargetFormats,
}

pub fn build_graphics(
    device: &dyn GpuDevice,
    build: &GraphicsBuild<'_>,
    fingerprint: &Fingerprint,
) -> DeviceResult<PipelineHandle> {
    log::debug!(
        "Pipeline: building {} for {:?}",
        build.name,
        fingerprint
    );
    let desc = GraphicsPipelineDesc {
        name: build.name,
        layout: build.layout,
        vertex_code: build.vertex_code,
        fragment_code: build.fragment_code,
        vertex_bindings: &build.vertex_layout.bindings,
        vertex_attributes: &build.vertex_layout.attributes,
        topology: build.vertex_layout.topology,
        raster: fingerprint.raster(),
        color_format: build.formats.color,
        depth_format: build.formats.depth,
    };
    device.create_graphics_pipeline(&desc)
}

pub fn build_compute(
    device: &dyn GpuDevice,
    name: &str,
    layout: BindingLayoutHandle,
    code: &[u32],
) -> DeviceResult<PipelineHandle> {
    log::debug!("Pipeline: building compute {}", name);
    device.create_compute_pipeline(&ComputePipelineDesc { name, layout, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, HeadlessDevice};
    use crate::program::ProgramKind;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            front_face: FrontFace::CounterClockwise,
            cull_mode: CullMode::Back,
            blend: false,
            depth_test: true,
            depth_write: true,
            depth_function: DepthFunction::LessOrEqual,
            target: OutputTarget::Frame,
        }
    }

    // ========================================================================
    // Fingerprint equality
    // ========================================================================

    #[test]
    fn test_fingerprints_differ_in_every_field() {
        let base = fingerprint();
        let variants = [
            Fingerprint { front_face: FrontFace::Clockwise, ..base },
            Fingerprint { cull_mode: CullMode::None, ..base },
            Fingerprint { blend: true, ..base },
            Fingerprint { depth_test: false, ..base },
            Fingerprint { depth_write: false, ..base },
            Fingerprint { depth_function: DepthFunction::Less, ..base },
            Fingerprint {
                target: OutputTarget::Target(RenderTargetId::default()),
                ..base
            },
        ];
        for variant in &variants {
            assert_ne!(*variant, base);
        }
        assert_eq!(fingerprint(), base);
    }

    // ========================================================================
    // Cache
    // ========================================================================

    #[test]
    fn test_equal_fingerprints_share_pipeline() {
        let cache = PipelineCache::new();
        let (a, built_a) = cache.get_or_build(fingerprint(), || Ok(PipelineHandle(7))).unwrap();
        let (b, built_b) = cache
            .get_or_build(fingerprint(), || panic!("must not rebuild"))
            .unwrap();
        assert_eq!(a, b);
        assert!(built_a);
        assert!(!built_b);

        let other = Fingerprint { blend: true, ..fingerprint() };
        let (c, _) = cache.get_or_build(other, || Ok(PipelineHandle(8))).unwrap();
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache = PipelineCache::new();
        let result = cache.get_or_build(fingerprint(), || Err(DeviceError::Pipeline("boom".into())));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_build_graphics_uses_kind_layout() {
        let device = HeadlessDevice::new();
        let layout = VertexLayout::for_kind(ProgramKind::Lines);
        let build = GraphicsBuild {
            name: "lines",
            layout: BindingLayoutHandle(1),
            vertex_code: &[1, 2],
            fragment_code: &[3, 4],
            vertex_layout: &layout,
            formats: TargetFormats {
                color: Some(TextureFormat::Rgba8Unorm),
                depth: Some(TextureFormat::Depth32Float),
            },
        };
        let pipeline = build_graphics(&device, &build, &fingerprint()).unwrap();
        assert!(!pipeline.is_null());
        assert_eq!(HeadlessDevice::count(&device.counters.pipelines_created), 1);
    }

    #[test]
    fn test_concurrent_lookups_build_once() {
        let cache = PipelineCache::new();
        let builds = std::sync::atomic::AtomicU32::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_build(fingerprint(), || {
                            builds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            Ok(PipelineHandle(1))
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
