//! Fixed vertex-input layouts, one per program kind.
//!
//! Every vertex stream lives in its own buffer binding. Binding `n` of a
//! layout is fed by the buffer bound to vertex slot `n`; unbound slots are
//! filled with the backend's empty buffer so the layout is always satisfied.

use crate::device::{Topology, VertexAttribute, VertexBinding, VertexFormat};

use super::ProgramKind;

/// Vertex streams of [`ProgramKind::Objects`], by slot.
pub mod objects {
    pub const POSITION: u32 = 0;
    pub const NORMAL: u32 = 1;
    pub const TEXCOORD: u32 = 2;
    /// Per-instance model matrix (four locations).
    pub const INSTANCE_MATRIX: u32 = 3;
    pub const EFFECT_COLOR_MUL: u32 = 4;
    pub const EFFECT_COLOR_ADD: u32 = 5;
    pub const TANGENT: u32 = 6;
    pub const BITANGENT: u32 = 7;
}

/// Vertex streams of [`ProgramKind::Points`], by slot.
pub mod points {
    pub const POSITION: u32 = 0;
    pub const SPRITE_INDEX: u32 = 1;
    pub const COLOR: u32 = 2;
    pub const POINT_SIZE: u32 = 3;
    pub const EFFECT_COLOR_MUL: u32 = 4;
    pub const EFFECT_COLOR_ADD: u32 = 5;
}

/// Vertex streams of [`ProgramKind::Lines`], by slot.
pub mod lines {
    pub const POSITION: u32 = 0;
    pub const COLOR: u32 = 1;
}

/// Most vertex slots any layout uses.
pub const MAX_VERTEX_SLOTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
    pub topology: Topology,
}

impl VertexLayout {
    /// Number of vertex buffer bindings the pipeline consumes.
    pub fn slot_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn for_kind(kind: ProgramKind) -> Self {
        let mut builder = LayoutBuilder::default();
        match kind {
            ProgramKind::Objects => {
                builder.stream(VertexFormat::Float3, false);
                builder.stream(VertexFormat::Float3, false);
                builder.stream(VertexFormat::Float2, false);
                builder.instance_matrix();
                builder.stream(VertexFormat::Float4, true);
                builder.stream(VertexFormat::Float4, true);
                builder.stream(VertexFormat::Float3, false);
                builder.stream(VertexFormat::Float3, false);
                builder.finish(Topology::TriangleList)
            }
            ProgramKind::Points => {
                builder.stream(VertexFormat::Float3, false);
                builder.stream(VertexFormat::Float, false);
                builder.stream(VertexFormat::Float4, false);
                builder.stream(VertexFormat::Float, false);
                builder.stream(VertexFormat::Float4, false);
                builder.stream(VertexFormat::Float4, false);
                builder.finish(Topology::PointList)
            }
            ProgramKind::Lines => {
                builder.stream(VertexFormat::Float3, false);
                builder.stream(VertexFormat::Float4, false);
                builder.finish(Topology::LineList)
            }
            ProgramKind::Compute => builder.finish(Topology::TriangleList),
        }
    }
}

#[derive(Default)]
struct LayoutBuilder {
    bindings: Vec<VertexBinding>,
    attributes: Vec<VertexAttribute>,
    location: u32,
}

impl LayoutBuilder {
    fn stream(&mut self, format: VertexFormat, per_instance: bool) {
        let binding = self.bindings.len() as u32;
        self.bindings.push(VertexBinding {
            binding,
            stride: format.size(),
            per_instance,
        });
        self.attributes.push(VertexAttribute {
            location: self.location,
            binding,
            format,
            offset: 0,
        });
        self.location += 1;
    }

    /// A per-instance mat4 stream: four vec4 columns in consecutive locations.
    fn instance_matrix(&mut self) {
        let binding = self.bindings.len() as u32;
        self.bindings.push(VertexBinding {
            binding,
            stride: 64,
            per_instance: true,
        });
        for column in 0..4 {
            self.attributes.push(VertexAttribute {
                location: self.location,
                binding,
                format: VertexFormat::Float4,
                offset: column * 16,
            });
            self.location += 1;
        }
    }

    fn finish(self, topology: Topology) -> VertexLayout {
        VertexLayout {
            bindings: self.bindings,
            attributes: self.attributes,
            topology,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objects_layout() {
        let layout = VertexLayout::for_kind(ProgramKind::Objects);
        assert_eq!(layout.slot_count(), 8);
        assert_eq!(layout.attributes.len(), 11);
        assert!(layout.slot_count() <= MAX_VERTEX_SLOTS);

        let matrix: Vec<_> = layout
            .attributes
            .iter()
            .filter(|a| a.binding == objects::INSTANCE_MATRIX)
            .collect();
        assert_eq!(matrix.iter().map(|a| a.location).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(matrix[3].offset, 48);
        assert!(layout.bindings[objects::INSTANCE_MATRIX as usize].per_instance);

        let bitangent = layout.attributes.last().unwrap();
        assert_eq!(bitangent.binding, objects::BITANGENT);
        assert_eq!(bitangent.location, 10);
    }

    #[test]
    fn test_points_and_lines_layouts() {
        let points = VertexLayout::for_kind(ProgramKind::Points);
        assert_eq!(points.topology, Topology::PointList);
        assert_eq!(points.slot_count(), 6);
        assert_eq!(points.bindings[points::SPRITE_INDEX as usize].stride, 4);

        let lines = VertexLayout::for_kind(ProgramKind::Lines);
        assert_eq!(lines.topology, Topology::LineList);
        assert_eq!(lines.attributes[lines::COLOR as usize].format, VertexFormat::Float4);
    }

    #[test]
    fn test_compute_has_no_vertex_input() {
        let layout = VertexLayout::for_kind(ProgramKind::Compute);
        assert!(layout.bindings.is_empty());
        assert!(layout.attributes.is_empty());
    }

    #[test]
    fn test_kinds_are_distinct() {
        let kinds = [ProgramKind::Objects, ProgramKind::Points, ProgramKind::Lines, ProgramKind::Compute];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(VertexLayout::for_kind(*a), VertexLayout::for_kind(*b));
            }
        }
    }
}
