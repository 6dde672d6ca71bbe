//! Writing uniform values into block staging bytes.
//!
//! Values arrive as flat component lists (column-major for matrices) and are
//! scattered into the block at the slot's offset, honoring the 16-byte
//! matrix-column and array-element strides of the block layout.

use crate::shader::layout::{ScalarKind, UniformSlot};

/// Components supplied by a `set_uniform_*` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformData<'a> {
    Float(&'a [f32]),
    Int(&'a [i32]),
    UInt(&'a [u32]),
}

impl UniformData<'_> {
    pub fn len(&self) -> usize {
        match self {
            UniformData::Float(v) => v.len(),
            UniformData::Int(v) => v.len(),
            UniformData::UInt(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Component `index` converted to the 4-byte representation of `kind`.
    fn component(&self, index: usize, kind: ScalarKind) -> [u8; 4] {
        let word: u32 = match (self, kind) {
            (UniformData::Float(v), ScalarKind::Float) => v[index].to_bits(),
            (UniformData::Float(v), ScalarKind::Int) => bytemuck::cast(v[index] as i32),
            (UniformData::Float(v), ScalarKind::UInt) => v[index] as u32,
            (UniformData::Float(v), ScalarKind::Bool) => u32::from(v[index] != 0.0),
            (UniformData::Int(v), ScalarKind::Float) => (v[index] as f32).to_bits(),
            (UniformData::Int(v), ScalarKind::Int | ScalarKind::UInt) => bytemuck::cast(v[index]),
            (UniformData::Int(v), ScalarKind::Bool) => u32::from(v[index] != 0),
            (UniformData::UInt(v), ScalarKind::Float) => (v[index] as f32).to_bits(),
            (UniformData::UInt(v), ScalarKind::Int | ScalarKind::UInt) => v[index],
            (UniformData::UInt(v), ScalarKind::Bool) => u32::from(v[index] != 0),
        };
        bytemuck::cast(word)
    }
}

/// Scatter `data` into `block` at `slot`. Returns whether any byte changed.
///
/// Extra components beyond the slot's reachable elements are ignored, and a
/// short list writes only what it covers.
pub fn write_slot(slot: &UniformSlot, block: &mut [u8], data: UniformData<'_>) -> bool {
    let (columns, rows) = slot.ty.shape();
    let kind = slot.ty.scalar_kind();
    let per_element = (columns * rows) as usize;
    let column_stride = slot.ty.column_stride();
    let mut changed = false;

    for index in 0..data.len().min(per_element * slot.count as usize) {
        let element = (index / per_element) as u32;
        let within = (index % per_element) as u32;
        let (column, row) = (within / rows, within % rows);
        let at = (slot.offset + element * slot.stride + column * column_stride + row * 4) as usize;
        let Some(target) = block.get_mut(at..at + 4) else {
            break;
        };
        let bytes = data.component(index, kind);
        if target[..] != bytes[..] {
            target.copy_from_slice(&bytes);
            changed = true;
        }
    }
    changed
}
