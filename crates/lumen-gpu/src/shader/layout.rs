//! Uniform types and the packed block layout.
//!
//! Scalars align to their own size, vectors and matrices to 16 bytes. Array
//! elements use a stride rounded up to 16. Structs align to their widest
//! member (never less than 16) and their size is rounded up to 16. The
//! engine writes raw bytes at these offsets, and the generated block carries
//! explicit offsets so the compiled layout matches.

use std::collections::HashMap;

/// Plain (non-opaque) uniform types that live inside the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Int,
    UInt,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    IVec2,
    IVec3,
    IVec4,
    UVec2,
    UVec3,
    UVec4,
    Mat2,
    Mat3,
    Mat4,
}

/// Scalar kind of a uniform component, used when converting written values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
    Bool,
}

impl UniformType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "float" => UniformType::Float,
            "int" => UniformType::Int,
            "uint" => UniformType::UInt,
            "bool" => UniformType::Bool,
            "vec2" => UniformType::Vec2,
            "vec3" => UniformType::Vec3,
            "vec4" => UniformType::Vec4,
            "ivec2" => UniformType::IVec2,
            "ivec3" => UniformType::IVec3,
            "ivec4" => UniformType::IVec4,
            "uvec2" => UniformType::UVec2,
            "uvec3" => UniformType::UVec3,
            "uvec4" => UniformType::UVec4,
            "mat2" | "mat2x2" => UniformType::Mat2,
            "mat3" | "mat3x3" => UniformType::Mat3,
            "mat4" | "mat4x4" => UniformType::Mat4,
            _ => return None,
        })
    }

    pub fn glsl_name(self) -> &'static str {
        match self {
            UniformType::Float => "float",
            UniformType::Int => "int",
            UniformType::UInt => "uint",
            UniformType::Bool => "bool",
            UniformType::Vec2 => "vec2",
            UniformType::Vec3 => "vec3",
            UniformType::Vec4 => "vec4",
            UniformType::IVec2 => "ivec2",
            UniformType::IVec3 => "ivec3",
            UniformType::IVec4 => "ivec4",
            UniformType::UVec2 => "uvec2",
            UniformType::UVec3 => "uvec3",
            UniformType::UVec4 => "uvec4",
            UniformType::Mat2 => "mat2",
            UniformType::Mat3 => "mat3",
            UniformType::Mat4 => "mat4",
        }
    }

    pub fn scalar_kind(self) -> ScalarKind {
        match self {
            UniformType::Int | UniformType::IVec2 | UniformType::IVec3 | UniformType::IVec4 => ScalarKind::Int,
            UniformType::UInt | UniformType::UVec2 | UniformType::UVec3 | UniformType::UVec4 => ScalarKind::UInt,
            UniformType::Bool => ScalarKind::Bool,
            _ => ScalarKind::Float,
        }
    }

    /// (columns, rows). Vectors and scalars have one column.
    pub fn shape(self) -> (u32, u32) {
        match self {
            UniformType::Float | UniformType::Int | UniformType::UInt | UniformType::Bool => (1, 1),
            UniformType::Vec2 | UniformType::IVec2 | UniformType::UVec2 => (1, 2),
            UniformType::Vec3 | UniformType::IVec3 | UniformType::UVec3 => (1, 3),
            UniformType::Vec4 | UniformType::IVec4 | UniformType::UVec4 => (1, 4),
            UniformType::Mat2 => (2, 2),
            UniformType::Mat3 => (3, 3),
            UniformType::Mat4 => (4, 4),
        }
    }

    /// Number of scalar components a caller supplies for one value.
    pub fn components(self) -> u32 {
        let (columns, rows) = self.shape();
        columns * rows
    }

    /// Byte stride between matrix columns (zero for vectors and scalars).
    pub fn column_stride(self) -> u32 {
        if self.shape().0 > 1 {
            16
        } else {
            0
        }
    }

    pub fn size(self) -> u32 {
        let (columns, rows) = self.shape();
        if columns > 1 {
            columns * 16
        } else {
            rows * 4
        }
    }

    pub fn alignment(self) -> u32 {
        if self.shape() == (1, 1) {
            4
        } else {
            16
        }
    }
}

/// Type of a struct member or block member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Plain(UniformType),
    Struct(String),
}

impl FieldType {
    pub fn glsl_name(&self) -> &str {
        match self {
            FieldType::Plain(ty) => ty.glsl_name(),
            FieldType::Struct(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    /// Element count for arrays.
    pub array: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedField {
    pub field: Field,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<PlacedField>,
    pub size: u32,
    pub alignment: u32,
}

/// A flattened, individually addressable staging entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformSlot {
    /// `name`, `name[i]`, `name.member`, or `name[i].member`.
    pub name: String,
    pub ty: UniformType,
    pub offset: u32,
    /// Elements reachable from this entry (more than one for bare array names).
    pub count: u32,
    pub stride: u32,
}

impl UniformSlot {
    /// Bytes spanned from the first to the last reachable element.
    pub fn span(&self) -> u32 {
        (self.count - 1) * self.stride + self.ty.size()
    }
}

pub fn round_up(value: u32, alignment: u32) -> u32 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Struct table plus the layout rules.
#[derive(Debug, Default, Clone)]
pub struct LayoutEngine {
    structs: HashMap<String, StructLayout>,
}

impl LayoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_struct(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    /// (size, alignment) of one element of `ty`.
    fn element(&self, ty: &FieldType) -> Result<(u32, u32), String> {
        match ty {
            FieldType::Plain(ty) => Ok((ty.size(), ty.alignment())),
            FieldType::Struct(name) => self
                .structs
                .get(name)
                .map(|s| (s.size, s.alignment))
                .ok_or_else(|| format!("unknown struct {}", name)),
        }
    }

    /// (size, alignment, element stride) of a field including its array dimension.
    pub fn field_size_align(&self, field: &Field) -> Result<(u32, u32, u32), String> {
        let (size, alignment) = self.element(&field.ty)?;
        match field.array {
            Some(0) => Err(format!("array {} has zero elements", field.name)),
            Some(count) => {
                let stride = round_up(size, 16);
                Ok((stride * count, alignment.max(16), stride))
            }
            None => Ok((size, alignment, size)),
        }
    }

    /// Place `fields` one after another starting at offset zero.
    pub fn place(&self, fields: &[Field]) -> Result<(Vec<PlacedField>, u32, u32), String> {
        let mut offset = 0;
        let mut widest = 4;
        let mut placed = Vec::with_capacity(fields.len());
        for field in fields {
            let (size, alignment, _) = self.field_size_align(field)?;
            offset = round_up(offset, alignment);
            placed.push(PlacedField {
                field: field.clone(),
                offset,
            });
            offset += size;
            widest = widest.max(alignment);
        }
        Ok((placed, offset, widest))
    }

    pub fn define_struct(&mut self, name: &str, fields: &[Field]) -> Result<&StructLayout, String> {
        if fields.is_empty() {
            return Err(format!("struct {} has no members", name));
        }
        let (fields, end, widest) = self.place(fields)?;
        let alignment = round_up(widest, 16).max(16);
        let layout = StructLayout {
            name: name.to_string(),
            fields,
            size: round_up(end, 16),
            alignment,
        };
        self.structs.insert(name.to_string(), layout);
        self.structs
            .get(name)
            .ok_or_else(|| format!("struct {} vanished", name))
    }

    /// Flatten a placed field into addressable staging entries.
    pub fn flatten(&self, prefix: &str, placed: &PlacedField, out: &mut Vec<UniformSlot>) -> Result<(), String> {
        let field = &placed.field;
        let name = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", prefix, field.name)
        };
        let (_, _, stride) = self.field_size_align(field)?;

        match (&field.ty, field.array) {
            (FieldType::Plain(ty), None) => out.push(UniformSlot {
                name,
                ty: *ty,
                offset: placed.offset,
                count: 1,
                stride,
            }),
            (FieldType::Plain(ty), Some(count)) => {
                // The bare name addresses element 0 and runs on through the array.
                out.push(UniformSlot {
                    name: name.clone(),
                    ty: *ty,
                    offset: placed.offset,
                    count,
                    stride,
                });
                for i in 0..count {
                    out.push(UniformSlot {
                        name: format!("{}[{}]", name, i),
                        ty: *ty,
                        offset: placed.offset + i * stride,
                        count: 1,
                        stride,
                    });
                }
            }
            (FieldType::Struct(struct_name), array) => {
                let layout = self
                    .structs
                    .get(struct_name)
                    .ok_or_else(|| format!("unknown struct {}", struct_name))?;
                let elements = array.unwrap_or(1);
                for i in 0..elements {
                    let base = placed.offset + i * stride;
                    let mut element_prefixes = Vec::with_capacity(2);
                    if array.is_some() {
                        element_prefixes.push(format!("{}[{}]", name, i));
                        if i == 0 {
                            element_prefixes.push(name.clone());
                        }
                    } else {
                        element_prefixes.push(name.clone());
                    }
                    for element_prefix in element_prefixes {
                        for member in &layout.fields {
                            let shifted = PlacedField {
                                field: member.field.clone(),
                                offset: base + member.offset,
                            };
                            self.flatten(&element_prefix, &shifted, out)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
