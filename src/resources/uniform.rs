//! Descriptor driven uniform storage
//!
//! A descriptor such as `"float4 u_color; mat4 projMatrix; float shadow_map_index"`
//! declares named fields. Offsets follow uniform buffer alignment so the same bytes
//! can be bound as a WGSL struct.

use crate::error::{RenderError, RenderResult};
use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Field types accepted in a uniform descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    Mat3,
    Mat4,
}

impl UniformType {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "float" => UniformType::Float,
            "float2" | "vec2" => UniformType::Float2,
            "float3" | "vec3" => UniformType::Float3,
            "float4" | "vec4" => UniformType::Float4,
            "int" => UniformType::Int,
            "int2" | "ivec2" => UniformType::Int2,
            "int3" | "ivec3" => UniformType::Int3,
            "int4" | "ivec4" => UniformType::Int4,
            "mat3" => UniformType::Mat3,
            "mat4" => UniformType::Mat4,
            _ => return None,
        })
    }

    /// Bytes occupied by one value
    pub fn size(&self) -> u32 {
        match self {
            UniformType::Float | UniformType::Int => 4,
            UniformType::Float2 | UniformType::Int2 => 8,
            UniformType::Float3 | UniformType::Int3 => 12,
            UniformType::Float4 | UniformType::Int4 => 16,
            // three columns, each padded to a vec4
            UniformType::Mat3 => 48,
            UniformType::Mat4 => 64,
        }
    }

    pub fn align(&self) -> u32 {
        match self {
            UniformType::Float | UniformType::Int => 4,
            UniformType::Float2 | UniformType::Int2 => 8,
            _ => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UniformType::Float => "float",
            UniformType::Float2 => "float2",
            UniformType::Float3 => "float3",
            UniformType::Float4 => "float4",
            UniformType::Int => "int",
            UniformType::Int2 => "int2",
            UniformType::Int3 => "int3",
            UniformType::Int4 => "int4",
            UniformType::Mat3 => "mat3",
            UniformType::Mat4 => "mat4",
        }
    }

    fn wgsl(&self) -> &'static str {
        match self {
            UniformType::Float => "f32",
            UniformType::Float2 => "vec2<f32>",
            UniformType::Float3 => "vec3<f32>",
            UniformType::Float4 => "vec4<f32>",
            UniformType::Int => "i32",
            UniformType::Int2 => "vec2<i32>",
            UniformType::Int3 => "vec3<i32>",
            UniformType::Int4 => "vec4<i32>",
            UniformType::Mat3 => "mat3x3<f32>",
            UniformType::Mat4 => "mat4x4<f32>",
        }
    }
}

/// One named field of a layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformEntry {
    pub name: String,
    pub ty: UniformType,
    /// Array length, 0 for a plain field
    pub count: u32,
    pub offset: u32,
}

impl UniformEntry {
    /// Distance between array elements. Uniform arrays use a 16 byte stride.
    pub fn stride(&self) -> u32 {
        if self.count == 0 {
            self.ty.size()
        } else {
            round_up(self.ty.size(), 16)
        }
    }

    pub fn byte_size(&self) -> u32 {
        if self.count == 0 {
            self.ty.size()
        } else {
            self.stride() * self.count
        }
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Parsed descriptor: field names, types and offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    descriptor: String,
    entries: Vec<UniformEntry>,
    index: HashMap<String, usize>,
    size: u32,
}

impl UniformLayout {
    /// Parse `"type name; type name[count]; ..."`
    pub fn parse(descriptor: &str) -> RenderResult<Self> {
        let mut layout = UniformLayout {
            descriptor: descriptor.to_string(),
            ..Default::default()
        };
        let mut offset = 0u32;

        for decl in descriptor.split(';').map(str::trim).filter(|d| !d.is_empty()) {
            let mut parts = decl.split_whitespace();
            let (Some(type_token), Some(name_token), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(RenderError::InvalidDescriptor(format!("expected 'type name' in '{}'", decl)));
            };

            // the array suffix may sit on either token: "float[4] w" or "float w[4]"
            let (type_token, type_count) = split_array(type_token)?;
            let (name, name_count) = split_array(name_token)?;
            let count = type_count.max(name_count);

            let ty = UniformType::parse(type_token).ok_or_else(|| {
                RenderError::InvalidDescriptor(format!("unknown type '{}' in '{}'", type_token, decl))
            })?;
            if layout.index.contains_key(name) {
                return Err(RenderError::InvalidDescriptor(format!("duplicate field '{}'", name)));
            }

            let align = if count > 0 { 16 } else { ty.align() };
            offset = round_up(offset, align);
            let entry = UniformEntry {
                name: name.to_string(),
                ty,
                count,
                offset,
            };
            offset += entry.byte_size();
            layout.index.insert(entry.name.clone(), layout.entries.len());
            layout.entries.push(entry);
        }

        layout.size = round_up(offset, 16);
        Ok(layout)
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn entries(&self) -> &[UniformEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&UniformEntry> {
        self.index.get(name).map(|i| &self.entries[*i])
    }

    /// Total size, rounded to 16 bytes so layouts can be stacked in an array
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// WGSL struct with the same memory layout, usable as a uniform array element.
    /// Scalar arrays become `vec4` arrays with the value in `.x`.
    pub fn wgsl_struct(&self, struct_name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "struct {} {{", struct_name);
        if self.entries.is_empty() {
            let _ = writeln!(out, "    _pad: vec4<f32>,");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let ty = match (entry.count, entry.ty) {
                (0, ty) => ty.wgsl().to_string(),
                (n, UniformType::Float | UniformType::Float2 | UniformType::Float3) => {
                    format!("array<vec4<f32>, {}>", n)
                }
                (n, UniformType::Int | UniformType::Int2 | UniformType::Int3) => {
                    format!("array<vec4<i32>, {}>", n)
                }
                (n, ty) => format!("array<{}, {}>", ty.wgsl(), n),
            };
            // keeps the struct 16 byte aligned so arrays of it match `size()`
            let align = if i == 0 { "@align(16) " } else { "" };
            let _ = writeln!(out, "    {}{}: {},", align, entry.name, ty);
        }
        out.push_str("};\n");
        out
    }
}

fn split_array(token: &str) -> RenderResult<(&str, u32)> {
    match token.find('[') {
        None => Ok((token, 0)),
        Some(open) => {
            let count = token[open + 1..]
                .strip_suffix(']')
                .and_then(|n| n.trim().parse::<u32>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| RenderError::InvalidDescriptor(format!("bad array size in '{}'", token)))?;
            Ok((&token[..open], count))
        }
    }
}

/// Named uniform values backed by one byte buffer with a dirty flag
#[derive(Debug, Clone)]
pub struct UniformBlock {
    layout: Arc<UniformLayout>,
    data: Vec<u8>,
    dirty: bool,
}

impl UniformBlock {
    pub fn new(descriptor: &str) -> RenderResult<Self> {
        Ok(Self::from_layout(Arc::new(UniformLayout::parse(descriptor)?)))
    }

    pub fn from_layout(layout: Arc<UniformLayout>) -> Self {
        Self {
            data: vec![0; layout.size() as usize],
            layout,
            dirty: true,
        }
    }

    pub fn layout(&self) -> &Arc<UniformLayout> {
        &self.layout
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.layout.entry(name).is_some()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> u32 {
        self.layout.size()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn slot(&self, name: &str, expected: UniformType) -> RenderResult<(usize, usize)> {
        let entry = self
            .layout
            .entry(name)
            .ok_or_else(|| RenderError::UniformNotFound(name.to_string()))?;
        if entry.ty != expected || entry.count != 0 {
            return Err(RenderError::UniformTypeMismatch {
                name: name.to_string(),
                expected: expected.name(),
                actual: entry.ty.name(),
            });
        }
        Ok((entry.offset as usize, entry.ty.size() as usize))
    }

    fn write(&mut self, name: &str, ty: UniformType, bytes: &[u8]) -> RenderResult<()> {
        let (offset, size) = self.slot(name, ty)?;
        self.data[offset..offset + size].copy_from_slice(&bytes[..size]);
        self.dirty = true;
        Ok(())
    }

    fn read(&self, name: &str, ty: UniformType) -> RenderResult<&[u8]> {
        let (offset, size) = self.slot(name, ty)?;
        Ok(&self.data[offset..offset + size])
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> RenderResult<()> {
        self.write(name, UniformType::Float, bytemuck::bytes_of(&value))
    }

    pub fn set_vec2(&mut self, name: &str, value: Vec2) -> RenderResult<()> {
        self.write(name, UniformType::Float2, bytemuck::bytes_of(&value))
    }

    pub fn set_vec3(&mut self, name: &str, value: Vec3) -> RenderResult<()> {
        self.write(name, UniformType::Float3, bytemuck::bytes_of(&value))
    }

    pub fn set_vec4(&mut self, name: &str, value: Vec4) -> RenderResult<()> {
        self.write(name, UniformType::Float4, bytemuck::bytes_of(&value))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> RenderResult<()> {
        self.write(name, UniformType::Int, bytemuck::bytes_of(&value))
    }

    pub fn set_mat3(&mut self, name: &str, value: &Mat3) -> RenderResult<()> {
        let padded = [
            value.x_axis.extend(0.0),
            value.y_axis.extend(0.0),
            value.z_axis.extend(0.0),
        ];
        self.write(name, UniformType::Mat3, bytemuck::cast_slice(&padded))
    }

    pub fn set_mat4(&mut self, name: &str, value: &Mat4) -> RenderResult<()> {
        self.write(name, UniformType::Mat4, bytemuck::bytes_of(value))
    }

    /// Write `values` into a `float[n]` array, one element per 16 byte slot
    pub fn set_float_array(&mut self, name: &str, values: &[f32]) -> RenderResult<()> {
        let entry = self
            .layout
            .entry(name)
            .ok_or_else(|| RenderError::UniformNotFound(name.to_string()))?
            .clone();
        if entry.ty != UniformType::Float || entry.count == 0 {
            return Err(RenderError::UniformTypeMismatch {
                name: name.to_string(),
                expected: "float[]",
                actual: entry.ty.name(),
            });
        }
        for (i, value) in values.iter().take(entry.count as usize).enumerate() {
            let at = (entry.offset + i as u32 * entry.stride()) as usize;
            self.data[at..at + 4].copy_from_slice(bytemuck::bytes_of(value));
        }
        self.dirty = true;
        Ok(())
    }

    pub fn get_float(&self, name: &str) -> RenderResult<f32> {
        Ok(bytemuck::pod_read_unaligned(self.read(name, UniformType::Float)?))
    }

    pub fn get_vec3(&self, name: &str) -> RenderResult<Vec3> {
        Ok(bytemuck::pod_read_unaligned(self.read(name, UniformType::Float3)?))
    }

    pub fn get_vec4(&self, name: &str) -> RenderResult<Vec4> {
        let bytes = self.read(name, UniformType::Float4)?;
        let v: [f32; 4] = bytemuck::pod_read_unaligned(bytes);
        Ok(Vec4::from_array(v))
    }

    pub fn get_int(&self, name: &str) -> RenderResult<i32> {
        Ok(bytemuck::pod_read_unaligned(self.read(name, UniformType::Int)?))
    }

    pub fn get_mat4(&self, name: &str) -> RenderResult<Mat4> {
        let bytes = self.read(name, UniformType::Mat4)?;
        let cols: [f32; 16] = bytemuck::pod_read_unaligned(bytes);
        Ok(Mat4::from_cols_array(&cols))
    }

    /// Bytes laid out as `layout` expects, copying every field by name.
    /// Fails when this block lacks a field or declares it with another type.
    pub fn pack_for(&self, layout: &UniformLayout) -> RenderResult<Vec<u8>> {
        if layout.descriptor() == self.layout.descriptor() {
            return Ok(self.data.clone());
        }
        let mut out = vec![0; layout.size() as usize];
        for entry in layout.entries() {
            let own = self
                .layout
                .entry(&entry.name)
                .ok_or_else(|| RenderError::UniformNotFound(entry.name.clone()))?;
            if own.ty != entry.ty || own.count != entry.count {
                return Err(RenderError::UniformTypeMismatch {
                    name: entry.name.clone(),
                    expected: entry.ty.name(),
                    actual: own.ty.name(),
                });
            }
            let len = entry.byte_size() as usize;
            let (src, dst) = (own.offset as usize, entry.offset as usize);
            out[dst..dst + len].copy_from_slice(&self.data[src..src + len]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_for_remaps_by_name() {
        let mut block = UniformBlock::new("float shininess; float4 u_color").unwrap();
        block.set_vec4("u_color", Vec4::new(0.25, 0.5, 0.75, 1.0)).unwrap();
        let shader_layout = UniformLayout::parse("float4 u_color").unwrap();
        let bytes = block.pack_for(&shader_layout).unwrap();
        assert_eq!(bytes.len(), 16);
        let color: [f32; 4] = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(color, [0.25, 0.5, 0.75, 1.0]);

        let missing = UniformLayout::parse("mat4 projMatrix").unwrap();
        assert!(matches!(block.pack_for(&missing), Err(RenderError::UniformNotFound(_))));
    }

    #[test]
    fn offsets_follow_uniform_alignment() {
        let layout = UniformLayout::parse("float4 u_color; mat4 projMatrix; float shadow_map_index").unwrap();
        assert_eq!(layout.entry("u_color").unwrap().offset, 0);
        assert_eq!(layout.entry("projMatrix").unwrap().offset, 16);
        assert_eq!(layout.entry("shadow_map_index").unwrap().offset, 80);
        assert_eq!(layout.size(), 96);
    }

    #[test]
    fn scalars_pack_before_vectors_realign() {
        let layout = UniformLayout::parse("float a; float b; float3 dir; int flags").unwrap();
        assert_eq!(layout.entry("b").unwrap().offset, 4);
        assert_eq!(layout.entry("dir").unwrap().offset, 16);
        assert_eq!(layout.entry("flags").unwrap().offset, 28);
        assert_eq!(layout.size(), 32);
    }

    #[test]
    fn arrays_use_vec4_stride() {
        let layout = UniformLayout::parse("float weights[3]; mat3 basis").unwrap();
        let weights = layout.entry("weights").unwrap();
        assert_eq!(weights.count, 3);
        assert_eq!(weights.byte_size(), 48);
        assert_eq!(layout.entry("basis").unwrap().offset, 48);
        assert!(layout.wgsl_struct("U").contains("weights: array<vec4<f32>, 3>,"));
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        assert!(UniformLayout::parse("float4").is_err());
        assert!(UniformLayout::parse("double x").is_err());
        assert!(UniformLayout::parse("float x; float x").is_err());
        assert!(UniformLayout::parse("float x[0]").is_err());
    }

    #[test]
    fn typed_access() {
        let mut block = UniformBlock::new("float4 color; int mode; mat4 m").unwrap();
        block.clear_dirty();
        block.set_vec4("color", Vec4::new(1.0, 0.5, 0.25, 1.0)).unwrap();
        assert!(block.is_dirty());
        assert_eq!(block.get_vec4("color").unwrap(), Vec4::new(1.0, 0.5, 0.25, 1.0));

        block.set_int("mode", 7).unwrap();
        assert_eq!(block.get_int("mode").unwrap(), 7);

        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        block.set_mat4("m", &m).unwrap();
        assert_eq!(block.get_mat4("m").unwrap(), m);
    }

    #[test]
    fn missing_and_mistyped_keys() {
        let mut block = UniformBlock::new("float4 color").unwrap();
        assert!(!block.has_uniform("intensity"));
        assert!(matches!(
            block.set_float("intensity", 1.0),
            Err(RenderError::UniformNotFound(_))
        ));
        assert!(matches!(
            block.set_float("color", 1.0),
            Err(RenderError::UniformTypeMismatch { .. })
        ));
    }
}
