//! WGSL sources of the built-in shaders
//!
//! Every module is assembled as `PRELUDE` + material block + optional light
//! block + body. Bind groups: 0 transform, 1 material, 2 lights.

/// Transform uniform, vertex input and the shared vertex transform
pub const PRELUDE: &str = r#"
struct Transform {
    model: mat4x4<f32>,
    view: mat4x4<f32>,
    proj: mat4x4<f32>,
    model_view: mat4x4<f32>,
    mvp: mat4x4<f32>,
    normal_matrix: mat4x4<f32>,
    view_inverse: mat4x4<f32>,
    eye: vec4<f32>,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) view_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

@group(0) @binding(0) var<uniform> transform: Transform;

fn transform_vertex(input: VertexInput) -> VertexOutput {
    var output: VertexOutput;
    let world_pos = transform.model * vec4<f32>(input.position, 1.0);
    output.world_position = world_pos.xyz;
    output.clip_position = transform.mvp * vec4<f32>(input.position, 1.0);
    output.view_normal = normalize((transform.normal_matrix * vec4<f32>(input.normal, 0.0)).xyz);
    output.uv = input.uv;
    return output;
}
"#;

/// Shadow map bindings appended after the generated light block
pub const SHADOW_BINDINGS: &str = r#"
@group(2) @binding(1) var u_shadow_maps: texture_2d_array<f32>;
@group(2) @binding(2) var u_shadow_sampler: sampler;

// depth packed into the three 10 bit channels of an RGB10A2 layer
fn unpack_depth(packed: vec4<f32>) -> f32 {
    return packed.r + packed.g / 1023.0 + packed.b / (1023.0 * 1023.0);
}
"#;

pub const UNLIT_COLOR: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return material.u_color;
}
"#;

pub const TEXTURE: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(u_texture, u_sampler, input.uv) * material.u_color;
}
"#;

pub const DEPTH: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let scaled = input.clip_position.z * 1023.0;
    let mid = fract(scaled) * 1023.0;
    return vec4<f32>(floor(scaled) / 1023.0, floor(mid) / 1023.0, fract(mid), 1.0);
}
"#;

/// Occlusion proxy: color writes are masked off in the pipeline
pub const BOUNDING_BOX: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 1.0, 1.0, 1.0);
}
"#;

pub const ERROR: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 1.0, 1.0);
}
"#;
