//! Resource management
//!
//! Meshes, textures, materials and the uniform storage they share with lights.

mod material;
mod mesh;
mod texture;
mod uniform;

pub use material::*;
pub use mesh::*;
pub use texture::*;
pub use uniform::*;
