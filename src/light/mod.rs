//! Lights and shadows

mod light;
mod light_list;
mod shadow_map;

pub use light::*;
pub use light_list::*;
pub use shadow_map::*;
