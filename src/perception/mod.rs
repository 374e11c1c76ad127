pub mod encode;
pub mod overlay;
pub mod screenshot;
pub mod types;
