//! Render targets

pub mod depth;

pub use depth::DepthTexture;
