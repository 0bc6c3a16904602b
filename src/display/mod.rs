pub mod gpu;
pub mod quad;
pub mod render;
pub mod surface;

pub use gpu::WgpuRenderer;
pub use quad::Quad;
pub use render::{ClearColor, DrawOutcome, RenderBackend, RenderHandle, RenderLoop, RenderOptions};
pub use surface::{PresentationTarget, TextureId};
