pub mod render;
pub mod settings;
pub mod vr;

pub use render::{CameraPersp, EyeCamera, StereoRenderTarget, StereoRenderer, Window, WindowRef};
pub use settings::{HeadsetSettings, SettingsError};
pub use vr::{Eye, HeadsetSession, RuntimeSession, ScopedStereoBind, VrError, VrResult};
