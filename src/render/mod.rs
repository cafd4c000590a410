pub mod camera;
pub mod headless;
pub mod target;
#[cfg(feature = "render-wgpu")]
pub mod wgpu_backend;

use crate::vr::{SurfaceHandle, VrError, Viewport};
use glam::{Mat4, UVec2};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub use camera::{CameraPersp, EyeCamera};
pub use headless::{HeadlessRenderer, HeadlessWindow};
pub use target::{DepthBuffer, StereoRenderTarget};
#[cfg(feature = "render-wgpu")]
pub use wgpu_backend::WgpuStereoRenderer;

/// Invoked by the renderer once per frame, before or after the scene draw.
pub type DrawHook = Rc<dyn Fn(&dyn StereoRenderer)>;

/// Invoked once when the window closes.
pub type CloseHook = Rc<dyn Fn()>;

pub type WindowRef = Rc<dyn Window>;

#[derive(Debug)]
pub enum RenderError {
    Vr(VrError),
    Backend(&'static str),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Vr(err) => write!(f, "vr runtime error: {err}"),
            RenderError::Backend(reason) => write!(f, "gpu backend failure: {reason}"),
        }
    }
}

impl std::error::Error for RenderError {}

impl From<VrError> for RenderError {
    fn from(value: VrError) -> Self {
        RenderError::Vr(value)
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Window owned by the host render framework.
pub trait Window {
    fn label(&self) -> &'static str;
    fn is_valid(&self) -> bool;
    fn size(&self) -> UVec2;

    /// The window's renderer, if it accepts stereo draw hooks.
    fn stereo_renderer(&self) -> Option<Rc<dyn StereoRenderer>>;

    fn connect_close(&self, hook: CloseHook);
}

/// Graphics state surface of a renderer that runs registered hooks around
/// every frame: the start hook before the scene draw, the finish hook after.
pub trait StereoRenderer {
    fn label(&self) -> &'static str;

    fn make_current_context(&self);

    fn set_start_draw_hook(&self, hook: Option<DrawHook>);
    fn set_finish_draw_hook(&self, hook: Option<DrawHook>);

    /// Redirects drawing into `color` and `depth` and clears both.
    fn set_render_surface(&self, color: SurfaceHandle, depth: SurfaceHandle) -> RenderResult<()>;

    /// Restores the destination that was active before the last
    /// [`StereoRenderer::set_render_surface`].
    fn unset_render_surface(&self);

    /// Drops any renderer-side storage backing `surface`. Called once the
    /// runtime has destroyed the surface.
    fn release_surface(&self, surface: SurfaceHandle);

    fn set_viewport(&self, viewport: Viewport);
    fn set_model_matrix(&self, matrix: Mat4);
    fn set_view_matrix(&self, matrix: Mat4);
    fn set_projection_matrix(&self, matrix: Mat4);

    fn blit_to_window(&self, source: SurfaceHandle, window_size: UVec2) -> RenderResult<()>;
}

/// Start and finish hook storage shared by renderer implementations. Hooks
/// are cloned out before they run so a hook may replace or clear itself.
#[derive(Default)]
pub struct DrawHookSlots {
    start: RefCell<Option<DrawHook>>,
    finish: RefCell<Option<DrawHook>>,
}

impl DrawHookSlots {
    pub fn set_start(&self, hook: Option<DrawHook>) {
        *self.start.borrow_mut() = hook;
    }

    pub fn set_finish(&self, hook: Option<DrawHook>) {
        *self.finish.borrow_mut() = hook;
    }

    pub fn has_start(&self) -> bool {
        self.start.borrow().is_some()
    }

    pub fn has_finish(&self) -> bool {
        self.finish.borrow().is_some()
    }

    pub fn run_start(&self, renderer: &dyn StereoRenderer) {
        let hook = self.start.borrow().clone();
        if let Some(hook) = hook {
            hook(renderer);
        }
    }

    pub fn run_finish(&self, renderer: &dyn StereoRenderer) {
        let hook = self.finish.borrow().clone();
        if let Some(hook) = hook {
            hook(renderer);
        }
    }
}

impl fmt::Debug for DrawHookSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrawHookSlots")
            .field("start", &self.has_start())
            .field("finish", &self.has_finish())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn hook_can_clear_itself_while_running() {
        let renderer = HeadlessRenderer::new();
        let slots = Rc::new(DrawHookSlots::default());
        let calls = Rc::new(Cell::new(0));

        let hook_slots = Rc::downgrade(&slots);
        let hook_calls = calls.clone();
        slots.set_start(Some(Rc::new(move |_renderer: &dyn StereoRenderer| {
            hook_calls.set(hook_calls.get() + 1);
            if let Some(slots) = hook_slots.upgrade() {
                slots.set_start(None);
            }
        })));

        slots.run_start(&renderer);
        slots.run_start(&renderer);

        assert_eq!(calls.get(), 1);
        assert!(!slots.has_start());
    }

    #[test]
    fn vr_errors_convert_into_render_errors() {
        let err: RenderError = VrError::NoDevice.into();
        assert!(matches!(err, RenderError::Vr(VrError::NoDevice)));
        assert!(err.to_string().contains("no headset"));
    }
}
