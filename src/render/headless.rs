use crate::render::{CloseHook, DrawHook, DrawHookSlots, RenderResult, StereoRenderer, Window};
use crate::vr::{SurfaceHandle, Viewport};
use glam::{Mat4, UVec2};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Renderer without a GPU. Records the graphics state it is handed so the
/// pipeline can run and be observed without a display.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    hooks: DrawHookSlots,
    context_activations: Cell<u32>,
    surface_stack: RefCell<Vec<(SurfaceHandle, SurfaceHandle)>>,
    bind_history: RefCell<Vec<SurfaceHandle>>,
    clears: Cell<u32>,
    viewport: Cell<Option<Viewport>>,
    model: Cell<Mat4>,
    view: Cell<Mat4>,
    projection: Cell<Mat4>,
    blits: RefCell<Vec<(SurfaceHandle, UVec2)>>,
    released: RefCell<Vec<SurfaceHandle>>,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(&self) -> &DrawHookSlots {
        &self.hooks
    }

    pub fn context_activations(&self) -> u32 {
        self.context_activations.get()
    }

    /// Colour and depth surfaces currently receiving draws.
    pub fn bound_surface(&self) -> Option<(SurfaceHandle, SurfaceHandle)> {
        self.surface_stack.borrow().last().copied()
    }

    pub fn bind_history(&self) -> Vec<SurfaceHandle> {
        self.bind_history.borrow().clone()
    }

    pub fn clear_count(&self) -> u32 {
        self.clears.get()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport.get()
    }

    pub fn model_matrix(&self) -> Mat4 {
        self.model.get()
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view.get()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.get()
    }

    pub fn blits(&self) -> Vec<(SurfaceHandle, UVec2)> {
        self.blits.borrow().clone()
    }

    pub fn released_surfaces(&self) -> Vec<SurfaceHandle> {
        self.released.borrow().clone()
    }
}

impl StereoRenderer for HeadlessRenderer {
    fn label(&self) -> &'static str {
        "Headless Renderer"
    }

    fn make_current_context(&self) {
        self.context_activations
            .set(self.context_activations.get() + 1);
    }

    fn set_start_draw_hook(&self, hook: Option<DrawHook>) {
        self.hooks.set_start(hook);
    }

    fn set_finish_draw_hook(&self, hook: Option<DrawHook>) {
        self.hooks.set_finish(hook);
    }

    fn set_render_surface(&self, color: SurfaceHandle, depth: SurfaceHandle) -> RenderResult<()> {
        self.surface_stack.borrow_mut().push((color, depth));
        self.bind_history.borrow_mut().push(color);
        self.clears.set(self.clears.get() + 1);
        Ok(())
    }

    fn unset_render_surface(&self) {
        if self.surface_stack.borrow_mut().pop().is_none() {
            log::warn!("[render] render surface unset while none was bound");
        }
    }

    fn release_surface(&self, surface: SurfaceHandle) {
        self.released.borrow_mut().push(surface);
    }

    fn set_viewport(&self, viewport: Viewport) {
        self.viewport.set(Some(viewport));
    }

    fn set_model_matrix(&self, matrix: Mat4) {
        self.model.set(matrix);
    }

    fn set_view_matrix(&self, matrix: Mat4) {
        self.view.set(matrix);
    }

    fn set_projection_matrix(&self, matrix: Mat4) {
        self.projection.set(matrix);
    }

    fn blit_to_window(&self, source: SurfaceHandle, window_size: UVec2) -> RenderResult<()> {
        self.blits.borrow_mut().push((source, window_size));
        Ok(())
    }
}

/// Window driven by hand: each [`HeadlessWindow::draw_frame`] call is one
/// iteration of a render loop.
pub struct HeadlessWindow {
    size: Cell<UVec2>,
    valid: Cell<bool>,
    renderer: Option<Rc<HeadlessRenderer>>,
    close_hooks: RefCell<Vec<CloseHook>>,
}

impl HeadlessWindow {
    pub fn new(size: UVec2) -> Rc<Self> {
        Rc::new(Self {
            size: Cell::new(size),
            valid: Cell::new(true),
            renderer: Some(Rc::new(HeadlessRenderer::new())),
            close_hooks: RefCell::new(Vec::new()),
        })
    }

    /// A window whose renderer cannot host stereo draw hooks.
    pub fn without_stereo_renderer(size: UVec2) -> Rc<Self> {
        Rc::new(Self {
            size: Cell::new(size),
            valid: Cell::new(true),
            renderer: None,
            close_hooks: RefCell::new(Vec::new()),
        })
    }

    pub fn renderer(&self) -> Option<Rc<HeadlessRenderer>> {
        self.renderer.clone()
    }

    pub fn resize(&self, size: UVec2) {
        self.size.set(size);
    }

    /// Runs the start hook, `draw` and the finish hook in that order. Returns
    /// false without drawing once the window is closed or when it has no
    /// stereo renderer.
    pub fn draw_frame(&self, draw: impl FnOnce(&dyn StereoRenderer)) -> bool {
        if !self.valid.get() {
            return false;
        }
        let Some(renderer) = self.renderer.clone() else {
            return false;
        };

        let stereo: &dyn StereoRenderer = &*renderer;
        stereo.make_current_context();
        renderer.hooks().run_start(stereo);
        draw(stereo);
        renderer.hooks().run_finish(stereo);
        true
    }

    /// Invalidates the window and runs every close hook once.
    pub fn close(&self) {
        if !self.valid.replace(false) {
            return;
        }
        log::info!("[render] headless window closed");
        let hooks = std::mem::take(&mut *self.close_hooks.borrow_mut());
        for hook in hooks {
            hook();
        }
    }

    pub fn close_hook_count(&self) -> usize {
        self.close_hooks.borrow().len()
    }
}

impl Window for HeadlessWindow {
    fn label(&self) -> &'static str {
        "Headless Window"
    }

    fn is_valid(&self) -> bool {
        self.valid.get()
    }

    fn size(&self) -> UVec2 {
        self.size.get()
    }

    fn stereo_renderer(&self) -> Option<Rc<dyn StereoRenderer>> {
        self.renderer
            .clone()
            .map(|renderer| renderer as Rc<dyn StereoRenderer>)
    }

    fn connect_close(&self, hook: CloseHook) {
        self.close_hooks.borrow_mut().push(hook);
    }
}
