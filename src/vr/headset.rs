use crate::render::camera::{CameraPersp, EyeCamera};
use crate::render::target::StereoRenderTarget;
use crate::render::{StereoRenderer, Window, WindowRef};
use crate::settings::{HeadsetSettings, check_positive};
use crate::vr::device::Device;
use crate::vr::runtime::check;
use crate::vr::{
    Eye, EyeRenderDesc, FrameSubmission, HmdCaps, LayerEyeFov, Pose, RuntimeSession,
    SubmitStatus, ViewScaleDesc, Viewport, VrError, VrResult,
};
use glam::{Mat4, UVec2, Vec3};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;

const LATENCY_KEY: &str = "DK2Latency";

/// Drives one headset through the per-frame stereo cycle: pose prediction in
/// the start hook, per-eye camera activation while the scene draws, and frame
/// submission in the finish hook.
///
/// Sessions are shared as `Rc<RefCell<HeadsetSession>>` so the hooks
/// registered on the window's renderer can reach them.
pub struct HeadsetSession {
    // Declared before `device` so swap sets and mirrors are released while
    // the device handle is still live.
    render_target: Option<StereoRenderTarget>,
    device: Option<Device>,
    window: Option<WindowRef>,
    renderer: Option<Rc<dyn StereoRenderer>>,
    attach_generation: u64,
    host_camera: CameraPersp,
    eye_cameras: [EyeCamera; 2],
    current_eye: Eye,
    eye_render_desc: [EyeRenderDesc; 2],
    eye_view_offset: [Vec3; 2],
    eye_render_pose: [Pose; 2],
    layer: LayerEyeFov,
    frame_index: u64,
    settings: HeadsetSettings,
    settings_changed: bool,
    tracking_changed: bool,
    view: Cell<Option<Mat4>>,
    inverse_view: Cell<Option<Mat4>>,
    last_submit: Option<SubmitStatus>,
}

impl HeadsetSession {
    /// Acquires a headset from `session` with default settings. Without any
    /// device, physical or debug, the session stays usable but never attaches.
    pub fn new(session: Arc<RuntimeSession>) -> Self {
        Self::build(session, HeadsetSettings::default())
    }

    pub fn with_settings(session: Arc<RuntimeSession>, settings: HeadsetSettings) -> VrResult<Self> {
        settings.validate()?;
        Ok(Self::build(session, settings))
    }

    fn build(session: Arc<RuntimeSession>, settings: HeadsetSettings) -> Self {
        let mut device = check(
            "acquire headset",
            Device::acquire(session, settings.hmd_caps()),
        );
        if let Some(device) = device.as_mut() {
            device.set_positional_tracking(settings.positional_tracking);
        }

        let eye_render_desc = match device.as_ref() {
            Some(device) => Eye::both().map(|eye| device.render_desc(eye)),
            None => Eye::both().map(EyeRenderDesc::new),
        };
        let eye_cameras = Eye::both().map(|eye| {
            let mut camera = EyeCamera::new(eye);
            camera.set_fov(eye_render_desc[eye.index()].fov);
            camera
        });
        let layer = LayerEyeFov::side_by_side(
            UVec2::ZERO,
            eye_render_desc.map(|desc| desc.fov),
            settings.layer_flags(),
        );

        let mut host_camera = CameraPersp::default();
        host_camera.set_eye_point(Vec3::ZERO);
        host_camera.set_view_direction(Vec3::Z);

        Self {
            render_target: device.as_ref().map(StereoRenderTarget::new),
            device,
            window: None,
            renderer: None,
            attach_generation: 0,
            host_camera,
            eye_cameras,
            current_eye: Eye::Left,
            eye_render_desc,
            eye_view_offset: eye_render_desc.map(|desc| desc.hmd_to_eye_view_offset),
            eye_render_pose: [Pose::IDENTITY; 2],
            layer,
            frame_index: 0,
            settings,
            settings_changed: true,
            tracking_changed: false,
            view: Cell::new(None),
            inverse_view: Cell::new(None),
            last_submit: None,
        }
    }

    /// Hooks the session into `window`'s render loop.
    ///
    /// Returns `Ok(false)` without touching any state when there is no
    /// device or the window is no longer valid, and
    /// [`VrError::UnsupportedRenderer`] when the window's renderer cannot host
    /// stereo draw hooks.
    ///
    /// # Panics
    ///
    /// Panics if the session is already borrowed.
    pub fn attach(this: &Rc<RefCell<Self>>, window: WindowRef) -> VrResult<bool> {
        let mut headset = this.borrow_mut();
        if headset.device.is_none() {
            log::warn!("[headset] attach skipped: no headset device");
            return Ok(false);
        }
        if !window.is_valid() {
            log::warn!("[headset] attach skipped: {} is not valid", window.label());
            return Ok(false);
        }
        let Some(renderer) = window.stereo_renderer() else {
            log::error!(
                "[headset] {} has no renderer that accepts stereo draw hooks",
                window.label()
            );
            return Err(VrError::UnsupportedRenderer);
        };

        headset.ensure_target_size()?;
        headset.detach();
        headset.apply_hmd_settings();

        let start = Rc::downgrade(this);
        renderer.set_start_draw_hook(Some(Rc::new(move |renderer: &dyn StereoRenderer| {
            with_session(&start, "start frame", |headset| headset.start_frame(renderer));
        })));
        let finish = Rc::downgrade(this);
        renderer.set_finish_draw_hook(Some(Rc::new(move |renderer: &dyn StereoRenderer| {
            with_session(&finish, "finish frame", |headset| headset.finish_frame(renderer));
        })));

        headset.attach_generation += 1;
        let generation = headset.attach_generation;
        let closing = Rc::downgrade(this);
        window.connect_close(Rc::new(move || {
            with_session(&closing, "window close", |headset| {
                if headset.attach_generation == generation {
                    headset.handle_window_closed();
                }
            });
        }));

        headset.apply_tracking();
        log::info!(
            "[headset] attached to {} using {}",
            window.label(),
            renderer.label()
        );
        headset.window = Some(window);
        headset.renderer = Some(renderer);
        Ok(true)
    }

    /// Removes the draw hooks and releases the window. Safe to call when
    /// already detached.
    pub fn detach(&mut self) {
        self.window = None;
        let Some(renderer) = self.renderer.take() else {
            return;
        };
        renderer.set_start_draw_hook(None);
        renderer.set_finish_draw_hook(None);
        if let Some(target) = self.render_target.as_mut() {
            target.release_retired(&*renderer);
        }
        self.attach_generation += 1;
        log::info!("[headset] detached from window");
    }

    fn handle_window_closed(&mut self) {
        if let Some(target) = self.render_target.as_mut() {
            target.release();
        }
        self.detach();
        log::info!("[headset] window closed, stereo target released");
    }

    /// True while hooked into a window that is still open.
    pub fn is_attached(&self) -> bool {
        self.window.as_ref().is_some_and(|window| window.is_valid())
    }

    /// Detaches from a window that closed without its close hook reaching
    /// the session. Returns whether the session is still attached.
    fn drop_closed_window(&mut self) -> bool {
        match self.window.as_ref() {
            Some(window) if !window.is_valid() => {
                log::warn!("[headset] {} closed while the session was busy", window.label());
                self.handle_window_closed();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn has_window(&self, window: &WindowRef) -> bool {
        self.window
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, window))
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn render_target(&self) -> Option<&StereoRenderTarget> {
        self.render_target.as_ref()
    }

    pub fn settings(&self) -> &HeadsetSettings {
        &self.settings
    }

    /// Combined side-by-side target size for the current screen percentage.
    pub fn required_target_size(&self) -> Option<UVec2> {
        self.device
            .as_ref()
            .map(|device| device.stereo_target_size(self.settings.screen_percentage))
    }

    fn ensure_target_size(&mut self) -> VrResult<bool> {
        let (Some(device), Some(target)) = (self.device.as_ref(), self.render_target.as_mut())
        else {
            return Ok(false);
        };

        let size = device.stereo_target_size(self.settings.screen_percentage);
        let resized = target.ensure_size(size)?;
        if resized {
            let render_pose = self.layer.render_pose;
            self.layer = LayerEyeFov::side_by_side(
                size,
                self.eye_render_desc.map(|desc| desc.fov),
                self.settings.layer_flags(),
            );
            self.layer.render_pose = render_pose;
        }
        Ok(resized)
    }

    fn apply_hmd_settings(&mut self) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let mut caps = device.caps();
        caps.set(HmdCaps::NO_MIRROR_TO_WINDOW, !self.settings.mirrored);
        device.set_caps(caps);
        device.apply_caps();
        self.settings_changed = false;
    }

    fn apply_tracking(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        check("configure tracking", device.configure_tracking());
        self.tracking_changed = false;
    }

    fn ensure_mirror(&mut self) {
        let (Some(device), Some(target)) = (self.device.as_ref(), self.render_target.as_mut())
        else {
            return;
        };

        if self.settings.mirrored {
            let size = (device.resolution().as_vec2() * self.settings.mirror_percentage)
                .as_uvec2()
                .max(UVec2::ONE);
            check("allocate mirror texture", target.ensure_mirror(size));
        } else {
            target.release_mirror();
        }
    }

    /// Start-of-frame work run by the renderer's start hook.
    pub fn start_frame(&mut self, renderer: &dyn StereoRenderer) {
        renderer.make_current_context();
        if self.device.is_none() || !self.drop_closed_window() {
            return;
        }

        check("resize stereo target", self.ensure_target_size());
        if self.settings_changed {
            self.apply_hmd_settings();
        }
        if self.tracking_changed {
            self.apply_tracking();
        }

        self.eye_view_offset = if self.settings.monoscopic {
            [Vec3::ZERO; 2]
        } else {
            self.eye_render_desc.map(|desc| desc.hmd_to_eye_view_offset)
        };

        let Some(device) = self.device.as_ref() else {
            return;
        };
        let runtime = device.runtime();
        let timing = runtime.frame_timing(device.handle(), self.frame_index);
        let tracking = device.tracking_state(timing.display_midpoint_seconds);
        self.eye_render_pose = runtime.calc_eye_poses(tracking.head_pose, &self.eye_view_offset);
        self.layer.render_pose = self.eye_render_pose;

        self.ensure_mirror();
        if let Some(target) = self.render_target.as_mut() {
            target.release_retired(renderer);
        }
        self.invalidate_view();
    }

    /// End-of-frame work run by the renderer's finish hook: submits the
    /// layer and mirrors the composed frame to the window.
    pub fn finish_frame(&mut self, renderer: &dyn StereoRenderer) {
        if !self.is_attached() {
            return;
        }
        let (Some(device), Some(target)) = (self.device.as_ref(), self.render_target.as_ref())
        else {
            return;
        };
        let Some(color_texture) = target.swap_set() else {
            log::warn!("[headset] frame {} not submitted: no stereo target", self.frame_index);
            return;
        };

        let submission = FrameSubmission {
            frame_index: self.frame_index,
            layer: &self.layer,
            color_texture,
            view_scale: ViewScaleDesc {
                hmd_space_to_world_scale_in_meters: 1.0,
                hmd_to_eye_view_offset: self.eye_view_offset,
            },
        };
        let status = check(
            "submit frame",
            device.runtime().submit_frame(device.handle(), &submission),
        );
        if status == Some(SubmitStatus::NotVisible) {
            log::debug!("[headset] frame {} is not visible on the headset", self.frame_index);
        }

        if self.settings.mirrored {
            if let (Some(mirror), Some(window)) = (target.mirror(), self.window.as_ref()) {
                if let Err(err) = renderer.blit_to_window(mirror.surface, window.size()) {
                    log::error!("[render] mirror blit failed: {err}");
                }
            }
        }

        self.last_submit = status;
        self.frame_index += 1;
    }

    /// Binds the stereo target on the attached renderer.
    pub fn bind(&mut self) {
        let (Some(target), Some(renderer)) = (self.render_target.as_mut(), self.renderer.as_ref())
        else {
            return;
        };
        if let Err(err) = target.bind(&**renderer) {
            log::error!("[render] failed to bind stereo target: {err}");
        }
    }

    pub fn unbind(&mut self) {
        let (Some(target), Some(renderer)) = (self.render_target.as_mut(), self.renderer.as_ref())
        else {
            return;
        };
        target.unbind(&**renderer);
    }

    /// Eyes in the device's preferred render order, or none when there is no
    /// device or no attached window.
    pub fn eyes(&self) -> Vec<Eye> {
        match self.device.as_ref() {
            Some(device) if self.is_attached() => device.eye_render_order().to_vec(),
            _ => Vec::new(),
        }
    }

    /// Makes the `index`-th eye in render order current. With `apply`, the
    /// eye's viewport and matrices are pushed to the attached renderer.
    pub fn enable_eye(&mut self, index: usize, apply: bool) -> VrResult<Eye> {
        if index >= Eye::COUNT {
            return Err(VrError::EyeIndex(index));
        }
        let device = self.device.as_ref().ok_or(VrError::NoDevice)?;
        let eye = device.eye_render_order()[index];

        self.invalidate_view();
        self.current_eye = eye;
        let near_clip = self.host_camera.near_clip();
        let far_clip = self.host_camera.far_clip();
        let camera = &mut self.eye_cameras[eye.index()];
        camera.set_pose(self.eye_render_pose[eye.index()]);
        camera.set_fov(self.eye_render_desc[eye.index()].fov);
        camera.set_clip_planes(near_clip, far_clip);

        if apply {
            if let Some(renderer) = self.renderer.clone() {
                renderer.set_viewport(self.eye_viewport());
                renderer.set_model_matrix(Mat4::IDENTITY);
                renderer.set_view_matrix(self.view_matrix());
                renderer.set_projection_matrix(self.projection_matrix());
            }
        }
        Ok(eye)
    }

    pub fn current_eye(&self) -> Eye {
        self.current_eye
    }

    pub fn eye_camera(&self, eye: Eye) -> &EyeCamera {
        &self.eye_cameras[eye.index()]
    }

    pub fn eye_viewport(&self) -> Viewport {
        self.layer.viewport[self.current_eye.index()]
    }

    pub fn frame_layer(&self) -> &LayerEyeFov {
        &self.layer
    }

    pub fn eye_view_offsets(&self) -> [Vec3; 2] {
        self.eye_view_offset
    }

    pub fn eye_render_poses(&self) -> [Pose; 2] {
        self.eye_render_pose
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn last_submit_status(&self) -> Option<SubmitStatus> {
        self.last_submit
    }

    /// World-to-eye transform of the current eye, cached until the next
    /// [`HeadsetSession::enable_eye`] or configuration change.
    pub fn view_matrix(&self) -> Mat4 {
        if let Some(view) = self.view.get() {
            return view;
        }

        let camera = &self.eye_cameras[self.current_eye.index()];
        let host_orientation = self.host_camera.orientation();
        let orientation = host_orientation * camera.orientation();
        let up = orientation * Vec3::Y;
        let forward = orientation * Vec3::NEG_Z;

        let mut eye_point = self.host_camera.eye_point();
        if self.is_tracked() {
            eye_point += host_orientation * camera.position();
        }

        let view = Mat4::look_at_rh(eye_point, eye_point + forward, up)
            * Mat4::from_scale(Vec3::splat(1.0 / self.settings.head_scale));
        self.view.set(Some(view));
        view
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        if let Some(inverse) = self.inverse_view.get() {
            return inverse;
        }
        let inverse = self.view_matrix().inverse();
        self.inverse_view.set(Some(inverse));
        inverse
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.eye_cameras[self.current_eye.index()].projection_matrix()
    }

    fn invalidate_view(&self) {
        self.view.set(None);
        self.inverse_view.set(None);
    }

    pub fn host_camera(&self) -> &CameraPersp {
        &self.host_camera
    }

    pub fn set_host_camera(&mut self, camera: CameraPersp) {
        self.host_camera = camera;
        self.invalidate_view();
    }

    pub fn head_scale(&self) -> f32 {
        self.settings.head_scale
    }

    pub fn set_head_scale(&mut self, scale: f32) -> VrResult<()> {
        self.settings.head_scale = reject_non_positive("head scale", scale)?;
        self.invalidate_view();
        Ok(())
    }

    pub fn screen_percentage(&self) -> f32 {
        self.settings.screen_percentage
    }

    /// Resolution scale of the stereo target. The target is resized at the
    /// start of the next frame.
    pub fn set_screen_percentage(&mut self, percentage: f32) -> VrResult<()> {
        self.settings.screen_percentage = reject_non_positive("screen percentage", percentage)?;
        Ok(())
    }

    pub fn mirror_percentage(&self) -> f32 {
        self.settings.mirror_percentage
    }

    pub fn set_mirror_percentage(&mut self, percentage: f32) -> VrResult<()> {
        self.settings.mirror_percentage = reject_non_positive("mirror percentage", percentage)?;
        Ok(())
    }

    pub fn is_mirrored(&self) -> bool {
        self.settings.mirrored
    }

    pub fn enable_mirrored(&mut self, enabled: bool) {
        if self.settings.mirrored != enabled {
            self.settings.mirrored = enabled;
            self.settings_changed = true;
        }
    }

    pub fn is_monoscopic(&self) -> bool {
        self.settings.monoscopic
    }

    /// Collapses both eyes onto one viewpoint from the next frame on.
    pub fn enable_monoscopic(&mut self, enabled: bool) {
        self.settings.monoscopic = enabled;
    }

    pub fn is_positional_tracking_enabled(&self) -> bool {
        self.settings.positional_tracking
    }

    pub fn enable_positional_tracking(&mut self, enabled: bool) {
        if self.settings.positional_tracking == enabled {
            return;
        }
        self.settings.positional_tracking = enabled;
        if let Some(device) = self.device.as_mut() {
            device.set_positional_tracking(enabled);
        }
        self.tracking_changed = true;
        self.invalidate_view();
    }

    /// True when positional tracking is enabled and the device reports the
    /// tracking camera connected and following the headset.
    pub fn is_tracked(&self) -> bool {
        self.settings.positional_tracking
            && self
                .device
                .as_ref()
                .is_some_and(|device| device.tracking_state_now().is_position_tracked())
    }

    pub fn recenter_pose(&self) {
        if let Some(device) = self.device.as_ref() {
            device.runtime().recenter_pose(device.handle());
        }
    }

    pub fn is_desktop_extended(&self) -> bool {
        self.device.as_ref().is_some_and(Device::is_desktop_extended)
    }

    pub fn native_window_resolution(&self) -> Option<UVec2> {
        self.device.as_ref().map(Device::resolution)
    }

    /// Frustum of the positional tracking camera, posed at the current eye's
    /// render pose. `None` unless tracked.
    pub fn positional_tracking_camera(&self) -> Option<CameraPersp> {
        if !self.is_tracked() {
            return None;
        }
        let frustum = self.device.as_ref()?.info().camera_frustum;
        let aspect_ratio =
            ((0.5 * frustum.h_fov_radians).tan() / (0.5 * frustum.v_fov_radians).tan()).abs();

        let mut camera = CameraPersp::new(
            frustum.v_fov_radians.to_degrees(),
            aspect_ratio,
            frustum.near_z_meters.abs(),
            frustum.far_z_meters.abs(),
        );
        let pose = self.eye_render_pose[self.current_eye.index()];
        camera.set_orientation(pose.orientation);
        camera.set_eye_point(pose.position);
        Some(camera)
    }

    /// Display pipeline latencies in milliseconds, zero when the runtime
    /// does not report them.
    pub fn latencies(&self) -> Vec3 {
        let Some(device) = self.device.as_ref() else {
            return Vec3::ZERO;
        };
        let mut latencies = [0.0f32; 3];
        if device
            .runtime()
            .float_array(device.handle(), LATENCY_KEY, &mut latencies)
            == latencies.len()
        {
            Vec3::from_array(latencies) * 1000.0
        } else {
            Vec3::ZERO
        }
    }
}

fn reject_non_positive(setting: &'static str, value: f32) -> VrResult<f32> {
    check_positive(setting, value).inspect_err(|err| log::error!("[headset] {err}"))
}

fn with_session(
    session: &Weak<RefCell<HeadsetSession>>,
    context: &str,
    run: impl FnOnce(&mut HeadsetSession),
) {
    let Some(session) = session.upgrade() else {
        return;
    };
    match session.try_borrow_mut() {
        Ok(mut headset) => run(&mut headset),
        Err(_) => log::warn!("[headset] {context} skipped: session is already borrowed"),
    };
}

impl fmt::Debug for HeadsetSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadsetSession")
            .field("device", &self.device)
            .field("render_target", &self.render_target)
            .field("attached", &self.is_attached())
            .field("current_eye", &self.current_eye)
            .field("frame_index", &self.frame_index)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Drop for HeadsetSession {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Keeps the stereo target bound for as long as it lives.
pub struct ScopedStereoBind<'a> {
    headset: &'a mut HeadsetSession,
}

impl<'a> ScopedStereoBind<'a> {
    pub fn new(headset: &'a mut HeadsetSession) -> Self {
        headset.bind();
        Self { headset }
    }
}

impl Deref for ScopedStereoBind<'_> {
    type Target = HeadsetSession;

    fn deref(&self) -> &Self::Target {
        &*self.headset
    }
}

impl DerefMut for ScopedStereoBind<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.headset
    }
}

impl Drop for ScopedStereoBind<'_> {
    fn drop(&mut self) {
        self.headset.unbind();
    }
}
