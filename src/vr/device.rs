use crate::vr::{
    DeviceHandle, DeviceRuntime, Eye, EyeRenderDesc, HmdCaps, HmdInfo, HmdType, RuntimeSession,
    TrackingCaps, TrackingState, VrResult,
};
use glam::UVec2;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_HMD_CAPS: HmdCaps = HmdCaps::LOW_PERSISTENCE.union(HmdCaps::DYNAMIC_PREDICTION);

pub const DEFAULT_TRACKING_CAPS: TrackingCaps = TrackingCaps::ORIENTATION
    .union(TrackingCaps::MAG_YAW_CORRECTION)
    .union(TrackingCaps::POSITION);

/// Headset type created when no physical device is detected.
pub const FALLBACK_HMD_TYPE: HmdType = HmdType::Dk2;

/// One headset handle, physical or debug. Capability and tracking changes are
/// staged here and only reach the runtime through [`Device::apply_caps`] and
/// [`Device::configure_tracking`].
pub struct Device {
    session: Arc<RuntimeSession>,
    handle: DeviceHandle,
    info: HmdInfo,
    caps: HmdCaps,
    tracking_caps: TrackingCaps,
    is_debug: bool,
}

impl Device {
    /// Opens the first detected headset, or a debug headset when none is
    /// connected.
    pub fn acquire(session: Arc<RuntimeSession>, requested_caps: HmdCaps) -> VrResult<Self> {
        let runtime = session.runtime();
        let create_debug = || {
            log::warn!(
                "[vr] falling back to a debug {:?} headset",
                FALLBACK_HMD_TYPE
            );
            runtime.create_debug_device(FALLBACK_HMD_TYPE)
        };

        let (handle, caps, is_debug) = if runtime.detect() > 0 {
            match runtime.create_device(0) {
                Ok(handle) => {
                    let caps = runtime.enabled_caps(handle) | requested_caps;
                    runtime.set_enabled_caps(handle, caps);
                    (handle, caps, false)
                }
                Err(err) => {
                    log::error!("[vr] failed to open detected headset: {err}");
                    (create_debug()?, requested_caps, true)
                }
            }
        } else {
            log::error!("[vr] failed to create headset: none detected");
            (create_debug()?, requested_caps, true)
        };

        let info = match runtime.device_info(handle) {
            Ok(info) => info,
            Err(err) => {
                runtime.destroy_device(handle);
                return Err(err);
            }
        };

        log::info!(
            "[vr] acquired {} ({}x{}, debug: {is_debug})",
            info.product_name,
            info.resolution.x,
            info.resolution.y
        );

        Ok(Self {
            session,
            handle,
            info,
            caps,
            tracking_caps: DEFAULT_TRACKING_CAPS,
            is_debug,
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn info(&self) -> &HmdInfo {
        &self.info
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn session(&self) -> &Arc<RuntimeSession> {
        &self.session
    }

    pub fn runtime(&self) -> &dyn DeviceRuntime {
        self.session.runtime()
    }

    pub fn resolution(&self) -> UVec2 {
        self.info.resolution
    }

    pub fn eye_render_order(&self) -> [Eye; 2] {
        self.info.eye_render_order
    }

    pub fn caps(&self) -> HmdCaps {
        self.caps
    }

    /// Stages `caps`; they take effect on the next [`Device::apply_caps`].
    pub fn set_caps(&mut self, caps: HmdCaps) {
        self.caps = caps;
    }

    pub fn apply_caps(&self) {
        self.runtime().set_enabled_caps(self.handle, self.caps);
    }

    pub fn tracking_caps(&self) -> TrackingCaps {
        self.tracking_caps
    }

    pub fn set_positional_tracking(&mut self, enabled: bool) {
        self.tracking_caps.set(TrackingCaps::POSITION, enabled);
    }

    pub fn configure_tracking(&self) -> VrResult<()> {
        self.runtime()
            .configure_tracking(self.handle, self.tracking_caps, TrackingCaps::empty())
    }

    pub fn is_desktop_extended(&self) -> bool {
        self.runtime()
            .enabled_caps(self.handle)
            .contains(HmdCaps::EXTEND_DESKTOP)
    }

    pub fn tracking_state(&self, absolute_time_seconds: f64) -> TrackingState {
        self.runtime().tracking_state(self.handle, absolute_time_seconds)
    }

    pub fn tracking_state_now(&self) -> TrackingState {
        let runtime = self.runtime();
        runtime.tracking_state(self.handle, runtime.time_seconds())
    }

    pub fn render_desc(&self, eye: Eye) -> EyeRenderDesc {
        self.runtime()
            .render_desc(self.handle, eye, self.info.default_eye_fov[eye.index()])
    }

    pub fn recommended_texture_size(&self, eye: Eye, pixel_density: f32) -> UVec2 {
        self.runtime().fov_texture_size(
            self.handle,
            eye,
            self.info.default_eye_fov[eye.index()],
            pixel_density,
        )
    }

    /// Size of one target holding both eyes side by side.
    pub fn stereo_target_size(&self, pixel_density: f32) -> UVec2 {
        let left = self.recommended_texture_size(Eye::Left, pixel_density);
        let right = self.recommended_texture_size(Eye::Right, pixel_density);
        UVec2::new(left.x + right.x, left.y.max(right.y))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("product", &self.info.product_name)
            .field("caps", &self.caps)
            .field("tracking_caps", &self.tracking_caps)
            .field("is_debug", &self.is_debug)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.runtime().destroy_device(self.handle);
    }
}
