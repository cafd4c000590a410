pub mod device;
pub mod headset;
pub mod runtime;
pub mod simulated;

use bitflags::bitflags;
use glam::{Quat, UVec2, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use device::Device;
pub use headset::{HeadsetSession, ScopedStereoBind};
pub use runtime::RuntimeSession;
pub use simulated::{SimulatedProbe, SimulatedRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const COUNT: usize = 2;

    pub const fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    pub const fn both() -> [Eye; 2] {
        [Eye::Left, Eye::Right]
    }
}

bitflags! {
    /// Display capabilities reported by, or requested from, the headset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HmdCaps: u32 {
        const LOW_PERSISTENCE = 1 << 0;
        const DYNAMIC_PREDICTION = 1 << 1;
        const NO_MIRROR_TO_WINDOW = 1 << 2;
        const EXTEND_DESKTOP = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrackingCaps: u32 {
        const ORIENTATION = 1 << 0;
        const MAG_YAW_CORRECTION = 1 << 1;
        const POSITION = 1 << 2;
    }
}

bitflags! {
    /// Status bits attached to every tracking sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u32 {
        const ORIENTATION_TRACKED = 1 << 0;
        const POSITION_TRACKED = 1 << 1;
        const CAMERA_POSE_TRACKED = 1 << 2;
        const POSITION_CONNECTED = 1 << 3;
        const HMD_CONNECTED = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LayerFlags: u32 {
        const HIGH_QUALITY = 1 << 0;
        const TEXTURE_ORIGIN_AT_BOTTOM_LEFT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HmdType {
    Dk1,
    Dk2,
    Other,
}

/// Field of view expressed as tangents of the half-angles around the view axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FovPort {
    pub up_tan: f32,
    pub down_tan: f32,
    pub left_tan: f32,
    pub right_tan: f32,
}

impl FovPort {
    pub fn symmetric(horizontal_degrees: f32, vertical_degrees: f32) -> Self {
        let h = (horizontal_degrees.to_radians() * 0.5).tan();
        let v = (vertical_degrees.to_radians() * 0.5).tan();
        Self {
            up_tan: v,
            down_tan: v,
            left_tan: h,
            right_tan: h,
        }
    }

    pub fn vertical_degrees(&self) -> f32 {
        (self.up_tan.atan() + self.down_tan.atan()).to_degrees()
    }

    pub fn aspect_ratio(&self) -> f32 {
        (self.left_tan + self.right_tan) / (self.up_tan + self.down_tan)
    }
}

impl Default for FovPort {
    fn default() -> Self {
        Self::symmetric(90.0, 90.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self {
            orientation,
            position,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }
}

/// Opaque GPU surface owned by either the runtime or the render framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    pub id: u64,
    pub size: UVec2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFrustum {
    pub h_fov_radians: f32,
    pub v_fov_radians: f32,
    pub near_z_meters: f32,
    pub far_z_meters: f32,
}

/// Static description of a headset, read once when the device is acquired.
#[derive(Debug, Clone, PartialEq)]
pub struct HmdInfo {
    pub hmd_type: HmdType,
    pub product_name: String,
    pub resolution: UVec2,
    pub default_eye_fov: [FovPort; 2],
    pub eye_render_order: [Eye; 2],
    pub available_caps: HmdCaps,
    pub available_tracking_caps: TrackingCaps,
    pub camera_frustum: CameraFrustum,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRenderDesc {
    pub eye: Eye,
    pub fov: FovPort,
    pub hmd_to_eye_view_offset: Vec3,
}

impl EyeRenderDesc {
    pub fn new(eye: Eye) -> Self {
        Self {
            eye,
            fov: FovPort::default(),
            hmd_to_eye_view_offset: Vec3::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTiming {
    pub frame_index: u64,
    pub frame_interval_seconds: f64,
    pub display_midpoint_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingState {
    pub head_pose: Pose,
    pub status: StatusFlags,
    pub timestamp_seconds: f64,
}

impl TrackingState {
    pub fn is_position_tracked(&self) -> bool {
        self.status
            .contains(StatusFlags::POSITION_CONNECTED | StatusFlags::POSITION_TRACKED)
    }
}

/// Ring of colour buffers allocated by the runtime for one stereo target.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapTextureSet {
    pub id: u64,
    pub textures: Vec<SurfaceHandle>,
    pub current_index: usize,
}

impl SwapTextureSet {
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn current(&self) -> Option<SurfaceHandle> {
        self.textures.get(self.current_index).copied()
    }

    /// Moves to the next buffer in the ring and returns its index.
    pub fn advance(&mut self) -> usize {
        if !self.textures.is_empty() {
            self.current_index = (self.current_index + 1) % self.textures.len();
        }
        self.current_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorTexture {
    pub surface: SurfaceHandle,
}

/// Eye-FOV composition layer handed to the compositor every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerEyeFov {
    pub flags: LayerFlags,
    pub viewport: [Viewport; 2],
    pub fov: [FovPort; 2],
    pub render_pose: [Pose; 2],
}

impl LayerEyeFov {
    /// Splits a combined target into a left half and a right half.
    pub fn side_by_side(size: UVec2, fov: [FovPort; 2], flags: LayerFlags) -> Self {
        let half = size.x / 2;
        Self {
            flags,
            viewport: [
                Viewport::new(0, 0, half, size.y),
                Viewport::new(half as i32, 0, half, size.y),
            ],
            fov,
            render_pose: [Pose::IDENTITY; 2],
        }
    }
}

impl Default for LayerEyeFov {
    fn default() -> Self {
        Self::side_by_side(UVec2::ZERO, [FovPort::default(); 2], LayerFlags::HIGH_QUALITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewScaleDesc {
    pub hmd_space_to_world_scale_in_meters: f32,
    pub hmd_to_eye_view_offset: [Vec3; 2],
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSubmission<'a> {
    pub frame_index: u64,
    pub layer: &'a LayerEyeFov,
    pub color_texture: &'a SwapTextureSet,
    pub view_scale: ViewScaleDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Presented,
    /// The compositor accepted the frame but the headset is not showing it.
    NotVisible,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VrError {
    #[error("vr runtime failed to initialize: {0}")]
    Initialization(String),
    #[error("vr runtime call failed: {0}")]
    Runtime(String),
    #[error("no headset device is available")]
    NoDevice,
    #[error("window renderer does not support stereo draw hooks")]
    UnsupportedRenderer,
    #[error("{setting} must be greater than zero (got {value})")]
    NonPositive { setting: &'static str, value: f32 },
    #[error("eye index {0} is out of range")]
    EyeIndex(usize),
}

impl VrError {
    pub fn runtime(reason: impl Into<String>) -> Self {
        VrError::Runtime(reason.into())
    }
}

pub type VrResult<T> = Result<T, VrError>;

/// Contract of the vendor VR runtime. Implementations are shared across
/// threads through [`RuntimeSession`], so state lives behind interior
/// mutability.
pub trait DeviceRuntime: Send + Sync {
    fn label(&self) -> &'static str;

    fn initialize(&self) -> VrResult<()>;
    fn shutdown(&self);

    /// Number of physically connected headsets.
    fn detect(&self) -> usize;
    fn create_device(&self, index: usize) -> VrResult<DeviceHandle>;
    fn create_debug_device(&self, hmd_type: HmdType) -> VrResult<DeviceHandle>;
    fn destroy_device(&self, device: DeviceHandle);
    fn device_info(&self, device: DeviceHandle) -> VrResult<HmdInfo>;

    fn enabled_caps(&self, device: DeviceHandle) -> HmdCaps;
    fn set_enabled_caps(&self, device: DeviceHandle, caps: HmdCaps);
    fn configure_tracking(
        &self,
        device: DeviceHandle,
        supported: TrackingCaps,
        required: TrackingCaps,
    ) -> VrResult<()>;

    fn fov_texture_size(
        &self,
        device: DeviceHandle,
        eye: Eye,
        fov: FovPort,
        pixels_per_display_pixel: f32,
    ) -> UVec2;
    fn render_desc(&self, device: DeviceHandle, eye: Eye, fov: FovPort) -> EyeRenderDesc;

    fn create_swap_texture_set(&self, device: DeviceHandle, size: UVec2)
        -> VrResult<SwapTextureSet>;
    fn destroy_swap_texture_set(&self, device: DeviceHandle, set: SwapTextureSet);
    fn create_mirror_texture(&self, device: DeviceHandle, size: UVec2) -> VrResult<MirrorTexture>;
    fn destroy_mirror_texture(&self, device: DeviceHandle, texture: MirrorTexture);

    fn time_seconds(&self) -> f64;
    fn frame_timing(&self, device: DeviceHandle, frame_index: u64) -> FrameTiming;
    fn tracking_state(&self, device: DeviceHandle, absolute_time_seconds: f64) -> TrackingState;

    /// Derives both eye poses from a head pose and the head-to-eye offsets.
    fn calc_eye_poses(&self, head: Pose, hmd_to_eye_view_offset: &[Vec3; 2]) -> [Pose; 2] {
        hmd_to_eye_view_offset.map(|offset| Pose {
            orientation: head.orientation,
            position: head.position + head.orientation * offset,
        })
    }

    fn submit_frame(
        &self,
        device: DeviceHandle,
        submission: &FrameSubmission<'_>,
    ) -> VrResult<SubmitStatus>;

    fn recenter_pose(&self, device: DeviceHandle);

    /// Copies a named float property into `out`, returning how many values were written.
    fn float_array(&self, device: DeviceHandle, key: &str, out: &mut [f32]) -> usize;
}
