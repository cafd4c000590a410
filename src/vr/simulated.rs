use crate::vr::{
    CameraFrustum, DeviceHandle, DeviceRuntime, Eye, EyeRenderDesc, FovPort, FrameSubmission,
    FrameTiming, HmdCaps, HmdInfo, HmdType, LayerEyeFov, MirrorTexture, Pose, StatusFlags,
    SubmitStatus, SurfaceHandle, SwapTextureSet, TrackingCaps, TrackingState, ViewScaleDesc,
    VrError, VrResult,
};
use glam::{UVec2, Vec3};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// DK2 panel refresh.
const FRAME_INTERVAL_SECONDS: f64 = 1.0 / 75.0;
const PIXELS_PER_TAN: [f32; 2] = [560.0, 549.0];
const HALF_IPD_METERS: f32 = 0.032;
const DEFAULT_SWAP_COUNT: usize = 3;
/// Submissions kept for inspection; older ones are only counted.
const SUBMISSION_HISTORY: usize = 64;
/// Photon, timewarp and post-present latencies reported under `DK2Latency`.
const DK2_LATENCY_SECONDS: [f32; 3] = [0.0138, 0.0112, 0.0021];

fn dk2_info(product_name: &str) -> HmdInfo {
    HmdInfo {
        hmd_type: HmdType::Dk2,
        product_name: product_name.to_string(),
        resolution: UVec2::new(1920, 1080),
        default_eye_fov: [
            FovPort {
                up_tan: 1.3292,
                down_tan: 1.3292,
                left_tan: 1.0586,
                right_tan: 1.0924,
            },
            FovPort {
                up_tan: 1.3292,
                down_tan: 1.3292,
                left_tan: 1.0924,
                right_tan: 1.0586,
            },
        ],
        eye_render_order: [Eye::Left, Eye::Right],
        available_caps: HmdCaps::LOW_PERSISTENCE | HmdCaps::DYNAMIC_PREDICTION,
        available_tracking_caps: TrackingCaps::all(),
        camera_frustum: CameraFrustum {
            h_fov_radians: 1.2915,
            v_fov_radians: 0.9424,
            near_z_meters: 0.4,
            far_z_meters: 2.5,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmittedFrame {
    pub frame_index: u64,
    pub swap_set_id: u64,
    pub swap_index: usize,
    pub layer: LayerEyeFov,
    pub view_scale: ViewScaleDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceRecord {
    debug: bool,
    caps: HmdCaps,
    tracking_supported: TrackingCaps,
    tracking_required: TrackingCaps,
}

#[derive(Debug)]
struct SimulatedState {
    connected_devices: usize,
    allow_debug: bool,
    init_failure: Option<String>,
    extend_desktop: bool,
    eye_render_order: [Eye; 2],
    swap_count: usize,
    head_pose: Pose,
    status: StatusFlags,
    submit_status: SubmitStatus,
    next_id: u64,
    initialize_count: u32,
    shutdown_count: u32,
    devices: HashMap<u64, DeviceRecord>,
    destroyed_devices: u32,
    swap_sets: HashSet<u64>,
    swap_sets_created: u32,
    mirrors: HashSet<u64>,
    submitted: VecDeque<SubmittedFrame>,
    submitted_count: u64,
    fail_swap_allocation: bool,
    recenter_count: u32,
    last_tracking_query: Option<f64>,
}

impl SimulatedState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            connected_devices: 0,
            allow_debug: true,
            init_failure: None,
            extend_desktop: false,
            eye_render_order: [Eye::Left, Eye::Right],
            swap_count: DEFAULT_SWAP_COUNT,
            head_pose: Pose::IDENTITY,
            status: StatusFlags::ORIENTATION_TRACKED
                | StatusFlags::POSITION_TRACKED
                | StatusFlags::POSITION_CONNECTED
                | StatusFlags::HMD_CONNECTED,
            submit_status: SubmitStatus::Presented,
            next_id: 0,
            initialize_count: 0,
            shutdown_count: 0,
            devices: HashMap::new(),
            destroyed_devices: 0,
            swap_sets: HashSet::new(),
            swap_sets_created: 0,
            mirrors: HashSet::new(),
            submitted: VecDeque::with_capacity(SUBMISSION_HISTORY),
            submitted_count: 0,
            fail_swap_allocation: false,
            recenter_count: 0,
            last_tracking_query: None,
        }
    }
}

/// In-process runtime that behaves like a DK2 with deterministic timing.
/// With no hardware configured it only offers the debug device.
pub struct SimulatedRuntime {
    state: Arc<Mutex<SimulatedState>>,
    epoch: Instant,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState::default())),
            epoch: Instant::now(),
        }
    }

    /// Reports one physically connected headset.
    pub fn with_hardware(self) -> Self {
        self.lock().connected_devices = 1;
        self
    }

    pub fn without_debug_device(self) -> Self {
        self.lock().allow_debug = false;
        self
    }

    pub fn failing_initialization(self, reason: impl Into<String>) -> Self {
        self.lock().init_failure = Some(reason.into());
        self
    }

    pub fn with_swap_count(self, count: usize) -> Self {
        self.lock().swap_count = count.max(1);
        self
    }

    pub fn with_status(self, status: StatusFlags) -> Self {
        self.lock().status = status;
        self
    }

    pub fn with_head_pose(self, pose: Pose) -> Self {
        self.lock().head_pose = pose;
        self
    }

    pub fn with_eye_render_order(self, order: [Eye; 2]) -> Self {
        self.lock().eye_render_order = order;
        self
    }

    pub fn extending_desktop(self) -> Self {
        self.lock().extend_desktop = true;
        self
    }

    pub fn with_submit_status(self, status: SubmitStatus) -> Self {
        self.lock().submit_status = status;
        self
    }

    /// Handle for observing and steering the runtime after it has been boxed
    /// into a [`crate::vr::RuntimeSession`].
    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        lock_state(&self.state)
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<SimulatedState>) -> MutexGuard<'_, SimulatedState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceRuntime for SimulatedRuntime {
    fn label(&self) -> &'static str {
        "Simulated VR Runtime"
    }

    fn initialize(&self) -> VrResult<()> {
        let mut state = self.lock();
        state.initialize_count += 1;
        match &state.init_failure {
            Some(reason) => Err(VrError::Initialization(reason.clone())),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        self.lock().shutdown_count += 1;
    }

    fn detect(&self) -> usize {
        self.lock().connected_devices
    }

    fn create_device(&self, index: usize) -> VrResult<DeviceHandle> {
        let mut state = self.lock();
        if index >= state.connected_devices {
            return Err(VrError::runtime(format!("no headset at index {index}")));
        }
        let id = state.allocate_id();
        state.devices.insert(
            id,
            DeviceRecord {
                debug: false,
                caps: HmdCaps::LOW_PERSISTENCE,
                tracking_supported: TrackingCaps::empty(),
                tracking_required: TrackingCaps::empty(),
            },
        );
        Ok(DeviceHandle(id))
    }

    fn create_debug_device(&self, hmd_type: HmdType) -> VrResult<DeviceHandle> {
        let mut state = self.lock();
        if !state.allow_debug {
            return Err(VrError::runtime(format!(
                "debug {hmd_type:?} device unavailable"
            )));
        }
        let id = state.allocate_id();
        state.devices.insert(
            id,
            DeviceRecord {
                debug: true,
                caps: HmdCaps::empty(),
                tracking_supported: TrackingCaps::empty(),
                tracking_required: TrackingCaps::empty(),
            },
        );
        Ok(DeviceHandle(id))
    }

    fn destroy_device(&self, device: DeviceHandle) {
        let mut state = self.lock();
        if state.devices.remove(&device.0).is_some() {
            state.destroyed_devices += 1;
        }
    }

    fn device_info(&self, device: DeviceHandle) -> VrResult<HmdInfo> {
        let state = self.lock();
        let record = state
            .devices
            .get(&device.0)
            .ok_or_else(|| VrError::runtime(format!("unknown device {}", device.0)))?;

        let mut info = dk2_info(if record.debug {
            "Oculus Rift DK2 (debug)"
        } else {
            "Oculus Rift DK2"
        });
        info.eye_render_order = state.eye_render_order;
        if state.extend_desktop {
            info.available_caps |= HmdCaps::EXTEND_DESKTOP;
        }
        Ok(info)
    }

    fn enabled_caps(&self, device: DeviceHandle) -> HmdCaps {
        let state = self.lock();
        let mut caps = state
            .devices
            .get(&device.0)
            .map(|record| record.caps)
            .unwrap_or_else(HmdCaps::empty);
        if state.extend_desktop {
            caps |= HmdCaps::EXTEND_DESKTOP;
        }
        caps
    }

    fn set_enabled_caps(&self, device: DeviceHandle, caps: HmdCaps) {
        if let Some(record) = self.lock().devices.get_mut(&device.0) {
            record.caps = caps;
        }
    }

    fn configure_tracking(
        &self,
        device: DeviceHandle,
        supported: TrackingCaps,
        required: TrackingCaps,
    ) -> VrResult<()> {
        let mut state = self.lock();
        let record = state
            .devices
            .get_mut(&device.0)
            .ok_or_else(|| VrError::runtime(format!("unknown device {}", device.0)))?;
        record.tracking_supported = supported;
        record.tracking_required = required;
        Ok(())
    }

    fn fov_texture_size(
        &self,
        _device: DeviceHandle,
        _eye: Eye,
        fov: FovPort,
        pixels_per_display_pixel: f32,
    ) -> UVec2 {
        let width = (fov.left_tan + fov.right_tan) * PIXELS_PER_TAN[0] * pixels_per_display_pixel;
        let height = (fov.up_tan + fov.down_tan) * PIXELS_PER_TAN[1] * pixels_per_display_pixel;
        UVec2::new((width.ceil() as u32).max(1), (height.ceil() as u32).max(1))
    }

    fn render_desc(&self, _device: DeviceHandle, eye: Eye, fov: FovPort) -> EyeRenderDesc {
        let x = match eye {
            Eye::Left => -HALF_IPD_METERS,
            Eye::Right => HALF_IPD_METERS,
        };
        EyeRenderDesc {
            eye,
            fov,
            hmd_to_eye_view_offset: Vec3::new(x, 0.0, 0.0),
        }
    }

    fn create_swap_texture_set(
        &self,
        device: DeviceHandle,
        size: UVec2,
    ) -> VrResult<SwapTextureSet> {
        let mut state = self.lock();
        if !state.devices.contains_key(&device.0) {
            return Err(VrError::runtime(format!("unknown device {}", device.0)));
        }
        if state.fail_swap_allocation {
            return Err(VrError::runtime("swap texture set allocation refused"));
        }
        if size.x == 0 || size.y == 0 {
            return Err(VrError::runtime(format!(
                "cannot allocate a {}x{} swap texture set",
                size.x, size.y
            )));
        }

        let id = state.allocate_id();
        let count = state.swap_count;
        let textures = (0..count)
            .map(|_| SurfaceHandle {
                id: state.allocate_id(),
                size,
            })
            .collect();
        state.swap_sets.insert(id);
        state.swap_sets_created += 1;

        Ok(SwapTextureSet {
            id,
            textures,
            current_index: 0,
        })
    }

    fn destroy_swap_texture_set(&self, _device: DeviceHandle, set: SwapTextureSet) {
        self.lock().swap_sets.remove(&set.id);
    }

    fn create_mirror_texture(&self, device: DeviceHandle, size: UVec2) -> VrResult<MirrorTexture> {
        let mut state = self.lock();
        if !state.devices.contains_key(&device.0) {
            return Err(VrError::runtime(format!("unknown device {}", device.0)));
        }
        let id = state.allocate_id();
        state.mirrors.insert(id);
        Ok(MirrorTexture {
            surface: SurfaceHandle { id, size },
        })
    }

    fn destroy_mirror_texture(&self, _device: DeviceHandle, texture: MirrorTexture) {
        self.lock().mirrors.remove(&texture.surface.id);
    }

    fn time_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn frame_timing(&self, _device: DeviceHandle, frame_index: u64) -> FrameTiming {
        FrameTiming {
            frame_index,
            frame_interval_seconds: FRAME_INTERVAL_SECONDS,
            display_midpoint_seconds: (frame_index as f64 + 1.5) * FRAME_INTERVAL_SECONDS,
        }
    }

    fn tracking_state(&self, _device: DeviceHandle, absolute_time_seconds: f64) -> TrackingState {
        let mut state = self.lock();
        state.last_tracking_query = Some(absolute_time_seconds);
        TrackingState {
            head_pose: state.head_pose,
            status: state.status,
            timestamp_seconds: absolute_time_seconds,
        }
    }

    fn submit_frame(
        &self,
        device: DeviceHandle,
        submission: &FrameSubmission<'_>,
    ) -> VrResult<SubmitStatus> {
        let mut state = self.lock();
        if !state.devices.contains_key(&device.0) {
            return Err(VrError::runtime(format!("unknown device {}", device.0)));
        }
        if !state.swap_sets.contains(&submission.color_texture.id) {
            return Err(VrError::runtime(format!(
                "swap texture set {} was not created by this runtime",
                submission.color_texture.id
            )));
        }

        if state.submitted.len() == SUBMISSION_HISTORY {
            state.submitted.pop_front();
        }
        state.submitted_count += 1;
        state.submitted.push_back(SubmittedFrame {
            frame_index: submission.frame_index,
            swap_set_id: submission.color_texture.id,
            swap_index: submission.color_texture.current_index,
            layer: *submission.layer,
            view_scale: submission.view_scale,
        });
        Ok(state.submit_status)
    }

    fn recenter_pose(&self, _device: DeviceHandle) {
        self.lock().recenter_count += 1;
    }

    fn float_array(&self, _device: DeviceHandle, key: &str, out: &mut [f32]) -> usize {
        if key != "DK2Latency" {
            return 0;
        }
        let count = out.len().min(DK2_LATENCY_SECONDS.len());
        out[..count].copy_from_slice(&DK2_LATENCY_SECONDS[..count]);
        count
    }
}

/// Shared view into a [`SimulatedRuntime`]'s state.
#[derive(Clone)]
pub struct SimulatedProbe {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedProbe {
    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        lock_state(&self.state)
    }

    pub fn initialize_count(&self) -> u32 {
        self.lock().initialize_count
    }

    pub fn shutdown_count(&self) -> u32 {
        self.lock().shutdown_count
    }

    pub fn live_devices(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn destroyed_devices(&self) -> u32 {
        self.lock().destroyed_devices
    }

    pub fn is_debug_device(&self, device: DeviceHandle) -> bool {
        self.lock()
            .devices
            .get(&device.0)
            .is_some_and(|record| record.debug)
    }

    pub fn enabled_caps(&self, device: DeviceHandle) -> HmdCaps {
        self.lock()
            .devices
            .get(&device.0)
            .map(|record| record.caps)
            .unwrap_or_else(HmdCaps::empty)
    }

    pub fn tracking_caps(&self, device: DeviceHandle) -> TrackingCaps {
        self.lock()
            .devices
            .get(&device.0)
            .map(|record| record.tracking_supported)
            .unwrap_or_else(TrackingCaps::empty)
    }

    pub fn required_tracking_caps(&self, device: DeviceHandle) -> TrackingCaps {
        self.lock()
            .devices
            .get(&device.0)
            .map(|record| record.tracking_required)
            .unwrap_or_else(TrackingCaps::empty)
    }

    pub fn live_swap_sets(&self) -> usize {
        self.lock().swap_sets.len()
    }

    pub fn swap_sets_created(&self) -> u32 {
        self.lock().swap_sets_created
    }

    pub fn live_mirrors(&self) -> usize {
        self.lock().mirrors.len()
    }

    /// The most recent submissions, oldest first.
    pub fn submitted_frames(&self) -> Vec<SubmittedFrame> {
        self.lock().submitted.iter().copied().collect()
    }

    /// Every submission accepted since the runtime was created.
    pub fn submitted_count(&self) -> u64 {
        self.lock().submitted_count
    }

    pub fn fail_swap_allocations(&self, fail: bool) {
        self.lock().fail_swap_allocation = fail;
    }

    pub fn recenter_count(&self) -> u32 {
        self.lock().recenter_count
    }

    pub fn last_tracking_query(&self) -> Option<f64> {
        self.lock().last_tracking_query
    }

    pub fn set_status(&self, status: StatusFlags) {
        self.lock().status = status;
    }

    pub fn set_head_pose(&self, pose: Pose) {
        self.lock().head_pose = pose;
    }

    pub fn set_submit_status(&self, status: SubmitStatus) {
        self.lock().submit_status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_device_only_without_hardware() {
        let runtime = SimulatedRuntime::new();
        assert_eq!(runtime.detect(), 0);
        assert!(runtime.create_device(0).is_err());

        let handle = runtime
            .create_debug_device(HmdType::Dk2)
            .expect("debug device available");
        assert!(runtime.probe().is_debug_device(handle));
        assert_eq!(runtime.device_info(handle).unwrap().hmd_type, HmdType::Dk2);
    }

    #[test]
    fn submission_history_is_bounded() {
        let runtime = SimulatedRuntime::new();
        let probe = runtime.probe();
        let handle = runtime.create_debug_device(HmdType::Dk2).unwrap();
        let set = runtime
            .create_swap_texture_set(handle, UVec2::new(64, 32))
            .unwrap();
        let layer = LayerEyeFov::default();
        let extra = 10;

        for frame_index in 0..(SUBMISSION_HISTORY + extra) as u64 {
            let submission = FrameSubmission {
                frame_index,
                layer: &layer,
                color_texture: &set,
                view_scale: ViewScaleDesc {
                    hmd_space_to_world_scale_in_meters: 1.0,
                    hmd_to_eye_view_offset: [Vec3::ZERO; 2],
                },
            };
            runtime.submit_frame(handle, &submission).unwrap();
        }

        let frames = probe.submitted_frames();
        assert_eq!(frames.len(), SUBMISSION_HISTORY);
        assert_eq!(frames[0].frame_index, extra as u64);
        assert_eq!(probe.submitted_count(), (SUBMISSION_HISTORY + extra) as u64);
    }

    #[test]
    fn refused_swap_allocation_reports_runtime_error() {
        let runtime = SimulatedRuntime::new();
        let probe = runtime.probe();
        let handle = runtime.create_debug_device(HmdType::Dk2).unwrap();

        probe.fail_swap_allocations(true);
        assert!(matches!(
            runtime.create_swap_texture_set(handle, UVec2::new(64, 32)),
            Err(VrError::Runtime(_))
        ));
        assert_eq!(probe.live_swap_sets(), 0);
    }

    #[test]
    fn recommended_size_scales_with_pixel_density() {
        let runtime = SimulatedRuntime::new().with_hardware();
        let handle = runtime.create_device(0).unwrap();
        let fov = runtime.device_info(handle).unwrap().default_eye_fov[0];

        let native = runtime.fov_texture_size(handle, Eye::Left, fov, 1.0);
        let half = runtime.fov_texture_size(handle, Eye::Left, fov, 0.5);

        assert_eq!(native, UVec2::new(1205, 1460));
        assert!(half.x <= native.x / 2 + 1);
        assert!(half.y <= native.y / 2 + 1);
    }

    #[test]
    fn swap_sets_are_tracked_until_destroyed() {
        let runtime = SimulatedRuntime::new().with_swap_count(2);
        let probe = runtime.probe();
        let handle = runtime.create_debug_device(HmdType::Dk2).unwrap();

        let set = runtime
            .create_swap_texture_set(handle, UVec2::new(64, 32))
            .unwrap();
        assert_eq!(set.texture_count(), 2);
        assert!(set.textures.iter().all(|surface| surface.size == UVec2::new(64, 32)));
        assert_eq!(probe.live_swap_sets(), 1);

        runtime.destroy_swap_texture_set(handle, set);
        assert_eq!(probe.live_swap_sets(), 0);
    }

    #[test]
    fn latency_array_reported_for_dk2_key_only() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.create_debug_device(HmdType::Dk2).unwrap();
        let mut out = [0.0; 3];

        assert_eq!(runtime.float_array(handle, "DK2Latency", &mut out), 3);
        assert_eq!(out, DK2_LATENCY_SECONDS);
        assert_eq!(runtime.float_array(handle, "Unknown", &mut out), 0);
    }

    #[test]
    fn midpoint_advances_one_interval_per_frame() {
        let runtime = SimulatedRuntime::new();
        let handle = runtime.create_debug_device(HmdType::Dk2).unwrap();
        let first = runtime.frame_timing(handle, 0);
        let second = runtime.frame_timing(handle, 1);

        let delta = second.display_midpoint_seconds - first.display_midpoint_seconds;
        assert!((delta - FRAME_INTERVAL_SECONDS).abs() < 1e-12);
    }
}
