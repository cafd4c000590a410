use crate::vr::{Eye, FovPort, Pose};
use glam::{Mat3, Mat4, Quat, Vec3, Vec4};
use std::cell::Cell;

const DEFAULT_FOV_DEGREES: f32 = 35.0;
const DEFAULT_ASPECT_RATIO: f32 = 4.0 / 3.0;
const DEFAULT_NEAR_CLIP: f32 = 0.1;
const DEFAULT_FAR_CLIP: f32 = 1000.0;

/// Orientation whose -Z axis points along `direction`, keeping `world_up` up
/// wherever the two are not parallel.
fn orientation_towards(direction: Vec3, world_up: Vec3) -> Quat {
    let forward = direction.normalize_or_zero();
    if forward == Vec3::ZERO {
        return Quat::IDENTITY;
    }

    let right = forward.cross(world_up);
    if right.length_squared() < 1e-8 {
        return Quat::from_rotation_arc(Vec3::NEG_Z, forward);
    }
    let right = right.normalize();
    let up = right.cross(forward);
    Quat::from_mat3(&Mat3::from_cols(right, up, -forward)).normalize()
}

/// Right-handed off-axis projection built from FOV tangents, mapping depth
/// to `[0, 1]` between the near and far planes.
pub fn fov_projection(fov: FovPort, near_clip: f32, far_clip: f32) -> Mat4 {
    let x_scale = 2.0 / (fov.left_tan + fov.right_tan);
    let x_offset = (fov.left_tan - fov.right_tan) * x_scale * 0.5;
    let y_scale = 2.0 / (fov.up_tan + fov.down_tan);
    let y_offset = (fov.up_tan - fov.down_tan) * y_scale * 0.5;
    let depth = far_clip / (near_clip - far_clip);

    Mat4::from_cols(
        Vec4::new(x_scale, 0.0, 0.0, 0.0),
        Vec4::new(0.0, y_scale, 0.0, 0.0),
        Vec4::new(-x_offset, y_offset, depth, -1.0),
        Vec4::new(0.0, 0.0, depth * near_clip, 0.0),
    )
}

/// Conventional perspective camera describing where the observer stands in
/// the world.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraPersp {
    eye_point: Vec3,
    orientation: Quat,
    world_up: Vec3,
    fov_degrees: f32,
    aspect_ratio: f32,
    near_clip: f32,
    far_clip: f32,
}

impl CameraPersp {
    pub fn new(fov_degrees: f32, aspect_ratio: f32, near_clip: f32, far_clip: f32) -> Self {
        Self {
            eye_point: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            world_up: Vec3::Y,
            fov_degrees,
            aspect_ratio,
            near_clip,
            far_clip,
        }
    }

    pub fn eye_point(&self) -> Vec3 {
        self.eye_point
    }

    pub fn set_eye_point(&mut self, eye_point: Vec3) {
        self.eye_point = eye_point;
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn set_orientation(&mut self, orientation: Quat) {
        self.orientation = orientation.normalize();
    }

    pub fn view_direction(&self) -> Vec3 {
        self.orientation * Vec3::NEG_Z
    }

    pub fn set_view_direction(&mut self, direction: Vec3) {
        self.orientation = orientation_towards(direction, self.world_up);
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.set_view_direction(target - self.eye_point);
    }

    pub fn set_perspective(
        &mut self,
        fov_degrees: f32,
        aspect_ratio: f32,
        near_clip: f32,
        far_clip: f32,
    ) {
        self.fov_degrees = fov_degrees;
        self.aspect_ratio = aspect_ratio;
        self.near_clip = near_clip;
        self.far_clip = far_clip;
    }

    pub fn fov_degrees(&self) -> f32 {
        self.fov_degrees
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.aspect_ratio = aspect_ratio;
    }

    pub fn near_clip(&self) -> f32 {
        self.near_clip
    }

    pub fn far_clip(&self) -> f32 {
        self.far_clip
    }

    pub fn view_matrix(&self) -> Mat4 {
        let forward = self.orientation * Vec3::NEG_Z;
        let up = self.orientation * Vec3::Y;
        Mat4::look_at_rh(self.eye_point, self.eye_point + forward, up)
    }

    pub fn inverse_view_matrix(&self) -> Mat4 {
        self.view_matrix().inverse()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh_gl(
            self.fov_degrees.to_radians(),
            self.aspect_ratio,
            self.near_clip,
            self.far_clip,
        )
    }
}

impl Default for CameraPersp {
    fn default() -> Self {
        Self::new(
            DEFAULT_FOV_DEGREES,
            DEFAULT_ASPECT_RATIO,
            DEFAULT_NEAR_CLIP,
            DEFAULT_FAR_CLIP,
        )
    }
}

/// Per-eye camera posed from the headset's render pose. The projection comes
/// from the device FOV and is cached until the pose, FOV or clip planes change.
#[derive(Debug, Clone)]
pub struct EyeCamera {
    eye: Eye,
    orientation: Quat,
    position: Vec3,
    fov: FovPort,
    near_clip: f32,
    far_clip: f32,
    projection: Cell<Option<Mat4>>,
}

impl EyeCamera {
    pub fn new(eye: Eye) -> Self {
        Self {
            eye,
            orientation: Quat::IDENTITY,
            position: Vec3::ZERO,
            fov: FovPort::default(),
            near_clip: DEFAULT_NEAR_CLIP,
            far_clip: DEFAULT_FAR_CLIP,
            projection: Cell::new(None),
        }
    }

    pub fn eye(&self) -> Eye {
        self.eye
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn set_orientation(&mut self, orientation: Quat) {
        self.orientation = orientation;
        self.invalidate();
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        self.invalidate();
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.orientation = pose.orientation;
        self.position = pose.position;
        self.invalidate();
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.orientation, self.position)
    }

    pub fn fov(&self) -> FovPort {
        self.fov
    }

    pub fn set_fov(&mut self, fov: FovPort) {
        self.fov = fov;
        self.invalidate();
    }

    pub fn near_clip(&self) -> f32 {
        self.near_clip
    }

    pub fn far_clip(&self) -> f32 {
        self.far_clip
    }

    pub fn set_clip_planes(&mut self, near_clip: f32, far_clip: f32) {
        self.near_clip = near_clip;
        self.far_clip = far_clip;
        self.invalidate();
    }

    pub fn is_projection_cached(&self) -> bool {
        self.projection.get().is_some()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        if let Some(projection) = self.projection.get() {
            return projection;
        }
        let projection = fov_projection(self.fov, self.near_clip, self.far_clip);
        self.projection.set(Some(projection));
        projection
    }

    fn invalidate(&mut self) {
        self.projection.set(None);
    }
}
