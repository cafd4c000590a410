use glam::{Mat3, Mat4, Quat, UVec2, Vec3};
use hmd_stereo::render::HeadlessWindow;
use hmd_stereo::vr::{Pose, SimulatedProbe, SimulatedRuntime, StatusFlags};
use hmd_stereo::{CameraPersp, Eye, HeadsetSession, RuntimeSession, ScopedStereoBind, VrError};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

const WINDOW_SIZE: UVec2 = UVec2::new(1920, 1080);

struct Rig {
    session: Rc<RefCell<HeadsetSession>>,
    window: Rc<HeadlessWindow>,
    probe: SimulatedProbe,
}

fn rig(runtime: SimulatedRuntime) -> Rig {
    let probe = runtime.probe();
    let runtime = RuntimeSession::new(Box::new(runtime)).expect("simulated runtime initializes");
    Rig {
        session: Rc::new(RefCell::new(HeadsetSession::new(runtime))),
        window: HeadlessWindow::new(WINDOW_SIZE),
        probe,
    }
}

fn attached_rig(runtime: SimulatedRuntime) -> Rig {
    let rig = rig(runtime);
    assert!(
        HeadsetSession::attach(&rig.session, rig.window.clone()).expect("attach succeeds"),
        "attach should succeed with a valid window"
    );
    rig
}

fn tilted_head() -> SimulatedRuntime {
    SimulatedRuntime::new().with_head_pose(Pose::new(
        Quat::from_euler(glam::EulerRot::YXZ, 0.4, -0.1, 0.05),
        Vec3::new(0.05, 0.1, -0.02),
    ))
}

fn rotation_columns(matrix: Mat4) -> Mat3 {
    let basis = Mat3::from_mat4(matrix);
    Mat3::from_cols(
        basis.x_axis.normalize(),
        basis.y_axis.normalize(),
        basis.z_axis.normalize(),
    )
}

proptest! {
    #[test]
    fn head_scale_divides_view_distances(scale in 0.05f32..20.0) {
        let rig = attached_rig(tilted_head());
        rig.window.draw_frame(|_renderer| {});
        let mut headset = rig.session.borrow_mut();
        headset.enable_eye(0, false).unwrap();
        let unscaled = headset.view_matrix();

        headset.set_head_scale(scale).unwrap();
        let scaled = headset.view_matrix();

        let a = Vec3::new(0.3, -1.2, 2.5);
        let b = Vec3::new(-4.0, 0.7, -1.5);
        let unscaled_distance = unscaled.transform_point3(a).distance(unscaled.transform_point3(b));
        let scaled_distance = scaled.transform_point3(a).distance(scaled.transform_point3(b));
        prop_assert!((scaled_distance * scale - unscaled_distance).abs() < 1e-3 * unscaled_distance);

        prop_assert!(rotation_columns(scaled).abs_diff_eq(rotation_columns(unscaled), 1e-4));
    }

    #[test]
    fn tracking_gate_holds_for_every_status(bits in 0u32..32) {
        let status = StatusFlags::from_bits_truncate(bits);
        let rig = attached_rig(SimulatedRuntime::new().with_status(status));
        rig.session.borrow_mut().enable_positional_tracking(false);
        prop_assert!(!rig.session.borrow().is_tracked());

        rig.session.borrow_mut().enable_positional_tracking(true);
        let expected = status.contains(StatusFlags::POSITION_CONNECTED | StatusFlags::POSITION_TRACKED);
        prop_assert_eq!(rig.session.borrow().is_tracked(), expected);
    }
}

fn assert_close(actual: Vec3, expected: Vec3) {
    assert!(
        actual.abs_diff_eq(expected, 1e-4),
        "expected {expected:?}, got {actual:?}"
    );
}

#[test]
fn view_matrix_composes_host_and_eye_poses() {
    let rig = attached_rig(tilted_head());
    let mut host = CameraPersp::default();
    host.set_eye_point(Vec3::new(1.0, 2.0, 3.0));
    host.look_at(Vec3::new(-2.0, 0.5, -4.0));
    rig.session.borrow_mut().set_host_camera(host.clone());
    rig.window.draw_frame(|_renderer| {});

    let mut headset = rig.session.borrow_mut();
    assert!(headset.is_tracked());
    for index in 0..2 {
        let eye = headset.enable_eye(index, false).unwrap();
        let pose = headset.eye_render_poses()[eye.index()];
        let orientation = host.orientation() * pose.orientation;
        let inverse = headset.inverse_view_matrix();

        assert_close(
            inverse.w_axis.truncate(),
            host.eye_point() + host.orientation() * pose.position,
        );
        assert_close(inverse.y_axis.truncate(), orientation * Vec3::Y);
        assert_close(inverse.z_axis.truncate(), orientation * Vec3::Z);
    }

    headset.enable_positional_tracking(false);
    assert!(!headset.is_tracked());
    for index in 0..2 {
        let eye = headset.enable_eye(index, false).unwrap();
        let pose = headset.eye_render_poses()[eye.index()];
        let inverse = headset.inverse_view_matrix();

        assert_close(inverse.w_axis.truncate(), host.eye_point());
        assert_close(
            inverse.z_axis.truncate(),
            host.orientation() * pose.orientation * Vec3::Z,
        );
    }
}

#[test]
fn repeated_matrix_queries_are_stable() {
    let rig = attached_rig(tilted_head());
    rig.window.draw_frame(|_renderer| {});
    let mut headset = rig.session.borrow_mut();

    for index in 0..2 {
        headset.enable_eye(index, false).unwrap();
        let projection = headset.projection_matrix();
        let inverse = headset.inverse_view_matrix();
        for _ in 0..3 {
            assert_eq!(headset.projection_matrix(), projection);
            assert_eq!(headset.inverse_view_matrix(), inverse);
        }
    }
}

#[test]
fn ring_returns_to_start_after_one_bind_per_buffer() {
    let rig = attached_rig(SimulatedRuntime::new().with_swap_count(4));
    let mut headset = rig.session.borrow_mut();
    let start = headset.render_target().expect("target").current_index();

    for _ in 0..4 {
        let _bound = ScopedStereoBind::new(&mut headset);
    }
    assert_eq!(headset.render_target().expect("target").current_index(), start);
}

#[test]
fn eye_count_depends_on_device_and_window() {
    for has_device in [false, true] {
        for has_window in [false, true] {
            let runtime = if has_device {
                SimulatedRuntime::new()
            } else {
                SimulatedRuntime::new().without_debug_device()
            };
            let rig = rig(runtime);
            if has_window {
                let attached =
                    HeadsetSession::attach(&rig.session, rig.window.clone()).expect("attach");
                assert_eq!(attached, has_device);
            }

            let expected = if has_device && has_window { 2 } else { 0 };
            assert_eq!(
                rig.session.borrow().eyes().len(),
                expected,
                "device: {has_device}, window: {has_window}"
            );
        }
    }
}

#[test]
fn monoscopic_toggle_restores_device_offsets() {
    let rig = attached_rig(SimulatedRuntime::new());
    rig.window.draw_frame(|_renderer| {});
    let stereo = rig.session.borrow().eye_view_offsets();

    rig.session.borrow_mut().enable_monoscopic(true);
    rig.window.draw_frame(|_renderer| {});
    assert_eq!(rig.session.borrow().eye_view_offsets(), [Vec3::ZERO; 2]);
    let frames = rig.probe.submitted_frames();
    assert_eq!(
        frames.last().expect("frame submitted").view_scale.hmd_to_eye_view_offset,
        [Vec3::ZERO; 2]
    );

    rig.session.borrow_mut().enable_monoscopic(false);
    rig.window.draw_frame(|_renderer| {});
    assert_eq!(rig.session.borrow().eye_view_offsets(), stereo);
}

#[test]
fn missing_headset_falls_back_to_debug_device() {
    let rig = attached_rig(SimulatedRuntime::new().with_eye_render_order([Eye::Right, Eye::Left]));
    {
        let headset = rig.session.borrow();
        let device = headset.device().expect("debug device");
        assert!(device.is_debug());
        assert!(rig.probe.is_debug_device(device.handle()));
        assert_eq!(headset.eyes(), vec![Eye::Right, Eye::Left]);
    }

    let drawn = rig.window.draw_frame(|_renderer| {
        let mut headset = rig.session.borrow_mut();
        let mut bound = ScopedStereoBind::new(&mut headset);
        assert_eq!(bound.enable_eye(0, true), Ok(Eye::Right));
    });

    assert!(drawn);
    assert_eq!(rig.probe.submitted_frames().len(), 1);
    assert_eq!(rig.session.borrow().frame_index(), 1);
}

#[test]
fn non_positive_screen_percentage_is_rejected() {
    let rig = attached_rig(SimulatedRuntime::new());
    let size = rig.session.borrow().render_target().map(|target| target.size());

    for value in [0.0, -0.5] {
        let result = rig.session.borrow_mut().set_screen_percentage(value);
        assert_eq!(
            result,
            Err(VrError::NonPositive {
                setting: "screen percentage",
                value
            })
        );
    }

    rig.window.draw_frame(|_renderer| {});
    assert_eq!(
        rig.session.borrow().render_target().map(|target| target.size()),
        size
    );
}

#[test]
fn long_sessions_keep_bounded_submission_history() {
    let rig = attached_rig(SimulatedRuntime::new());
    let frames = 500;
    for _ in 0..frames {
        rig.window.draw_frame(|_renderer| {
            let mut headset = rig.session.borrow_mut();
            let _bound = ScopedStereoBind::new(&mut headset);
        });
    }

    assert_eq!(rig.probe.submitted_count(), frames);
    assert!(rig.probe.submitted_frames().len() < 100);
    assert_eq!(
        rig.probe.submitted_frames().last().map(|frame| frame.frame_index),
        Some(frames - 1)
    );
}

#[test]
fn second_detach_is_a_noop() {
    let rig = attached_rig(SimulatedRuntime::new());
    rig.session.borrow_mut().detach();
    rig.session.borrow_mut().detach();

    assert!(!rig.session.borrow().is_attached());
    assert!(rig.window.draw_frame(|_renderer| {}));
    assert!(rig.probe.submitted_frames().is_empty());
}
