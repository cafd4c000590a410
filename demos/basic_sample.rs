/// Headset sample loop on the simulated runtime: attaches to a headless
/// window, renders every eye for a few frames and exercises the runtime
/// toggles a user would reach through the keyboard.
use glam::{Mat4, UVec2, Vec3, Vec4};
use hmd_stereo::render::HeadlessWindow;
use hmd_stereo::vr::SimulatedRuntime;
use hmd_stereo::{
    CameraPersp, HeadsetSession, RuntimeSession, ScopedStereoBind, StereoRenderer, VrError,
};
use std::cell::RefCell;
use std::env;
use std::rc::Rc;

const DEFAULT_FRAMES: u64 = 8;

#[derive(Debug, Clone, Copy)]
enum Key {
    Recenter,
    Mirror,
    Monoscopic,
    Tracking,
}

fn key_for_frame(frame: u64) -> Option<Key> {
    match frame {
        2 => Some(Key::Recenter),
        3 => Some(Key::Mirror),
        4 => Some(Key::Monoscopic),
        5 => Some(Key::Tracking),
        _ => None,
    }
}

fn key_down(headset: &mut HeadsetSession, key: Key) {
    log::info!("[sample] key {key:?}");
    match key {
        Key::Recenter => headset.recenter_pose(),
        Key::Mirror => headset.enable_mirrored(!headset.is_mirrored()),
        Key::Monoscopic => headset.enable_monoscopic(!headset.is_monoscopic()),
        Key::Tracking => headset.enable_positional_tracking(!headset.is_tracked()),
    }
}

fn light_position(time: f32) -> Vec4 {
    let t = time * 0.4;
    Vec4::new(t.sin(), (t * 4.0).sin(), t.cos(), 1.0)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let frames = env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>())
        .transpose()?
        .unwrap_or(DEFAULT_FRAMES);

    let runtime = match RuntimeSession::initialize(|| Box::new(SimulatedRuntime::new())) {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("[sample] {err}");
            std::process::exit(1);
        }
    };

    let window = HeadlessWindow::new(UVec2::new(1920, 1080));
    let session = Rc::new(RefCell::new(HeadsetSession::new(runtime)));

    match HeadsetSession::attach(&session, window.clone()) {
        Ok(true) => {
            let mut headset = session.borrow_mut();
            if headset.is_desktop_extended() {
                log::info!("[sample] headset extends the desktop, going full screen");
            } else if let Some(resolution) = headset.native_window_resolution() {
                window.resize(resolution);
            }

            let mut host = CameraPersp::default();
            host.set_eye_point(Vec3::new(0.0, 0.0, 1.0));
            host.look_at(Vec3::ZERO);
            headset.set_host_camera(host);
            headset.set_screen_percentage(1.25)?;
        }
        Ok(false) => log::warn!("[sample] no headset, drawing to the window only"),
        Err(VrError::UnsupportedRenderer) => {
            log::error!("[sample] window renderer cannot drive a headset");
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    }

    let mut debug_camera = CameraPersp::default();
    debug_camera.set_eye_point(Vec3::new(0.0, 2.0, 5.0));
    debug_camera.look_at(Vec3::ZERO);
    debug_camera.set_perspective(45.0, 16.0 / 9.0, 0.1, 1000.0);

    for frame in 0..frames {
        if let Some(key) = key_for_frame(frame) {
            key_down(&mut session.borrow_mut(), key);
        }
        let light = light_position(frame as f32 / 75.0);

        window.draw_frame(|renderer| {
            let mut headset = session.borrow_mut();
            let mut bound = ScopedStereoBind::new(&mut headset);

            let eyes = bound.eyes();
            if eyes.is_empty() {
                renderer.set_viewport(hmd_stereo::vr::Viewport::new(0, 0, 1920, 1080));
                renderer.set_model_matrix(Mat4::IDENTITY);
                renderer.set_view_matrix(debug_camera.view_matrix());
                renderer.set_projection_matrix(debug_camera.projection_matrix());
                return;
            }

            for index in 0..eyes.len() {
                let eye = match bound.enable_eye(index, true) {
                    Ok(eye) => eye,
                    Err(err) => {
                        log::error!("[sample] {err}");
                        continue;
                    }
                };
                let light_in_view = bound.view_matrix() * light;
                log::debug!("[sample] frame {frame} {eye:?} light at {light_in_view:?}");

                if let Some(tracker) = bound.positional_tracking_camera() {
                    let model = bound.host_camera().inverse_view_matrix();
                    log::trace!(
                        "[sample] tracker frustum at {:?}, model {:?}",
                        tracker.eye_point(),
                        model.w_axis
                    );
                }
            }
        });
    }

    let headset = session.borrow();
    log::info!(
        "[sample] rendered {} frames, latencies {:?} ms",
        headset.frame_index(),
        headset.latencies()
    );
    Ok(())
}
