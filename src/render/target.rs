use crate::render::{RenderResult, StereoRenderer};
use crate::vr::device::Device;
use crate::vr::{DeviceHandle, MirrorTexture, RuntimeSession, SurfaceHandle, SwapTextureSet, VrResult};
use glam::UVec2;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// Depth buffers belong to the renderer, not the runtime, so they draw ids
// from a range the runtime never hands out.
static NEXT_DEPTH_ID: AtomicU64 = AtomicU64::new(1 << 48);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthBuffer {
    surface: SurfaceHandle,
}

impl DepthBuffer {
    fn allocate(size: UVec2) -> Self {
        Self {
            surface: SurfaceHandle {
                id: NEXT_DEPTH_ID.fetch_add(1, Ordering::Relaxed),
                size,
            },
        }
    }

    pub fn surface(&self) -> SurfaceHandle {
        self.surface
    }

    pub fn size(&self) -> UVec2 {
        self.surface.size
    }
}

/// Side-by-side stereo target: the runtime's ring of colour buffers, one
/// depth buffer shared by every ring entry, and an optional mirror texture.
///
/// Runtime resources are released on drop, and only those that were
/// actually allocated. Surfaces released from the runtime are remembered
/// until a renderer is at hand to drop its own copies of them.
pub struct StereoRenderTarget {
    session: Arc<RuntimeSession>,
    device: DeviceHandle,
    size: UVec2,
    swap_set: Option<SwapTextureSet>,
    depth: Option<DepthBuffer>,
    mirror: Option<MirrorTexture>,
    retired: Vec<SurfaceHandle>,
    bound: bool,
}

impl StereoRenderTarget {
    /// An empty target for `device`; nothing is allocated until
    /// [`StereoRenderTarget::ensure_size`].
    pub fn new(device: &Device) -> Self {
        Self {
            session: Arc::clone(device.session()),
            device: device.handle(),
            size: UVec2::ZERO,
            swap_set: None,
            depth: None,
            mirror: None,
            retired: Vec::new(),
            bound: false,
        }
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn is_allocated(&self) -> bool {
        self.swap_set.is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn swap_set(&self) -> Option<&SwapTextureSet> {
        self.swap_set.as_ref()
    }

    pub fn current_index(&self) -> usize {
        self.swap_set.as_ref().map_or(0, |set| set.current_index)
    }

    pub fn buffer_count(&self) -> usize {
        self.swap_set.as_ref().map_or(0, SwapTextureSet::texture_count)
    }

    pub fn color_surface(&self) -> Option<SurfaceHandle> {
        self.swap_set.as_ref().and_then(SwapTextureSet::current)
    }

    pub fn depth(&self) -> Option<DepthBuffer> {
        self.depth
    }

    pub fn mirror(&self) -> Option<MirrorTexture> {
        self.mirror
    }

    /// Surfaces released from the runtime that `renderer` has not yet been
    /// told about.
    pub fn retired_surfaces(&self) -> &[SurfaceHandle] {
        &self.retired
    }

    /// Hands every retired surface to `renderer` for release.
    pub fn release_retired(&mut self, renderer: &dyn StereoRenderer) {
        for surface in self.retired.drain(..) {
            renderer.release_surface(surface);
        }
    }

    /// Reallocates the colour ring and depth buffer when `size` differs from
    /// the current allocation. Returns whether anything was reallocated; on
    /// error the previous allocation is kept.
    pub fn ensure_size(&mut self, size: UVec2) -> VrResult<bool> {
        if self.is_allocated() && self.size == size {
            return Ok(false);
        }

        let swap_set = self
            .session
            .runtime()
            .create_swap_texture_set(self.device, size)?;
        self.release_swap_set();

        log::info!(
            "[render] allocated {}x{} stereo target with {} colour buffers",
            size.x,
            size.y,
            swap_set.texture_count()
        );
        self.size = size;
        self.swap_set = Some(swap_set);
        self.depth = Some(DepthBuffer::allocate(size));
        Ok(true)
    }

    /// Advances the ring by one and makes the new colour buffer and the depth
    /// buffer the render destination. Returns false, doing nothing, when the
    /// target is unallocated.
    pub fn bind(&mut self, renderer: &dyn StereoRenderer) -> RenderResult<bool> {
        self.release_retired(renderer);
        let (Some(swap_set), Some(depth)) = (self.swap_set.as_mut(), self.depth) else {
            log::warn!("[render] bind skipped: stereo target is not allocated");
            return Ok(false);
        };

        swap_set.advance();
        let Some(color) = swap_set.current() else {
            return Ok(false);
        };
        renderer.set_render_surface(color, depth.surface())?;
        self.bound = true;
        Ok(true)
    }

    pub fn unbind(&mut self, renderer: &dyn StereoRenderer) {
        if !self.bound {
            return;
        }
        renderer.unset_render_surface();
        self.bound = false;
    }

    /// Makes sure a mirror texture of `size` exists, replacing one of a
    /// different size.
    pub fn ensure_mirror(&mut self, size: UVec2) -> VrResult<MirrorTexture> {
        if let Some(mirror) = self.mirror {
            if mirror.surface.size == size {
                return Ok(mirror);
            }
        }

        self.release_mirror();
        let mirror = self
            .session
            .runtime()
            .create_mirror_texture(self.device, size)?;
        log::debug!("[render] allocated {}x{} mirror texture", size.x, size.y);
        self.mirror = Some(mirror);
        Ok(mirror)
    }

    pub fn release_mirror(&mut self) {
        if let Some(mirror) = self.mirror.take() {
            self.retired.push(mirror.surface);
            self.session
                .runtime()
                .destroy_mirror_texture(self.device, mirror);
        }
    }

    /// Returns every runtime resource. The target can be reallocated later.
    pub fn release(&mut self) {
        self.release_mirror();
        self.release_swap_set();
    }

    fn release_swap_set(&mut self) {
        if let Some(swap_set) = self.swap_set.take() {
            self.retired.extend(swap_set.textures.iter().copied());
            self.session
                .runtime()
                .destroy_swap_texture_set(self.device, swap_set);
        }
        if let Some(depth) = self.depth.take() {
            self.retired.push(depth.surface());
        }
        self.size = UVec2::ZERO;
        self.bound = false;
    }
}

impl fmt::Debug for StereoRenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StereoRenderTarget")
            .field("device", &self.device)
            .field("size", &self.size)
            .field("current_index", &self.current_index())
            .field("buffer_count", &self.buffer_count())
            .field("mirror", &self.mirror.map(|mirror| mirror.surface.size))
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl Drop for StereoRenderTarget {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::HeadlessRenderer;
    use crate::vr::device::DEFAULT_HMD_CAPS;
    use crate::vr::{SimulatedProbe, SimulatedRuntime};
    use proptest::prelude::*;

    fn device_with(runtime: SimulatedRuntime) -> (Device, SimulatedProbe) {
        let probe = runtime.probe();
        let session = RuntimeSession::new(Box::new(runtime)).expect("simulated runtime initializes");
        let device = Device::acquire(session, DEFAULT_HMD_CAPS).expect("debug device available");
        (device, probe)
    }

    #[test]
    fn bind_without_allocation_is_noop() {
        let (device, _probe) = device_with(SimulatedRuntime::new());
        let mut target = StereoRenderTarget::new(&device);
        let renderer = HeadlessRenderer::new();

        assert!(!target.bind(&renderer).unwrap());
        target.unbind(&renderer);

        assert!(renderer.bind_history().is_empty());
        assert_eq!(renderer.clear_count(), 0);
    }

    #[test]
    fn ensure_size_only_reallocates_on_change() {
        let (device, probe) = device_with(SimulatedRuntime::new());
        let mut target = StereoRenderTarget::new(&device);

        assert!(target.ensure_size(UVec2::new(2364, 1461)).unwrap());
        assert!(!target.ensure_size(UVec2::new(2364, 1461)).unwrap());
        assert_eq!(probe.swap_sets_created(), 1);

        assert!(target.ensure_size(UVec2::new(1000, 800)).unwrap());
        assert_eq!(probe.swap_sets_created(), 2);
        assert_eq!(probe.live_swap_sets(), 1);
        assert_eq!(target.depth().map(|depth| depth.size()), Some(UVec2::new(1000, 800)));
    }

    #[test]
    fn bind_clears_and_unbind_restores() {
        let (device, _probe) = device_with(SimulatedRuntime::new());
        let mut target = StereoRenderTarget::new(&device);
        let renderer = HeadlessRenderer::new();
        target.ensure_size(UVec2::new(64, 32)).unwrap();

        assert!(target.bind(&renderer).unwrap());
        let (color, depth) = renderer.bound_surface().expect("target bound");
        assert_eq!(Some(color), target.color_surface());
        assert_eq!(Some(depth), target.depth().map(|depth| depth.surface()));
        assert_eq!(renderer.clear_count(), 1);

        target.unbind(&renderer);
        assert_eq!(renderer.bound_surface(), None);
        assert!(!target.is_bound());
    }

    #[test]
    fn mirror_is_reallocated_independently() {
        let (device, probe) = device_with(SimulatedRuntime::new());
        let mut target = StereoRenderTarget::new(&device);

        let first = target.ensure_mirror(UVec2::new(960, 540)).unwrap();
        assert_eq!(target.ensure_mirror(UVec2::new(960, 540)).unwrap(), first);
        let second = target.ensure_mirror(UVec2::new(480, 270)).unwrap();

        assert_ne!(first, second);
        assert_eq!(probe.live_mirrors(), 1);
        assert!(!target.is_allocated());
    }

    #[test]
    fn drop_releases_only_allocated_resources() {
        let (device, probe) = device_with(SimulatedRuntime::new());
        drop(StereoRenderTarget::new(&device));
        assert_eq!(probe.live_swap_sets(), 0);

        let mut target = StereoRenderTarget::new(&device);
        target.ensure_size(UVec2::new(64, 32)).unwrap();
        target.ensure_mirror(UVec2::new(32, 16)).unwrap();
        assert_eq!(probe.live_swap_sets(), 1);
        assert_eq!(probe.live_mirrors(), 1);

        drop(target);
        assert_eq!(probe.live_swap_sets(), 0);
        assert_eq!(probe.live_mirrors(), 0);
    }

    #[test]
    fn resize_hands_old_surfaces_to_renderer() {
        let (device, _probe) = device_with(SimulatedRuntime::new().with_swap_count(2));
        let mut target = StereoRenderTarget::new(&device);
        let renderer = HeadlessRenderer::new();
        target.ensure_size(UVec2::new(64, 32)).unwrap();
        let old_colors = target.swap_set().expect("allocated").textures.clone();
        let old_depth = target.depth().expect("allocated").surface();
        let old_mirror = target.ensure_mirror(UVec2::new(32, 16)).unwrap();

        target.ensure_size(UVec2::new(128, 64)).unwrap();
        target.ensure_mirror(UVec2::new(16, 8)).unwrap();
        assert_eq!(target.retired_surfaces().len(), 4);
        assert!(renderer.released_surfaces().is_empty());

        target.bind(&renderer).unwrap();
        let released = renderer.released_surfaces();
        assert_eq!(released.len(), 4);
        assert!(old_colors.iter().all(|surface| released.contains(surface)));
        assert!(released.contains(&old_depth));
        assert!(released.contains(&old_mirror.surface));
        assert!(target.retired_surfaces().is_empty());
    }

    proptest! {
        #[test]
        fn ring_index_returns_after_full_cycle(count in 1usize..6, warmup in 0usize..8) {
            let (device, _probe) = device_with(SimulatedRuntime::new().with_swap_count(count));
            let mut target = StereoRenderTarget::new(&device);
            let renderer = HeadlessRenderer::new();
            target.ensure_size(UVec2::new(16, 16)).unwrap();

            for _ in 0..warmup {
                target.bind(&renderer).unwrap();
                target.unbind(&renderer);
            }
            let start = target.current_index();
            prop_assert_eq!(target.buffer_count(), count);

            for step in 1..=count {
                target.bind(&renderer).unwrap();
                prop_assert_eq!(target.current_index(), (start + step) % count);
                target.unbind(&renderer);
            }
            prop_assert_eq!(target.current_index(), start);
        }
    }
}
