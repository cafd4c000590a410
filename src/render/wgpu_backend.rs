use super::*;
use bytemuck::{Pod, Zeroable};
use pollster::block_on;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.02,
    g: 0.02,
    b: 0.1,
    a: 1.0,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct CameraUniforms {
    model: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
}

impl Default for CameraUniforms {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY.to_cols_array_2d(),
            view: Mat4::IDENTITY.to_cols_array_2d(),
            projection: Mat4::IDENTITY.to_cols_array_2d(),
        }
    }
}

/// Offscreen wgpu renderer. Surfaces handed out by the VR runtime are
/// materialized as wgpu textures the first time they are bound.
pub struct WgpuStereoRenderer {
    _instance: wgpu::Instance,
    _adapter: wgpu::Adapter,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    hooks: DrawHookSlots,
    color_textures: RefCell<HashMap<u64, wgpu::Texture>>,
    depth_textures: RefCell<HashMap<u64, wgpu::Texture>>,
    surface_stack: RefCell<Vec<(SurfaceHandle, SurfaceHandle)>>,
    window_texture: RefCell<Option<wgpu::Texture>>,
    viewport: Cell<Option<Viewport>>,
    uniforms: Cell<CameraUniforms>,
    uniform_buffer: wgpu::Buffer,
}

impl WgpuStereoRenderer {
    pub fn initialize() -> RenderResult<Self> {
        block_on(Self::initialize_async())
    }

    async fn initialize_async() -> RenderResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::Backend(
                "failed to find a compatible GPU adapter",
            ))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("HMD Stereo Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|_| RenderError::Backend("failed to create wgpu device"))?;

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("HMD Camera Uniforms"),
            size: std::mem::size_of::<CameraUniforms>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::info!("[render] wgpu stereo renderer on {}", adapter.get_info().name);
        Ok(Self {
            _instance: instance,
            _adapter: adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            hooks: DrawHookSlots::default(),
            color_textures: RefCell::new(HashMap::new()),
            depth_textures: RefCell::new(HashMap::new()),
            surface_stack: RefCell::new(Vec::new()),
            window_texture: RefCell::new(None),
            viewport: Cell::new(None),
            uniforms: Cell::new(CameraUniforms::default()),
            uniform_buffer,
        })
    }

    pub fn hooks(&self) -> &DrawHookSlots {
        &self.hooks
    }

    pub fn device(&self) -> Arc<wgpu::Device> {
        Arc::clone(&self.device)
    }

    pub fn queue(&self) -> Arc<wgpu::Queue> {
        Arc::clone(&self.queue)
    }

    pub fn uniform_buffer(&self) -> &wgpu::Buffer {
        &self.uniform_buffer
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport.get()
    }

    /// Runs one frame: start hook, `draw`, finish hook.
    pub fn draw_frame(&self, draw: impl FnOnce(&dyn StereoRenderer)) {
        let stereo: &dyn StereoRenderer = self;
        stereo.make_current_context();
        self.hooks.run_start(stereo);
        draw(stereo);
        self.hooks.run_finish(stereo);
    }

    fn create_texture(
        &self,
        label: &'static str,
        size: UVec2,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    fn materialize(
        &self,
        textures: &RefCell<HashMap<u64, wgpu::Texture>>,
        surface: SurfaceHandle,
        label: &'static str,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) {
        let mut textures = textures.borrow_mut();
        let stale = textures.get(&surface.id).is_some_and(|texture| {
            texture.width() != surface.size.x.max(1) || texture.height() != surface.size.y.max(1)
        });
        if stale || !textures.contains_key(&surface.id) {
            textures.insert(
                surface.id,
                self.create_texture(label, surface.size, format, usage),
            );
        }
    }

    #[cfg(test)]
    fn cached_textures(&self) -> usize {
        self.color_textures.borrow().len() + self.depth_textures.borrow().len()
    }

    fn upload_uniforms(&self, update: impl FnOnce(&mut CameraUniforms)) {
        let mut uniforms = self.uniforms.get();
        update(&mut uniforms);
        self.uniforms.set(uniforms);
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
    }
}

fn extent(size: UVec2) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.x.max(1),
        height: size.y.max(1),
        depth_or_array_layers: 1,
    }
}

impl StereoRenderer for WgpuStereoRenderer {
    fn label(&self) -> &'static str {
        "WGPU Stereo Renderer"
    }

    fn make_current_context(&self) {
        log::trace!("[render] wgpu has no thread-bound context");
    }

    fn set_start_draw_hook(&self, hook: Option<DrawHook>) {
        self.hooks.set_start(hook);
    }

    fn set_finish_draw_hook(&self, hook: Option<DrawHook>) {
        self.hooks.set_finish(hook);
    }

    fn set_render_surface(&self, color: SurfaceHandle, depth: SurfaceHandle) -> RenderResult<()> {
        self.materialize(
            &self.color_textures,
            color,
            "HMD Eye Colour Buffer",
            COLOR_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        self.materialize(
            &self.depth_textures,
            depth,
            "HMD Depth Buffer",
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );

        let color_textures = self.color_textures.borrow();
        let depth_textures = self.depth_textures.borrow();
        let (Some(color_texture), Some(depth_texture)) =
            (color_textures.get(&color.id), depth_textures.get(&depth.id))
        else {
            return Err(RenderError::Backend("render surface was not materialized"));
        };
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("HMD Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("HMD Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        self.surface_stack.borrow_mut().push((color, depth));
        Ok(())
    }

    fn unset_render_surface(&self) {
        if self.surface_stack.borrow_mut().pop().is_none() {
            log::warn!("[render] render surface unset while none was bound");
        }
    }

    fn release_surface(&self, surface: SurfaceHandle) {
        let color = self.color_textures.borrow_mut().remove(&surface.id);
        let depth = self.depth_textures.borrow_mut().remove(&surface.id);
        for texture in color.into_iter().chain(depth) {
            texture.destroy();
        }
    }

    fn set_viewport(&self, viewport: Viewport) {
        self.viewport.set(Some(viewport));
    }

    fn set_model_matrix(&self, matrix: Mat4) {
        self.upload_uniforms(|uniforms| uniforms.model = matrix.to_cols_array_2d());
    }

    fn set_view_matrix(&self, matrix: Mat4) {
        self.upload_uniforms(|uniforms| uniforms.view = matrix.to_cols_array_2d());
    }

    fn set_projection_matrix(&self, matrix: Mat4) {
        self.upload_uniforms(|uniforms| uniforms.projection = matrix.to_cols_array_2d());
    }

    fn blit_to_window(&self, source: SurfaceHandle, window_size: UVec2) -> RenderResult<()> {
        self.materialize(
            &self.color_textures,
            source,
            "HMD Mirror Texture",
            COLOR_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );

        let mut window_texture = self.window_texture.borrow_mut();
        let window_extent = extent(window_size);
        let resize = window_texture.as_ref().map_or(true, |texture| {
            texture.width() != window_extent.width || texture.height() != window_extent.height
        });
        if resize {
            *window_texture = Some(self.create_texture(
                "HMD Window Image",
                window_size,
                COLOR_FORMAT,
                wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            ));
        }

        let color_textures = self.color_textures.borrow();
        let (Some(source_texture), Some(target_texture)) =
            (color_textures.get(&source.id), window_texture.as_ref())
        else {
            return Err(RenderError::Backend("mirror blit without textures"));
        };

        // Texture copies cannot scale; copy the overlapping region.
        let copy_extent = wgpu::Extent3d {
            width: source_texture.width().min(target_texture.width()),
            height: source_texture.height().min(target_texture.height()),
            depth_or_array_layers: 1,
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("HMD Mirror Blit Encoder"),
            });
        encoder.copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: source_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: target_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            copy_extent,
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}
