//! WebGPU render backend drawing into an offscreen display target

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, instrument};
use wgpu::*;

use super::quad::Quad;
use super::render::{ClearColor, RenderBackend};
use super::surface::TextureId;
use crate::capture::{decode, Frame};
use crate::error::PipelineError;
use crate::{DisplayConfig, GpuBackend};

const TARGET_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

const SHADER: &str = r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@group(0) @binding(0) var frame_texture: texture_2d<f32>;
@group(0) @binding(1) var frame_sampler: sampler;

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOut) -> @location(0) vec4<f32> {
    return textureSample(frame_texture, frame_sampler, in.uv);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

const VERTEX_ATTRIBUTES: [VertexAttribute; 2] = vertex_attr_array![0 => Float32x2, 1 => Float32x2];

impl From<GpuBackend> for Backends {
    fn from(backend: GpuBackend) -> Self {
        match backend {
            GpuBackend::Vulkan => Backends::VULKAN,
            GpuBackend::Metal => Backends::METAL,
            GpuBackend::Dx12 => Backends::DX12,
            GpuBackend::OpenGl => Backends::GL,
            GpuBackend::Auto => Backends::all(),
        }
    }
}

struct Imported {
    texture: Texture,
    bind_group: BindGroup,
    width: u32,
    height: u32,
}

/// External texture slot; GPU storage is (re)allocated on import
#[derive(Default)]
struct ExternalSlot {
    imported: Option<Imported>,
}

pub struct WgpuRenderer {
    device: Device,
    queue: Queue,
    pipeline: RenderPipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    vertex_buffer: Buffer,
    target: Texture,
    target_view: TextureView,
    textures: HashMap<TextureId, ExternalSlot>,
    next_texture: u32,
}

impl WgpuRenderer {
    /// Initialize WebGPU; must run on the render thread
    #[instrument(skip(config))]
    pub fn new(config: &DisplayConfig) -> Result<Self, PipelineError> {
        info!("Initializing WebGPU renderer");

        let instance = Instance::new(InstanceDescriptor {
            backends: config.gpu_backend.into(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| PipelineError::GpuContext("no suitable GPU adapter found".into()))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("Edgeview GPU Device"),
                required_features: Features::empty(),
                required_limits: Limits::downlevel_defaults(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| PipelineError::GpuContext(e.to_string()))?;

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("External Texture Layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::FRAGMENT,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("External Texture Sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Nearest,
            ..Default::default()
        });

        let vertex_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("Quad Vertices"),
            size: (std::mem::size_of::<Vertex>() * Quad::VERTEX_COUNT as usize) as u64,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let pipeline = Self::create_render_pipeline(&device, &bind_group_layout);
        let (target, target_view) = Self::create_target(&device, config.width, config.height);

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            vertex_buffer,
            target,
            target_view,
            textures: HashMap::new(),
            next_texture: 1,
        })
    }

    /// Offscreen texture holding the last presented image
    pub fn display_target(&self) -> &Texture {
        &self.target
    }

    fn create_target(device: &Device, width: u32, height: u32) -> (Texture, TextureView) {
        let texture = device.create_texture(&TextureDescriptor {
            label: Some("Display Target"),
            size: Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        (texture, view)
    }

    fn create_render_pipeline(device: &Device, layout: &BindGroupLayout) -> RenderPipeline {
        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("Display Shader"),
            source: ShaderSource::Wgsl(SHADER.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Display Pipeline Layout"),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });

        device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Display Pipeline"),
            layout: Some(&pipeline_layout),
            cache: None,
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as BufferAddress,
                    step_mode: VertexStepMode::Vertex,
                    attributes: &VERTEX_ATTRIBUTES,
                }],
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState::default(),
            multiview: None,
        })
    }

    fn allocate(&self, width: u32, height: u32) -> Imported {
        let texture = self.device.create_texture(&TextureDescriptor {
            label: Some("External Texture"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("External Texture Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::TextureView(&view),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        Imported {
            texture,
            bind_group,
            width,
            height,
        }
    }

    fn pass(&self, load: LoadOp<Color>, draw: Option<&BindGroup>) {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: Operations {
                        load,
                        store: StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some(bind_group) = draw {
                render_pass.set_pipeline(&self.pipeline);
                render_pass.set_bind_group(0, bind_group, &[]);
                render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                render_pass.draw(0..Quad::VERTEX_COUNT, 0..1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

/// The upload must cover exactly `width` x `height` RGBA pixels
fn check_upload_len(len: usize, width: u32, height: u32) -> Result<(), PipelineError> {
    let expected = decode::image_bytes(width, height, 4)
        .map_err(|e| PipelineError::GpuImportFailed(e.to_string()))?;
    if len != expected {
        return Err(PipelineError::GpuImportFailed(format!(
            "{} bytes for a {}x{} texture, expected {}",
            len, width, height, expected
        )));
    }
    Ok(())
}

impl RenderBackend for WgpuRenderer {
    fn create_external_texture(&mut self) -> Result<TextureId, PipelineError> {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        self.textures.insert(id, ExternalSlot::default());
        Ok(id)
    }

    fn import(&mut self, texture: TextureId, frame: &Frame) -> Result<(), PipelineError> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(PipelineError::GpuImportFailed("empty frame".into()));
        }
        let rgba = decode::to_rgba(&frame.data, &frame.meta)
            .map_err(|e| PipelineError::GpuImportFailed(e.to_string()))?;
        check_upload_len(rgba.len(), width, height)?;

        let needs_alloc = match self.textures.get(&texture) {
            None => return Err(PipelineError::GpuImportFailed("unknown texture".into())),
            Some(slot) => !slot
                .imported
                .as_ref()
                .is_some_and(|i| i.width == width && i.height == height),
        };
        if needs_alloc {
            debug!(width, height, "Allocating external texture storage");
            let imported = self.allocate(width, height);
            if let Some(slot) = self.textures.get_mut(&texture) {
                slot.imported = Some(imported);
            }
        }
        let Some(imported) = self.textures.get(&texture).and_then(|s| s.imported.as_ref()) else {
            return Err(PipelineError::GpuImportFailed("texture storage missing".into()));
        };

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &imported.texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &rgba,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        let (target, view) = Self::create_target(&self.device, width, height);
        self.target = target;
        self.target_view = view;
    }

    fn clear(&mut self, color: ClearColor) {
        self.pass(
            LoadOp::Clear(Color {
                r: color.r,
                g: color.g,
                b: color.b,
                a: color.a,
            }),
            None,
        );
    }

    fn draw_quad(&mut self, texture: TextureId, quad: &Quad) -> Result<(), PipelineError> {
        let vertices: [Vertex; 4] = std::array::from_fn(|i| Vertex {
            position: quad.positions[i],
            uv: quad.tex_coords[i],
        });
        self.queue
            .write_buffer(&self.vertex_buffer, 0, bytemuck::cast_slice(&vertices));

        let Some(imported) = self.textures.get(&texture).and_then(|s| s.imported.as_ref()) else {
            return Err(PipelineError::GpuContext(format!(
                "texture {} has no storage",
                texture.0
            )));
        };
        self.pass(LoadOp::Load, Some(&imported.bind_group));
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(slot) = self.textures.remove(&texture) {
            if let Some(imported) = slot.imported {
                imported.texture.destroy();
            }
        }
    }
}
