//! wgpu backend.
//!
//! The Gaussian blur runs as a compute shader over storage buffers. The other
//! kernels run on the host implementation until they get shaders of their own.

use ndarray::Array3;
use std::borrow::Cow;
use tracing::{debug, info};
use wgpu::{PollType, util::DeviceExt};

use crate::{
    device::{DeviceCapabilities, DeviceError},
    enums::{Axis, GvfVariant},
    fields::{VectorComponent, VectorField},
    kernels::{
        BlurMask, CpuKernels, GvfParams, OccupancyRule, RadiusRange, TdfResponse, TubeKernels,
        VectorFieldParams,
    },
    volume::Samples,
};

const WORKGROUP_SIZE: u32 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct BlurParams {
    width: u32,
    height: u32,
    depth: u32,
    half_width: u32,
}

/// Device and queue of the selected adapter, with what it can do.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: DeviceCapabilities,
}

impl GpuContext {
    /// Request a high performance adapter with compute support.
    ///
    /// # Errors
    ///
    /// Returns error if no adapter is available, the adapter cannot run compute
    /// shaders, or the device request fails
    pub async fn acquire() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|err| DeviceError::Other(format!("no adapter: {err}")))?;

        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(DeviceError::Other("adapter does not support compute shaders".into()));
        }

        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Tube Device"),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|err| DeviceError::Other(format!("device request failed: {err}")))?;

        // vector field buffers are bound as storage, so both limits apply
        let max_alloc_bytes = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        let supports_3d_write = adapter
            .get_texture_format_features(wgpu::TextureFormat::Rgba32Float)
            .allowed_usages
            .contains(wgpu::TextureUsages::STORAGE_BINDING);
        let capabilities = DeviceCapabilities {
            name: adapter.get_info().name,
            max_alloc_bytes,
            supports_3d_write,
            global_mem_bytes: None,
        };
        info!(
            device = %capabilities.name,
            backend = ?adapter.get_info().backend,
            max_alloc_bytes,
            supports_3d_write,
            "adapter acquired"
        );

        Ok(Self {
            device,
            queue,
            capabilities,
        })
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }
}

pub struct GpuKernels {
    context: GpuContext,
    blur_pipeline: wgpu::ComputePipeline,
    blur_layout: wgpu::BindGroupLayout,
    host: CpuKernels,
}

impl GpuKernels {
    pub fn new(context: GpuContext) -> Self {
        let device = &context.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Gaussian Blur Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/gaussian_blur.wgsl"))),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let blur_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Gaussian Blur Bind Group Layout"),
            entries: &[
                // Volume
                storage(0, true),
                // Mask weights
                storage(1, true),
                // Output
                storage(2, false),
                // Params
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Gaussian Blur Pipeline Layout"),
            bind_group_layouts: &[&blur_layout],
            push_constant_ranges: &[],
        });

        let blur_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Gaussian Blur Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Self {
            context,
            blur_pipeline,
            blur_layout,
            host: CpuKernels,
        }
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.context.capabilities()
    }

    fn blur_on_device(
        &self,
        volume: &[f32],
        dim: (usize, usize, usize),
        mask: &BlurMask,
    ) -> Result<Vec<f32>, DeviceError> {
        let device = &self.context.device;
        let (depth, height, width) = dim;
        let params = BlurParams {
            width: width as u32,
            height: height as u32,
            depth: depth as u32,
            half_width: mask.half_width() as u32,
        };
        let size = std::mem::size_of_val(volume) as u64;

        let volume_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Blur Volume Buffer"),
            contents: bytemuck::cast_slice(volume),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let weights_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Blur Weights Buffer"),
            contents: bytemuck::cast_slice(mask.weights()),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Blur Params Buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blur Output Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Blur Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Gaussian Blur Bind Group"),
            layout: &self.blur_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: volume_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: weights_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Gaussian Blur Encoder"),
        });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Gaussian Blur Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.blur_pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let (x, y, z) = workgroups(params);
            compute_pass.dispatch_workgroups(x, y, z);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, size);
        self.context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| DeviceError::TransientQueue(err.to_string()))?;
        futures::executor::block_on(receiver)
            .map_err(|_| DeviceError::TransientQueue("map callback dropped".into()))?
            .map_err(|err| DeviceError::TransientQueue(err.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let result = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }
}

fn workgroups(params: BlurParams) -> (u32, u32, u32) {
    (
        params.width.div_ceil(WORKGROUP_SIZE),
        params.height.div_ceil(WORKGROUP_SIZE),
        params.depth.div_ceil(WORKGROUP_SIZE),
    )
}

impl TubeKernels for GpuKernels {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn scan_line_occupancy(
        &self,
        samples: &Samples,
        axis: Axis,
        rule: OccupancyRule,
    ) -> Result<Vec<u16>, DeviceError> {
        self.host.scan_line_occupancy(samples, axis, rule)
    }

    fn gaussian_blur(&self, volume: &Array3<f32>, mask: &BlurMask) -> Result<Array3<f32>, DeviceError> {
        let bytes = (volume.len() * std::mem::size_of::<f32>()) as u64;
        let contiguous = volume.as_slice();
        match contiguous {
            Some(data) if bytes <= self.capabilities().max_alloc_bytes => {
                let blurred = self.blur_on_device(data, volume.dim(), mask)?;
                Array3::from_shape_vec(volume.dim(), blurred)
                    .map_err(|err| DeviceError::Other(err.to_string()))
            }
            _ => {
                debug!(bytes, "volume exceeds a storage binding, blurring on the host");
                self.host.gaussian_blur(volume, mask)
            }
        }
    }

    fn create_vector_field<C: VectorComponent>(
        &self,
        volume: &Array3<f32>,
        params: VectorFieldParams,
        split_z: usize,
        first: &mut [C],
        second: &mut [C],
    ) -> Result<(), DeviceError> {
        self.host.create_vector_field(volume, params, split_z, first, second)
    }

    fn gradient_vector_flow(
        &self,
        field: &VectorField,
        variant: GvfVariant,
        params: GvfParams,
    ) -> Result<VectorField, DeviceError> {
        self.host.gradient_vector_flow(field, variant, params)
    }

    fn circle_fitting_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        self.host.circle_fitting_tdf(field, radii)
    }

    fn spline_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        self.host.spline_tdf(field, radii)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dispatch_covers_partial_workgroups() {
        let params = BlurParams {
            width: 9,
            height: 8,
            depth: 1,
            half_width: 2,
        };
        assert_eq!(workgroups(params), (3, 2, 1));
        assert_eq!(std::mem::size_of::<BlurParams>(), 16);
    }

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn device_blur_matches_host_blur() {
        let context = futures::executor::block_on(GpuContext::acquire()).unwrap();
        let kernels = GpuKernels::new(context);
        let volume = Array3::from_shape_fn((6, 7, 9), |(z, y, x)| ((x * 7 + y * 3 + z) % 11) as f32 / 10.0);
        let mask = BlurMask::new(1.0);

        let device = kernels.gaussian_blur(&volume, &mask).unwrap();
        let host = CpuKernels.gaussian_blur(&volume, &mask).unwrap();
        for (a, b) in device.iter().zip(host.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }
}
