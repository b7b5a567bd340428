//! GPU compute orchestrator (spec §4.D): one device, one queue, two compute
//! kernels (matrix-vector multiply and brute-force similarity), fixed
//! buffers sized for an upper bound, bind groups built once at construction.
//!
//! wgpu has no literal equivalent of a raw Vulkan buffer kept persistently
//! mapped across submits — its safety model unmaps once a submission
//! references the buffer. The orchestrator gets as close to the spec's
//! "mapped persistently" intent as wgpu allows: the same fixed buffers are
//! reused call after call (no per-dispatch allocation), uploads go through
//! `Queue::write_buffer`, and readback maps the same staging buffer every
//! time rather than creating a fresh one.

use crate::error::{Error, Result};
use std::sync::mpsc;

const WORKGROUP_SIZE: u32 = 256;

const MATMUL_SHADER: &str = include_str!("shaders/matmul.wgsl");
const SIMILARITY_SHADER: &str = include_str!("shaders/similarity.wgsl");

pub struct GpuOrchestrator {
    device: wgpu::Device,
    queue: wgpu::Queue,

    matmul_pipeline: wgpu::ComputePipeline,
    matmul_bind_group: wgpu::BindGroup,
    weights_buf: wgpu::Buffer,
    mm_input_buf: wgpu::Buffer,
    mm_output_buf: wgpu::Buffer,
    mm_staging_buf: wgpu::Buffer,
    max_vec_len: usize,

    sim_pipeline: wgpu::ComputePipeline,
    sim_bind_group: wgpu::BindGroup,
    sim_vectors_buf: wgpu::Buffer,
    sim_query_buf: wgpu::Buffer,
    sim_scores_buf: wgpu::Buffer,
    sim_staging_buf: wgpu::Buffer,
    capacity: usize,
    dim: usize,
}

fn make_pipeline(
    device: &wgpu::Device,
    label: &str,
    shader_src: &str,
    push_constant_size: u32,
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(shader_src.into()),
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[0u32, 1, 2].map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage {
                    read_only: binding != 2,
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }),
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[wgpu::PushConstantRange {
            stages: wgpu::ShaderStages::COMPUTE,
            range: 0..push_constant_size,
        }],
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: "main",
        compilation_options: Default::default(),
        cache: None,
    });

    (pipeline, bind_group_layout)
}

/// Maps the `.neuromemo.json` `gpu_power_preference` string onto wgpu's
/// adapter request. An unrecognized value is treated as `"high-performance"`
/// rather than rejected — this preference is a hint, not a contract.
pub fn parse_power_preference(s: &str) -> wgpu::PowerPreference {
    match s {
        "low-power" => wgpu::PowerPreference::LowPower,
        _ => wgpu::PowerPreference::HighPerformance,
    }
}

fn storage_buffer(device: &wgpu::Device, label: &str, size: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(4),
        usage: wgpu::BufferUsages::STORAGE | extra,
        mapped_at_creation: false,
    })
}

impl GpuOrchestrator {
    /// `weights_bytes` is the upper bound for the uploaded weights region.
    /// `max_vec_len` is the largest vector the matmul kernel will ever
    /// produce/consume (`max(dim, hidden_dim, vocab_size)`). `capacity` and
    /// `dim` size the similarity kernel's vector index buffers.
    pub fn new(
        weights_bytes: usize,
        max_vec_len: usize,
        capacity: usize,
        dim: usize,
        power_preference: wgpu::PowerPreference,
    ) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::GpuInit("no compatible GPU adapter found".into()))?;

        let push_constant_size = 12u32; // three u32s, both kernels
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("neuromemo-device"),
                required_features: wgpu::Features::PUSH_CONSTANTS,
                required_limits: wgpu::Limits {
                    max_push_constant_size: push_constant_size,
                    ..wgpu::Limits::downlevel_defaults()
                },
            },
            None,
        ))
        .map_err(|e| Error::GpuInit(format!("device request failed: {e}")))?;

        let (matmul_pipeline, matmul_bgl) =
            make_pipeline(&device, "matmul", MATMUL_SHADER, push_constant_size);
        let (sim_pipeline, sim_bgl) =
            make_pipeline(&device, "similarity", SIMILARITY_SHADER, push_constant_size);

        let weights_buf = storage_buffer(
            &device,
            "weights",
            weights_bytes as u64,
            wgpu::BufferUsages::COPY_DST,
        );
        let mm_input_buf = storage_buffer(
            &device,
            "mm_input",
            (max_vec_len * 4) as u64,
            wgpu::BufferUsages::COPY_DST,
        );
        let mm_output_buf = storage_buffer(
            &device,
            "mm_output",
            (max_vec_len * 4) as u64,
            wgpu::BufferUsages::COPY_SRC,
        );
        let mm_staging_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("mm_staging"),
            size: (max_vec_len * 4) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let matmul_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matmul"),
            layout: &matmul_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: weights_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: mm_input_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: mm_output_buf.as_entire_binding(),
                },
            ],
        });

        let sim_vectors_buf = storage_buffer(
            &device,
            "sim_vectors",
            (capacity * dim * 4) as u64,
            wgpu::BufferUsages::COPY_DST,
        );
        let sim_query_buf = storage_buffer(
            &device,
            "sim_query",
            (dim * 4) as u64,
            wgpu::BufferUsages::COPY_DST,
        );
        let sim_scores_buf = storage_buffer(
            &device,
            "sim_scores",
            (capacity * 4) as u64,
            wgpu::BufferUsages::COPY_SRC,
        );
        let sim_staging_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sim_staging"),
            size: (capacity * 4).max(4) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sim_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("similarity"),
            layout: &sim_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: sim_vectors_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sim_query_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: sim_scores_buf.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            device,
            queue,
            matmul_pipeline,
            matmul_bind_group,
            weights_buf,
            mm_input_buf,
            mm_output_buf,
            mm_staging_buf,
            max_vec_len,
            sim_pipeline,
            sim_bind_group,
            sim_vectors_buf,
            sim_query_buf,
            sim_scores_buf,
            sim_staging_buf,
            capacity,
            dim,
        })
    }

    /// Upload the whole weights arena once, after model load.
    pub fn upload_weights(&self, bytes: &[u8]) {
        self.queue.write_buffer(&self.weights_buf, 0, bytes);
    }

    fn check_error_scope(&self) -> Result<()> {
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::GpuDispatch(format!("{err}")));
        }
        Ok(())
    }

    fn read_back(&self, staging: &wgpu::Buffer, len: usize) -> Result<Vec<f32>> {
        let byte_len = (len * 4) as u64;
        let slice = staging.slice(0..byte_len);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::GpuDispatch("map_async callback never fired".into()))?
            .map_err(|e| Error::GpuDispatch(format!("buffer map failed: {e}")))?;

        let data = slice.get_mapped_range();
        let floats: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(floats)
    }

    /// `weight_offset` is an element offset (in `f32`s) into the shared
    /// weights buffer; `input` is consumed as the first `n` elements.
    pub fn matmul(&self, weight_offset: usize, input: &[f32], n: usize, d: usize) -> Result<Vec<f32>> {
        if n > self.max_vec_len || d > self.max_vec_len {
            return Err(Error::GpuDispatch(format!(
                "matmul dims ({n}, {d}) exceed buffer capacity {}",
                self.max_vec_len
            )));
        }

        self.queue
            .write_buffer(&self.mm_input_buf, 0, bytemuck::cast_slice(&input[..n]));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("matmul"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("matmul"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.matmul_pipeline);
            pass.set_bind_group(0, &self.matmul_bind_group, &[]);
            let mut pc = Vec::with_capacity(12);
            pc.extend_from_slice(&(weight_offset as u32).to_le_bytes());
            pc.extend_from_slice(&(n as u32).to_le_bytes());
            pc.extend_from_slice(&(d as u32).to_le_bytes());
            pass.set_push_constants(0, &pc);
            let groups = (d as u32 + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
            pass.dispatch_workgroups(groups.max(1), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.mm_output_buf, 0, &self.mm_staging_buf, 0, (d * 4) as u64);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        self.check_error_scope()?;

        self.read_back(&self.mm_staging_buf, d)
    }

    /// `vectors` is the packed `count x dim` candidate region (already
    /// compacted by the caller); `metric` is `1` for cosine, `2` for dot.
    pub fn similarity(&self, vectors: &[f32], query: &[f32], count: usize, metric: u32) -> Result<Vec<f32>> {
        if count > self.capacity {
            return Err(Error::GpuDispatch(format!(
                "similarity candidate count {count} exceeds buffer capacity {}",
                self.capacity
            )));
        }
        if query.len() != self.dim {
            return Err(Error::GpuDispatch(format!(
                "query dim {} does not match index dim {}",
                query.len(),
                self.dim
            )));
        }

        self.queue
            .write_buffer(&self.sim_vectors_buf, 0, bytemuck::cast_slice(vectors));
        self.queue
            .write_buffer(&self.sim_query_buf, 0, bytemuck::cast_slice(query));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("similarity"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("similarity"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.sim_pipeline);
            pass.set_bind_group(0, &self.sim_bind_group, &[]);
            let mut pc = Vec::with_capacity(12);
            pc.extend_from_slice(&(count as u32).to_le_bytes());
            pc.extend_from_slice(&(self.dim as u32).to_le_bytes());
            pc.extend_from_slice(&metric.to_le_bytes());
            pass.set_push_constants(0, &pc);
            let groups = (count as u32 + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
            pass.dispatch_workgroups(groups.max(1), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.sim_scores_buf, 0, &self.sim_staging_buf, 0, (count * 4) as u64);
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        self.check_error_scope()?;

        self.read_back(&self.sim_staging_buf, count)
    }
}
