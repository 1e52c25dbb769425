//! GPU device setup shared by every pipeline in the crate.

use crate::errors::{Result, SortError};

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    pub backend: String,
}

impl GpuContext {
    /// Acquire a compute-capable adapter and device.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|_| SortError::NoAdapter)?;

        let adapter_name = adapter.get_info().name.clone();
        let backend = format!("{:?}", adapter.get_info().backend);
        log::debug!("using adapter {adapter_name} ({backend})");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("floatradix"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| SortError::Device(e.to_string()))?;

        Ok(GpuContext {
            device,
            queue,
            adapter_name,
            backend,
        })
    }
}

/// Submit one encoder and block until the device has drained it. Every
/// dispatch boundary in the sort is a full device-wide barrier, so later
/// kernels may rely on earlier ones having completed.
pub fn submit_and_wait(ctx: &GpuContext, encoder: wgpu::CommandEncoder) {
    let idx = ctx.queue.submit(std::iter::once(encoder.finish()));
    let _ = ctx.device.poll(wgpu::PollType::Wait {
        submission_index: Some(idx),
        timeout: None,
    });
}
