//! Work-efficient hierarchical exclusive prefix sum on GPU buffers.
//!
//! One thread group scans one block of `BLOCK` counters in shared memory
//! (Blelloch upsweep/downsweep) and emits the block total. When more than
//! one block exists, the totals form a smaller array that is scanned by the
//! same kernel recursively; the scanned totals are then added back to every
//! element of their block, one level at a time, unwinding the recursion.

use wgpu::util::DeviceExt;

use crate::context::{submit_and_wait, GpuContext};

/// Elements scanned per thread group. Must be a power of two: the in-block
/// reduction tree assumes it.
pub const BLOCK: usize = 2048;

const THREADS: u32 = 256;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ScanParams {
    count: u32,
    workgroups_x: u32,
    _pad0: u32,
    _pad1: u32,
}

// Each group loads eight slots per thread into shared memory, padding the
// tail of a partial block with zeros (the scan identity) without ever
// touching the buffer past `count`. The root of the reduction tree is the
// block total: it is written out for the next level and cleared in place,
// which is the base case the downsweep distributes from.
const SCAN_BLOCK_WGSL: &str = r#"
struct ScanParams {
    count: u32,
    workgroups_x: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<uniform> params: ScanParams;
@group(0) @binding(1) var<storage, read_write> data: array<u32>;
@group(0) @binding(2) var<storage, read_write> block_totals: array<u32>;

var<workgroup> tile: array<u32, 2048>;

@compute @workgroup_size(256)
fn scan_block(@builtin(local_invocation_id) lid: vec3<u32>,
              @builtin(workgroup_id) wid: vec3<u32>) {
    let block = wid.x + wid.y * params.workgroups_x;
    let base = block * 2048u;
    let t = lid.x;

    for (var k = 0u; k < 8u; k = k + 1u) {
        let slot = k * 256u + t;
        let src = base + slot;
        tile[slot] = select(0u, data[src], src < params.count);
    }

    // Upsweep: build partial sums bottom-up.
    var stride = 1u;
    var active_n = 1024u;
    loop {
        workgroupBarrier();
        for (var i = t; i < active_n; i = i + 256u) {
            let a = stride * (2u * i + 1u) - 1u;
            let b = stride * (2u * i + 2u) - 1u;
            tile[b] = tile[b] + tile[a];
        }
        stride = stride << 1u;
        active_n = active_n >> 1u;
        if (active_n == 0u) { break; }
    }

    workgroupBarrier();
    if (t == 0u) {
        block_totals[block] = tile[2047u];
        tile[2047u] = 0u;
    }

    // Downsweep: distribute the partial sums back down.
    active_n = 1u;
    stride = 1024u;
    loop {
        workgroupBarrier();
        for (var i = t; i < active_n; i = i + 256u) {
            let a = stride * (2u * i + 1u) - 1u;
            let b = stride * (2u * i + 2u) - 1u;
            let left = tile[a];
            tile[a] = tile[b];
            tile[b] = tile[b] + left;
        }
        active_n = active_n << 1u;
        stride = stride >> 1u;
        if (stride == 0u) { break; }
    }

    workgroupBarrier();
    for (var k = 0u; k < 8u; k = k + 1u) {
        let slot = k * 256u + t;
        let dst = base + slot;
        if (dst < params.count) { data[dst] = tile[slot]; }
    }
}
"#;

// Block 0's offset is zero, so it is skipped.
const ADD_OFFSETS_WGSL: &str = r#"
struct ScanParams {
    count: u32,
    workgroups_x: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<uniform> params: ScanParams;
@group(0) @binding(1) var<storage, read_write> data: array<u32>;
@group(0) @binding(2) var<storage, read> block_totals: array<u32>;

@compute @workgroup_size(256)
fn add_block_offsets(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x + gid.y * params.workgroups_x * 256u;
    if (idx >= params.count) { return; }
    let block = idx / 2048u;
    if (block == 0u) { return; }
    data[idx] = data[idx] + block_totals[block];
}
"#;

/// Buffers for the block totals of every recursion level, sized once for a
/// capacity and reused across scans of any count up to it. The chain ends
/// with a one-slot sink the terminal block writes its total into.
pub struct ScanLevels {
    totals: Vec<wgpu::Buffer>,
    sizes: Vec<usize>,
}

impl ScanLevels {
    /// Number of recursion levels the chain supports.
    pub fn depth(&self) -> usize {
        self.totals.len()
    }
}

pub struct ScanPipelines {
    scan_pipeline: wgpu::ComputePipeline,
    add_pipeline: wgpu::ComputePipeline,
    scan_bgl: wgpu::BindGroupLayout,
    add_bgl: wgpu::BindGroupLayout,
}

impl ScanPipelines {
    pub fn new(ctx: &GpuContext) -> Self {
        let bgl_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform = wgpu::BufferBindingType::Uniform;
        let ro = wgpu::BufferBindingType::Storage { read_only: true };
        let rw = wgpu::BufferBindingType::Storage { read_only: false };

        let scan_bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_bgl"),
                entries: &[bgl_entry(0, uniform), bgl_entry(1, rw), bgl_entry(2, rw)],
            });

        let add_bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scan_add_bgl"),
                entries: &[bgl_entry(0, uniform), bgl_entry(1, rw), bgl_entry(2, ro)],
            });

        let make_pipeline = |label: &str,
                             source: &str,
                             entry: &str,
                             layout: &wgpu::BindGroupLayout|
         -> wgpu::ComputePipeline {
            let shader = ctx
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
            let pl = ctx
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[layout],
                    push_constant_ranges: &[],
                });
            ctx.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&pl),
                    module: &shader,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    cache: None,
                })
        };

        let scan_pipeline = make_pipeline("scan_block", SCAN_BLOCK_WGSL, "scan_block", &scan_bgl);
        let add_pipeline =
            make_pipeline("scan_add", ADD_OFFSETS_WGSL, "add_block_offsets", &add_bgl);

        ScanPipelines {
            scan_pipeline,
            add_pipeline,
            scan_bgl,
            add_bgl,
        }
    }

    /// Allocate the block-total chain for scans of up to `capacity` elements.
    pub fn allocate_levels(&self, ctx: &GpuContext, capacity: usize) -> ScanLevels {
        let mut sizes = Vec::new();
        let mut cur = capacity;
        loop {
            let blocks = cur.div_ceil(BLOCK);
            sizes.push(blocks);
            if blocks == 1 {
                break;
            }
            cur = blocks;
        }

        let totals = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                ctx.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("scan_totals_l{i}")),
                    size: (size * 4) as u64,
                    usage: wgpu::BufferUsages::STORAGE,
                    mapped_at_creation: false,
                })
            })
            .collect();

        ScanLevels { totals, sizes }
    }

    /// In-place exclusive prefix sum over the first `count` counters of
    /// `data`. `count` must be at least 1 and within the capacity `levels`
    /// was allocated for; violating either is a caller bug.
    pub fn exclusive_scan(
        &self,
        ctx: &GpuContext,
        data: &wgpu::Buffer,
        count: usize,
        levels: &ScanLevels,
    ) {
        debug_assert!(count > 0, "scan of zero elements");
        self.scan_level(ctx, data, count, levels, 0);
    }

    fn scan_level(
        &self,
        ctx: &GpuContext,
        data: &wgpu::Buffer,
        count: usize,
        levels: &ScanLevels,
        depth: usize,
    ) {
        let blocks = count.div_ceil(BLOCK);
        assert!(
            depth < levels.depth() && blocks <= levels.sizes[depth],
            "scan recursion exceeded the allocated level chain"
        );
        let totals = &levels.totals[depth];

        let dx = (blocks as u32).min(65535);
        let dy = (blocks as u32).div_ceil(dx);
        let params = ScanParams {
            count: count as u32,
            workgroups_x: dx,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buf = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scan_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let scan_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_bg"),
            layout: &self.scan_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: totals.as_entire_binding(),
                },
            ],
        });

        let mut encoder = ctx.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.scan_pipeline);
            pass.set_bind_group(0, &scan_bg, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        submit_and_wait(ctx, encoder);

        if blocks == 1 {
            // Terminal level: the single block's scan is already global and
            // its total went into the one-slot sink.
            return;
        }

        self.scan_level(ctx, totals, blocks, levels, depth + 1);

        // Offset every element by its block's scanned total.
        let threads_total = (count as u32).div_ceil(THREADS);
        let add_dx = threads_total.min(65535);
        let add_dy = threads_total.div_ceil(add_dx);
        let add_params = ScanParams {
            count: count as u32,
            workgroups_x: add_dx,
            _pad0: 0,
            _pad1: 0,
        };
        let add_params_buf = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("scan_add_params"),
                contents: bytemuck::bytes_of(&add_params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let add_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scan_add_bg"),
            layout: &self.add_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: add_params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: totals.as_entire_binding(),
                },
            ],
        });

        let mut encoder = ctx.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.add_pipeline);
            pass.set_bind_group(0, &add_bg, &[]);
            pass.dispatch_workgroups(add_dx, add_dy, 1);
        }
        submit_and_wait(ctx, encoder);
    }
}
