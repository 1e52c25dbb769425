//! GPU radix sort for f32 arrays.
//!
//! Sorts the raw IEEE-754 bit patterns with 32 single-bit passes of a stable
//! two-way partition (least significant bit first), ping-ponging between two
//! element buffers. That yields an unsigned-integer ordering, which is wrong
//! for negative floats: the sign bit makes negatives sort after positives,
//! most negative last. A final remap pass moves the negatives to the front
//! in reversed relative order.
//!
//! Per bit level the pass sequence is:
//!   1. identify: predicate per element into the scan buffer
//!   2. scan: exclusive prefix sum over the predicates (see [`crate::scan`])
//!   3. scatter: stable partition from the current input buffer into the
//!      cleared output buffer, roles swapping afterwards

use std::time::Instant;

use wgpu::util::DeviceExt;

use crate::context::{submit_and_wait, GpuContext};
use crate::errors::{Result, SortError};
use crate::scan::{ScanLevels, ScanPipelines};

/// Bit levels in a 32-bit key. The sort always runs all of them; skipping
/// provably-uniform high bits would only change timing, never placement.
const LEVELS: u32 = 32;

const THREADS: u32 = 256;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct PassParams {
    count: u32,
    level: u32,
    last_index: u32,
    workgroups_x: u32,
}

// The flag is 1 for a clear bit, so the scan yields each element's exclusive
// rank within the zero-bit group directly.
const IDENTIFY_WGSL: &str = r#"
struct PassParams {
    count: u32,
    level: u32,
    last_index: u32,
    workgroups_x: u32,
}

@group(0) @binding(0) var<uniform> params: PassParams;
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read_write> flags: array<u32>;

@compute @workgroup_size(256)
fn identify_bits(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x + gid.y * params.workgroups_x * 256u;
    if (idx >= params.count) { return; }
    let bits = bitcast<u32>(src[idx]);
    flags[idx] = 1u - ((bits >> params.level) & 1u);
}
"#;

// Stable two-way partition. zero_ranks[i] is the exclusive count of
// zero-bit elements before i; the rank of a one-bit element within its
// group is therefore i - zero_ranks[i]. The total zero count comes from the
// last element's rank plus its own predicate, and thread 0 records the
// totals for the sign-correction pass.
const SCATTER_WGSL: &str = r#"
struct PassParams {
    count: u32,
    level: u32,
    last_index: u32,
    workgroups_x: u32,
}

@group(0) @binding(0) var<uniform> params: PassParams;
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read> zero_ranks: array<u32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;
@group(0) @binding(4) var<storage, read_write> tally: array<u32>;

@compute @workgroup_size(256)
fn scatter(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x + gid.y * params.workgroups_x * 256u;
    if (idx >= params.count) { return; }

    let last = params.last_index;
    let last_bits = bitcast<u32>(src[last]);
    let zero_total = zero_ranks[last] + (1u - ((last_bits >> params.level) & 1u));

    let value = src[idx];
    let bit = (bitcast<u32>(value) >> params.level) & 1u;
    var dest: u32;
    if (bit == 0u) {
        dest = zero_ranks[idx];
    } else {
        dest = zero_total + (idx - zero_ranks[idx]);
    }
    dst[dest] = value;

    if (idx == 0u) {
        tally[0] = zero_total;
        tally[1] = params.count - zero_total;
    }
}
"#;

// After 32 unsigned passes the non-negatives occupy [0, tally[0]) in correct
// ascending order and the negatives occupy [tally[0], count) in descending
// numeric order. Reflect the negatives to the front, shift the rest behind.
const FLIP_NEGATIVES_WGSL: &str = r#"
struct PassParams {
    count: u32,
    level: u32,
    last_index: u32,
    workgroups_x: u32,
}

@group(0) @binding(0) var<uniform> params: PassParams;
@group(0) @binding(1) var<storage, read> src: array<f32>;
@group(0) @binding(2) var<storage, read> tally: array<u32>;
@group(0) @binding(3) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(256)
fn flip_negatives(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = gid.x + gid.y * params.workgroups_x * 256u;
    if (idx >= params.count) { return; }

    let value = src[idx];
    let non_negative = tally[0];
    let negative = params.count - non_negative;
    var dest: u32;
    if ((bitcast<u32>(value) & 0x80000000u) != 0u) {
        dest = negative - 1u - (idx - non_negative);
    } else {
        dest = negative + idx;
    }
    dst[dest] = value;
}
"#;

/// Device storage for one sorter instance, sized for `capacity` elements.
struct SortStorage {
    capacity: usize,
    element_a: wgpu::Buffer,
    element_b: wgpu::Buffer,
    flags: wgpu::Buffer,
    levels: ScanLevels,
    tally: wgpu::Buffer,
}

/// Microseconds spent in each phase of a sort, summed over all 32 passes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SortTimings {
    pub upload_us: f64,
    pub identify_us: f64,
    pub scan_us: f64,
    pub scatter_us: f64,
    pub flip_us: f64,
    pub total_us: f64,
}

pub struct FloatRadixSorter {
    identify_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    flip_pipeline: wgpu::ComputePipeline,
    identify_bgl: wgpu::BindGroupLayout,
    scatter_bgl: wgpu::BindGroupLayout,
    flip_bgl: wgpu::BindGroupLayout,
    scan: ScanPipelines,
    storage: Option<SortStorage>,
    count: usize,
}

impl FloatRadixSorter {
    /// Compile the compute pipelines. Buffers are allocated separately by
    /// [`configure`](Self::configure), or on demand by the first sort.
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

        let identify_bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("identify_bgl"),
                entries: &[bgl_entry(0, uniform), bgl_entry(1, ro), bgl_entry(2, rw)],
            });

        let scatter_bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scatter_bgl"),
                entries: &[
                    bgl_entry(0, uniform),
                    bgl_entry(1, ro),
                    bgl_entry(2, ro),
                    bgl_entry(3, rw),
                    bgl_entry(4, rw),
                ],
            });

        let flip_bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("flip_bgl"),
                entries: &[
                    bgl_entry(0, uniform),
                    bgl_entry(1, ro),
                    bgl_entry(2, ro),
                    bgl_entry(3, rw),
                ],
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

        let identify_pipeline =
            make_pipeline("identify_bits", IDENTIFY_WGSL, "identify_bits", &identify_bgl);
        let scatter_pipeline = make_pipeline("scatter", SCATTER_WGSL, "scatter", &scatter_bgl);
        let flip_pipeline =
            make_pipeline("flip_negatives", FLIP_NEGATIVES_WGSL, "flip_negatives", &flip_bgl);

        let scan = ScanPipelines::new(ctx);

        FloatRadixSorter {
            identify_pipeline,
            scatter_pipeline,
            flip_pipeline,
            identify_bgl,
            scatter_bgl,
            flip_bgl,
            scan,
            storage: None,
            count: 0,
        }
    }

    /// (Re)allocate device buffers for `capacity` elements, releasing any
    /// previous storage first. Called automatically when a sort exceeds the
    /// current capacity.
    pub fn configure(&mut self, ctx: &GpuContext, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(SortError::EmptyInput);
        }
        log::debug!("allocating sort buffers for {capacity} elements");

        // Old buffers go first so peak usage is one generation, and an OOM
        // during allocation leaves the sorter cleanly unconfigured.
        self.storage = None;
        self.count = 0;

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let bytes = (capacity * 4) as u64;
        let element_buffer = |label: &str| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let element_a = element_buffer("element_a");
        let element_b = element_buffer("element_b");
        let flags = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scan_flags"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let levels = self.scan.allocate_levels(ctx, capacity);
        let tally = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sign_tally"),
            size: 8,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(SortError::Allocation(err.to_string()));
        }

        self.storage = Some(SortStorage {
            capacity,
            element_a,
            element_b,
            flags,
            levels,
            tally,
        });
        Ok(())
    }

    /// Upload `data` and sort it on the device. The result stays in device
    /// memory until [`read_back`](Self::read_back).
    pub fn sort(&mut self, ctx: &GpuContext, data: &[f32]) -> Result<SortTimings> {
        let n = data.len();
        if n == 0 {
            return Err(SortError::EmptyInput);
        }
        let needs_realloc = self.storage.as_ref().map_or(true, |s| s.capacity < n);
        if needs_realloc {
            self.configure(ctx, n)?;
        }

        let t_upload = Instant::now();
        {
            let storage = self.storage.as_ref().expect("configured above");
            ctx.queue
                .write_buffer(&storage.element_a, 0, bytemuck::cast_slice(data));
        }
        let upload_us = t_upload.elapsed().as_secs_f64() * 1e6;

        let timings = self.run_passes(ctx, n, upload_us);
        self.count = n;
        Ok(timings)
    }

    /// Drive the 32 bit-level passes plus the sign correction over the first
    /// `n` elements already resident in `element_a`.
    fn run_passes(&self, ctx: &GpuContext, n: usize, upload_us: f64) -> SortTimings {
        let storage = self.storage.as_ref().expect("storage present");
        let total_wg = (n as u32).div_ceil(THREADS);
        let dx = total_wg.min(65535);
        let dy = total_wg.div_ceil(dx);

        let mut identify_us = 0.0;
        let mut scan_us = 0.0;
        let mut scatter_us = 0.0;

        for level in 0..LEVELS {
            log::trace!("bit pass {level}");
            let (src, dst) = if level % 2 == 0 {
                (&storage.element_a, &storage.element_b)
            } else {
                (&storage.element_b, &storage.element_a)
            };

            let params = PassParams {
                count: n as u32,
                level,
                last_index: (n - 1) as u32,
                workgroups_x: dx,
            };
            let params_buf = ctx
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("pass_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

            // Identify: predicate per element into the scan buffer.
            let t = Instant::now();
            let identify_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("identify_bg"),
                layout: &self.identify_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: storage.flags.as_entire_binding(),
                    },
                ],
            });
            let mut encoder = ctx.device.create_command_encoder(&Default::default());
            {
                let mut pass = encoder.begin_compute_pass(&Default::default());
                pass.set_pipeline(&self.identify_pipeline);
                pass.set_bind_group(0, &identify_bg, &[]);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            submit_and_wait(ctx, encoder);
            identify_us += t.elapsed().as_secs_f64() * 1e6;

            // Scan: predicates become exclusive zero-group ranks in place.
            let t = Instant::now();
            self.scan
                .exclusive_scan(ctx, &storage.flags, n, &storage.levels);
            scan_us += t.elapsed().as_secs_f64() * 1e6;

            // Scatter into a cleared output buffer, so indices a smaller
            // earlier sort never wrote cannot leak stale values.
            let t = Instant::now();
            let scatter_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("scatter_bg"),
                layout: &self.scatter_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: storage.flags.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: dst.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: storage.tally.as_entire_binding(),
                    },
                ],
            });
            let mut encoder = ctx.device.create_command_encoder(&Default::default());
            encoder.clear_buffer(dst, 0, Some((n * 4) as u64));
            {
                let mut pass = encoder.begin_compute_pass(&Default::default());
                pass.set_pipeline(&self.scatter_pipeline);
                pass.set_bind_group(0, &scatter_bg, &[]);
                pass.dispatch_workgroups(dx, dy, 1);
            }
            submit_and_wait(ctx, encoder);
            scatter_us += t.elapsed().as_secs_f64() * 1e6;
        }

        // 32 passes is even, so the unsigned ordering is back in element_a.
        // The sign correction reads it and writes the final result into
        // element_b.
        let t = Instant::now();
        let params = PassParams {
            count: n as u32,
            level: 0,
            last_index: (n - 1) as u32,
            workgroups_x: dx,
        };
        let params_buf = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("flip_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let flip_bg = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("flip_bg"),
            layout: &self.flip_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: storage.element_a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: storage.tally.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: storage.element_b.as_entire_binding(),
                },
            ],
        });
        let mut encoder = ctx.device.create_command_encoder(&Default::default());
        encoder.clear_buffer(&storage.element_b, 0, Some((n * 4) as u64));
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.flip_pipeline);
            pass.set_bind_group(0, &flip_bg, &[]);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        submit_and_wait(ctx, encoder);
        let flip_us = t.elapsed().as_secs_f64() * 1e6;

        let total_us = upload_us + identify_us + scan_us + scatter_us + flip_us;
        SortTimings {
            upload_us,
            identify_us,
            scan_us,
            scatter_us,
            flip_us,
            total_us,
        }
    }

    /// Copy the sorted result into `out`, which must hold exactly as many
    /// elements as the last sort.
    pub fn read_back(&self, ctx: &GpuContext, out: &mut [f32]) -> Result<()> {
        let storage = self.storage.as_ref().ok_or(SortError::NotConfigured)?;
        if self.count == 0 {
            return Err(SortError::NoResult);
        }
        if out.len() != self.count {
            return Err(SortError::SizeMismatch {
                expected: self.count,
                got: out.len(),
            });
        }

        let bytes = (self.count * 4) as u64;
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&storage.element_b, 0, &staging, 0, bytes);
        let sub_idx = ctx.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        let _ = ctx.device.poll(wgpu::PollType::Wait {
            submission_index: Some(sub_idx),
            timeout: None,
        });
        receiver
            .recv()
            .map_err(|e| SortError::Device(e.to_string()))?
            .map_err(|e| SortError::Device(e.to_string()))?;

        let mapped = buffer_slice.get_mapped_range();
        out.copy_from_slice(bytemuck::cast_slice(&mapped));
        drop(mapped);
        staging.unmap();
        Ok(())
    }

    /// Sort `data` and return the result, one call.
    pub fn sorted(&mut self, ctx: &GpuContext, data: &[f32]) -> Result<Vec<f32>> {
        self.sort(ctx, data)?;
        let mut out = vec![0.0f32; data.len()];
        self.read_back(ctx, &mut out)?;
        Ok(out)
    }

    /// Release all device buffers. A disposed sorter is unconfigured and can
    /// be reused after another `configure` (or a sort, which reconfigures on
    /// demand). Calling this twice is a no-op.
    pub fn dispose(&mut self) {
        self.storage = None;
        self.count = 0;
    }

    /// Element capacity of the currently allocated buffers.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.capacity)
    }

    /// Length of the last completed sort, 0 if none.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
