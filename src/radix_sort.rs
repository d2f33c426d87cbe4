// Radix sort for splat depth ordering
// 3-Pass Architecture (Upsweep-Spine-Downsweep) inspired by vrdx
// Pass 1: Upsweep - Build local histograms per partition
// Pass 2: Spine - Prefix sum on partition and global histograms
// Pass 3: Downsweep - Scatter elements using computed offsets
//
// Four 8-bit digit passes cover the full 32-bit key. Every pass is a stable
// counting sort, so equal keys keep their relative order.

use rayon::prelude::*;
use tracing::{debug, warn};
use wgpu::BufferUsages;

use crate::error::SplatResult;
use crate::gpu::{CommandEncoder, GpuBuffer, GpuDevice, KernelPass, KernelTarget};
use crate::gpu_pipelines::{KernelParams, SplatKernel};

const RADIX: usize = 256;
const BLOCK_SIZE: usize = 256 * 4; // 1024
const DIGIT_PASSES: usize = 4;

/// Map an f32 to a u32 whose unsigned ordering matches the float ordering.
///
/// Positive values get the sign bit set; negative values have every bit inverted.
#[inline]
pub fn float_to_sortable_uint(f: f32) -> u32 {
    let bits = f.to_bits();
    let mask = (((bits as i32) >> 31) as u32) | 0x8000_0000;
    bits ^ mask
}

/// Inverse of [`float_to_sortable_uint`]
#[inline]
pub fn sortable_uint_to_float(u: u32) -> f32 {
    let mask = (u >> 31).wrapping_sub(1) | 0x8000_0000;
    f32::from_bits(u ^ mask)
}

/// Per-pass parameters, carried in the kernel uniform as count / arg0..arg2
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SortParams {
    pub max_element_count: u32,
    pub bit_shift: u32,
    pub pass_index: u32, // Pass index (0-3)
    pub num_partitions: u32,
}

impl SortParams {
    fn kernel_params(&self) -> KernelParams {
        KernelParams {
            count: self.max_element_count,
            arg0: self.bit_shift,
            arg1: self.pass_index,
            arg2: self.num_partitions,
            ..Default::default()
        }
    }
}

/// Scratch memory for one sorter, sized at prepare time
#[derive(Debug)]
pub struct SortResources {
    pub global_histogram: GpuBuffer,
    pub partition_histogram: GpuBuffer,
    pub keys_temp: GpuBuffer,
    pub values_temp: GpuBuffer,
    pub num_partitions: u32,
    pub capacity: u32,
}

/// Parallel key/value sort consumed by the frame pipeline
pub trait SortEngine: Send + Sync {
    /// Allocate scratch memory for up to `capacity` keys
    fn prepare(&self, device: &GpuDevice, capacity: u32) -> SortResources;

    /// Stable ascending sort of the first `count` values by keys, in place.
    /// Keys are consumed (left in sorted order). `count` may vary between calls
    /// as long as it does not exceed the prepared capacity.
    fn dispatch(
        &self,
        encoder: &mut CommandEncoder,
        resources: &mut SortResources,
        keys: &mut GpuBuffer,
        values: &mut GpuBuffer,
        count: u32,
    ) -> SplatResult<()>;
}

/// LSD radix sort with 8-bit digits
#[derive(Debug, Default, Clone, Copy)]
pub struct RadixSortEngine;

pub fn create_radix_sort_buffers(device: &GpuDevice, max_elements: usize) -> SortResources {
    let num_partitions = max_elements.div_ceil(BLOCK_SIZE).max(1) as u32;

    // Global histogram: 4 passes * RADIX bins (1024 total)
    let global_histogram = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("radix_sort_global_histogram"),
        size: (RADIX * DIGIT_PASSES * 4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    // Partition histogram: RADIX counts per partition
    let partition_histogram = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("radix_sort_partition_histogram"),
        size: (RADIX * num_partitions as usize * 4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    // Temp buffers for ping-pong
    let keys_temp = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("radix_sort_keys_temp"),
        size: (max_elements.max(1) * 4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let values_temp = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("radix_sort_values_temp"),
        size: (max_elements.max(1) * 4) as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    debug!(
        "Created radix sort buffers: capacity {}, {} partitions",
        max_elements, num_partitions
    );

    SortResources {
        global_histogram,
        partition_histogram,
        keys_temp,
        values_temp,
        num_partitions,
        capacity: max_elements as u32,
    }
}

impl SortEngine for RadixSortEngine {
    fn prepare(&self, device: &GpuDevice, capacity: u32) -> SortResources {
        create_radix_sort_buffers(device, capacity as usize)
    }

    fn dispatch(
        &self,
        encoder: &mut CommandEncoder,
        resources: &mut SortResources,
        keys: &mut GpuBuffer,
        values: &mut GpuBuffer,
        count: u32,
    ) -> SplatResult<()> {
        let limit = resources
            .capacity
            .min(keys.len_words() as u32)
            .min(values.len_words() as u32);
        let count = if count > limit {
            warn!(
                "Sort count {} exceeds prepared capacity {}, clamping",
                count, limit
            );
            limit
        } else {
            count
        };
        if count < 2 {
            return Ok(());
        }
        execute_radix_sort(encoder, resources, keys, values, count)
    }
}

/// Execute the four digit passes, each as upsweep / spine / downsweep.
///
/// Passes ping-pong between the caller's buffers and the temp buffers; with an
/// even number of passes the result lands back in `keys` / `values`.
pub fn execute_radix_sort(
    encoder: &mut CommandEncoder,
    resources: &mut SortResources,
    keys: &mut GpuBuffer,
    values: &mut GpuBuffer,
    count: u32,
) -> SplatResult<()> {
    let num_partitions = count.div_ceil(BLOCK_SIZE as u32);
    let SortResources {
        global_histogram,
        partition_histogram,
        keys_temp,
        values_temp,
        ..
    } = resources;
    let mut histograms = Histograms {
        global: global_histogram,
        partitions: partition_histogram,
    };

    for pass_idx in 0..DIGIT_PASSES {
        let params = SortParams {
            max_element_count: count,
            bit_shift: (pass_idx * 8) as u32,
            pass_index: pass_idx as u32,
            num_partitions,
        };
        if pass_idx % 2 == 0 {
            digit_pass(encoder, &params, &mut histograms, keys, values, keys_temp, values_temp)?;
        } else {
            digit_pass(encoder, &params, &mut histograms, keys_temp, values_temp, keys, values)?;
        }
    }
    Ok(())
}

struct Histograms<'a> {
    global: &'a mut GpuBuffer,
    partitions: &'a mut GpuBuffer,
}

/// One digit: histogram, offsets, scatter from `src` into `dst`
fn digit_pass(
    encoder: &mut CommandEncoder,
    params: &SortParams,
    histograms: &mut Histograms,
    src_keys: &GpuBuffer,
    src_values: &GpuBuffer,
    dst_keys: &mut GpuBuffer,
    dst_values: &mut GpuBuffer,
) -> SplatResult<()> {
    let n = params.max_element_count as usize;
    let pass_idx = params.pass_index;

    let upsweep_pass = KernelPass::new(SplatKernel::RadixUpsweep, params.max_element_count)
        .label(format!("radix_upsweep_p{}", pass_idx))
        .workgroups(params.num_partitions)
        .uniform(params.kernel_params())
        .buffer(src_keys)
        .buffer(&*histograms.partitions);
    if encoder.dispatch(upsweep_pass)? == KernelTarget::Host {
        upsweep(params, &src_keys.words()[..n], histograms.partitions.words_mut());
    }

    let spine_pass = KernelPass::new(SplatKernel::RadixSpine, RADIX as u32)
        .label(format!("radix_spine_p{}", pass_idx))
        .workgroups(1)
        .uniform(params.kernel_params())
        .buffer(&*histograms.global)
        .buffer(&*histograms.partitions);
    if encoder.dispatch(spine_pass)? == KernelTarget::Host {
        spine(
            params,
            params.num_partitions as usize,
            histograms.global.words_mut(),
            histograms.partitions.words_mut(),
        );
    }

    let downsweep_pass = KernelPass::new(SplatKernel::RadixDownsweep, params.max_element_count)
        .label(format!("radix_downsweep_p{}", pass_idx))
        .workgroups(params.num_partitions)
        .uniform(params.kernel_params())
        .buffer(src_keys)
        .buffer(src_values)
        .buffer(&*histograms.partitions)
        .buffer(dst_keys)
        .buffer(dst_values);
    if encoder.dispatch(downsweep_pass)? == KernelTarget::Host {
        downsweep(
            params,
            &src_keys.words()[..n],
            &src_values.words()[..n],
            histograms.partitions.words(),
            dst_keys.words_mut(),
            dst_values.words_mut(),
        );
    }
    Ok(())
}

#[inline]
fn digit(key: u32, shift: u32) -> usize {
    ((key >> shift) & 0xFF) as usize
}

/// Per-partition digit histograms
fn upsweep(params: &SortParams, keys: &[u32], partition_histogram: &mut [u32]) {
    let shift = params.bit_shift;
    partition_histogram
        .par_chunks_mut(RADIX)
        .zip(keys.par_chunks(BLOCK_SIZE))
        .for_each(|(hist, block)| {
            hist.fill(0);
            for &key in block {
                hist[digit(key, shift)] += 1;
            }
        });
}

/// Turn per-partition counts into global scatter offsets
fn spine(
    params: &SortParams,
    num_partitions: usize,
    global_histogram: &mut [u32],
    partition_histogram: &mut [u32],
) {
    let global = &mut global_histogram[params.pass_index as usize * RADIX..][..RADIX];
    global.fill(0);
    for p in 0..num_partitions {
        for (d, total) in global.iter_mut().enumerate() {
            *total += partition_histogram[p * RADIX + d];
        }
    }

    // Exclusive prefix sum over digits
    let mut digit_base = [0u32; RADIX];
    let mut sum = 0u32;
    for (d, base) in digit_base.iter_mut().enumerate() {
        *base = sum;
        sum += global[d];
    }

    // Exclusive prefix over partitions within each digit
    for (d, base) in digit_base.iter().enumerate() {
        let mut running = *base;
        for p in 0..num_partitions {
            let c = partition_histogram[p * RADIX + d];
            partition_histogram[p * RADIX + d] = running;
            running += c;
        }
    }
}

/// Scatter keys/values to their sorted slots
fn downsweep(
    params: &SortParams,
    keys: &[u32],
    values: &[u32],
    partition_offsets: &[u32],
    keys_out: &mut [u32],
    values_out: &mut [u32],
) {
    let shift = params.bit_shift;
    let destinations: Vec<u32> = keys
        .par_chunks(BLOCK_SIZE)
        .zip(partition_offsets.par_chunks(RADIX))
        .flat_map_iter(|(block, offsets)| {
            let mut local = [0u32; RADIX];
            local.copy_from_slice(offsets);
            block
                .iter()
                .map(|&key| {
                    let d = digit(key, shift);
                    let dst = local[d];
                    local[d] += 1;
                    dst
                })
                .collect::<Vec<_>>()
        })
        .collect();

    for (i, &dst) in destinations.iter().enumerate() {
        keys_out[dst as usize] = keys[i];
        values_out[dst as usize] = values[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sortable_uint_preserves_order_across_zero() {
        let values = [-1e30f32, -2.5, -1.0, -0.0, 0.0, 1e-20, 1.0, 3.5, 1e30];
        for w in values.windows(2) {
            assert!(float_to_sortable_uint(w[0]) <= float_to_sortable_uint(w[1]));
        }
        assert!(float_to_sortable_uint(-1.0) < float_to_sortable_uint(1.0));
    }

    #[test]
    fn sortable_uint_round_trips_exactly() {
        for f in [-123.456f32, -0.0, 0.0, f32::MIN_POSITIVE, f32::MAX, f32::MIN] {
            assert_eq!(sortable_uint_to_float(float_to_sortable_uint(f)).to_bits(), f.to_bits());
        }
    }
}
