// Radix sort validation tests
// Tests the splat sorter against a CPU reference

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rfs_gsplat_composite::{
    float_to_sortable_uint, sortable_uint_to_float, CommandEncoder, GpuBuffer, GpuDevice,
    RadixSortEngine, SortEngine,
};

// CPU reference: one stable counting sort per 8-bit digit
fn cpu_radix_sort_reference(keys: &mut [u32], values: &mut [u32]) {
    let n = keys.len();
    let mut keys_temp = vec![0u32; n];
    let mut values_temp = vec![0u32; n];

    for pass in 0..4 {
        let shift = pass * 8;
        let mut histogram = vec![0usize; 256];
        for &key in keys.iter() {
            histogram[((key >> shift) & 0xFF) as usize] += 1;
        }

        let mut sum = 0;
        for count in histogram.iter_mut() {
            let temp = *count;
            *count = sum;
            sum += temp;
        }

        for i in 0..n {
            let digit = ((keys[i] >> shift) & 0xFF) as usize;
            let pos = histogram[digit];
            histogram[digit] += 1;
            keys_temp[pos] = keys[i];
            values_temp[pos] = values[i];
        }

        keys.copy_from_slice(&keys_temp);
        values.copy_from_slice(&values_temp);
    }
}

fn is_sorted(keys: &[u32]) -> bool {
    keys.windows(2).all(|w| w[0] <= w[1])
}

fn upload(device: &GpuDevice, label: &'static str, words: &[u32]) -> GpuBuffer {
    device.create_buffer_with_data(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(words),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    })
}

/// Sort the first `count` keys on the device and return (keys, values)
fn device_sort(keys: &[u32], capacity: u32, count: u32) -> (Vec<u32>, Vec<u32>) {
    let device = GpuDevice::new();
    let engine = RadixSortEngine;
    let mut resources = engine.prepare(&device, capacity);
    let values: Vec<u32> = (0..keys.len() as u32).collect();
    let mut key_buf = upload(&device, "test_sort_keys", keys);
    let mut value_buf = upload(&device, "test_sort_values", &values);
    let mut encoder = CommandEncoder::new("test_sort");
    engine
        .dispatch(&mut encoder, &mut resources, &mut key_buf, &mut value_buf, count)
        .unwrap();
    (key_buf.words().to_vec(), value_buf.words().to_vec())
}

#[test]
fn test_random_keys_match_reference() {
    let mut rng = StdRng::seed_from_u64(42);
    for &n in &[1usize, 7, 1000, 1024, 1025, 5000] {
        let keys: Vec<u32> = (0..n).map(|_| rng.gen()).collect();
        let (sorted_keys, sorted_values) = device_sort(&keys, n as u32, n as u32);

        let mut ref_keys = keys.clone();
        let mut ref_values: Vec<u32> = (0..n as u32).collect();
        cpu_radix_sort_reference(&mut ref_keys, &mut ref_values);

        assert!(is_sorted(&sorted_keys), "keys not sorted for n = {}", n);
        assert_eq!(sorted_keys, ref_keys);
        assert_eq!(sorted_values, ref_values, "permutation differs for n = {}", n);
    }
}

#[test]
fn test_equal_keys_keep_input_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<u32> = (0..3000).map(|_| rng.gen_range(0..4)).collect();
    let (sorted_keys, sorted_values) = device_sort(&keys, 3000, 3000);

    assert!(is_sorted(&sorted_keys));
    for w in sorted_keys.windows(2).zip(sorted_values.windows(2)) {
        let (k, v) = w;
        if k[0] == k[1] {
            assert!(v[0] < v[1], "stability violated at values {:?}", v);
        }
    }
}

#[test]
fn test_count_below_capacity_only_touches_prefix() {
    let keys = vec![9, 3, 7, 1, 100, 50];
    let (sorted_keys, sorted_values) = device_sort(&keys, 6, 4);
    assert_eq!(&sorted_keys[..4], &[1, 3, 7, 9]);
    assert_eq!(&sorted_values[..4], &[3, 1, 2, 0]);
    assert_eq!(&sorted_keys[4..], &[100, 50]);
    assert_eq!(&sorted_values[4..], &[4, 5]);
}

#[test]
fn test_sort_records_three_dispatches_per_digit() {
    let device = GpuDevice::new();
    let engine = RadixSortEngine;
    let mut resources = engine.prepare(&device, 64);
    let mut keys = upload(&device, "k", &[5u32; 64]);
    let mut values = upload(&device, "v", &[0u32; 64]);
    let mut encoder = CommandEncoder::new("test_sort");
    engine
        .dispatch(&mut encoder, &mut resources, &mut keys, &mut values, 64)
        .unwrap();

    let labels = encoder.labels();
    assert_eq!(labels.len(), 12);
    assert_eq!(labels[0], "radix_upsweep_p0");
    assert_eq!(labels[11], "radix_downsweep_p3");
}

#[test]
fn test_float_key_bijection_preserves_order() {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut floats: Vec<f32> = (0..2000).map(|_| rng.gen_range(-1.0e6f32..1.0e6)).collect();
    floats.extend([0.0, -0.0, f32::MIN_POSITIVE, -f32::MIN_POSITIVE, f32::MAX, f32::MIN]);

    for &f in &floats {
        assert_eq!(sortable_uint_to_float(float_to_sortable_uint(f)).to_bits(), f.to_bits());
    }

    let mut by_key = floats.clone();
    by_key.sort_by_key(|&f| float_to_sortable_uint(f));
    assert!(by_key.windows(2).all(|w| w[0] <= w[1]));
}
