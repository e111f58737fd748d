//! 64-bit perceptual hash.
//!
//! Classic DCT hash: downsample the luma plane to 32x32, take the 8x8
//! low-frequency block of its 2D DCT, and emit one bit per coefficient
//! above the block median. Hamming distance between two hashes
//! approximates visual similarity; the dedupe thresholds in
//! [`crate::options::DedupeLevel`] are calibrated against this hash.

/// DCT input edge length.
const SAMPLE_SIZE: usize = 32;

/// Low-frequency block edge length (64 output bits).
const BLOCK_SIZE: usize = 8;

/// Hash the given luma plane. `luma` is row-major, `width * height`
/// bytes. Degenerate inputs hash to 0.
pub fn perceptual_hash(luma: &[u8], width: u32, height: u32) -> u64 {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 || luma.len() < w * h {
        return 0;
    }

    let small = downsample(luma, w, h);
    let freq = dct_2d(&small);

    // Median over the low-frequency block, excluding the DC term so a
    // uniform background does not dominate the split point.
    let mut block = [0.0f64; BLOCK_SIZE * BLOCK_SIZE];
    for y in 0..BLOCK_SIZE {
        for x in 0..BLOCK_SIZE {
            block[y * BLOCK_SIZE + x] = freq[y * SAMPLE_SIZE + x];
        }
    }
    let mut sorted: Vec<f64> = block[1..].to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = sorted[sorted.len() / 2];

    let mut bits = 0u64;
    for (i, value) in block.iter().enumerate() {
        if *value > median {
            bits |= 1u64 << i;
        }
    }
    bits
}

/// Number of differing bits between two hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Box-average the luma plane down to `SAMPLE_SIZE x SAMPLE_SIZE`.
fn downsample(luma: &[u8], w: usize, h: usize) -> [f64; SAMPLE_SIZE * SAMPLE_SIZE] {
    let mut out = [0.0f64; SAMPLE_SIZE * SAMPLE_SIZE];
    for ty in 0..SAMPLE_SIZE {
        let y0 = ty * h / SAMPLE_SIZE;
        let y1 = (((ty + 1) * h) / SAMPLE_SIZE).max(y0 + 1).min(h);
        for tx in 0..SAMPLE_SIZE {
            let x0 = tx * w / SAMPLE_SIZE;
            let x1 = (((tx + 1) * w) / SAMPLE_SIZE).max(x0 + 1).min(w);
            let mut sum = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    sum += luma[y * w + x] as u64;
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as f64;
            out[ty * SAMPLE_SIZE + tx] = sum as f64 / count;
        }
    }
    out
}

/// Separable 2D DCT-II over a `SAMPLE_SIZE x SAMPLE_SIZE` tile.
fn dct_2d(input: &[f64; SAMPLE_SIZE * SAMPLE_SIZE]) -> [f64; SAMPLE_SIZE * SAMPLE_SIZE] {
    let table = cos_table();
    let mut rows = [0.0f64; SAMPLE_SIZE * SAMPLE_SIZE];
    for y in 0..SAMPLE_SIZE {
        for k in 0..SAMPLE_SIZE {
            let mut acc = 0.0;
            for x in 0..SAMPLE_SIZE {
                acc += input[y * SAMPLE_SIZE + x] * table[k][x];
            }
            rows[y * SAMPLE_SIZE + k] = acc;
        }
    }

    let mut out = [0.0f64; SAMPLE_SIZE * SAMPLE_SIZE];
    for k in 0..SAMPLE_SIZE {
        for x in 0..SAMPLE_SIZE {
            let mut acc = 0.0;
            for y in 0..SAMPLE_SIZE {
                acc += rows[y * SAMPLE_SIZE + x] * table[k][y];
            }
            out[k * SAMPLE_SIZE + x] = acc;
        }
    }
    out
}

fn cos_table() -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let n = SAMPLE_SIZE as f64;
    let mut table = [[0.0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (k, row) in table.iter_mut().enumerate() {
        for (x, cell) in row.iter_mut().enumerate() {
            *cell = (std::f64::consts::PI / n * (x as f64 + 0.5) * k as f64).cos();
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth ramp defined in normalized coordinates, so the same
    /// structure can be rendered at any resolution.
    fn gradient(w: u32, h: u32) -> Vec<u8> {
        (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                let fx = x as f64 / w as f64;
                let fy = y as f64 / h as f64;
                (fx * 180.0 + fy * 60.0) as u8
            })
            .collect()
    }

    #[test]
    fn identical_images_hash_identically() {
        let pixels = gradient(160, 120);
        let a = perceptual_hash(&pixels, 160, 120);
        let b = perceptual_hash(&pixels, 160, 120);
        assert_eq!(a, b);
        assert_eq!(hamming_distance(a, b), 0);
    }

    #[test]
    fn hash_survives_uniform_rescale() {
        let big = gradient(320, 240);
        let small = gradient(160, 120);
        let a = perceptual_hash(&big, 320, 240);
        let b = perceptual_hash(&small, 160, 120);
        // Same structure at two resolutions should stay well inside the
        // strictest dedupe threshold.
        assert!(hamming_distance(a, b) <= 6, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn structured_images_differ() {
        let a = perceptual_hash(&gradient(128, 128), 128, 128);
        let inverted: Vec<u8> = gradient(128, 128).iter().map(|v| 255 - v).collect();
        let b = perceptual_hash(&inverted, 128, 128);
        assert!(hamming_distance(a, b) > 0);
    }

    #[test]
    fn degenerate_input_hashes_to_zero() {
        assert_eq!(perceptual_hash(&[], 0, 0), 0);
        assert_eq!(perceptual_hash(&[1, 2], 4, 4), 0);
    }

    #[test]
    fn hamming_distance_counts_bits() {
        assert_eq!(hamming_distance(0, u64::MAX), 64);
        assert_eq!(hamming_distance(0b1011, 0b0010), 2);
    }
}
