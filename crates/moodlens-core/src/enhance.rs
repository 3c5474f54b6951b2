//! Contrast enhancement applied to face crops before classification.

use image::GrayImage;

/// Tile grid used by [`clahe`] for face crops.
pub const FACE_CLAHE_TILES: u32 = 8;
/// Histogram clip limit, as a fraction of tile pixels.
///
/// Twice the mean bin height (`2 / 256`), the usual CLAHE clip of 2.0.
pub const FACE_CLAHE_CLIP: f32 = 2.0 / 256.0;

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// Divides the image into a `tiles` × `tiles` grid, computes a clipped
/// histogram per tile, builds CDFs, and blends neighbouring tile CDFs
/// bilinearly. Images smaller than the grid are left untouched.
pub fn clahe(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let t = tiles as usize;
    if t == 0 || w < t || h < t {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    let tile_pixels = tile_w * tile_h;
    let pixels: &mut [u8] = gray;

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[pixels[y * w + x] as usize] += 1;
                }
            }
            cdfs.push(clipped_cdf(&mut hist, tile_pixels, clip_limit));
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let pixel = pixels[y * w + x] as usize;
            let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
            let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
            pixels[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip a tile histogram, redistribute the excess evenly, and normalize its CDF to 0–255.
fn clipped_cdf(hist: &mut [u32; 256], tile_pixels: usize, clip_limit: f32) -> [f32; 256] {
    let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let redist = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += redist + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut acc = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        acc += count as f32;
        *slot = acc;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = tile_pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}
