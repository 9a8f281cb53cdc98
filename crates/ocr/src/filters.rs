//! Grayscale filters used by the purifier.
//!
//! Every filter takes and returns a `GrayImage` of the same dimensions and is
//! fully deterministic.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::morphology::{grayscale_open, Mask};

// ── Non-local means ──────────────────────────────────────────────────────────

/// Non-local means denoising.
///
/// For each pixel, every candidate in the `search_window` neighbourhood is
/// weighted by the similarity of the `template_window` patches around the two
/// pixels: `w = exp(-avg_sq_diff / h²)`. Patch sums use an integral image per
/// search offset, so cost is O(width · height · search_window²).
pub fn non_local_means(img: &GrayImage, h: f32, template_window: u32, search_window: u32) -> GrayImage {
    let (w, ht) = img.dimensions();
    if w == 0 || ht == 0 {
        return img.clone();
    }

    let tr = (template_window / 2) as usize;
    let sr = (search_window / 2) as usize;
    let pad = tr + sr;
    let (w, ht) = (w as usize, ht as usize);
    let pw = w + 2 * pad;
    let ph = ht + 2 * pad;

    // Edge-replicated copy so patches near the border stay well defined.
    let mut padded = vec![0i32; pw * ph];
    for py in 0..ph {
        let sy = py.saturating_sub(pad).min(ht - 1);
        for px in 0..pw {
            let sx = px.saturating_sub(pad).min(w - 1);
            padded[py * pw + px] = img.get_pixel(sx as u32, sy as u32)[0] as i32;
        }
    }

    // Weight lookup indexed by the mean squared difference over a patch.
    let area = ((2 * tr + 1) * (2 * tr + 1)) as u64;
    let h2 = (h as f64).max(f64::EPSILON).powi(2);
    let lut: Vec<f64> = (0..=255usize * 255).map(|d| (-(d as f64) / h2).exp()).collect();

    // The diff region covers every template window of every output pixel.
    let rw = w + 2 * tr;
    let rh = ht + 2 * tr;
    let mut integral = vec![0u64; (rw + 1) * (rh + 1)];
    let mut sum_w = vec![0f64; w * ht];
    let mut sum_v = vec![0f64; w * ht];

    for dy in 0..=2 * sr {
        for dx in 0..=2 * sr {
            for j in 0..rh {
                let mut row = 0u64;
                let a_row = (sr + j) * pw + sr;
                let b_row = (j + dy) * pw + dx;
                for i in 0..rw {
                    let d = padded[a_row + i] - padded[b_row + i];
                    row += (d * d) as u64;
                    integral[(j + 1) * (rw + 1) + i + 1] = integral[j * (rw + 1) + i + 1] + row;
                }
            }

            let span = 2 * tr + 1;
            for y in 0..ht {
                for x in 0..w {
                    let ssd = integral[(y + span) * (rw + 1) + x + span]
                        + integral[y * (rw + 1) + x]
                        - integral[y * (rw + 1) + x + span]
                        - integral[(y + span) * (rw + 1) + x];
                    let weight = lut[(ssd / area) as usize];
                    let candidate = padded[(y + dy + tr) * pw + x + dx + tr] as f64;
                    sum_w[y * w + x] += weight;
                    sum_v[y * w + x] += weight * candidate;
                }
            }
        }
    }

    ImageBuffer::from_fn(w as u32, ht as u32, |x, y| {
        let idx = y as usize * w + x as usize;
        Luma([(sum_v[idx] / sum_w[idx]).round().clamp(0.0, 255.0) as u8])
    })
}

// ── CLAHE ────────────────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalization over a `tiles × tiles` grid.
///
/// Each tile's histogram is clipped at `clip_limit · tile_area / 256`, the
/// excess is spread evenly over all bins, and the resulting mappings are
/// bilinearly interpolated between neighbouring tile centres.
pub fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let tiles_x = tiles.clamp(1, w) as usize;
    let tiles_y = tiles.clamp(1, h) as usize;
    let (wu, hu) = (w as usize, h as usize);

    let bounds = |t: usize, n: usize, len: usize| (t * len / n, (t + 1) * len / n);

    let mut luts = vec![[0u8; 256]; tiles_x * tiles_y];
    for ty in 0..tiles_y {
        let (y0, y1) = bounds(ty, tiles_y, hu);
        for tx in 0..tiles_x {
            let (x0, x1) = bounds(tx, tiles_x, wu);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }
            let area = ((x1 - x0) * (y1 - y0)) as u32;
            luts[ty * tiles_x + tx] = clipped_equalization(&mut hist, area, clip_limit);
        }
    }

    let tile_w = w as f32 / tiles_x as f32;
    let tile_h = h as f32 / tiles_y as f32;
    let neighbours = |pos: u32, size: f32, n: usize| {
        let f = pos as f32 / size - 0.5;
        let lo = f.floor();
        let frac = f - lo;
        let t1 = (lo as i64).clamp(0, n as i64 - 1) as usize;
        let t2 = (lo as i64 + 1).clamp(0, n as i64 - 1) as usize;
        (t1, t2, frac)
    };

    ImageBuffer::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (tx1, tx2, xa) = neighbours(x, tile_w, tiles_x);
        let (ty1, ty2, ya) = neighbours(y, tile_h, tiles_y);
        let at = |tx: usize, ty: usize| luts[ty * tiles_x + tx][v] as f32;
        let top = at(tx1, ty1) * (1.0 - xa) + at(tx2, ty1) * xa;
        let bottom = at(tx1, ty2) * (1.0 - xa) + at(tx2, ty2) * xa;
        Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
    })
}

fn clipped_equalization(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let batch = excess / 256;
        let mut residual = (excess % 256) as usize;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1);
            let mut i = 0;
            while i < 256 && residual > 0 {
                hist[i] += 1;
                residual -= 1;
                i += step;
            }
        }
    }

    let scale = 255.0 / area.max(1) as f32;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cumulative += bin;
        lut[i] = (cumulative as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

// ── Adaptive threshold ───────────────────────────────────────────────────────

/// Binarize against a Gaussian-weighted local mean.
///
/// A pixel becomes 255 when `src − mean > −c`, otherwise 0. `block_size` is
/// forced odd and at least 3; σ follows the usual kernel-size relation
/// `0.3·((k−1)/2 − 1) + 0.8`.
pub fn adaptive_threshold_gaussian(img: &GrayImage, block_size: u32, c: f32) -> GrayImage {
    let k = block_size.max(3) | 1;
    let sigma = 0.3 * ((k as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let mean = imageproc::filter::gaussian_blur_f32(img, sigma);
    let delta = c.ceil() as i32;

    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        let src = img.get_pixel(x, y)[0] as i32;
        let m = mean.get_pixel(x, y)[0] as i32;
        if src - m > -delta {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

// ── Morphology ───────────────────────────────────────────────────────────────

/// Square structuring element of side `size` anchored at `size / 2`, so a
/// 2×2 element reaches one pixel up and left. `size` is capped at 255.
pub fn square_mask(size: u32) -> Mask {
    let n = size.clamp(1, 255);
    let element: GrayImage = ImageBuffer::from_pixel(n, n, Luma([255u8]));
    Mask::from_image(&element, (n / 2) as u8, (n / 2) as u8)
}

/// Morphological opening (erode then dilate) with `mask`.
pub fn open(img: &GrayImage, mask: &Mask) -> GrayImage {
    grayscale_open(img, mask)
}
