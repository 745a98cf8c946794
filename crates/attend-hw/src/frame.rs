//! Captured frames and grayscale processing — YUYV conversion, dark
//! detection, CLAHE.

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time, milliseconds since the Unix epoch. This is
    /// the canonical detection timestamp carried through to the attendance
    /// record when a sign-in confirms.
    pub captured_at_ms: i64,
    /// Driver sequence number, for dropped-frame diagnostics.
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0). Used to pick the best of
    /// several enrollment captures.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV (4:2:2) to grayscale by taking the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], so luma is every
/// even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Whether a frame is too dark to bother embedding.
///
/// True when more than `threshold_pct` of pixels fall below luma 32 — lens
/// covered, lights off, or the sensor still warming up.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// The image is split into a `tiles x tiles` grid. Each tile gets a
/// histogram clipped at `clip_limit` (as a fraction of the tile's pixels,
/// excess redistributed evenly), turned into a normalized CDF. Output
/// pixels interpolate bilinearly between the four surrounding tile CDFs so
/// tile borders stay seamless. Degenerate geometry (empty image, tiles
/// smaller than one pixel) leaves the buffer untouched.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    let grid = tiles as usize;
    if w == 0 || h == 0 || grid == 0 || gray.len() < w * h {
        return;
    }
    let tile_w = w / grid;
    let tile_h = h / grid;
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(grid * grid);
    for row in 0..grid {
        for col in 0..grid {
            cdfs.push(tile_cdf(
                gray,
                w,
                col * tile_w,
                row * tile_h,
                tile_w,
                tile_h,
                clip_limit,
            ));
        }
    }

    for y in 0..h {
        for x in 0..w {
            let level = gray[y * w + x] as usize;

            let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (grid - 1) as f32);
            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(grid - 1);
            let c1 = (c0 + 1).min(grid - 1);
            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let top = cdfs[r0 * grid + c0][level] * (1.0 - dx) + cdfs[r0 * grid + c1][level] * dx;
            let bottom =
                cdfs[r1 * grid + c0][level] * (1.0 - dx) + cdfs[r1 * grid + c1][level] * dx;
            let value = top * (1.0 - dy) + bottom * dy;

            gray[y * w + x] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clipped, redistributed, normalized CDF for one tile.
fn tile_cdf(
    gray: &[u8],
    stride: usize,
    x0: usize,
    y0: usize,
    tile_w: usize,
    tile_h: usize,
    clip_limit: f32,
) -> [f32; 256] {
    let tile_pixels = tile_w * tile_h;
    let mut hist = [0u32; 256];
    for y in y0..y0 + tile_h {
        for x in x0..x0 + tile_w {
            hist[gray[y * stride + x] as usize] += 1;
        }
    }

    let clip = (clip_limit * tile_pixels as f32) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share;
        if i < remainder {
            *bin += 1;
        }
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (i, &bin) in hist.iter().enumerate() {
        running += bin as f32;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
    let denom = tile_pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_extracts_even_bytes() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn yuyv_short_buffer_rejected() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn dark_frame_detection() {
        assert!(is_dark_frame(&vec![0u8; 1000], 0.95));
        assert!(!is_dark_frame(&vec![128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn dark_frame_borderline() {
        // 96% dark is dark; 94% dark is not
        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, 0.95));

        let mut lit = vec![10u8; 940];
        lit.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&lit, 0.95));
    }

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        let variance = data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n;
        variance.sqrt()
    }

    #[test]
    fn clahe_stretches_low_contrast() {
        // 16x16 image with all pixels packed into 100-110
        let w = 16u32;
        let h = 16u32;
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();

        let before = stddev(&gray);
        clahe_enhance(&mut gray, w, h, 2, 0.02);
        let after = stddev(&gray);

        assert!(
            after > before,
            "contrast should grow: before={before:.2}, after={after:.2}"
        );
    }

    #[test]
    fn clahe_degenerate_geometry_is_untouched() {
        let mut empty: Vec<u8> = vec![];
        clahe_enhance(&mut empty, 0, 0, 8, 0.02);
        assert!(empty.is_empty());

        // tiles larger than the image: 2x2 image with an 8x8 grid
        let mut tiny = vec![10u8, 200, 10, 200];
        let original = tiny.clone();
        clahe_enhance(&mut tiny, 2, 2, 8, 0.02);
        assert_eq!(tiny, original);
    }

    #[test]
    fn avg_brightness() {
        let frame = Frame {
            data: vec![0, 100, 200],
            width: 3,
            height: 1,
            captured_at_ms: 0,
            sequence: 0,
            is_dark: false,
        };
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
    }
}
