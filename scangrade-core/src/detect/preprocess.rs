use image::{GrayImage, Luma};
use imageproc::{
    contrast::{adaptive_threshold, otsu_level, threshold, ThresholdType},
    filter::filter3x3,
};

/// Half size of the adaptive threshold window (11x11 block).
const ADAPTIVE_BLOCK_RADIUS: u32 = 5;

const SHARPEN_KERNEL: [f32; 9] = [-1f32, -1f32, -1f32, -1f32, 9f32, -1f32, -1f32, -1f32, -1f32];

/// Image variants tried, in order, when the raw page does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocess {
    AdaptiveThreshold,
    Otsu,
    Sharpen,
    Clahe,
}

impl Preprocess {
    pub const CASCADE: [Preprocess; 4] = [
        Preprocess::AdaptiveThreshold,
        Preprocess::Otsu,
        Preprocess::Sharpen,
        Preprocess::Clahe,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preprocess::AdaptiveThreshold => "adaptive_threshold",
            Preprocess::Otsu => "otsu",
            Preprocess::Sharpen => "sharpened",
            Preprocess::Clahe => "clahe",
        }
    }

    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        match self {
            Preprocess::AdaptiveThreshold => adaptive_threshold(gray, ADAPTIVE_BLOCK_RADIUS),
            Preprocess::Otsu => threshold(gray, otsu_level(gray), ThresholdType::Binary),
            Preprocess::Sharpen => filter3x3::<Luma<u8>, f32, u8>(gray, &SHARPEN_KERNEL),
            Preprocess::Clahe => clahe(gray, 3.0, 8),
        }
    }
}

/// Contrast limited adaptive histogram equalization.
///
/// The image is split into `tiles x tiles` regions. Each region gets its own
/// equalization lookup table built from a histogram clipped at
/// `clip_limit * (region pixels / 256)`; the clipped excess is spread evenly
/// over all bins. Pixels are mapped by bilinear interpolation between the
/// lookup tables of the four closest region centres, which removes the block
/// seams plain tiled equalization would leave.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tiles_x = tiles.clamp(1, w);
    let tiles_y = tiles.clamp(1, h);
    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);

    let mut luts = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts[(ty * tiles_x + tx) as usize] = tile_lut(gray, (x0, y0, x1, y1), clip_limit);
        }
    }

    let mut out = GrayImage::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        // Position relative to tile centres.
        let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let tx0 = gx.floor().clamp(0f32, (tiles_x - 1) as f32) as u32;
        let ty0 = gy.floor().clamp(0f32, (tiles_y - 1) as f32) as u32;
        let tx1 = (tx0 + 1).min(tiles_x - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let ax = (gx - tx0 as f32).clamp(0f32, 1f32);
        let ay = (gy - ty0 as f32).clamp(0f32, 1f32);

        let v = gray.get_pixel(x, y)[0] as usize;
        let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v] as f32;
        let top = lut(tx0, ty0) * (1f32 - ax) + lut(tx1, ty0) * ax;
        let bottom = lut(tx0, ty1) * (1f32 - ax) + lut(tx1, ty1) * ax;
        let value = top * (1f32 - ay) + bottom * ay;
        *px = Luma([value.round().clamp(0f32, 255f32) as u8]);
    }
    out
}

fn tile_lut(gray: &GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let n_pixels = (x1 - x0) * (y1 - y0);
    let mut lut = [0u8; 256];
    if n_pixels == 0 {
        for (i, v) in lut.iter_mut().enumerate() {
            *v = i as u8;
        }
        return lut;
    }

    let clip = ((clip_limit * n_pixels as f32 / 256f32) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let spread = excess / 256;
    let mut remainder = excess % 256;
    for bin in hist.iter_mut() {
        *bin += spread;
        if remainder > 0 {
            *bin += 1;
            remainder -= 1;
        }
    }

    let mut cdf = 0u32;
    for (bin, v) in hist.iter().zip(lut.iter_mut()) {
        cdf += bin;
        *v = ((cdf as f32 * 255f32) / n_pixels as f32).round().min(255f32) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([(100 + (x * 40) / w) as u8]))
    }

    #[test]
    fn test_cascade_order() {
        let names: Vec<_> = Preprocess::CASCADE.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["adaptive_threshold", "otsu", "sharpened", "clahe"]);
    }

    #[test]
    fn test_variants_keep_dimensions() {
        let img = gradient(64, 48);
        for variant in Preprocess::CASCADE {
            let out = variant.apply(&img);
            assert_eq!(out.dimensions(), (64, 48), "{}", variant.name());
        }
    }

    #[test]
    fn test_otsu_is_binary() {
        let img = GrayImage::from_fn(32, 32, |x, _| Luma([if x < 16 { 60 } else { 190 }]));
        let out = Preprocess::Otsu.apply(&img);
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(31, 0)[0], 255);
    }

    #[test]
    fn test_clahe_stretches_low_contrast() {
        let img = gradient(128, 128);
        let out = clahe(&img, 3.0, 8);
        let (in_min, in_max) = min_max(&img);
        let (out_min, out_max) = min_max(&out);
        assert!(out_max - out_min > in_max - in_min);
    }

    #[test]
    fn test_clahe_on_uniform_image_is_stable() {
        let img = GrayImage::from_pixel(40, 40, Luma([255u8]));
        let out = clahe(&img, 3.0, 8);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    fn min_max(img: &GrayImage) -> (i32, i32) {
        img.pixels().fold((255, 0), |(lo, hi), p| {
            (lo.min(p[0] as i32), hi.max(p[0] as i32))
        })
    }
}
