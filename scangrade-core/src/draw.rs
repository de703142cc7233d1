use std::path::{Path, PathBuf};

use image::{GrayImage, ImageBuffer, Rgba};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::entities::{BBox, PageNumber};

const REGION_COLOR: [u8; 4] = [209, 139, 0, 255];
/// Outline thickness of the region rectangle, in pixels.
const REGION_STROKE: i32 = 4;

/// Receives intermediate images of the page stages.
///
/// Snapshots are best effort: a sink must never fail the page it observes.
pub trait DiagnosticSink: Send + Sync {
    fn snapshot(&self, page: PageNumber, stage: &str, image: &GrayImage);

    fn grade_region(&self, page: PageNumber, image: &GrayImage, region: &BBox);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {
    fn snapshot(&self, _page: PageNumber, _stage: &str, _image: &GrayImage) {}

    fn grade_region(&self, _page: PageNumber, _image: &GrayImage, _region: &BBox) {}
}

/// Writes `page_{n}_{stage}.png` files to a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    fn path(&self, page: PageNumber, stage: &str) -> PathBuf {
        self.dir.join(format!("page_{page}_{stage}.png"))
    }
}

impl DiagnosticSink for DirectorySink {
    fn snapshot(&self, page: PageNumber, stage: &str, image: &GrayImage) {
        let path = self.path(page, stage);
        if let Err(e) = image.save(&path) {
            tracing::warn!("can't save debug image {}: {e}", path.display());
        }
    }

    fn grade_region(&self, page: PageNumber, image: &GrayImage, region: &BBox) {
        let annotated = draw_region(image, region);
        let path = self.path(page, "grade_region");
        if let Err(e) = annotated.save(&path) {
            tracing::warn!("can't save debug image {}: {e}", path.display());
        }
    }
}

pub(crate) fn draw_region(page_img: &GrayImage, region: &BBox) -> ImageBuffer<Rgba<u8>, Vec<u8>> {
    let mut out_img = image::DynamicImage::ImageLuma8(page_img.clone()).to_rgba8();

    let x0 = region.x0 as i32;
    let y0 = region.y0 as i32;
    let width = (region.width() as i32).max(1);
    let height = (region.height() as i32).max(1);

    // Stack a few one pixel outlines, page rasters are too large for a single line to show.
    for inset in 0..REGION_STROKE {
        let w = width - 2 * inset;
        let h = height - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(x0 + inset, y0 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(&mut out_img, rect, Rgba(REGION_COLOR));
    }
    out_img
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn test_draw_region_outline() {
        let page = GrayImage::from_pixel(100, 100, Luma([255u8]));
        let out = draw_region(&page, &BBox::from_xywh(10.0, 20.0, 50.0, 30.0));
        assert_eq!(out.get_pixel(10, 20), &Rgba(REGION_COLOR));
        assert_eq!(out.get_pixel(13, 30), &Rgba(REGION_COLOR));
        // Interior untouched.
        assert_eq!(out.get_pixel(35, 35), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_directory_sink_writes_pngs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = DirectorySink::new(dir.path());
        let page = GrayImage::from_pixel(40, 40, Luma([200u8]));
        sink.snapshot(3, "deskewed", &page);
        sink.grade_region(3, &page, &BBox::from_xywh(5.0, 5.0, 10.0, 10.0));

        assert!(dir.path().join("page_3_deskewed.png").exists());
        assert!(dir.path().join("page_3_grade_region.png").exists());
        Ok(())
    }
}
