use image::GrayImage;

use super::CodeReader;

/// QR decoding with `rqrr`. Used on the raw page and every preprocessed variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct QrReader;

impl CodeReader for QrReader {
    fn name(&self) -> &'static str {
        "rqrr"
    }

    fn decode(&self, image: &GrayImage) -> Option<String> {
        let (w, h) = image.dimensions();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            w as usize,
            h as usize,
            |x, y| image.get_pixel(x as u32, y as u32)[0],
        );
        prepared
            .detect_grids()
            .into_iter()
            .find_map(|grid| match grid.decode() {
                Ok((_meta, content)) => Some(content),
                Err(e) => {
                    tracing::trace!("qr grid found but not decodable: {e}");
                    None
                }
            })
    }
}

/// Multi-format reader (QR, Code128, DataMatrix, ...) backed by `rxing`.
/// Slower than [`QrReader`], only consulted once the cascade is exhausted.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiFormatReader;

impl CodeReader for MultiFormatReader {
    fn name(&self) -> &'static str {
        "rxing"
    }

    fn decode(&self, image: &GrayImage) -> Option<String> {
        let (w, h) = image.dimensions();
        match rxing::helpers::detect_in_luma(image.as_raw().clone(), w, h, None) {
            Ok(result) => Some(result.getText().to_owned()),
            Err(e) => {
                tracing::trace!("rxing found no code: {e}");
                None
            }
        }
    }
}
