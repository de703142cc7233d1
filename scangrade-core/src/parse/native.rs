use std::{
    ops::Range,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use image::GrayImage;
use pdfium_render::prelude::{PdfPage, PdfRenderConfig, Pdfium};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{instrument, Span};

use crate::entities::PageNumber;

const MAX_CONCURRENT_RASTER_REQS: usize = 10;

pub struct RasterRequest {
    pub doc_data: Arc<[u8]>,
    pub password: Option<String>,
    pub page_range: Option<Range<usize>>,
    pub render_scale: f32,
    pub sender_tx: Sender<anyhow::Result<RasterMessage>>,
    pub count_only: bool,
}

impl RasterRequest {
    pub fn new(
        data: Arc<[u8]>,
        password: Option<&str>,
        page_range: Option<Range<usize>>,
        render_scale: f32,
        sender_tx: Sender<anyhow::Result<RasterMessage>>,
    ) -> Self {
        RasterRequest {
            doc_data: data,
            password: password.map(|p| p.to_string()),
            page_range,
            render_scale,
            sender_tx,
            count_only: false,
        }
    }

    pub fn new_count_only(
        data: Arc<[u8]>,
        password: Option<&str>,
        sender_tx: Sender<anyhow::Result<RasterMessage>>,
    ) -> Self {
        RasterRequest {
            doc_data: data,
            password: password.map(|p| p.to_string()),
            page_range: None,
            render_scale: 0f32,
            sender_tx,
            count_only: true,
        }
    }
}

/// Messages streamed back for one request. The document is opened first, the
/// page count comes before any page.
#[derive(Debug)]
pub enum RasterMessage {
    PageCount(usize),
    Page {
        page_number: PageNumber,
        image: GrayImage,
        render_duration_ms: u128,
    },
    PageFailed {
        page_number: PageNumber,
        reason: String,
    },
}

/// Handle to the pdfium worker thread. pdfium is not thread safe, every
/// document goes through the single instance owned by that thread.
#[derive(Debug, Clone)]
pub struct RasterQueue {
    queue: Sender<(RasterRequest, Span)>,
}

impl RasterQueue {
    pub fn new(pdfium_lib_dir: Option<PathBuf>) -> Self {
        let (queue_sender, queue_receiver) = mpsc::channel(MAX_CONCURRENT_RASTER_REQS);

        tokio::task::spawn_blocking(move || start_rasterizer(queue_receiver, pdfium_lib_dir));
        Self {
            queue: queue_sender,
        }
    }

    pub(crate) async fn push(&self, req: RasterRequest) -> anyhow::Result<()> {
        let span = Span::current();
        self.queue
            .send((req, span))
            .await
            .context("error sending raster request")
    }
}

#[instrument(skip(page))]
pub(crate) fn rasterize_page(
    page_number: PageNumber,
    page: &PdfPage,
    render_scale: f32,
) -> anyhow::Result<(GrayImage, u128)> {
    let start_time = Instant::now();
    let image = page
        .render_with_config(&PdfRenderConfig::default().scale_page_by_factor(render_scale))
        .map(|bitmap| bitmap.as_image().to_luma8())?;

    let render_duration_ms = start_time.elapsed().as_millis();
    tracing::debug!(
        "Rendering page {} ({}x{}) using pdfium took {}ms",
        page_number,
        image.width(),
        image.height(),
        render_duration_ms
    );
    Ok((image, render_duration_ms))
}

fn handle_raster_req(pdfium: &Pdfium, req: RasterRequest, parent_span: Span) -> anyhow::Result<()> {
    // Reenter the caller's span
    let _guard = parent_span.enter();
    let RasterRequest {
        doc_data,
        password,
        page_range,
        render_scale,
        sender_tx,
        count_only,
    } = req;
    let document = match pdfium.load_pdf_from_byte_slice(&doc_data, password.as_deref()) {
        Ok(document) => document,
        Err(e) => {
            sender_tx.blocking_send(Err(anyhow::anyhow!("can't open pdf document: {e}")))?;
            return Ok(());
        }
    };
    let pages = document.pages();
    let total_pages = pages.len() as usize;

    let range = match page_range {
        Some(range) if range.end > total_pages => {
            sender_tx.blocking_send(Err(anyhow::anyhow!(
                "Page range end ({}) exceeds document length ({})",
                range.end,
                total_pages
            )))?;
            return Ok(());
        }
        Some(range) => range,
        None => 0..total_pages,
    };

    if count_only {
        sender_tx.blocking_send(Ok(RasterMessage::PageCount(total_pages)))?;
        return Ok(());
    }
    sender_tx.blocking_send(Ok(RasterMessage::PageCount(range.len())))?;

    for index in range {
        let page_number = index + 1;
        let message = match pages
            .get(index as u16)
            .map_err(anyhow::Error::from)
            .and_then(|page| rasterize_page(page_number, &page, render_scale))
        {
            Ok((image, render_duration_ms)) => RasterMessage::Page {
                page_number,
                image,
                render_duration_ms,
            },
            Err(e) => {
                tracing::warn!("can't render page {page_number}: {e}");
                RasterMessage::PageFailed {
                    page_number,
                    reason: e.to_string(),
                }
            }
        };
        // Bounded channel: blocks while the consumer still holds enough rasters.
        sender_tx.blocking_send(Ok(message))?
    }
    Ok(())
}

fn bind_pdfium(lib_dir: Option<&PathBuf>) -> anyhow::Result<Pdfium> {
    let bindings = match lib_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            .or_else(|_| Pdfium::bind_to_system_library()),
        None => Pdfium::bind_to_system_library(),
    }
    .context("can't load pdfium bindings")?;
    Ok(Pdfium::new(bindings))
}

pub fn start_rasterizer(
    mut input_rx: Receiver<(RasterRequest, Span)>,
    pdfium_lib_dir: Option<PathBuf>,
) {
    let pdfium = match bind_pdfium(pdfium_lib_dir.as_ref()) {
        Ok(pdfium) => pdfium,
        Err(e) => {
            tracing::error!("pdfium unavailable, pdf documents can't be rendered: {e:#}");
            // Keep answering so callers fail with a proper error instead of hanging.
            while let Some((req, _)) = input_rx.blocking_recv() {
                let _ = req
                    .sender_tx
                    .blocking_send(Err(anyhow::anyhow!("pdfium unavailable: {e:#}")));
            }
            return;
        }
    };
    while let Some((req, parent_span)) = input_rx.blocking_recv() {
        if let Err(e) = handle_raster_req(&pdfium, req, parent_span) {
            tracing::error!("error rasterizing request: {e:?}");
        }
    }
}
