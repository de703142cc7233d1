use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Context;
use image::{GrayImage, ImageFormat};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{OcrEngine, OcrWord};
use crate::{config::OcrConfig, entities::BBox};

const TESSERACT_BIN: &str = "tesseract";
/// TSV level of a single word.
const WORD_LEVEL: &str = "5";
/// How often a running tesseract process is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Drives the `tesseract` executable. One process per call, the image goes
/// through a temporary PNG file.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    config: OcrConfig,
}

impl TesseractEngine {
    pub fn new(config: OcrConfig) -> Self {
        let binary = config
            .tesseract_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(TESSERACT_BIN));
        Self { binary, config }
    }

    fn run(
        &self,
        image: &GrayImage,
        args: &[String],
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        if cancel.is_cancelled() {
            anyhow::bail!("ocr cancelled");
        }
        let input = tempfile::Builder::new()
            .prefix("scangrade-ocr")
            .suffix(".png")
            .tempfile()
            .context("can't create ocr input file")?;
        image
            .save_with_format(input.path(), ImageFormat::Png)
            .context("can't write ocr input image")?;

        let start = Instant::now();
        let mut child = Command::new(&self.binary)
            .arg(input.path())
            .arg("stdout")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("can't run {}", self.binary.display()))?;
        // Pipes are drained on their own threads, a full pipe would stall the child.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait().context("can't wait for tesseract")? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(
                    "killed tesseract {:?} after {}ms",
                    args,
                    start.elapsed().as_millis()
                );
                anyhow::bail!("ocr cancelled");
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        tracing::debug!(
            "tesseract {:?} took {}ms",
            args,
            start.elapsed().as_millis()
        );

        let stdout = join_drain(stdout)?;
        if !status.success() {
            let stderr = join_drain(stderr).unwrap_or_default();
            anyhow::bail!(
                "tesseract exited with {}: {}",
                status,
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        String::from_utf8(stdout).context("tesseract output is not utf-8")
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_drain(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> anyhow::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("tesseract output reader panicked"))?
        .context("can't read tesseract output")
}

impl OcrEngine for TesseractEngine {
    #[instrument(skip_all)]
    fn recognize_words(
        &self,
        image: &GrayImage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<OcrWord>> {
        let args = vec![
            "-l".to_owned(),
            self.config.page_languages.clone(),
            "--psm".to_owned(),
            self.config.psm.to_string(),
            "tsv".to_owned(),
        ];
        let tsv = self.run(image, &args, cancel)?;
        Ok(parse_tsv_words(&tsv))
    }

    #[instrument(skip_all)]
    fn recognize_text(
        &self,
        image: &GrayImage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let args = vec![
            "-l".to_owned(),
            self.config.grade_languages.clone(),
            "--oem".to_owned(),
            "3".to_owned(),
            "--psm".to_owned(),
            self.config.psm.to_string(),
            "-c".to_owned(),
            format!("tessedit_char_whitelist={}", self.config.grade_whitelist),
        ];
        self.run(image, &args, cancel)
    }
}

/// Parse tesseract TSV output, keeping word level rows with text.
///
/// Columns: level page_num block_num par_num line_num word_num left top width
/// height conf text
pub(crate) fn parse_tsv_words(tsv: &str) -> Vec<OcrWord> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(12, '\t').collect();
            if cols.len() < 12 || cols[0] != WORD_LEVEL {
                return None;
            }
            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }
            let left: f32 = cols[6].parse().ok()?;
            let top: f32 = cols[7].parse().ok()?;
            let width: f32 = cols[8].parse().ok()?;
            let height: f32 = cols[9].parse().ok()?;
            let confidence: f32 = cols[10].parse().ok()?;
            Some(OcrWord {
                text: text.to_owned(),
                confidence,
                bbox: BBox::from_xywh(left, top, width, height),
            })
        })
        .collect()
}
