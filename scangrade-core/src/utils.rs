use anyhow::Context;
use colored::*;
use std::{
    fs::{create_dir, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{entities::ScanReport, persist::BatchStats};

fn sanitize_doc_name(doc_name: &str) -> String {
    doc_name
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
}

fn recreate_result_dir(result_dir_name: &Path) -> anyhow::Result<PathBuf> {
    if std::fs::create_dir(result_dir_name).is_err() {
        std::fs::remove_dir_all(result_dir_name)?;
        std::fs::create_dir(result_dir_name)?;
    };
    Ok(result_dir_name.to_owned())
}

/// Create `<doc>-results` (and its `debug` subdirectory) under `output_dir`,
/// or the current directory. An existing result directory is replaced.
pub fn create_dirs<P: AsRef<Path>>(
    output_dir: Option<P>,
    doc_name: &str,
    debug: bool,
) -> anyhow::Result<(PathBuf, Option<PathBuf>)> {
    let result_dir_name = format!("{}-results", sanitize_doc_name(doc_name));
    let res_dir_path = match output_dir {
        Some(p) => recreate_result_dir(&p.as_ref().join(&result_dir_name))?,
        None => recreate_result_dir(&PathBuf::from(format!("./{}", &result_dir_name)))?,
    };

    let debug_path = if debug {
        let debug_path = res_dir_path.join("debug");
        create_dir(&debug_path).context("cant create debug path")?;
        Some(debug_path)
    } else {
        None
    };
    Ok((res_dir_path, debug_path))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("can't create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Write the report as `<doc>.json` in `res_dir_path`. Returns the file path.
pub fn save_scan_report(report: &ScanReport, res_dir_path: &Path) -> anyhow::Result<PathBuf> {
    let file_out = res_dir_path.join(format!("{}.json", sanitize_doc_name(&report.doc_name)));
    write_json(&file_out, report)?;

    if let Some(dbg_path) = &report.debug_path {
        println!(
            "{} Debug output saved in: {}",
            "ℹ".yellow().bold(),
            dbg_path.display().to_string().yellow().underline()
        );
    }
    println!(
        "{} Results saved in: {}",
        "✓".green().bold(),
        file_out.display().to_string().cyan().underline()
    );
    Ok(file_out)
}

/// Write persistence stats next to the report as `<doc>-stats.json`.
pub fn save_batch_stats(
    stats: &BatchStats,
    doc_name: &str,
    res_dir_path: &Path,
) -> anyhow::Result<PathBuf> {
    let file_out = res_dir_path.join(format!("{}-stats.json", sanitize_doc_name(doc_name)));
    write_json(&file_out, stats)?;
    Ok(file_out)
}
