// Worker process side of the refresh protocol

use std::any::Any;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info, warn};

use super::protocol::{FieldCacheOptions, ProcessOptions, Request, Response};
use crate::error::WorkerResult;
use crate::index::field_cache::FieldIndex;
use crate::index::sanitize_path_segment;
use crate::indexer::extract::{extract, extract_source_tree};
use crate::indexer::fields::update_index;
use crate::indexer::parser::{ParseOptions, ParsedMetadata};
use crate::indexer::Indexer;
use crate::logging;

/// Writes one JSON message per line and flushes after each.
pub struct MessageWriter<W: Write> {
    out: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn send(&mut self, message: &Response) -> WorkerResult<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Serve requests from stdin until it closes.
pub fn run_stdio() -> WorkerResult<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run(stdin.lock(), stdout.lock())
}

/// Request loop. Every `process` request yields exactly one `success` or
/// `error`; every `updateFieldCache` yields `fieldCacheData` or `fieldCacheError`.
pub fn run<R: BufRead, W: Write>(input: R, output: W) -> WorkerResult<()> {
    let mut writer = MessageWriter::new(output);
    debug!("Worker {} ready", std::process::id());

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                writer.send(&Response::Error {
                    message: format!("Invalid request: {}", e),
                    stack: None,
                    app_path: None,
                })?;
                continue;
            }
        };

        match request {
            Request::Process { app_path, options } => handle_process(&app_path, &options, &mut writer)?,
            Request::UpdateFieldCache { options } => {
                let response = handle_update_field_cache(&options, &mut writer);
                writer.send(&response)?;
            }
            Request::SetLogLevel { log_level } => logging::set_level(&log_level),
        }
    }

    debug!("Worker {} input closed", std::process::id());
    Ok(())
}

fn handle_process<W: Write>(app_path: &Path, options: &ProcessOptions, writer: &mut MessageWriter<W>) -> WorkerResult<()> {
    logging::set_level(&options.log_level);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| process_artifact(app_path, options, writer)));
    let terminal = match outcome {
        Ok(Ok(parsed)) => Response::Success {
            symbols: parsed.objects,
            procedures: parsed.procedures,
            app_path: app_path.to_path_buf(),
        },
        Ok(Err(e)) => Response::Error {
            message: format!("{:#}", e),
            stack: Some(format!("{:?}", e)),
            app_path: Some(app_path.to_path_buf()),
        },
        Err(payload) => Response::Error {
            message: format!("Worker panicked: {}", panic_message(payload.as_ref())),
            stack: None,
            app_path: Some(app_path.to_path_buf()),
        },
    };
    writer.send(&terminal)
}

/// Extract, optionally copy sources out, then parse. The scratch tree is removed
/// when `tree` drops, on every path out of this function.
fn process_artifact<W: Write>(
    app_path: &Path,
    options: &ProcessOptions,
    writer: &mut MessageWriter<W>,
) -> anyhow::Result<ParsedMetadata> {
    let file_name = app_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    writer.send(&Response::progress(format!("Extracting {}", file_name)))?;

    let mut tree = extract(app_path, &options.extract_path)?;
    info!("Unpacked {} files from {}", tree.file_count, file_name);

    if options.enable_src_extraction {
        if let Some(dest) = &options.src_extraction_path {
            let mut copied = 0usize;
            let mut send_failure = None;
            let mut on_file = |relative: &Path| {
                copied += 1;
                if send_failure.is_none() {
                    let message = Response::progress(format!("Extracted source {}", relative.display()));
                    if let Err(e) = writer.send(&message) {
                        send_failure = Some(e);
                    }
                }
            };
            let extracted = extract_source_tree(app_path, &mut tree.archive, dest, &mut on_file);
            if let Some(e) = send_failure {
                return Err(e.into());
            }
            match extracted {
                Ok(true) => writer.send(&Response::progress(format!("Extracted {} source files", copied)))?,
                Ok(false) => writer.send(&Response::warning(format!(
                    "Cannot derive app name and version from {}",
                    file_name
                )))?,
                Err(e) => {
                    warn!("Source extraction failed: {}", e);
                    writer.send(&Response::warning(format!("Source extraction failed: {}", e)))?;
                }
            }
        }
    }

    writer.send(&Response::progress(format!("Parsing {}", file_name)))?;
    let parse_options = ParseOptions {
        extract_procedures: options.extract_procedures,
    };
    let mut parsed = Indexer::new()
        .index_tree(tree.root(), &parse_options)
        .with_context(|| format!("Failed to read metadata from {}", file_name))?;

    for record in &mut parsed.objects {
        record.app = Some(file_name.clone());
    }
    info!(
        "{}: {} objects, {} procedure lists",
        file_name,
        parsed.objects.len(),
        parsed.procedures.len()
    );
    Ok(parsed)
}

fn handle_update_field_cache<W: Write>(options: &FieldCacheOptions, writer: &mut MessageWriter<W>) -> Response {
    logging::set_level(&options.log_level);

    let root = match &options.app_name {
        Some(app) => options.src_extraction_path.join(sanitize_path_segment(app)),
        None => options.src_extraction_path.clone(),
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let previous = FieldIndex::load(&options.global_storage_path);
        update_index(&root, previous)
    }));

    match outcome {
        Ok((index, stats)) => {
            if stats.changed() {
                let message = Response::progress(format!(
                    "Field index: {} files parsed, {} removed",
                    stats.parsed, stats.removed
                ));
                if let Err(e) = writer.send(&message) {
                    warn!("Failed to report field index progress: {}", e);
                }
            }
            Response::field_cache_data(index)
        }
        Err(payload) => Response::FieldCacheError {
            message: format!("Field index update panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
