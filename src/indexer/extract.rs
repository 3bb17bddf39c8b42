// Package unpacking: scratch extraction and versioned source-tree copies

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use super::parser::is_source_file;
use crate::error::ExtractionError;
use crate::index::{sanitize_path_segment, short_hash, AppArtifact};

/// Compiled packages may carry a proprietary header in front of the zip payload
const NAVX_MAGIC: &[u8] = b"NAVX";
const LOCAL_FILE_SIGNATURE: &[u8] = b"PK\x03\x04";
const SOURCE_SEGMENT: &str = "src";

pub type PackageArchive = ZipArchive<Cursor<Vec<u8>>>;

/// Directory that is removed when dropped
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create (or empty) `path`.
    pub fn create(path: PathBuf) -> Result<Self, ExtractionError> {
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|e| ExtractionError::io(&path, e))?;
        }
        fs::create_dir_all(&path).map_err(|e| ExtractionError::io(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed scratch directory {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch directory {}: {}", self.path.display(), e),
        }
    }
}

/// Unpacked package contents. The scratch directory lives as long as this value.
#[derive(Debug)]
pub struct ExtractedTree {
    pub scratch: ScratchDir,
    pub archive: PackageArchive,
    pub file_count: usize,
}

impl ExtractedTree {
    pub fn root(&self) -> &Path {
        self.scratch.path()
    }
}

/// Byte offset where the zip payload starts
fn payload_offset(bytes: &[u8]) -> usize {
    if !bytes.starts_with(NAVX_MAGIC) || bytes.len() < 8 {
        return 0;
    }
    let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if bytes.get(declared..declared + LOCAL_FILE_SIGNATURE.len()) == Some(LOCAL_FILE_SIGNATURE) {
        return declared;
    }
    bytes
        .windows(LOCAL_FILE_SIGNATURE.len())
        .position(|w| w == LOCAL_FILE_SIGNATURE)
        .unwrap_or(0)
}

/// Read a package into memory and open it as a zip archive.
pub fn open_archive(path: &Path) -> Result<PackageArchive, ExtractionError> {
    let mut bytes = fs::read(path).map_err(|e| ExtractionError::io(path, e))?;
    let offset = payload_offset(&bytes);
    if offset > 0 {
        debug!("Skipping {} byte package header in {}", offset, path.display());
        bytes.drain(..offset);
    }
    ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractionError::zip(path, e))
}

/// Scratch subdirectory name: the sanitized file name plus a hash of the full
/// path, so equally named packages from different folders never collide.
pub fn scratch_dir_name(artifact_path: &Path) -> String {
    let file_name = artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "{}-{}",
        sanitize_path_segment(&file_name),
        short_hash(artifact_path.to_string_lossy().as_bytes())
    )
}

/// Unpack `artifact_path` into its own subdirectory of `scratch_dir`.
pub fn extract(artifact_path: &Path, scratch_dir: &Path) -> Result<ExtractedTree, ExtractionError> {
    let mut archive = open_archive(artifact_path)?;
    let scratch = ScratchDir::create(scratch_dir.join(scratch_dir_name(artifact_path)))?;

    let mut file_count = 0;
    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .map_err(|e| ExtractionError::zip(artifact_path, e))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe entry '{}' in {}", entry.name(), artifact_path.display());
            continue;
        };
        let target = scratch.path().join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| ExtractionError::io(&target, e))?;
            continue;
        }
        write_entry(&mut entry, &target)?;
        file_count += 1;
    }

    debug!(
        "Extracted {} files from {} into {}",
        file_count,
        artifact_path.display(),
        scratch.path().display()
    );
    Ok(ExtractedTree {
        scratch,
        archive,
        file_count,
    })
}

fn write_entry(reader: &mut impl io::Read, target: &Path) -> Result<(), ExtractionError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| ExtractionError::io(parent, e))?;
    }
    let mut out = File::create(target).map_err(|e| ExtractionError::io(target, e))?;
    io::copy(reader, &mut out).map_err(|e| ExtractionError::io(target, e))?;
    Ok(())
}

/// Percent-decode a path segment, tolerating double escaping. Falls back to
/// the raw segment when decoding yields invalid UTF-8.
fn decode_segment(raw: &str) -> String {
    let Ok(once) = percent_decode_str(raw).decode_utf8() else {
        return raw.to_string();
    };
    if !once.contains('%') {
        return once.into_owned();
    }
    match percent_decode_str(&once).decode_utf8() {
        Ok(twice) => twice.into_owned(),
        Err(_) => once.into_owned(),
    }
}

/// Path of a source entry relative to its `src/` segment, decoded and with
/// traversal segments dropped. `None` for entries outside a `src/` folder.
fn source_relative_path(entry_name: &str) -> Option<PathBuf> {
    let normalized = entry_name.replace('\\', "/");
    let segments: Vec<&str> = normalized.split('/').collect();
    let src = segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case(SOURCE_SEGMENT))?;

    let relative: PathBuf = segments[src + 1..]
        .iter()
        .map(|s| decode_segment(s))
        .filter(|s| !matches!(s.as_str(), "" | "." | ".."))
        .map(|s| sanitize_path_segment(&s))
        .collect();
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

/// Copy every source file under a `src/` segment of `archive` to
/// `<dest_base>/<appName>/<appVersion>/...`, overwriting what is there.
///
/// Returns `Ok(false)` when the artifact's file name cannot be decomposed.
pub fn extract_source_tree(
    artifact_path: &Path,
    archive: &mut PackageArchive,
    dest_base: &Path,
    on_file: &mut dyn FnMut(&Path),
) -> Result<bool, ExtractionError> {
    let Some(artifact) = AppArtifact::from_path(artifact_path) else {
        warn!("Cannot derive app name and version from {}", artifact_path.display());
        return Ok(false);
    };
    let dest = artifact.source_dir(dest_base);

    let mut written = 0;
    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .map_err(|e| ExtractionError::zip(artifact_path, e))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = source_relative_path(entry.name()) else {
            continue;
        };
        if !is_source_file(&relative) {
            continue;
        }
        let target = dest.join(&relative);
        write_entry(&mut entry, &target)?;
        on_file(&relative);
        written += 1;
    }

    info!(
        "Extracted {} source files of {} {} to {}",
        written,
        artifact.app_name,
        artifact.app_version,
        dest.display()
    );
    Ok(true)
}

/// True when the versioned source directory for `artifact` already holds at
/// least one source file.
pub fn has_extracted_sources(artifact: &AppArtifact, dest_base: &Path) -> bool {
    let dir = artifact.source_dir(dest_base);
    dir.is_dir()
        && WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.file_type().is_file() && is_source_file(e.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn navx_wrapped(payload: &[u8]) -> Vec<u8> {
        let mut bytes = b"NAVX".to_vec();
        bytes.extend_from_slice(&40u32.to_le_bytes());
        bytes.resize(40, 0);
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_extract_and_cleanup() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("Contoso_Sales_1.0.0.0.app");
        fs::write(
            &app,
            build_zip(&[("SymbolReference.json", "{}"), ("src/Tables/Extra.Table.al", "table 1 X { }")]),
        )
        .unwrap();

        let scratch_base = dir.path().join("scratch");
        let tree = extract(&app, &scratch_base).unwrap();
        let root = tree.root().to_path_buf();
        assert_eq!(tree.file_count, 2);
        assert!(root.join("SymbolReference.json").is_file());
        assert!(root.join("src/Tables/Extra.Table.al").is_file());
        assert!(root.starts_with(&scratch_base));

        drop(tree);
        assert!(!root.exists());
    }

    #[test]
    fn test_navx_header_is_skipped() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("Contoso_Sales_1.0.0.0.app");
        fs::write(&app, navx_wrapped(&build_zip(&[("a.txt", "hello")]))).unwrap();

        let archive = open_archive(&app).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn test_non_archive_is_benign_error() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("readme.app");
        fs::write(&app, "this is not a zip file at all").unwrap();

        let err = extract(&app, &dir.path().join("scratch")).unwrap_err();
        assert!(err.is_benign());
        assert!(!dir.path().join("scratch").join(scratch_dir_name(&app)).exists());
    }

    #[test]
    fn test_scratch_names_differ_per_location() {
        let a = scratch_dir_name(Path::new("/one/Pub_App_1.0.app"));
        let b = scratch_dir_name(Path::new("/two/Pub_App_1.0.app"));
        assert_ne!(a, b);
        assert!(a.starts_with("Pub_App_1.0.app-"));
    }

    #[test]
    fn test_decode_segment() {
        assert_eq!(decode_segment("My%20Table.al"), "My Table.al");
        assert_eq!(decode_segment("My%2520Table.al"), "My Table.al");
        assert_eq!(decode_segment("bad%ZZ.al"), "bad%ZZ.al");
        assert_eq!(decode_segment("x%FF.al"), "x%FF.al");
    }

    #[test]
    fn test_source_relative_path() {
        assert_eq!(
            source_relative_path("src/Codeunits/Helper.al"),
            Some(PathBuf::from("Codeunits/Helper.al"))
        );
        assert_eq!(
            source_relative_path("App/src/../../etc/x.al"),
            Some(PathBuf::from("etc/x.al"))
        );
        assert_eq!(source_relative_path("Translations/app.xlf"), None);
        assert_eq!(source_relative_path("src/"), None);
    }

    #[test]
    fn test_extract_source_tree() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("Contoso_Sales Tools_2.1.0.0.app");
        fs::write(
            &app,
            build_zip(&[
                ("src/Codeunits/My%2520Helper.Codeunit.al", "codeunit 50000 Helper { }"),
                ("src/Readme.md", "docs"),
                ("NotSource/Other.al", "table 1 X { }"),
            ]),
        )
        .unwrap();

        let dest = dir.path().join("src-cache");
        let mut archive = open_archive(&app).unwrap();
        let mut seen = Vec::new();
        let ok = extract_source_tree(&app, &mut archive, &dest, &mut |p: &Path| seen.push(p.to_path_buf())).unwrap();
        assert!(ok);
        assert_eq!(seen, vec![PathBuf::from("Codeunits/My Helper.Codeunit.al")]);

        let written = dest.join("Sales Tools/2.1.0.0/Codeunits/My Helper.Codeunit.al");
        assert_eq!(fs::read_to_string(&written).unwrap(), "codeunit 50000 Helper { }");

        let artifact = AppArtifact::from_path(&app).unwrap();
        assert!(has_extracted_sources(&artifact, &dest));

        fs::write(&written, "stale").unwrap();
        extract_source_tree(&app, &mut archive, &dest, &mut |_: &Path| {}).unwrap();
        assert_eq!(fs::read_to_string(&written).unwrap(), "codeunit 50000 Helper { }");
    }

    #[test]
    fn test_extract_source_tree_rejects_nameless_path() {
        let dir = tempdir().unwrap();
        let mut archive = ZipArchive::new(Cursor::new(build_zip(&[("src/a.al", "x")]))).unwrap();
        let ok = extract_source_tree(Path::new("/"), &mut archive, dir.path(), &mut |_: &Path| {}).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_has_extracted_sources_needs_a_source_file() {
        let dir = tempdir().unwrap();
        let artifact = AppArtifact::from_path("/pkgs/Pub_App_1.0.0.0.app").unwrap();
        assert!(!has_extracted_sources(&artifact, dir.path()));

        let version_dir = artifact.source_dir(dir.path());
        fs::create_dir_all(&version_dir).unwrap();
        fs::write(version_dir.join("notes.txt"), "x").unwrap();
        assert!(!has_extracted_sources(&artifact, dir.path()));
    }
}
