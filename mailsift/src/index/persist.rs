//! On-disk layout of the vector index.
//!
//! A save writes `index.g{N}.json` (graph + slot arena) and `mapping.g{N}.json`
//! (slot -> remote id), then `index.manifest.json`, which names both files, the
//! generation and their SHA-256. Every file goes through temp file, fsync,
//! rename, and the manifest is renamed last, so a crash mid-save leaves the
//! previous generation's manifest pointing at that generation's files.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::hnsw::Hnsw;
use super::slots::SlotArena;
use super::VectorIndex;
use crate::error::MailsiftError;
use crate::types::{RemoteId, Slot};

pub const FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE: &str = "index.manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    generation: u64,
    dimension: usize,
    index_file: String,
    index_sha256: String,
    mapping_file: String,
    mapping_sha256: String,
}

#[derive(Serialize)]
struct IndexBlobRef<'a> {
    graph: &'a Hnsw,
    slots: &'a SlotArena,
}

#[derive(Deserialize)]
struct IndexBlob {
    graph: Hnsw,
    slots: SlotArena,
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    generation: u64,
    entries: Vec<(Slot, RemoteId)>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MailsiftError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), MailsiftError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), MailsiftError> {
    Ok(())
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join(MANIFEST_FILE)
}

pub fn exists(dir: &Path) -> bool {
    manifest_path(dir).exists()
}

/// Save the index under its current generation.
pub fn save(dir: &Path, index: &VectorIndex) -> Result<(), MailsiftError> {
    fs::create_dir_all(dir)?;

    let generation = index.generation();
    let index_file = format!("index.g{}.json", generation);
    let mapping_file = format!("mapping.g{}.json", generation);

    let blob = serde_json::to_vec(&IndexBlobRef {
        graph: index.graph(),
        slots: index.arena(),
    })?;
    let mapping = serde_json::to_vec(&MappingFile {
        generation,
        entries: index.mappings().collect(),
    })?;

    write_atomic(&dir.join(&index_file), &blob)?;
    write_atomic(&dir.join(&mapping_file), &mapping)?;

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        generation,
        dimension: index.dimension(),
        index_sha256: sha256_hex(&blob),
        mapping_sha256: sha256_hex(&mapping),
        index_file: index_file.clone(),
        mapping_file: mapping_file.clone(),
    };
    write_atomic(&manifest_path(dir), &serde_json::to_vec_pretty(&manifest)?)?;
    sync_dir(dir)?;

    remove_stale(dir, &index_file, &mapping_file)?;

    debug!(generation, entries = index.len(), "Saved vector index");
    Ok(())
}

/// Delete files from older generations and leftover temp files.
fn remove_stale(dir: &Path, keep_index: &str, keep_mapping: &str) -> Result<(), MailsiftError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let generational = name.starts_with("index.g") || name.starts_with("mapping.g");
        let leftover = name.ends_with(".tmp");
        if (generational && name != keep_index && name != keep_mapping) || leftover {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn corrupt(what: impl std::fmt::Display) -> MailsiftError {
    MailsiftError::CorruptIndex(what.to_string())
}

/// Load the index saved for `expected_generation`.
///
/// Every failure (missing files, checksum or generation mismatch, parse
/// errors, inconsistent mapping) is reported as `CorruptIndex`.
pub fn load(dir: &Path, expected_generation: u64, dimension: usize) -> Result<VectorIndex, MailsiftError> {
    let manifest_bytes =
        fs::read(manifest_path(dir)).map_err(|e| corrupt(format!("manifest unreadable: {}", e)))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| corrupt(format!("manifest unparseable: {}", e)))?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} not supported",
            manifest.format_version
        )));
    }
    if manifest.generation != expected_generation {
        return Err(corrupt(format!(
            "index generation {} does not match committed generation {}",
            manifest.generation, expected_generation
        )));
    }
    if manifest.dimension != dimension {
        return Err(corrupt(format!(
            "index dimension {} does not match {}",
            manifest.dimension, dimension
        )));
    }

    let blob = fs::read(dir.join(&manifest.index_file))
        .map_err(|e| corrupt(format!("{} unreadable: {}", manifest.index_file, e)))?;
    if sha256_hex(&blob) != manifest.index_sha256 {
        return Err(corrupt(format!("{} checksum mismatch", manifest.index_file)));
    }
    let mapping = fs::read(dir.join(&manifest.mapping_file))
        .map_err(|e| corrupt(format!("{} unreadable: {}", manifest.mapping_file, e)))?;
    if sha256_hex(&mapping) != manifest.mapping_sha256 {
        return Err(corrupt(format!("{} checksum mismatch", manifest.mapping_file)));
    }

    let blob: IndexBlob =
        serde_json::from_slice(&blob).map_err(|e| corrupt(format!("index unparseable: {}", e)))?;
    let mapping: MappingFile = serde_json::from_slice(&mapping)
        .map_err(|e| corrupt(format!("mapping unparseable: {}", e)))?;
    if mapping.generation != manifest.generation {
        return Err(corrupt(format!(
            "mapping generation {} does not match manifest generation {}",
            mapping.generation, manifest.generation
        )));
    }

    let index = VectorIndex::from_parts(
        dimension,
        blob.graph,
        blob.slots,
        mapping.entries,
        manifest.generation,
    )?;
    info!(generation = manifest.generation, entries = index.len(), "Loaded vector index");
    Ok(index)
}

/// Bytes used by the files of the current generation.
pub fn on_disk_bytes(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hnsw::HnswParams;
    use tempfile::TempDir;

    fn sample(generation: u64) -> VectorIndex {
        let mut index = VectorIndex::new(3, HnswParams::default());
        index.insert(101, &[1.0, 0.0, 0.0]).unwrap();
        index.insert(102, &[0.0, 1.0, 0.0]).unwrap();
        index.insert(103, &[0.0, 0.0, 1.0]).unwrap();
        index.remove(1);
        index.set_generation(generation);
        index
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let index = sample(4);
        save(dir.path(), &index).unwrap();

        let loaded = load(dir.path(), 4, 3).unwrap();
        assert_eq!(loaded.generation(), 4);
        assert_eq!(loaded.mappings().collect::<Vec<_>>(), vec![(0, 101), (2, 103)]);
        let q = [0.0, 0.1, 1.0];
        assert_eq!(loaded.search(&q, 2).unwrap(), index.search(&q, 2).unwrap());
    }

    #[test]
    fn test_generation_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        save(dir.path(), &sample(2)).unwrap();
        assert!(matches!(load(dir.path(), 3, 3), Err(MailsiftError::CorruptIndex(_))));
    }

    #[test]
    fn test_tampered_mapping_is_corrupt() {
        let dir = TempDir::new().unwrap();
        save(dir.path(), &sample(1)).unwrap();
        let path = dir.path().join("mapping.g1.json");
        let mut bytes = fs::read(&path).unwrap();
        bytes.push(b' ');
        fs::write(&path, bytes).unwrap();
        assert!(matches!(load(dir.path(), 1, 3), Err(MailsiftError::CorruptIndex(_))));
    }

    #[test]
    fn test_missing_manifest_is_corrupt() {
        let dir = TempDir::new().unwrap();
        assert!(!exists(dir.path()));
        assert!(matches!(load(dir.path(), 0, 3), Err(MailsiftError::CorruptIndex(_))));
    }

    #[test]
    fn test_save_removes_older_generations() {
        let dir = TempDir::new().unwrap();
        save(dir.path(), &sample(1)).unwrap();
        save(dir.path(), &sample(2)).unwrap();
        assert!(!dir.path().join("index.g1.json").exists());
        assert!(!dir.path().join("mapping.g1.json").exists());
        assert!(dir.path().join("index.g2.json").exists());
        assert!(on_disk_bytes(dir.path()) > 0);
    }
}
