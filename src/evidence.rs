//! Evidence artifacts for the current episode.
//!
//! Frames captured during significant detections are written as JPEG files
//! under a fixed directory. The store keeps only in-memory bookkeeping of
//! which artifacts belong to the open episode; `clear` forgets them, `purge`
//! deletes them from disk.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvidenceRecord {
    pub artifact_path: PathBuf,
    /// 1-based position within the episode.
    pub sequence: u32,
}

pub struct EvidenceStore {
    root: PathBuf,
    episode: u32,
    next_sequence: u32,
    records: Vec<EvidenceRecord>,
}

impl EvidenceStore {
    /// The directory is created lazily on first capture. Numbering resumes
    /// after the highest episode already on disk.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let episode = last_episode_on_disk(&root).map_or(1, |last| last + 1);
        Self {
            root,
            episode,
            next_sequence: 1,
            records: Vec::new(),
        }
    }

    pub fn episode(&self) -> u32 {
        self.episode
    }

    /// Persist `frame` as the next artifact of the episode.
    pub fn capture(&mut self, frame: &Frame) -> Result<PathBuf, PipelineError> {
        let path = self.artifact_path(self.next_sequence);
        write_jpeg(&path, frame).map_err(|source| PipelineError::StorageWrite {
            path: path.clone(),
            source,
        })?;

        self.records.push(EvidenceRecord {
            artifact_path: path.clone(),
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
        log::debug!("evidence captured: {}", path.display());
        Ok(path)
    }

    /// Artifact paths in capture order.
    pub fn list(&self) -> Vec<PathBuf> {
        self.records
            .iter()
            .map(|record| record.artifact_path.clone())
            .collect()
    }

    pub fn records(&self) -> &[EvidenceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every record and open a new episode. Files stay on disk.
    pub fn clear(&mut self) {
        self.records.clear();
        self.episode += 1;
        self.next_sequence = 1;
    }

    /// Forget the first `count` records, which a completed report already
    /// carried. Opens a new episode when nothing is left.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.records.len());
        self.records.drain(..count);
        if self.records.is_empty() {
            self.clear();
        }
    }

    /// Delete every recorded artifact from disk, then clear.
    ///
    /// Missing files are ignored; other I/O errors abort and leave the
    /// remaining records in place.
    pub fn purge(&mut self) -> std::io::Result<usize> {
        let mut removed = 0;
        while let Some(record) = self.records.first() {
            match fs::remove_file(&record.artifact_path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            self.records.remove(0);
        }
        self.clear();
        Ok(removed)
    }

    fn artifact_path(&self, sequence: u32) -> PathBuf {
        self.root.join(format!(
            "episode-{:04}-frame-{:04}.jpg",
            self.episode, sequence
        ))
    }
}

/// Highest `episode-NNNN-*` number among the files under `root`.
fn last_episode_on_disk(root: &Path) -> Option<u32> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return None,
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let rest = name.to_str()?.strip_prefix("episode-")?;
            let (number, _) = rest.split_once('-')?;
            number.parse::<u32>().ok()
        })
        .max()
}

fn write_jpeg(path: &Path, frame: &Frame) -> image::ImageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    // Never overwrite an artifact from an earlier run.
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    frame.write_jpeg(&mut writer)?;
    writer.flush()?;
    Ok(())
}
