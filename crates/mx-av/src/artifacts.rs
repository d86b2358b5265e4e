//! Run-scoped scratch storage for intermediate audio.
//!
//! An [`ArtifactStore`] owns one temporary directory per run. Every artifact
//! goes through `Allocated -> Ready -> Released`: a stage gets a path for an
//! allocated artifact, the store marks it ready once the bytes are on disk,
//! and the runner releases it when nobody needs it any more. Dropping the
//! store deletes whatever is left.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use mx_core::{ArtifactId, Error, Result, RunId};

/// Container format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Wav,
    Mp3,
    Flac,
    Ogg,
    /// Unknown container; the engine probes the content.
    Raw,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Wav => "wav",
            ArtifactFormat::Mp3 => "mp3",
            ArtifactFormat::Flac => "flac",
            ArtifactFormat::Ogg => "ogg",
            ArtifactFormat::Raw => "bin",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Wav => "audio/wav",
            ArtifactFormat::Mp3 => "audio/mpeg",
            ArtifactFormat::Flac => "audio/flac",
            ArtifactFormat::Ogg => "audio/ogg",
            ArtifactFormat::Raw => "application/octet-stream",
        }
    }

    /// Map a MIME type (parameters ignored) to a format.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => ArtifactFormat::Wav,
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" => ArtifactFormat::Mp3,
            "audio/flac" | "audio/x-flac" => ArtifactFormat::Flac,
            "audio/ogg" | "audio/vorbis" | "audio/opus" => ArtifactFormat::Ogg,
            _ => ArtifactFormat::Raw,
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => ArtifactFormat::Wav,
            "mp3" => ArtifactFormat::Mp3,
            "flac" => ArtifactFormat::Flac,
            "ogg" | "oga" | "opus" => ArtifactFormat::Ogg,
            _ => ArtifactFormat::Raw,
        }
    }
}

/// Lifecycle state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    Allocated,
    Ready,
    Released,
}

/// Metadata for one stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Slot name the artifact was produced for (input role or stage output).
    pub role: String,
    pub format: ArtifactFormat,
    pub created_at: DateTime<Utc>,
    /// Byte size, known once ready.
    pub size: Option<u64>,
}

/// Where the bytes of a finalized artifact come from.
#[derive(Debug, Clone)]
pub enum ByteSource {
    /// Write these bytes (uploads).
    Bytes(Bytes),
    /// An engine already wrote the file at the artifact's output path.
    InPlace,
}

struct Entry {
    artifact: Artifact,
    path: PathBuf,
    state: ArtifactState,
}

/// Scratch storage for one run.
pub struct ArtifactStore {
    run_id: RunId,
    dir: TempDir,
    next_id: AtomicU64,
    entries: Mutex<HashMap<ArtifactId, Entry>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("run_id", &self.run_id)
            .field("dir", &self.dir.path())
            .field("live", &self.live_count())
            .finish()
    }
}

impl ArtifactStore {
    /// Create the run's scratch directory under `root`
    /// (`mixdown-<run>-XXXXXX`).
    pub fn create(root: &Path, run_id: RunId) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("mixdown-{}-", run_id.short()))
            .tempdir_in(root)?;
        tracing::debug!(run = %run_id, "scratch dir {}", dir.path().display());
        Ok(Self {
            run_id,
            dir,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The run's scratch directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a new artifact. Nothing is written yet.
    pub fn allocate(&self, role: &str, format: ArtifactFormat) -> Artifact {
        let id = ArtifactId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let file_name = format!("{:04}-{}.{}", id.raw(), file_safe(role), format.extension());
        let artifact = Artifact {
            id,
            role: role.to_string(),
            format,
            created_at: Utc::now(),
            size: None,
        };
        self.entries.lock().insert(
            id,
            Entry {
                artifact: artifact.clone(),
                path: self.dir.path().join(file_name),
                state: ArtifactState::Allocated,
            },
        );
        artifact
    }

    /// Mark an allocated artifact ready, writing `source` first if it
    /// carries bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Write`] when the bytes cannot be written or the engine left
    /// no (or an empty) file behind. A failed finalize leaves the artifact
    /// allocated.
    pub async fn finalize(&self, id: ArtifactId, source: ByteSource) -> Result<Artifact> {
        let path = {
            let entries = self.entries.lock();
            let entry = entries
                .get(&id)
                .filter(|e| e.state != ArtifactState::Released)
                .ok_or(Error::ArtifactNotFound { artifact: id })?;
            if entry.state == ArtifactState::Ready {
                return Err(Error::Internal(format!("{id} is already finalized")));
            }
            entry.path.clone()
        };

        let size = match source {
            ByteSource::Bytes(data) => {
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|source| Error::Write { artifact: id, source })?;
                data.len() as u64
            }
            ByteSource::InPlace => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|source| Error::Write { artifact: id, source })?;
                if meta.len() == 0 {
                    return Err(Error::Write {
                        artifact: id,
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "engine produced an empty file",
                        ),
                    });
                }
                meta.len()
            }
        };

        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .filter(|e| e.state == ArtifactState::Allocated)
            .ok_or(Error::ArtifactNotFound { artifact: id })?;
        entry.state = ArtifactState::Ready;
        entry.artifact.size = Some(size);
        tracing::trace!(run = %self.run_id, "{id} ready ({size} bytes)");
        Ok(entry.artifact.clone())
    }

    /// Open a ready artifact for reading.
    pub async fn open(&self, id: ArtifactId) -> Result<tokio::fs::File> {
        let path = self.input_path(id)?;
        tokio::fs::File::open(&path)
            .await
            .map_err(|source| Error::Read { artifact: id, source })
    }

    /// Read a ready artifact fully into memory.
    pub async fn read_bytes(&self, id: ArtifactId) -> Result<Bytes> {
        let path = self.input_path(id)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|source| Error::Read { artifact: id, source })
    }

    /// Copy a ready artifact to `dest`, returning the number of bytes copied.
    pub async fn copy_to(&self, id: ArtifactId, dest: &Path) -> Result<u64> {
        let path = self.input_path(id)?;
        tokio::fs::copy(&path, dest)
            .await
            .map_err(|source| Error::Read { artifact: id, source })
    }

    /// Path of a ready artifact, for an engine to read.
    pub fn input_path(&self, id: ArtifactId) -> Result<PathBuf> {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(e) if e.state == ArtifactState::Ready => Ok(e.path.clone()),
            Some(e) if e.state == ArtifactState::Allocated => Err(Error::NotReady { artifact: id }),
            _ => Err(Error::ArtifactNotFound { artifact: id }),
        }
    }

    /// Path an engine should write an allocated artifact to.
    pub fn output_path(&self, id: ArtifactId) -> Result<PathBuf> {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(e) if e.state == ArtifactState::Allocated => Ok(e.path.clone()),
            Some(e) if e.state == ArtifactState::Ready => Err(Error::Internal(format!(
                "{id} is already finalized"
            ))),
            _ => Err(Error::ArtifactNotFound { artifact: id }),
        }
    }

    pub fn get(&self, id: ArtifactId) -> Option<Artifact> {
        self.entries.lock().get(&id).map(|e| e.artifact.clone())
    }

    pub fn state(&self, id: ArtifactId) -> Option<ArtifactState> {
        self.entries.lock().get(&id).map(|e| e.state)
    }

    /// Ids of all artifacts ever allocated, in allocation order.
    pub fn ids(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<_> = self.entries.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of artifacts not yet released.
    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state != ArtifactState::Released)
            .count()
    }

    /// Release the given artifacts, deleting their files. Best effort:
    /// failures are logged, never raised. Returns how many were released.
    pub fn release_all(&self, ids: &[ArtifactId]) -> usize {
        let doomed: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            ids.iter()
                .filter_map(|id| {
                    let entry = entries.get_mut(id)?;
                    if entry.state == ArtifactState::Released {
                        return None;
                    }
                    entry.state = ArtifactState::Released;
                    Some(entry.path.clone())
                })
                .collect()
        };

        for path in &doomed {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    run = %self.run_id,
                    "failed to remove {}: {e}",
                    path.display()
                ),
            }
        }
        doomed.len()
    }

    /// Release everything still live.
    pub fn release_remaining(&self) -> usize {
        let live: Vec<ArtifactId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.state != ArtifactState::Released)
            .map(|(id, _)| *id)
            .collect();
        self.release_all(&live)
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        let leftover = self.release_remaining();
        if leftover > 0 {
            tracing::debug!(run = %self.run_id, "released {leftover} leftover artifacts on drop");
        }
    }
}

fn file_safe(role: &str) -> String {
    role.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
