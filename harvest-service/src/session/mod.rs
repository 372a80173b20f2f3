//! On-disk persistence of the portal's authentication state.
//!
//! The artifact body is opaque to this module; it only guarantees that what
//! [`SessionStore::load`] returns is exactly what a previous
//! [`SessionStore::save`] wrote. Anything else reads back as "no session".

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Current envelope format version.
pub const ARTIFACT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("session artifact could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialized authentication state (cookies, tokens) owned by the portal client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionArtifact {
    pub state: Value,
    pub saved_at: OffsetDateTime,
}

impl SessionArtifact {
    pub fn new(state: Value) -> Self {
        Self {
            state,
            saved_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ArtifactFile {
    version: u32,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    checksum: String,
    state: Value,
}

fn checksum(state: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the stored artifact. Missing, unreadable or corrupt files are
    /// reported as `None`.
    pub fn load(&self) -> Option<SessionArtifact> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no stored session artifact");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "session artifact unreadable");
                return None;
            }
        };

        let file: ArtifactFile = match serde_json::from_slice(&bytes) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "session artifact malformed");
                return None;
            }
        };

        if file.version != ARTIFACT_VERSION {
            tracing::warn!(
                version = file.version,
                expected = ARTIFACT_VERSION,
                "session artifact has unsupported version"
            );
            return None;
        }

        match checksum(&file.state) {
            Ok(sum) if sum == file.checksum => {}
            _ => {
                tracing::warn!(path = %self.path.display(), "session artifact checksum mismatch");
                return None;
            }
        }

        Some(SessionArtifact {
            state: file.state,
            saved_at: file.saved_at,
        })
    }

    /// Persist `artifact`, replacing any previous one atomically.
    pub fn save(&self, artifact: &SessionArtifact) -> Result<(), SessionError> {
        let file = ArtifactFile {
            version: ARTIFACT_VERSION,
            saved_at: artifact.saved_at,
            checksum: checksum(&artifact.state)?,
            state: artifact.state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path();
        let written = (|| -> io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!(path = %self.path.display(), "session artifact saved");
        Ok(())
    }

    /// Delete the stored artifact. Succeeds if there is nothing to delete.
    pub fn invalidate(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "session artifact invalidated");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
