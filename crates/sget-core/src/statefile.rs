//! The `.state` sidecar: human-diffable resume token for a download.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::segments::Segments;

/// Suffix appended to the output path for the sidecar file.
pub const STATE_SUFFIX: &str = ".state";

/// Handle on the sidecar next to an output file.
///
/// The coordinator is the single writer; saving truncates and rewrites the
/// whole file, so a save is atomic from its perspective and repeating it is
/// harmless.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Sidecar for `output` (e.g. `archive.iso` -> `archive.iso.state`).
    pub fn for_output(output: &Path) -> Self {
        let mut os = output.as_os_str().to_owned();
        os.push(STATE_SUFFIX);
        StateFile { path: PathBuf::from(os) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the segment set. A missing sidecar is a fresh download (empty set).
    pub fn load(&self, min_chunk: u64) -> Result<Segments> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read state file {}", self.path.display()))
            }
        };
        Segments::parse(&text, min_chunk).with_context(|| {
            format!(
                "unparseable state file {} (delete it to restart the download)",
                self.path.display()
            )
        })
    }

    /// Serialize `segments` (compacting it) and rewrite the sidecar.
    pub fn save(&self, segments: &mut Segments) -> Result<()> {
        let text = segments.serialize();
        std::fs::write(&self.path, text.as_bytes())
            .with_context(|| format!("write state file {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), state = %text, "state saved");
        Ok(())
    }

    /// Delete the sidecar (used when a finished download leaves no resume
    /// work behind, or when the user opts out of resuming).
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("remove state file {}", self.path.display()))
            }
        }
    }
}
