//! Host stand-in for the proximity-tag emulator.
//!
//! While emulating, the live NDEF payload is published at a fixed file path
//! for a reader simulator to pick up; stopping removes the file. The file is
//! replaced atomically so a reader never sees a partial payload.

use std::path::{Path, PathBuf};

use bizcard_core::{EmulationError, StopOutcome, TagEmulator};

pub struct FileTagEmulator {
    payload_path: PathBuf,
    staged: Option<Vec<u8>>,
    running: bool,
}

impl FileTagEmulator {
    /// Emulator publishing to `payload_path`. A payload file left over from
    /// an earlier run counts as running, so the first stop removes it.
    pub fn new(payload_path: PathBuf) -> Self {
        let running = payload_path.exists();
        Self {
            payload_path,
            staged: None,
            running,
        }
    }

    pub fn payload_path(&self) -> &Path {
        &self.payload_path
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl TagEmulator for FileTagEmulator {
    fn stop(&mut self) -> Result<StopOutcome, EmulationError> {
        if !self.running {
            return Ok(StopOutcome::AlreadyStopped);
        }
        match std::fs::remove_file(&self.payload_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EmulationError::Stop(e.to_string())),
        }
        self.running = false;
        Ok(StopOutcome::Stopped)
    }

    fn set_payload(&mut self, payload: &[u8]) -> Result<(), EmulationError> {
        if self.running {
            return Err(EmulationError::SetPayload(
                "emulation must be stopped first".to_string(),
            ));
        }
        self.staged = Some(payload.to_vec());
        Ok(())
    }

    fn start(&mut self) -> Result<(), EmulationError> {
        let payload = self
            .staged
            .as_deref()
            .ok_or_else(|| EmulationError::Start("no payload installed".to_string()))?;
        if let Some(parent) = self.payload_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EmulationError::Start(e.to_string()))?;
        }
        let tmp = self.payload_path.with_extension("tmp");
        std::fs::write(&tmp, payload)
            .and_then(|()| std::fs::rename(&tmp, &self.payload_path))
            .map_err(|e| EmulationError::Start(e.to_string()))?;
        self.running = true;
        tracing::debug!(path = %self.payload_path.display(), len = payload.len(), "payload published");
        Ok(())
    }
}
