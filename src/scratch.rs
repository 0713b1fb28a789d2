use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use tempfile::TempDir;

use crate::Error;

/// A lazily-created, exclusively-owned scratch directory for intermediate signature material
///
/// Clones share the same state, so a clone can be handed to an interrupt handler
/// which removes the directory even while an operation is in flight.
///
/// Besides the directory, the handle tracks the staging file of a signature record
/// that is being saved, so that an interrupted save does not leave it behind.
#[derive(Debug, Clone, Default)]
pub struct Scratch(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    dir: Option<TempDir>,
    staged: Option<PathBuf>,
}

impl Scratch {
    /// Create a new scratch handle; the directory itself is only created on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the scratch directory, creating the directory if necessary
    pub fn path(&self) -> Result<PathBuf, Error> {
        let mut state = self.lock();

        let dir = match state.dir.take() {
            Some(dir) => dir,
            None => {
                let dir = tempfile::Builder::new().prefix("imgsig.").tempdir()?;

                debug!("Created scratch directory `{}`", dir.path().display());

                dir
            }
        };

        let path = dir.path().to_path_buf();
        state.dir = Some(dir);

        Ok(path)
    }

    /// Path of the scratch directory if it currently exists
    pub fn current(&self) -> Option<PathBuf> {
        self.lock().dir.as_ref().map(|dir| dir.path().to_path_buf())
    }

    /// Register a staging file to delete on `remove`, or clear the registration with `None`
    pub fn stage(&self, path: Option<&Path>) {
        self.lock().staged = path.map(Path::to_path_buf);
    }

    /// The currently registered staging file
    pub fn staged(&self) -> Option<PathBuf> {
        self.lock().staged.clone()
    }

    /// Remove the scratch directory and everything in it, as well as any staging file
    ///
    /// Safe to call any number of times; a later `path` call creates a fresh directory.
    pub fn remove(&self) {
        let (dir, staged) = {
            let mut state = self.lock();
            (state.dir.take(), state.staged.take())
        };

        if let Some(staged) = staged {
            match fs::remove_file(&staged) {
                Ok(()) => debug!("Removed staging file `{}`", staged.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => warn!(
                    "Removing staging file `{}` failed: {}",
                    staged.display(),
                    e
                ),
            }
        }

        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();

            match dir.close() {
                Ok(()) => debug!("Removed scratch directory `{}`", path.display()),
                Err(e) => warn!(
                    "Removing scratch directory `{}` failed: {}",
                    path.display(),
                    e
                ),
            }
        }
    }

    // A panic while holding the lock cannot leave the state half-updated
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
