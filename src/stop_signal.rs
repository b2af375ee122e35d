use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop is requested when the sentinel file exists or Ctrl-C has been
/// pressed. The listener never deletes the sentinel; whoever created it
/// clears it.
#[derive(Clone, Debug)]
pub struct StopSignal {
    sentinel: PathBuf,
    interrupted: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new(sentinel: &Path) -> StopSignal {
        StopSignal {
            sentinel: sentinel.to_path_buf(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Hook Ctrl-C / SIGTERM up to this signal. Can only be installed once per process.
    pub fn install_ctrlc_handler(&self) -> Result<(), ctrlc::Error> {
        let interrupted = Arc::clone(&self.interrupted);
        ctrlc::set_handler(move || {
            warn!("--Listener--: Interrupt received, stopping after the current step.");
            interrupted.store(true, Ordering::SeqCst);
        })
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst) || self.sentinel.exists()
    }
}
