use std::fs;
use std::io;
use std::path::Path;

/// Creates the folder (and parents) if it isn't there yet.
pub fn ensure_folder(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    info!("--Folders--: Creating {}", path.display());
    fs::create_dir_all(path)
}

/// Empties a folder without removing it, so a new build never ships stale files.
pub fn reset_folder(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)
}
