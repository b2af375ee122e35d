use crate::config_file::UploadMode;
use crate::integrations::command_runner::{CommandRunner, Invocation};
use failure::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;
use zip::write::FileOptions;

pub struct StorageIntegration<'a, R: CommandRunner> {
    runner: &'a R,
    gsutil: &'a str,
    bucket: &'a str,
    mode: UploadMode,
    timeout: Duration,
}

impl<'a, R: CommandRunner> StorageIntegration<'a, R> {
    pub fn new(
        runner: &'a R,
        gsutil: &'a str,
        bucket: &'a str,
        mode: UploadMode,
        timeout: Duration,
    ) -> StorageIntegration<'a, R> {
        StorageIntegration {
            runner,
            gsutil,
            bucket,
            mode,
            timeout,
        }
    }

    /// Uploads `folder` under `prefix`. Some(destination) on success.
    pub fn upload_folder(&self, folder: &Path, prefix: &str) -> Option<String> {
        match self.try_upload(folder, prefix) {
            Ok(destination) => {
                info!("--Storage--: Uploaded {} to {}", folder.display(), destination);
                Some(destination)
            }
            Err(e) => {
                warn!("--Storage--: Upload of {} failed: {}", folder.display(), e);
                None
            }
        }
    }

    fn try_upload(&self, folder: &Path, prefix: &str) -> Result<String, Error> {
        if !folder.is_dir() {
            bail!("{} is not a folder", folder.display());
        }
        let base = destination_base(self.bucket, prefix);

        match self.mode {
            UploadMode::Archive => {
                // Dropping the TempDir removes the archive on every path out of here.
                let scratch = tempfile::Builder::new().prefix("unity-upload-").tempdir()?;
                let archive_name = format!("{}.zip", folder_name(folder));
                let archive_path = scratch.path().join(&archive_name);
                zip_folder(folder, &archive_path)?;

                let destination = format!("{}/{}", base, archive_name);
                let invocation = Invocation::new(self.gsutil, self.timeout)
                    .arg("cp")
                    .arg(archive_path.to_string_lossy().into_owned())
                    .arg(destination.as_str());
                self.runner.run_checked(&invocation)?;
                Ok(destination)
            }
            UploadMode::Copy => {
                let destination = format!("{}/{}", base, folder_name(folder));
                let invocation = Invocation::new(self.gsutil, self.timeout)
                    .args(vec!["-m", "cp", "-r"])
                    .arg(folder.to_string_lossy().into_owned())
                    .arg(format!("{}/", base));
                self.runner.run_checked(&invocation)?;
                Ok(destination)
            }
        }
    }
}

/// Backslashes become slashes, runs of slashes collapse, and the ends are trimmed.
pub fn normalize_prefix(prefix: &str) -> String {
    prefix
        .replace('\\', "/")
        .split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn destination_base(bucket: &str, prefix: &str) -> String {
    let bucket = bucket.trim().trim_start_matches("gs://").trim_matches('/');
    let prefix = normalize_prefix(prefix);
    if prefix.is_empty() {
        format!("gs://{}", bucket)
    } else {
        format!("gs://{}/{}", bucket, prefix)
    }
}

fn folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "build".to_string())
}

pub fn zip_folder(source: &Path, archive: &Path) -> Result<(), Error> {
    let file = File::create(archive)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let path = entry.path();
        let relative = match path.strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        // Zip entries always use forward slashes.
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            let mut source_file = File::open(path)?;
            io::copy(&mut source_file, &mut zip)?;
        }
    }
    zip.finish()?.flush()?;
    Ok(())
}
