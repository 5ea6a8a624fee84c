//! Incremental construction of password protected transfer archives

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::debug;
use walkdir::WalkDir;
use zip::unstable::write::FileOptionsExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};

/// A password protected archive that patient folders are appended to, one
/// append per completed study download.
pub struct Archive {
    path: PathBuf,
    password: String,
}

impl Archive {
    /// Open the archive, creating it with an `INDEX.txt` manifest as its
    /// first entry when it does not exist yet.
    pub fn open_or_create(
        path: impl Into<PathBuf>,
        password: impl Into<String>,
        creator_label: &str,
    ) -> Result<Self> {
        let archive = Self {
            path: path.into(),
            password: password.into(),
        };

        if archive.password.is_empty() {
            return Err(Error::Config(
                "An archive requires a non-empty password".into(),
            ));
        }

        if !archive.path.is_file() {
            debug!("Creating archive at {}", archive.path.display());
            if let Some(parent) = archive.path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let file = File::create(&archive.path)?;
            let mut writer = ZipWriter::new(file);
            writer.start_file("INDEX.txt", archive.file_options())?;
            writer.write_all(
                format!(
                    "Archive created by {} at {}.\n",
                    creator_label,
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                )
                .as_bytes(),
            )?;
            writer.finish()?;
        }

        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a folder tree to the archive. Entry names are prefixed with
    /// the folder's own name, so appending `/tmp/x/PSEUDO1` adds
    /// `PSEUDO1/...` entries.
    pub fn add_folder(&self, folder: &Path) -> Result<()> {
        let folder_name = folder
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("Invalid folder name: {}", folder.display())))?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut writer = ZipWriter::new_append(file)?;

        for entry in WalkDir::new(folder)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(folder)
                .map_err(|e| Error::Config(e.to_string()))?;
            // zip entries always use forward slashes
            let mut name = folder_name.to_string();
            for component in relative.components() {
                name.push('/');
                name.push_str(&component.as_os_str().to_string_lossy());
            }

            debug!("Adding {} to archive", name);
            writer.start_file(name, self.file_options())?;
            let mut source = File::open(entry.path())?;
            let mut buffer = Vec::new();
            source.read_to_end(&mut buffer)?;
            writer.write_all(&buffer)?;
        }

        writer.finish()?;
        Ok(())
    }

    fn file_options(&self) -> FileOptions {
        FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .with_deprecated_encryption(self.password.as_bytes())
    }
}
