//! Zip container for rooted repositories
//!
//! Blocking; callers run these on the blocking pool.

use crate::error::{StorageError, StorageResult};

use std::fs::{self, File};
use std::io::{self, Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |e| StorageError::io(path.display().to_string(), e)
}

/// Pack the contents of `dir` into an in-memory zip archive.
///
/// Entries are written in sorted order so equal trees produce equal archives.
/// Symlinks are skipped.
pub fn pack_dir(dir: &Path) -> StorageResult<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    add_dir(&mut zip, dir, "", options)?;

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn add_dir(
    zip: &mut zip::ZipWriter<Cursor<Vec<u8>>>,
    dir: &Path,
    prefix: &str,
    options: SimpleFileOptions,
) -> StorageResult<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(dir))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err(&path))?;
        let name = entry.file_name();
        let name = name.to_str().ok_or_else(|| StorageError::Archive(format!(
            "non UTF-8 file name: {}",
            path.display()
        )))?;
        let entry_name = format!("{}{}", prefix, name);

        if file_type.is_dir() {
            zip.add_directory(format!("{}/", entry_name), options)?;
            add_dir(zip, &path, &format!("{}/", entry_name), options)?;
        } else if file_type.is_file() {
            let options = file_options(&path, options)?;
            zip.start_file(entry_name, options)?;
            let mut file = File::open(&path).map_err(io_err(&path))?;
            io::copy(&mut file, zip).map_err(io_err(&path))?;
        } else {
            tracing::debug!(path = %path.display(), "Skipping non-regular file");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_options(path: &Path, options: SimpleFileOptions) -> StorageResult<SimpleFileOptions> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path).map_err(io_err(path))?.permissions().mode();
    Ok(options.unix_permissions(mode & 0o777))
}

#[cfg(not(unix))]
fn file_options(_path: &Path, options: SimpleFileOptions) -> StorageResult<SimpleFileOptions> {
    Ok(options)
}

/// Extract an archive into `dest`, which must exist.
///
/// Entries whose names would escape `dest` are rejected.
pub fn unpack_to_dir(data: &[u8], dest: &Path) -> StorageResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => {
                return Err(StorageError::Archive(format!(
                    "entry '{}' escapes the workspace",
                    entry.name()
                )))
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(io_err(&outpath))?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut outfile = File::create(&outpath).map_err(io_err(&outpath))?;
        io::copy(&mut entry, &mut outfile).map_err(io_err(&outpath))?;
        outfile.flush().map_err(io_err(&outpath))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o755 | 0o600))
                    .map_err(io_err(&outpath))?;
            }
        }
    }
    Ok(())
}
