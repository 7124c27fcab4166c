//! Confined tar.gz extraction and directory archiving.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{BundleError, BundleResult};

/// Join an archive member path onto `base`, rejecting anything that
/// could resolve outside it (absolute paths, `..` components).
pub(crate) fn safe_join(base: &Path, entry_path: &Path) -> BundleResult<PathBuf> {
    let mut target = base.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(BundleError::UnsafeArchivePath(
                    entry_path.display().to_string(),
                ));
            }
        }
    }
    Ok(target)
}

/// Extract a gzipped tar archive under `dest`, creating directories as
/// needed. Entries that would escape `dest` abort the extraction.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> BundleResult<()> {
    std::fs::create_dir_all(dest)?;

    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let target = safe_join(dest, &entry_path)?;

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
                }
            }
        } else {
            debug!(path = %entry_path.display(), "skipping non-regular archive entry");
        }
    }
    Ok(())
}

/// Archive the contents of `dir` into a gzipped tar at `out_path`,
/// skipping the root-relative paths listed in `exclude`. Entries are
/// written in sorted order so the output is reproducible.
pub fn write_archive_dir(dir: &Path, out_path: &Path, exclude: &[&str]) -> BundleResult<()> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let out = File::create(out_path)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for relative in &files {
        let name = relative.display().to_string();
        if exclude.contains(&name.as_str()) {
            continue;
        }
        builder.append_path_with_name(dir.join(relative), relative)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> BundleResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, files)?;
        } else if entry.file_type()?.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}
