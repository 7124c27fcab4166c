//! taskfly-bundle — client bundle processing.
//!
//! A client bundle is a gzipped tar archive holding the deployment
//! descriptor (`taskfly.yml`) plus the application files. Processing
//! extracts the application files into the deployment's working
//! directory, captures the descriptor in memory only, and re-emits a
//! worker bundle (application files, no descriptor) for agents to
//! download. The safe extraction routine is shared with the agent side.

mod archive;
mod descriptor;
mod error;

pub use archive::{extract_archive, write_archive_dir};
pub use descriptor::Descriptor;
pub use error::{BundleError, BundleResult};

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::archive::safe_join;

/// Name of the descriptor entry inside a client bundle.
pub const DESCRIPTOR_NAME: &str = "taskfly.yml";

/// Name of the re-emitted worker bundle.
pub const WORKER_BUNDLE_NAME: &str = "worker_bundle.tar.gz";

/// Result of processing a client bundle.
#[derive(Debug)]
pub struct ProcessedBundle {
    pub descriptor: Descriptor,
    /// Path of the worker bundle inside the working directory.
    pub worker_bundle_path: PathBuf,
}

/// Process a client bundle: extract application files into `work_dir`,
/// parse the descriptor, and emit the worker bundle.
///
/// The descriptor is read straight out of the archive stream and never
/// written to disk, so it cannot leak into the worker bundle. Archive
/// entries that would resolve outside `work_dir` are rejected.
pub fn process_bundle(bundle_path: &Path, work_dir: &Path) -> BundleResult<ProcessedBundle> {
    std::fs::create_dir_all(work_dir)?;

    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut descriptor_data: Option<Vec<u8>> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();

        if !entry.header().entry_type().is_file() {
            continue;
        }

        if entry_path == Path::new(DESCRIPTOR_NAME) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            descriptor_data = Some(data);
            continue;
        }

        let target = safe_join(work_dir, &entry_path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    let descriptor_data = descriptor_data.ok_or(BundleError::DescriptorMissing)?;
    let descriptor: Descriptor = serde_yaml::from_slice(&descriptor_data)?;

    let worker_bundle_path = work_dir.join(WORKER_BUNDLE_NAME);
    write_archive_dir(work_dir, &worker_bundle_path, &[DESCRIPTOR_NAME, WORKER_BUNDLE_NAME])?;
    debug!(path = %worker_bundle_path.display(), "worker bundle written");

    Ok(ProcessedBundle {
        descriptor,
        worker_bundle_path,
    })
}
