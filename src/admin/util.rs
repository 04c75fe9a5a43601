use std::path::Path;
use std::sync::Arc;

use crate::primitives::io::{OpenMode, StdFileIo};
use crate::storage::DataFile;
use crate::types::{Result, StoreError};

use crate::admin::options::AdminOpenOptions;

/// Opens a store file of either kind read-only.
///
/// # Errors
///
/// Returns [`StoreError::Config`] if the file doesn't exist, or whatever
/// loading the header reports.
pub fn open_file(path: &Path, opts: &AdminOpenOptions) -> Result<DataFile> {
    if !path.exists() {
        return Err(StoreError::Config(format!(
            "store file {} does not exist",
            path.display()
        )));
    }
    let io = StdFileIo::open(path, OpenMode::ReadOnly)?;
    DataFile::open_with_io(Arc::new(io), None, opts.store_options())
}
