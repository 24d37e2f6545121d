//! Atomic file persistence shared by the index and the reputation cache.

use crate::error::{MediatorError, MediatorResult};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write-temp, fsync, rename. The target is either the old file or the new
/// one, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> MediatorResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)
            .map_err(|e| MediatorError::Persistence(format!("creating {}: {e}", tmp.display())))?;
        file.write_all(bytes)
            .map_err(|e| MediatorError::Persistence(format!("writing {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| MediatorError::Persistence(format!("syncing {}: {e}", tmp.display())))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        MediatorError::Persistence(format!("renaming into {}: {e}", path.display()))
    })?;
    Ok(())
}
