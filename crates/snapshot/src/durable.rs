//! Crash-safe whole-file replacement.
//!
//! A save never overwrites the only complete copy of a snapshot:
//!
//! 1. run [`recover_snapshot`] to settle any earlier interrupted save
//! 2. rename the current primary `<name>` to `<name>.bak`
//! 3. write the completion marker `<name>.bak.done`
//! 4. write the new content to `<name>`
//! 5. remove the marker, then the backup
//!
//! A backup with its marker means the primary may be torn, so recovery puts
//! the backup back and keeps the suspect primary as `<name>.r.<unix-millis>`.
//! A backup without a marker is kept only when no primary exists.

use chrono::Utc;
use deferq_core::Result;
use tracing::{debug, info, warn};

use crate::storage::FileStorage;

/// What [`recover_snapshot`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted save.
    Clean,
    /// The primary was replaced by the backup of an interrupted save.
    RestoredFromBackup,
    /// An incomplete backup was deleted; the primary is authoritative.
    DiscardedStaleBackup,
}

/// Name of the backup sibling.
#[must_use]
pub fn backup_name(name: &str) -> String {
    format!("{name}.bak")
}

/// Name of the backup's completion marker.
#[must_use]
pub fn marker_name(name: &str) -> String {
    format!("{name}.bak.done")
}

fn suspect_name(name: &str) -> String {
    format!("{name}.r.{}", Utc::now().timestamp_millis())
}

/// Settle the files left behind by an interrupted save.
///
/// # Errors
///
/// Propagates storage failures. Recovery is re-entrant: running it again
/// after a failure picks up where it stopped.
pub async fn recover_snapshot(storage: &dyn FileStorage, name: &str) -> Result<Recovery> {
    let backup = backup_name(name);
    let marker = marker_name(name);

    let has_backup = storage.exists(&backup).await?;
    let has_marker = storage.exists(&marker).await?;

    let outcome = match (has_backup, has_marker) {
        (true, true) => {
            if storage.exists(name).await? {
                let suspect = suspect_name(name);
                storage.rename(name, &suspect).await?;
                warn!(file = %name, suspect = %suspect, "Primary snapshot set aside as suspect");
            }
            storage.rename(&backup, name).await?;
            storage.remove(&marker).await?;
            Recovery::RestoredFromBackup
        }
        (true, false) => {
            if storage.exists(name).await? {
                storage.remove(&backup).await?;
                Recovery::DiscardedStaleBackup
            } else {
                storage.rename(&backup, name).await?;
                Recovery::RestoredFromBackup
            }
        }
        (false, true) => {
            storage.remove(&marker).await?;
            Recovery::Clean
        }
        (false, false) => Recovery::Clean,
    };

    if outcome != Recovery::Clean {
        info!(file = %name, outcome = ?outcome, "Recovered interrupted snapshot save");
    }

    Ok(outcome)
}

/// Replace `name` with `data` using the backup/marker protocol.
///
/// # Errors
///
/// Fails if recovery, the backup rename, the marker write, the content write,
/// or the marker removal fails. A leftover backup after a successful write is
/// only logged; the next save or load removes it.
pub async fn write_snapshot(storage: &dyn FileStorage, name: &str, data: &[u8]) -> Result<()> {
    recover_snapshot(storage, name).await?;

    let backup = backup_name(name);
    let marker = marker_name(name);
    let had_primary = storage.exists(name).await?;

    if had_primary {
        storage.rename(name, &backup).await?;

        let stamp = Utc::now().to_rfc3339();
        if let Err(e) = storage.write_file(&marker, stamp.as_bytes()).await {
            if let Err(undo) = storage.rename(&backup, name).await {
                warn!(file = %name, error = %undo, "Failed to undo backup rename");
            }
            return Err(e);
        }
    }

    storage.write_file(name, data).await?;

    if had_primary {
        storage.remove(&marker).await?;
        if let Err(e) = storage.remove(&backup).await {
            warn!(file = %name, error = %e, "Failed to remove snapshot backup");
        }
    }

    debug!(file = %name, bytes = data.len(), "Snapshot written");
    Ok(())
}
