//! Output directory selection.
//!
//! CAR files land on whichever configured output directory has the most
//! free space. The caller falls back to the first directory when the
//! query fails, so an unreadable mount table degrades to a warning.

use std::path::Path;

use sysinfo::Disks;

use crate::error::{PackError, Result};

/// The configured directory with the most available bytes.
pub fn path_with_most_space(dirs: &[String]) -> Result<String> {
    if dirs.is_empty() {
        return Err(PackError::NotFound("output directory".to_string()));
    }

    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&String, u64)> = None;
    for dir in dirs {
        let available = available_space(&disks, Path::new(dir))?;
        if best.map_or(true, |(_, most)| available > most) {
            best = Some((dir, available));
        }
    }
    Ok(best.expect("dirs is non-empty").0.clone())
}

/// Free bytes on the filesystem holding `dir`: the disk with the
/// longest mount point that prefixes the canonical path.
fn available_space(disks: &Disks, dir: &Path) -> Result<u64> {
    let canonical = dir.canonicalize()?;
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| PackError::NotFound(format!("filesystem for {}", dir.display())))
}
