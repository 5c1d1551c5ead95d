use crate::cancel::Cancellation;
use crate::error::{PullError, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Knobs for how untrusted entries are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Honor OCI whiteout markers (`.wh.<name>`, `.wh..wh..opq`).
    pub whiteouts: bool,
    /// Create symlink and hardlink entries instead of skipping them.
    pub materialize_links: bool,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            whiteouts: true,
            materialize_links: false,
        }
    }
}

/// Per-layer counters, summed across layers by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnpackStats {
    pub entries: u64,
    pub directories: u64,
    pub files: u64,
    pub links: u64,
    pub whiteouts: u64,
    pub skipped: u64,
    pub bytes: u64,
}

impl UnpackStats {
    pub fn merge(&mut self, other: &UnpackStats) {
        self.entries += other.entries;
        self.directories += other.directories;
        self.files += other.files;
        self.links += other.links;
        self.whiteouts += other.whiteouts;
        self.skipped += other.skipped;
        self.bytes += other.bytes;
    }
}

/// Confines an archive entry name beneath the destination root.
///
/// `.` segments are dropped and `..` may only undo segments pushed earlier in
/// the same name. Absolute names and anything that climbs above the root are
/// rejected.
fn normalize_entry_path(p: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(c) => {
                out.push(c);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(unsafe_path(p));
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_path(p)),
        }
    }

    Ok(out)
}

fn unsafe_path(p: &Path) -> PullError {
    PullError::UnsafePath {
        entry: p.to_path_buf(),
    }
}

fn write_err(path: &Path) -> impl FnOnce(io::Error) -> PullError + '_ {
    move |source| PullError::UnpackIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Refuses to write through a symlink that already exists under the root.
///
/// Only ancestors are checked; a symlink at the destination itself is
/// replaced by the caller, never followed.
fn ensure_no_symlink_ancestors(root: &Path, rel: &Path, entry: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    let Some(parent) = rel.parent() else {
        return Ok(());
    };

    for comp in parent.components() {
        current.push(comp);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Err(unsafe_path(entry)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(write_err(&current)(e)),
        }
    }

    Ok(())
}

/// Removes whatever sits at `path` without following symlinks. Missing is fine.
fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(write_err(path)),
        Ok(_) => fs::remove_file(path).map_err(write_err(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(write_err(path)(e)),
    }
}

fn create_parent(dest: &Path) -> Result<()> {
    match dest.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(write_err(parent)),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        log::debug!("Failed to set mode {:o} on {}: {}", mode, path.display(), e);
    }
}

/// Paths this layer has already produced.
///
/// Whiteouts and opaque markers only act on what lower layers left behind.
#[derive(Default)]
struct WrittenSet {
    entries: HashSet<PathBuf>,
    /// Directories holding at least one entry of this layer.
    parents: HashSet<PathBuf>,
}

impl WrittenSet {
    fn record(&mut self, rel: &Path) {
        self.entries.insert(rel.to_path_buf());
        for ancestor in rel.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() || !self.parents.insert(ancestor.to_path_buf()) {
                break;
            }
        }
    }

    fn contains(&self, rel: &Path) -> bool {
        self.entries.contains(rel)
    }

    fn holds_children(&self, rel: &Path) -> bool {
        self.parents.contains(rel)
    }

    fn produced(&self, rel: &Path) -> bool {
        self.contains(rel) || self.holds_children(rel)
    }
}

/// Streams one gzip-compressed tar layer onto `root`.
///
/// Entries are applied in archive order, each replacing whatever an earlier
/// layer left at the same path. The cancel flag is polled before every entry.
/// On error the entries written so far stay in place; discarding the root is
/// up to the caller.
pub fn unpack_layer<R: Read>(
    mut reader: R,
    root: &Path,
    options: &UnpackOptions,
    cancel: &Cancellation,
) -> Result<UnpackStats> {
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            PullError::UnpackFormat("layer stream is shorter than a gzip header".to_string())
        }
        _ => PullError::from_stream(root.to_path_buf(), e),
    })?;
    if magic != GZIP_MAGIC {
        return Err(PullError::UnpackFormat(format!(
            "layer stream is not gzip-compressed (leading bytes {:02x} {:02x})",
            magic[0], magic[1]
        )));
    }

    let decoder = GzDecoder::new(Cursor::new(magic).chain(reader));
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| PullError::UnpackFormat(e.to_string()))?;

    let mut stats = UnpackStats::default();
    let mut written = WrittenSet::default();

    for entry_result in entries {
        cancel.check()?;

        let mut entry = entry_result.map_err(|e| PullError::UnpackFormat(e.to_string()))?;
        let entry_type = entry.header().entry_type();
        let raw_path = entry
            .path()
            .map_err(|e| PullError::UnpackFormat(format!("unreadable entry name: {}", e)))?
            .into_owned();
        stats.entries += 1;

        let rel = normalize_entry_path(&raw_path)?;
        if rel.as_os_str().is_empty() {
            // "./" and friends name the root itself.
            stats.skipped += 1;
            continue;
        }
        ensure_no_symlink_ancestors(root, &rel, &raw_path)?;

        if options.whiteouts {
            if let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) {
                if file_name == OPAQUE_MARKER {
                    clear_opaque_dir(root, &rel, &written)?;
                    stats.whiteouts += 1;
                    continue;
                }
                if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                    if hidden.is_empty() || hidden == "." || hidden == ".." {
                        return Err(unsafe_path(&raw_path));
                    }
                    let target = rel.with_file_name(hidden);
                    if written.produced(&target) {
                        log::debug!("Whiteout ignores same-layer {}", target.display());
                    } else {
                        log::debug!("Whiteout removes {}", target.display());
                        remove_existing(&root.join(&target))?;
                    }
                    stats.whiteouts += 1;
                    continue;
                }
            }
        }

        let dest = root.join(&rel);
        match entry_type {
            tar::EntryType::Directory => {
                match fs::symlink_metadata(&dest) {
                    Ok(meta) if !meta.is_dir() => remove_existing(&dest)?,
                    _ => {}
                }
                fs::create_dir_all(&dest).map_err(write_err(&dest))?;

                #[cfg(unix)]
                {
                    let mode = entry.header().mode().unwrap_or(0o755);
                    set_mode(&dest, (mode & 0o7777) | 0o700);
                }
                stats.directories += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                #[cfg(unix)]
                let mode = entry.header().mode().ok();

                create_parent(&dest)?;
                remove_existing(&dest)?;
                let mut out_file = File::create(&dest).map_err(write_err(&dest))?;
                let copied = io::copy(&mut entry, &mut out_file)
                    .map_err(|e| PullError::from_stream(dest.clone(), e))?;

                #[cfg(unix)]
                {
                    // Owner must be able to read everything for the analysis walk.
                    if let Some(mode) = mode {
                        set_mode(&dest, (mode & 0o777) | 0o400);
                    }
                }
                stats.files += 1;
                stats.bytes += copied;
            }
            tar::EntryType::Symlink | tar::EntryType::Link if !options.materialize_links => {
                log::debug!("Skipping link entry {}", rel.display());
                stats.skipped += 1;
                continue;
            }
            tar::EntryType::Symlink => {
                let target = link_target(&entry, &raw_path)?;
                create_parent(&dest)?;
                remove_existing(&dest)?;
                make_symlink(&target, &dest)?;
                stats.links += 1;
            }
            tar::EntryType::Link => {
                let target = link_target(&entry, &raw_path)?;
                let target_rel = normalize_entry_path(&target)?;
                ensure_no_symlink_ancestors(root, &target_rel, &target)?;
                let source = root.join(&target_rel);

                match fs::symlink_metadata(&source) {
                    Ok(meta) if meta.is_file() => {
                        create_parent(&dest)?;
                        remove_existing(&dest)?;
                        link_or_copy(&source, &dest)?;
                        stats.links += 1;
                    }
                    _ => {
                        log::warn!(
                            "Skipping hardlink {} -> {}: target is missing or not a regular file",
                            rel.display(),
                            target_rel.display()
                        );
                        stats.skipped += 1;
                        continue;
                    }
                }
            }
            other => {
                log::debug!("Skipping {:?} entry {}", other, rel.display());
                stats.skipped += 1;
                continue;
            }
        }

        written.record(&rel);
    }

    Ok(stats)
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, raw_path: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .map_err(|e| PullError::UnpackFormat(format!("unreadable link target: {}", e)))?
        .map(|name| name.into_owned())
        .ok_or_else(|| {
            PullError::UnpackFormat(format!("link entry {} has no target", raw_path.display()))
        })
}

#[cfg(unix)]
fn make_symlink(target: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).map_err(write_err(dest))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, dest: &Path) -> Result<()> {
    log::warn!("Symlinks are not supported on this platform: {}", dest.display());
    Ok(())
}

fn link_or_copy(source: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = fs::hard_link(source, dest) {
        log::debug!(
            "hardlink failed ({}), falling back to copy: {} -> {}",
            e,
            source.display(),
            dest.display()
        );
        fs::copy(source, dest).map_err(write_err(dest))?;
    }
    Ok(())
}

/// Empties the marker's directory of everything lower layers put there.
fn clear_opaque_dir(root: &Path, marker: &Path, written: &WrittenSet) -> Result<()> {
    let dir_rel = marker.parent().unwrap_or_else(|| Path::new(""));
    log::debug!("Opaque marker clears {}", root.join(dir_rel).display());
    clear_lower_entries(root, dir_rel, written)
}

/// Removes every child of `dir_rel` this layer did not write, descending
/// into directories that hold entries of this layer.
fn clear_lower_entries(root: &Path, dir_rel: &Path, written: &WrittenSet) -> Result<()> {
    let dir = root.join(dir_rel);
    let listing = match fs::read_dir(&dir) {
        Ok(listing) => listing
            .collect::<io::Result<Vec<_>>>()
            .map_err(write_err(&dir))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(write_err(&dir)(e)),
    };

    for child in listing {
        let child_rel = dir_rel.join(child.file_name());
        let path = child.path();
        if !written.produced(&child_rel) {
            remove_existing(&path)?;
            continue;
        }
        let real_dir = fs::symlink_metadata(&path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if real_dir {
            clear_lower_entries(root, &child_rel, written)?;
        }
    }
    Ok(())
}
