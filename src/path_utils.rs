use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
};

/// Extension of the sidecar file that keeps the cursor for a tailed file
pub const POSITION_EXTENSION: &str = "pos";

/// Resolve `path` against the current working directory if it is relative
///
/// Symlinks are not followed: the watched name is the one the user gave us, because rotation replaces
/// whatever the name points to.
pub fn resolve_absolute(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Directory whose change notifications cover `path`
///
/// Falls back to `/` for a bare root, which cannot be tailed anyway.
pub fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Path of the sidecar file for a tailed file: `path` with `.pos` appended
///
/// ## Example
///
/// ```rust
/// use std::path::PathBuf;
/// let sidecar = filetrail::path_utils::position_path("/var/log/mail.log");
/// assert_eq!(sidecar, PathBuf::from("/var/log/mail.log.pos"));
/// ```
pub fn position_path(path: impl AsRef<Path>) -> PathBuf {
    append_extension(path.as_ref().to_path_buf(), POSITION_EXTENSION)
}

/// Add extension to existing PathBuf without replacing the current one
pub fn append_extension(path: PathBuf, ext: impl AsRef<OsStr>) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(".");
    os_string.push(ext.as_ref());
    os_string.into()
}

/// Whether a path reported by a directory watch names the same entry as `target`
///
/// Only the file name is compared: the watch is non-recursive, so every reported path is a direct child of the
/// watched directory, while the directory prefix may come back canonicalized on some platforms.
pub fn names_same_entry(reported: &Path, target: &Path) -> bool {
    match (reported.file_name(), target.file_name()) {
        (Some(reported), Some(target)) => reported == target,
        _ => false,
    }
}
