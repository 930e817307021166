use std::{
    fmt,
    fs::{File, Metadata},
    io,
    os::unix::prelude::MetadataExt,
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a physical file independent of the name it is reachable by.
///
/// Made of device id and inode number, so it survives renames and changes when a log rotation tool puts a new file
/// under the old name. Its text form, used in sidecar files, is `"<dev>:<ino>"`.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Identity of an already opened file. Unlike `of_path`, this cannot race with a rename of the path.
    pub fn of_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    /// Ask the filesystem for metadata and return identity of the object currently found at `path`
    pub fn of_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed file identity `{0}`, expected `<dev>:<ino>`")]
pub struct ParseIdentityError(pub String);

impl FromStr for FileIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseIdentityError(s.to_string());
        let (dev, ino) = s.split_once(':').ok_or_else(malformed)?;
        Ok(Self {
            dev: dev.parse().map_err(|_| malformed())?,
            ino: ino.parse().map_err(|_| malformed())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn text_form_roundtrips() {
        let identity = FileIdentity::new(2049, 42);
        assert_eq!(identity.to_string(), "2049:42");
        assert_eq!("2049:42".parse::<FileIdentity>().unwrap(), identity);
    }

    #[rstest]
    #[case("")]
    #[case("42")]
    #[case("a:1")]
    #[case("1:")]
    #[case("1:2:3")]
    fn malformed_text_is_rejected(#[case] input: &str) {
        assert!(input.parse::<FileIdentity>().is_err())
    }

    #[test]
    fn identity_is_stable_across_appends() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        let before = FileIdentity::of_path(file.path())?;
        file.write_all(b"more\n")?;
        file.flush()?;
        assert_eq!(FileIdentity::of_path(file.path())?, before);
        assert_eq!(FileIdentity::of_file(&file.reopen()?)?, before);
        Ok(())
    }

    #[test]
    fn replaced_file_gets_new_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"old\n")?;
        let old = FileIdentity::of_path(&path)?;
        // keep the old inode alive so it cannot be reused for the new file
        let _held = File::open(&path)?;
        std::fs::rename(&path, dir.path().join("app.log.1"))?;
        std::fs::write(&path, b"new\n")?;
        assert_ne!(FileIdentity::of_path(&path)?, old);
        Ok(())
    }
}
