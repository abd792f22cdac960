//! Temporary files and directories.
//!
//! Each temp path is removed when its owner is dropped, and is registered in a
//! process wide set until then so a shutdown hook can [`sweep`] leftovers of
//! owners that were leaked.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{LazyLock, Mutex, MutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::file::FileSource;

static DEFAULT_TMP_DIR: LazyLock<RwLock<PathBuf>> = LazyLock::new(|| RwLock::new(std::env::temp_dir()));

static REGISTRY: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Mutex::default);

fn registry() -> MutexGuard<'static, HashSet<PathBuf>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Directory new temp paths are created in, the system temp dir by default.
pub fn default_tmp_dir() -> PathBuf {
    match DEFAULT_TMP_DIR.read() {
        Ok(dir) => dir.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub fn set_default_tmp_dir(dir: impl Into<PathBuf>) {
    let dir = dir.into();
    match DEFAULT_TMP_DIR.write() {
        Ok(mut current) => *current = dir,
        Err(poisoned) => *poisoned.into_inner() = dir,
    }
}

/// Removes every temp path still registered. Returns how many were removed.
pub fn sweep() -> usize {
    sweep_matching(|_| true)
}

fn sweep_matching(filter: impl Fn(&Path) -> bool) -> usize {
    let paths: Vec<PathBuf> = {
        let mut registry = registry();
        let matched: Vec<PathBuf> = registry.iter().filter(|path| filter(path)).cloned().collect();
        for path in &matched {
            registry.remove(path);
        }
        matched
    };
    let mut removed = 0;

    for path in paths {
        match remove_sync(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove temp path"),
        }
    }

    removed
}

fn unique_path(dir: &Path) -> PathBuf {
    dir.join(uuid::Uuid::new_v4().to_string())
}

fn remove_sync(path: &Path) -> io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

async fn remove(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// A registered path, removed on drop.
struct TmpPath {
    path: PathBuf,
    destroyed: bool,
}

impl TmpPath {
    fn new(path: PathBuf) -> Self {
        registry().insert(path.clone());
        TmpPath { path, destroyed: false }
    }

    fn rename(&mut self, path: PathBuf) {
        let mut registry = registry();
        registry.remove(&self.path);
        registry.insert(path.clone());
        self.path = path;
    }

    fn release(&mut self) {
        self.destroyed = true;
        registry().remove(&self.path);
    }

    async fn destroy(&mut self) -> io::Result<()> {
        if self.destroyed {
            return Ok(());
        }

        remove(&self.path).await?;
        self.release();
        Ok(())
    }
}

impl Drop for TmpPath {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }

        if let Err(e) = remove_sync(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temp path");
        }
        self.release();
    }
}

/// A unique file path in the temp dir. The file itself is not created.
pub struct TmpFile {
    tmp: TmpPath,
    name: Option<String>,
}

impl TmpFile {
    pub fn new() -> Self {
        TmpFile::new_in(default_tmp_dir())
    }

    pub fn new_in(dir: impl AsRef<Path>) -> Self {
        TmpFile { tmp: TmpPath::new(unique_path(dir.as_ref())), name: None }
    }

    /// Takes ownership of an existing path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        TmpFile { tmp: TmpPath::new(path.into()), name: None }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        let path = self.tmp.path.with_extension(extension.trim_start_matches('.'));
        self.tmp.rename(path);
        self
    }

    /// Name reported to clients instead of the generated one.
    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        let name = Path::new(name.as_ref()).file_name().map(|name| name.to_string_lossy().into_owned());
        self.name = name;
        self
    }

    pub fn path(&self) -> &Path {
        &self.tmp.path
    }

    pub fn name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.tmp.path.file_name().map(|name| name.to_string_lossy().into_owned()))
    }

    pub fn is_destroyed(&self) -> bool {
        self.tmp.destroyed
    }

    /// A body source over the file.
    pub fn source(&self) -> FileSource {
        let source = FileSource::new(self.path());
        match &self.name {
            Some(name) => source.with_name(name.clone()),
            None => source,
        }
    }

    pub async fn destroy(&mut self) -> io::Result<()> {
        self.tmp.destroy().await
    }

    /// Stops tracking the file and returns its path. The file is kept.
    pub fn persist(mut self) -> PathBuf {
        self.tmp.release();
        std::mem::take(&mut self.tmp.path)
    }
}

impl Default for TmpFile {
    fn default() -> Self {
        TmpFile::new()
    }
}

impl AsRef<Path> for TmpFile {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

impl fmt::Debug for TmpFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmpFile").field("path", &self.tmp.path).field("name", &self.name).finish()
    }
}

/// A unique directory in the temp dir, created up front and removed with its
/// contents.
pub struct TmpDir {
    tmp: TmpPath,
}

impl TmpDir {
    pub fn new() -> io::Result<Self> {
        TmpDir::new_in(default_tmp_dir())
    }

    pub fn new_in(dir: impl AsRef<Path>) -> io::Result<Self> {
        let path = unique_path(dir.as_ref());
        std::fs::create_dir_all(&path)?;
        Ok(TmpDir { tmp: TmpPath::new(path) })
    }

    pub fn path(&self) -> &Path {
        &self.tmp.path
    }

    /// A temp file path inside this directory.
    pub fn file(&self) -> TmpFile {
        TmpFile::new_in(self.path())
    }

    pub fn is_destroyed(&self) -> bool {
        self.tmp.destroyed
    }

    pub async fn destroy(&mut self) -> io::Result<()> {
        self.tmp.destroy().await
    }
}

impl AsRef<Path> for TmpDir {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

impl fmt::Debug for TmpDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmpDir").field("path", &self.tmp.path).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Keep,
    Set,
    Clear,
}

/// A permission change over the nine `rwxrwxrwx` bits.
///
/// Parsed either from the full form, where `-` clears a bit, `?` keeps it
/// and the letter sets it (`rwxr-x---`, `rw?r?-r--`), or from symbolic groups
/// such as `u+rwx go-w` (`+x` applies to everyone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode {
    bits: [Permission; 9],
}

const LETTERS: &[u8; 9] = b"rwxrwxrwx";

impl FileMode {
    /// Whether the result depends on the current mode.
    pub fn needs_base(&self) -> bool {
        self.bits.contains(&Permission::Keep)
    }

    pub fn apply(&self, base: u32) -> u32 {
        self.bits.iter().enumerate().fold(base, |mode, (n, permission)| {
            let bit = 1 << (8 - n);
            match permission {
                Permission::Keep => mode,
                Permission::Set => mode | bit,
                Permission::Clear => mode & !bit,
            }
        })
    }

    fn parse_full(mode: &str) -> Option<FileMode> {
        let mut bits = [Permission::Keep; 9];

        for (n, byte) in mode.bytes().enumerate() {
            bits[n] = match byte {
                b'-' => Permission::Clear,
                b'?' => Permission::Keep,
                letter if letter == LETTERS[n] => Permission::Set,
                _ => return None,
            };
        }

        Some(FileMode { bits })
    }

    fn parse_symbolic(mode: &str) -> Option<FileMode> {
        let mut bits = [Permission::Keep; 9];
        let mut groups = mode.split(' ').filter(|group| !group.is_empty()).peekable();
        groups.peek()?;

        for group in groups {
            let sign = group.find(['+', '-'])?;
            let (users, rest) = group.split_at(sign);
            let (op, permissions) = rest.split_at(1);

            let users = if users.is_empty() { "ugo" } else { users };
            if users.len() > 3 || permissions.is_empty() || permissions.len() > 3 {
                return None;
            }

            for user in users.chars() {
                let base = match user {
                    'u' => 0,
                    'g' => 3,
                    'o' => 6,
                    _ => return None,
                };

                for permission in permissions.chars() {
                    let offset = match permission {
                        'r' => 0,
                        'w' => 1,
                        'x' => 2,
                        _ => return None,
                    };

                    bits[base + offset] = if op == "-" { Permission::Clear } else { Permission::Set };
                }
            }
        }

        Some(FileMode { bits })
    }
}

impl FromStr for FileMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        let parsed = if mode.len() == 9 && !mode.contains(' ') {
            FileMode::parse_full(mode)
        } else {
            FileMode::parse_symbolic(mode)
        };

        parsed.ok_or_else(|| Error::InvalidFileMode(mode.to_string()))
    }
}

/// Applies `mode` to the permissions of `path`.
#[cfg(unix)]
pub async fn chmod(path: impl AsRef<Path>, mode: &FileMode) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = path.as_ref();
    let base = if mode.needs_base() { tokio::fs::metadata(path).await?.permissions().mode() & 0o777 } else { 0 };

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode.apply(base))).await
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_file_mode() {
        let tests = [
            ("rwxr-x---", 0o000, 0o750),
            ("rw?r?-r--", 0o111, 0o744),
            ("u+rwx", 0o000, 0o700),
            ("+x", 0o644, 0o755),
            ("u+rw go-w", 0o777, 0o755),
            ("go-rwx", 0o755, 0o700),
            ("ug+w  o-r", 0o444, 0o660),
        ];

        for (mode, base, expected) in tests {
            let parsed: FileMode = mode.parse().unwrap();
            assert_eq!(parsed.apply(base), expected, "{mode} over {base:o}");
        }

        assert!(!"rwxr-x---".parse::<FileMode>().unwrap().needs_base());
        assert!("u+x".parse::<FileMode>().unwrap().needs_base());
    }

    #[test]
    fn test_invalid_file_mode() {
        for mode in ["", "   ", "rwxrwxrwz", "a+x", "u+", "u*x", "uuuu+x", "u+rwxx", "xwrxwrxwr"] {
            assert_matches!(mode.parse::<FileMode>(), Err(Error::InvalidFileMode(m)) if m == mode);
        }
    }

    #[test]
    fn test_tmp_file_removed_on_drop() {
        let tmp = TmpFile::new().with_extension(".txt");
        let path = tmp.path().to_path_buf();
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("txt"));

        std::fs::write(&path, b"data").unwrap();
        assert!(registry().contains(&path));

        drop(tmp);
        assert!(!path.exists());
        assert!(!registry().contains(&path));
    }

    #[tokio::test]
    async fn test_tmp_dir_destroy() {
        let mut dir = TmpDir::new().unwrap();
        let file = dir.file();
        tokio::fs::write(file.path(), b"x").await.unwrap();
        let file_path = file.persist();

        dir.destroy().await.unwrap();
        assert!(dir.is_destroyed());
        assert!(!dir.path().exists());
        assert!(!file_path.exists());

        // destroying twice is fine
        dir.destroy().await.unwrap();
    }

    #[test]
    fn test_sweep_removes_leaked() {
        let tmp = TmpFile::new();
        std::fs::write(tmp.path(), b"leaked").unwrap();
        let path = tmp.path().to_path_buf();
        std::mem::forget(tmp);

        assert_eq!(sweep_matching(|leaked| leaked == path), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_name() {
        let tmp = TmpFile::new().with_name("/some/dir/report.pdf");
        assert_eq!(tmp.name().as_deref(), Some("report.pdf"));
        assert_eq!(tmp.source().name(), Some("report.pdf"));

        let unnamed = TmpFile::new().with_extension("bin");
        assert!(unnamed.name().unwrap().ends_with(".bin"));
    }
}
