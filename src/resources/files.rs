//! File access used by the script runtime.
//!
//! Scripts never touch the disk directly. The native `require`, `do_file` and
//! `luna.read_json` all go through a [`FileSystem`], so the runtime can be
//! pointed at the real asset tree ([`DiskFiles`]) or at an in-memory set of
//! sources ([`MemoryFiles`]) for tools and tests.
//!
//! Paths are plain `/`-separated strings, the same form the scripts use.
//! The free functions at the bottom implement the path helpers scripts and
//! the loader need (`parent_path`, `extension`, `basename`,
//! `replace_extension`, `normalize_path`).

use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use rustc_hash::FxHashMap;

/// Read-only view over the script/asset tree.
pub trait FileSystem {
    /// Whole file as bytes.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Whole file as UTF-8 text.
    fn read_file_to_string(&self, path: &str) -> io::Result<String> {
        let bytes = self.read_file(path)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// True when `path` names a regular file.
    fn is_file(&self, path: &str) -> bool;

    /// True when `path` names anything that exists.
    fn exists(&self, path: &str) -> bool {
        self.is_file(path)
    }
}

/// Files on disk, resolved relative to a base directory.
#[derive(Debug, Clone)]
pub struct DiskFiles {
    base: PathBuf,
}

impl DiskFiles {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Files relative to the process working directory.
    pub fn cwd() -> Self {
        Self::new(".")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base.join(p)
        }
    }
}

impl Default for DiskFiles {
    fn default() -> Self {
        Self::cwd()
    }
}

impl FileSystem for DiskFiles {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let full = self.resolve(path);
        debug!("Reading {}", full.display());
        std::fs::read(full)
    }

    fn is_file(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}

/// In-memory file set keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct MemoryFiles {
    files: FxHashMap<String, Vec<u8>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a file.
    pub fn insert(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.insert(normalize_path(path), contents.into());
    }

    /// Builder form of [`MemoryFiles::insert`].
    pub fn with(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileSystem for MemoryFiles {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no file '{path}'")))
    }

    fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_path(path))
    }
}

// --------------- Path helpers ---------------

/// Everything before the last `/`, or an empty string for a bare file name.
pub fn parent_path(path: &str) -> String {
    match path.rfind(['/', '\\']) {
        Some(pos) => path[..pos].to_string(),
        None => String::new(),
    }
}

/// File name without directories.
pub fn file_name(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Extension without the dot, empty when there is none.
pub fn extension(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[pos + 1..].to_string(),
        _ => String::new(),
    }
}

/// File name without directories and without extension.
pub fn basename(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[..pos].to_string(),
        _ => name.to_string(),
    }
}

/// Swaps (or appends) the extension. `ext` may be given with or without the dot.
pub fn replace_extension(path: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    let parent = parent_path(path);
    let stem = basename(path);
    let name = if ext.is_empty() {
        stem
    } else {
        format!("{stem}.{ext}")
    };
    if parent.is_empty() {
        name
    } else {
        format!("{parent}/{name}")
    }
}

/// Joins two path fragments with a single `/`.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Collapses `.`/`..` segments, repeated slashes and backslashes.
///
/// Used as the identity of a loaded module, so two spellings of the same file
/// normalize to the same string.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers_split_names() {
        assert_eq!(parent_path("scripts/enemies/boss.lua"), "scripts/enemies");
        assert_eq!(parent_path("main.lua"), "");
        assert_eq!(extension("scripts/boss.lua"), "lua");
        assert_eq!(extension("scripts/.hidden"), "");
        assert_eq!(basename("scripts/boss.lua"), "boss");
        assert_eq!(replace_extension("scripts/boss.lua", "json"), "scripts/boss.json");
        assert_eq!(replace_extension("boss", ".lua"), "boss.lua");
    }

    #[test]
    fn normalize_collapses_segments() {
        assert_eq!(normalize_path("./assets/scripts/../scripts//main.lua"), "assets/scripts/main.lua");
        assert_eq!(normalize_path("a\\b\\..\\c.lua"), "a/c.lua");
        assert_eq!(normalize_path("../x.lua"), "../x.lua");
        assert_eq!(normalize_path("/root/./a/../b"), "/root/b");
    }

    #[test]
    fn memory_files_match_normalized_paths() {
        let files = MemoryFiles::new().with("./scripts/main.lua", "return 1");
        assert!(files.is_file("scripts/main.lua"));
        assert!(files.is_file("scripts/../scripts/main.lua"));
        assert_eq!(files.read_file_to_string("scripts/main.lua").unwrap(), "return 1");
        assert_eq!(
            files.read_file("missing.lua").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn disk_files_resolve_against_base() {
        let dir = std::env::temp_dir().join(format!("aberredscript-files-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.txt"), "hi").unwrap();

        let files = DiskFiles::new(&dir);
        assert!(files.is_file("hello.txt"));
        assert!(!files.is_file("nope.txt"));
        assert_eq!(files.read_file_to_string("hello.txt").unwrap(), "hi");

        std::fs::remove_dir_all(&dir).ok();
    }
}
