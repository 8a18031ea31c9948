//! Managed-tree paths: immutable, lexically canonicalized path values used
//! for dependency bookkeeping and as keys into the run-database.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PathError(pub String);

/// A canonicalized POSIX-style path plus a directory flag.
///
/// Canonicalization is purely lexical: `.` components and redundant
/// separators are removed, and `a/..` pairs are collapsed.  Leading `..`
/// components are preserved, so an "upwards" path stays recognizable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath {
    /// Canonical form, without a trailing slash.  `.` for the current
    /// directory, `/` for the filesystem root.
    path: String,
    is_dir: bool,
}

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar".
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                Some(_) => parts.push(".."),
                None => {
                    if !absolute {
                        parts.push("..");
                    }
                    // "/.." collapses to "/".
                }
            },
            c => parts.push(c),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

impl TreePath {
    /// Build a path from a string.  A trailing `/` (or `.`/`..` as the last
    /// component) marks a directory path.
    pub fn new(path: &str) -> Result<TreePath, PathError> {
        if path.is_empty() {
            return Err(PathError("path must not be empty".to_string()));
        }
        let is_dir = path.ends_with('/')
            || path == "."
            || path == ".."
            || path.ends_with("/.")
            || path.ends_with("/..");
        let canon = canon_path(path);
        let is_dir =
            is_dir || canon == "." || canon == "/" || canon == ".." || canon.ends_with("/..");
        Ok(TreePath { path: canon, is_dir })
    }

    /// Like [`TreePath::new`] but forces the directory flag.
    pub fn dir(path: &str) -> Result<TreePath, PathError> {
        let mut p = TreePath::new(path)?;
        p.is_dir = true;
        Ok(p)
    }

    pub(crate) fn from_components(components: &[&str], is_dir: bool) -> TreePath {
        let path = if components.is_empty() {
            ".".to_string()
        } else {
            components.join("/")
        };
        TreePath { path, is_dir }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_absolute(&self) -> bool {
        self.path.starts_with('/')
    }

    /// True when the canonical form contains no `..` component.
    pub fn is_normalized(&self) -> bool {
        !self.components().any(|c| c == "..")
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
    }

    /// Append a relative path.  `self` must be a directory path.
    pub fn join(&self, other: &TreePath) -> Result<TreePath, PathError> {
        if !self.is_dir {
            return Err(PathError(format!(
                "cannot append to non-directory path: {:?}",
                self.path
            )));
        }
        if other.is_absolute() {
            return Err(PathError(format!(
                "cannot append absolute path: {:?}",
                other.path
            )));
        }
        let joined = format!("{}/{}", self.path, other.path);
        Ok(TreePath {
            path: canon_path(&joined),
            is_dir: other.is_dir,
        })
    }

    /// The directory containing this path, or `None` at a root.
    pub fn parent(&self) -> Option<TreePath> {
        if self.path == "." || self.path == "/" {
            return None;
        }
        match self.path.rsplit_once('/') {
            Some(("", _)) => Some(TreePath {
                path: "/".to_string(),
                is_dir: true,
            }),
            Some((rest, _)) => Some(TreePath {
                path: rest.to_string(),
                is_dir: true,
            }),
            None => Some(TreePath {
                path: ".".to_string(),
                is_dir: true,
            }),
        }
    }

    /// Whether `prefix` (a directory path) is a lexical prefix of `self`.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        let mine: Vec<&str> = self.components().collect();
        let theirs: Vec<&str> = prefix.components().collect();
        self.is_absolute() == prefix.is_absolute()
            && mine.len() >= theirs.len()
            && mine[..theirs.len()] == theirs[..]
    }

    /// This path relative to the directory path `base`, with `..` padding
    /// where necessary.  Purely lexical.
    pub fn relative_to(&self, base: &TreePath) -> Result<TreePath, PathError> {
        if self.is_absolute() != base.is_absolute() {
            return Err(PathError(
                "cannot relate absolute and relative paths".to_string(),
            ));
        }
        let mine: Vec<&str> = self.components().collect();
        let theirs: Vec<&str> = base.components().collect();
        let common = mine
            .iter()
            .zip(theirs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if theirs[common..].iter().any(|c| *c == "..") {
            return Err(PathError(format!(
                "reference directory is an upwards path: {:?}",
                base.path
            )));
        }
        let mut parts: Vec<&str> = Vec::new();
        for _ in common..theirs.len() {
            parts.push("..");
        }
        parts.extend_from_slice(&mine[common..]);
        Ok(TreePath::from_components(&parts, self.is_dir))
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Platform-native form for filesystem access.
    pub fn to_native(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Encode a relative, normalized path for storage in the run-database:
    /// no leading `./`, exactly one trailing `/` (enables prefix search).
    /// `.` encodes as the empty string.
    pub fn encode(&self) -> Result<String, PathError> {
        if self.is_absolute() || !self.is_normalized() {
            return Err(PathError(format!(
                "not a relative normalized path: {:?}",
                self.path
            )));
        }
        if self.path == "." {
            return Ok(String::new());
        }
        Ok(format!("{}/", self.path))
    }

    /// Inverse of [`TreePath::encode`].
    pub fn decode(encoded: &str, is_dir: bool) -> Result<TreePath, PathError> {
        if encoded.is_empty() {
            return Ok(TreePath {
                path: ".".to_string(),
                is_dir: true,
            });
        }
        let with_slash = format!("/{}", encoded);
        if !encoded.ends_with('/')
            || with_slash.contains("//")
            || with_slash.contains("/../")
            || with_slash.contains("/./")
        {
            return Err(PathError(format!("invalid encoded path: {:?}", encoded)));
        }
        let path = &encoded[..encoded.len() - 1];
        Ok(TreePath {
            path: path.to_string(),
            is_dir,
        })
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dir && self.path != "." && self.path != "/" {
            write!(f, "{}/", self.path)
        } else {
            write!(f, "{}", self.path)
        }
    }
}

impl std::str::FromStr for TreePath {
    type Err = PathError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TreePath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop() {
        assert_eq!(canon_path("foo"), "foo");
        assert_eq!(canon_path("foo/bar"), "foo/bar");
    }

    #[test]
    fn dot() {
        assert_eq!(canon_path("./foo"), "foo");
        assert_eq!(canon_path("foo/."), "foo");
        assert_eq!(canon_path("foo/./bar"), "foo/bar");
        assert_eq!(canon_path("."), ".");
    }

    #[test]
    fn slash() {
        assert_eq!(canon_path("/foo"), "/foo");
        assert_eq!(canon_path("foo//bar"), "foo/bar");
        assert_eq!(canon_path("foo/"), "foo");
    }

    #[test]
    fn parent() {
        assert_eq!(canon_path("foo/../bar"), "bar");
        assert_eq!(canon_path("/foo/../bar"), "/bar");
        assert_eq!(canon_path("../foo"), "../foo");
        assert_eq!(canon_path("../foo/../bar"), "../bar");
        assert_eq!(canon_path("../../bar"), "../../bar");
        assert_eq!(canon_path("/.."), "/");
    }

    #[test]
    fn dir_flag() {
        assert!(TreePath::new("a/b/").unwrap().is_dir());
        assert!(!TreePath::new("a/b").unwrap().is_dir());
        assert!(TreePath::new(".").unwrap().is_dir());
        assert!(TreePath::dir("a/b").unwrap().is_dir());
    }

    #[test]
    fn join() {
        let base = TreePath::dir("a/b").unwrap();
        let joined = base.join(&TreePath::new("c.txt").unwrap()).unwrap();
        assert_eq!(joined.as_str(), "a/b/c.txt");
        assert!(!joined.is_dir());

        let up = base.join(&TreePath::new("../c").unwrap()).unwrap();
        assert_eq!(up.as_str(), "a/c");

        assert!(TreePath::new("a/b").unwrap().join(&joined).is_err());
    }

    #[test]
    fn relative() {
        let p = TreePath::new("a/b/c.txt").unwrap();
        let rel = p.relative_to(&TreePath::dir("a/x").unwrap()).unwrap();
        assert_eq!(rel.as_str(), "../b/c.txt");
        let rel = p.relative_to(&TreePath::dir(".").unwrap()).unwrap();
        assert_eq!(rel.as_str(), "a/b/c.txt");
    }

    #[test]
    fn starts_with() {
        let p = TreePath::new("a/b/c.txt").unwrap();
        assert!(p.starts_with(&TreePath::dir("a/b").unwrap()));
        assert!(p.starts_with(&TreePath::dir(".").unwrap()));
        assert!(!p.starts_with(&TreePath::dir("a/c").unwrap()));
    }

    #[test]
    fn encoding_roundtrip() {
        let p = TreePath::new("a/b/c.txt").unwrap();
        assert_eq!(p.encode().unwrap(), "a/b/c.txt/");
        let back = TreePath::decode("a/b/c.txt/", false).unwrap();
        assert_eq!(back, p);

        assert_eq!(TreePath::dir(".").unwrap().encode().unwrap(), "");
        assert!(TreePath::new("/a").unwrap().encode().is_err());
        assert!(TreePath::new("../a").unwrap().encode().is_err());
        assert!(TreePath::decode("a//b/", false).is_err());
        assert!(TreePath::decode("a/../b/", false).is_err());
        assert!(TreePath::decode("a", false).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(TreePath::dir("a/b").unwrap().to_string(), "a/b/");
        assert_eq!(TreePath::new("a/b").unwrap().to_string(), "a/b");
    }
}
