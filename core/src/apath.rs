//! Archive paths: `/`-rooted, `/`-separated UTF-8 paths relative to the
//! top of the backup source.
//!
//! Apaths order component by component, so a directory sorts before its
//! children and before any sibling whose name it is a prefix of. This is the
//! same order as a depth-first walk with each directory's entries sorted by
//! name, which lets the index be written while walking.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Apath(String);

impl Apath {
    /// The apath of the backup root.
    pub fn root() -> Apath {
        Apath("/".to_owned())
    }

    /// Build the apath for `path`, which must be inside `root`.
    pub fn from_relative(root: &Path, path: &Path) -> Result<Apath> {
        let relative = path.strip_prefix(root).map_err(|_| Error::UnsupportedPath {
            path: path.to_path_buf(),
            reason: format!("not inside {}", root.display()),
        })?;
        let mut apath = String::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| Error::UnsupportedPath {
                        path: path.to_path_buf(),
                        reason: "file name is not valid UTF-8".to_owned(),
                    })?;
                    apath.push('/');
                    apath.push_str(name);
                }
                Component::CurDir => {}
                _ => {
                    return Err(Error::UnsupportedPath {
                        path: path.to_path_buf(),
                        reason: "unexpected path component".to_owned(),
                    });
                }
            }
        }
        if apath.is_empty() {
            Ok(Apath::root())
        } else {
            Ok(Apath(apath))
        }
    }

    /// True if `s` is a well-formed apath.
    pub fn is_valid(s: &str) -> bool {
        if s == "/" {
            return true;
        }
        match s.strip_prefix('/') {
            Some(rest) => rest
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != ".."),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|part| !part.is_empty())
    }

    /// The path relative to the root, suitable for joining onto a
    /// destination directory.
    pub fn relative_path(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    /// Depth below the root; the root itself is 0.
    pub fn depth(&self) -> usize {
        self.components().count()
    }
}

impl TryFrom<&str> for Apath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Apath> {
        if Apath::is_valid(s) {
            Ok(Apath(s.to_owned()))
        } else {
            Err(Error::UnsupportedPath {
                path: s.into(),
                reason: "not a valid apath".to_owned(),
            })
        }
    }
}

impl Ord for Apath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for Apath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Apath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validity() {
        assert!(Apath::is_valid("/"));
        assert!(Apath::is_valid("/a/b.txt"));
        assert!(!Apath::is_valid(""));
        assert!(!Apath::is_valid("a"));
        assert!(!Apath::is_valid("/a//b"));
        assert!(!Apath::is_valid("/a/../b"));
        assert!(!Apath::is_valid("/a/"));
    }

    #[test]
    fn test_try_from_rejects_invalid() {
        assert_eq!(Apath::try_from("/a/b").unwrap().as_str(), "/a/b");
        let err = Apath::try_from("a/../b").unwrap_err();
        assert!(matches!(err, Error::UnsupportedPath { .. }));
    }

    #[test]
    fn test_ordering_matches_sorted_walk() {
        let ordered = [
            "/", "/a", "/a/b", "/a/b/c", "/a/z", "/a.txt", "/aa", "/b", "/b/a",
        ];
        for pair in ordered.windows(2) {
            let a = Apath::try_from(pair[0]).unwrap();
            let b = Apath::try_from(pair[1]).unwrap();
            assert!(a < b, "{} should sort before {}", a, b);
        }
    }

    #[test]
    fn test_from_relative() {
        let root = PathBuf::from("/src/tree");
        assert_eq!(Apath::from_relative(&root, &root).unwrap(), Apath::root());
        assert_eq!(
            Apath::from_relative(&root, &root.join("sub").join("f.txt"))
                .unwrap()
                .as_str(),
            "/sub/f.txt"
        );
        assert!(Apath::from_relative(&root, Path::new("/elsewhere")).is_err());
    }

    #[test]
    fn test_relative_path_and_depth() {
        let apath = Apath::try_from("/sub/f.txt").unwrap();
        assert_eq!(apath.relative_path(), "sub/f.txt");
        assert_eq!(apath.depth(), 2);
        assert_eq!(Apath::root().depth(), 0);
        assert!(Apath::root().is_root());
    }
}
