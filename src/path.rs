//! Checked absolute pathnames.
//!
//! Host-side and container-side pathnames flow through many processes and
//! end up in mount calls, cgroup writes and ACL updates. [`Absolute`] is the
//! only pathname type those layers accept: it is always absolute, lexically
//! cleaned, and free of NUL bytes.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error returned by [`Absolute::new`] for an unusable pathname.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The pathname does not begin with `/`.
    #[error("pathname {0:?} is not absolute")]
    NotAbsolute(String),

    /// The pathname contains a NUL byte.
    #[error("pathname contains NUL byte")]
    NulByte,
}

/// An absolute, lexically cleaned pathname.
///
/// The string form never ends with a trailing slash (except for `/` itself)
/// and contains no `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Absolute(String);

impl Absolute {
    /// Validates and cleans `pathname`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if `pathname` is relative or contains NUL.
    pub fn new(pathname: impl AsRef<str>) -> Result<Self, PathError> {
        let pathname = pathname.as_ref();
        if pathname.contains('\0') {
            return Err(PathError::NulByte);
        }
        if !pathname.starts_with('/') {
            return Err(PathError::NotAbsolute(pathname.to_owned()));
        }
        Ok(Self(clean(pathname)))
    }

    /// Appends relative components, returning a new cleaned pathname.
    ///
    /// Leading slashes and dot components in `component` are cleaned away,
    /// so the result always remains beneath `self` lexically unless the
    /// component climbs with `..`.
    #[must_use]
    pub fn append(&self, component: impl AsRef<str>) -> Self {
        let mut joined = self.0.clone();
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(component.as_ref().trim_start_matches('/'));
        Self(clean(&joined))
    }

    /// Whether `self` lexically resides beneath (or equals) `base`.
    #[must_use]
    pub fn is_beneath(&self, base: &Absolute) -> bool {
        self.0 == base.0
            || (self.0.starts_with(base.0.as_str())
                && self.0.as_bytes().get(base.0.len()) == Some(&b'/'))
            || base.0 == "/"
    }

    /// The pathname as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pathname as a [`Path`].
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for Absolute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for Absolute {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl From<Absolute> for PathBuf {
    fn from(value: Absolute) -> Self {
        PathBuf::from(value.0)
    }
}

impl std::str::FromStr for Absolute {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Absolute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Absolute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Lexically cleans an absolute pathname: collapses repeated slashes,
/// resolves `.` and `..` components, strips the trailing slash.
fn clean(pathname: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(pathname).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(p) => {
                // components of a str path are valid UTF-8
                parts.push(p.to_str().unwrap_or_default());
            }
            Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::with_capacity(pathname.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_relative() {
        assert_eq!(
            Absolute::new("relative/path"),
            Err(PathError::NotAbsolute(String::from("relative/path")))
        );
        assert_eq!(Absolute::new(""), Err(PathError::NotAbsolute(String::new())));
    }

    #[test]
    fn test_rejects_nul() {
        assert_eq!(Absolute::new("/run/\0user"), Err(PathError::NulByte));
    }

    #[test]
    fn test_cleans_input() {
        assert_eq!(Absolute::new("/a//b/./c/").unwrap().as_str(), "/a/b/c");
        assert_eq!(Absolute::new("/a/b/../c").unwrap().as_str(), "/a/c");
        assert_eq!(Absolute::new("/..").unwrap().as_str(), "/");
    }

    #[test]
    fn test_append() {
        let base = Absolute::new("/run/user").unwrap();
        assert_eq!(base.append("1000").as_str(), "/run/user/1000");
        assert_eq!(base.append("a/b").as_str(), "/run/user/a/b");
        assert_eq!(base.append("/leading").as_str(), "/run/user/leading");
    }

    #[test]
    fn test_is_beneath() {
        let root = Absolute::new("/sys/fs/cgroup").unwrap();
        assert!(Absolute::new("/sys/fs/cgroup/x.slice").unwrap().is_beneath(&root));
        assert!(root.is_beneath(&root));
        assert!(!Absolute::new("/sys/fs/cgroupx").unwrap().is_beneath(&root));
        assert!(!Absolute::new("/etc").unwrap().is_beneath(&root));
    }

    #[test]
    fn test_serde_round_trip() {
        let p = Absolute::new("/home/chronos").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"/home/chronos\"");
        let back: Absolute = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_deserialize_rejects_relative() {
        assert!(serde_json::from_str::<Absolute>("\"etc\"").is_err());
    }
}
