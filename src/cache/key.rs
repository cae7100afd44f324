//! Cache keys and their on-disk names.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::CacheError;

/// Longest URL accepted as a key.
pub const MAX_KEY_LEN: usize = 4096;

/// Components of an encoded key carry at most this many base64 characters,
/// which keeps every name well below common filesystem limits.
const SEGMENT_LEN: usize = 128;

/// Suffix of every directory component. base64 never produces `.`, so a
/// directory can never share a name with a key's final file component.
pub(crate) const DIR_SUFFIX: &str = ".d";

/// A canonical absolute `http`/`https` URL addressing one cached item.
///
/// Normalisation (scheme overrides, local paths) happens in the dispatcher;
/// the engine only checks that the key is safe to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let invalid = |reason| CacheError::InvalidKey {
            key: raw.chars().take(256).collect(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("empty key"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(invalid("key too long"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("whitespace or control character"));
        }

        let uri: hyper::Uri = raw.parse().map_err(|_| invalid("not a valid URL"))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(invalid("scheme must be http or https")),
        }
        match uri.host() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(invalid("missing host")),
        }
        if uri.path().split('/').any(|segment| segment == "..") {
            return Err(invalid("parent directory segment"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the URL, used for per-host accounting.
    pub fn host(&self) -> &str {
        let rest = self
            .0
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0);
        rest.split(['/', '?']).next().unwrap_or(rest)
    }

    /// Relative path of the file holding this key in the file tier.
    ///
    /// The encoding is reversible so a directory walk can rebuild the index.
    /// Leading segments become `<seg>.d` directories, so a key that extends
    /// another one never needs the other's file to be a directory.
    pub fn relative_path(&self) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(self.0.as_bytes());
        // base64 output is ASCII, so byte chunks are valid str slices.
        let segments: Vec<_> = encoded
            .as_bytes()
            .chunks(SEGMENT_LEN)
            .map(String::from_utf8_lossy)
            .collect();
        let mut path = PathBuf::new();
        if let Some((last, dirs)) = segments.split_last() {
            for dir in dirs {
                path.push(format!("{dir}{DIR_SUFFIX}"));
            }
            path.push(&**last);
        }
        path
    }

    /// Inverse of [`CacheKey::relative_path`]. Returns `None` for foreign files.
    pub fn from_relative_path(path: &Path) -> Option<Self> {
        let components: Vec<&str> = path
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let (last, dirs) = components.split_last()?;
        let mut encoded = String::new();
        for dir in dirs {
            encoded.push_str(dir.strip_suffix(DIR_SUFFIX)?);
        }
        encoded.push_str(last);
        let bytes = URL_SAFE_NO_PAD.decode(encoded.as_bytes()).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        Self::parse(&raw).ok()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_http_and_https() {
        assert!(CacheKey::parse("http://mirror.example/pkg-1.0.tgz").is_ok());
        assert!(CacheKey::parse("https://mirror.example:8443/a/b?c=d").is_ok());
    }

    #[test]
    fn rejects_unsafe_keys() {
        for raw in [
            "",
            "mirror.example/pkg.tgz",
            "ftp://mirror.example/pkg.tgz",
            "http:///pkg.tgz",
            "http://mirror.example/a/../etc/passwd",
            "http://mirror.example/a b",
            "http://mirror.example/a\nb",
        ] {
            assert!(
                matches!(CacheKey::parse(raw), Err(CacheError::InvalidKey { .. })),
                "{raw:?} should be rejected"
            );
        }
        let long = format!("http://mirror.example/{}", "a".repeat(MAX_KEY_LEN));
        assert!(CacheKey::parse(&long).is_err());
    }

    #[test]
    fn host_is_extracted() {
        let key = CacheKey::parse("https://deb.debian.org/debian/dists/stable/Release").unwrap();
        assert_eq!(key.host(), "deb.debian.org");
        let key = CacheKey::parse("http://mirror.example:8080?x=1").unwrap();
        assert_eq!(key.host(), "mirror.example:8080");
    }

    #[test]
    fn relative_path_reverses_for_long_keys() {
        let raw = format!("https://mirror.example/{}", "segment/".repeat(60));
        let key = CacheKey::parse(&raw).unwrap();
        let path = key.relative_path();
        assert!(path.components().count() > 1);
        for component in path.components() {
            assert!(component.as_os_str().len() <= SEGMENT_LEN + DIR_SUFFIX.len());
        }
        assert_eq!(CacheKey::from_relative_path(&path), Some(key));
    }

    #[test]
    fn extended_key_does_not_nest_under_a_stored_file() {
        // 96 bytes encode to exactly one full segment
        let raw = format!("http://mirror.example/pool/{}.deb", "p".repeat(65));
        assert_eq!(raw.len(), 96);
        let deb = CacheKey::parse(&raw).unwrap();
        let asc = CacheKey::parse(&format!("{raw}.asc")).unwrap();

        let deb_path = deb.relative_path();
        let asc_path = asc.relative_path();
        assert_eq!(deb_path.components().count(), 1);
        assert_eq!(asc_path.components().count(), 2);
        assert!(!asc_path.starts_with(&deb_path));
        assert_eq!(CacheKey::from_relative_path(&deb_path), Some(deb));
        assert_eq!(CacheKey::from_relative_path(&asc_path), Some(asc));
    }

    #[test]
    fn directory_segments_need_their_suffix() {
        let raw = format!("https://mirror.example/{}", "segment/".repeat(20));
        let path = CacheKey::parse(&raw).unwrap().relative_path();
        let stripped: PathBuf = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().trim_end_matches(DIR_SUFFIX).to_string())
            .collect();
        assert_eq!(CacheKey::from_relative_path(&stripped), None);
    }

    #[test]
    fn foreign_file_names_are_ignored() {
        assert_eq!(CacheKey::from_relative_path(Path::new("not base64!")), None);
        // valid base64, but not a URL
        assert_eq!(CacheKey::from_relative_path(Path::new("aGVsbG8")), None);
    }
}
