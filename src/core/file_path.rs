//! Decomposition of a request path into its application and local parts.
use std::path::{Component, Path, PathBuf};

/// A request path split at the application's context path.
///
/// For a request to `/shop/css/site.css` handled by the `/shop` application:
/// * `raw_path` is `/shop/css/site.css` (still percent-encoded)
/// * `context_path` is `/shop`
/// * `local_path` is `/css/site.css` (decoded, what route rules match against)
/// * `remainder` is `css/site.css` (relative form used for file resolution)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePath {
    pub raw_path: String,
    pub context_path: String,
    pub local_path: String,
    pub remainder: String,
}

impl FilePath {
    /// Split `raw_path` under `context_path`. Returns `None` when the path does
    /// not belong to that context.
    pub fn new(raw_path: &str, context_path: &str) -> Option<Self> {
        if !belongs_to(raw_path, context_path) {
            return None;
        }

        let local = if context_path == "/" {
            raw_path
        } else {
            &raw_path[context_path.len()..]
        };
        let local_path = urlencoding::decode(local)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| local.to_string());
        let remainder = local_path.trim_start_matches('/').to_string();

        Some(Self {
            raw_path: raw_path.to_string(),
            context_path: context_path.to_string(),
            local_path,
            remainder,
        })
    }

    /// True when the raw path ends with a slash (directory form).
    pub fn is_directory_form(&self) -> bool {
        self.raw_path.ends_with('/')
    }

    /// Join the remainder onto `root`, refusing any path that would escape it.
    pub fn resolve_under(&self, root: &Path) -> Option<PathBuf> {
        join_confined(root, &self.remainder)
    }
}

/// Whether `path` is `context_path` itself or lies beneath it on a segment boundary.
pub fn belongs_to(path: &str, context_path: &str) -> bool {
    if context_path == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(context_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Join a relative path onto `root`, allowing only normal components.
pub fn join_confined(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = relative.trim_start_matches('/');
    let mut joined = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompose_under_named_context() {
        let path = FilePath::new("/shop/css/site%20main.css", "/shop").unwrap();
        assert_eq!(path.context_path, "/shop");
        assert_eq!(path.local_path, "/css/site main.css");
        assert_eq!(path.remainder, "css/site main.css");
        assert!(!path.is_directory_form());
    }

    #[test]
    fn test_decompose_under_root_context() {
        let path = FilePath::new("/docs/", "/").unwrap();
        assert_eq!(path.local_path, "/docs/");
        assert_eq!(path.remainder, "docs/");
        assert!(path.is_directory_form());
    }

    #[test]
    fn test_context_itself_has_empty_local_path() {
        let path = FilePath::new("/shop", "/shop").unwrap();
        assert_eq!(path.local_path, "");
        assert_eq!(path.remainder, "");
    }

    #[test]
    fn test_segment_boundary() {
        assert!(FilePath::new("/shopping/cart", "/shop").is_none());
        assert!(belongs_to("/shop/cart", "/shop"));
        assert!(belongs_to("/anything", "/"));
    }

    #[test]
    fn test_resolve_under_rejects_traversal() {
        let root = Path::new("/srv/app");
        let path = FilePath::new("/shop/../../etc/passwd", "/shop").unwrap();
        assert!(path.resolve_under(root).is_none());

        let encoded = FilePath::new("/shop/%2e%2e/secret", "/shop").unwrap();
        assert!(encoded.resolve_under(root).is_none());

        let fine = FilePath::new("/shop/a/./b.txt", "/shop").unwrap();
        assert_eq!(fine.resolve_under(root), Some(PathBuf::from("/srv/app/a/b.txt")));
    }
}
