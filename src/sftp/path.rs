//! Lexical path normalization for REALPATH

/// Normalize `path` without touching the target
///
/// `.` components are dropped and `..` pops the previous component. `..`
/// never climbs above `/`; on relative paths leading `..` are kept. An empty
/// result is `.` (or `/` for absolute paths).
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&"..") | None if !absolute => parts.push(".."),
                Some(_) => {
                    parts.pop();
                }
                None => {}
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_absolute() {
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/tmp/./a//b/"), "/tmp/a/b");
        assert_eq!(normalize("/tmp/a/../b"), "/tmp/b");
        assert_eq!(normalize("/../.."), "/");
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("."), ".");
        assert_eq!(normalize("a/.."), ".");
        assert_eq!(normalize("../a/../../b"), "../../b");
        assert_eq!(normalize("dir/file"), "dir/file");
    }
}
