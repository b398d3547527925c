//! Helpers for handler paths.
//!
//! Handler paths are absolute within the remote (`/vm/vdis/job/vdi/a.vhd`). Resolution never
//! escapes the root: `..` at the top level is dropped, the same way `path.posix.resolve('/')`
//! behaves.

/// Normalize `path` into `/a/b/c` form, collapsing `.`/`..` and duplicate separators.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    push_segments(&mut parts, path);
    join_segments(&parts)
}

/// Resolve `relative` against the directory `dir`.
///
/// An absolute `relative` (leading `/`) replaces `dir` entirely.
pub fn resolve(dir: &str, relative: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !relative.starts_with('/') {
        push_segments(&mut parts, dir);
    }
    push_segments(&mut parts, relative);
    join_segments(&parts)
}

/// Directory component of a normalized path (`/` for top-level entries).
pub fn dirname(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// Final component of a path (empty for the root).
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Join a directory and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    resolve(dir, name.trim_start_matches('/'))
}

/// Express `target` relative to the directory `from_dir` (`../x/y.vhd` style).
pub fn relative(from_dir: &str, target: &str) -> String {
    let from = normalize(from_dir);
    let to = normalize(target);
    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();

    let common = from_parts
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out: Vec<&str> = Vec::new();
    out.extend(std::iter::repeat("..").take(from_parts.len() - common));
    out.extend(&to_parts[common..]);
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

fn push_segments<'a>(parts: &mut Vec<&'a str>, path: &'a str) {
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
}

fn join_segments(parts: &[&str]) -> String {
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum::<usize>() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots_and_separators() {
        assert_eq!(normalize("a//b/./c"), "/a/b/c");
        assert_eq!(normalize("/a/b/../c/"), "/a/c");
        assert_eq!(normalize("../../x"), "/x");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn resolve_follows_parent_links_relative_to_dir() {
        assert_eq!(
            resolve("/vm/vdis/job/vdi", "20240101.vhd"),
            "/vm/vdis/job/vdi/20240101.vhd"
        );
        assert_eq!(
            resolve("/vm/vdis/job/vdi", "../other/base.vhd"),
            "/vm/vdis/job/other/base.vhd"
        );
        assert_eq!(resolve("/vm", "/abs/path.vhd"), "/abs/path.vhd");
    }

    #[test]
    fn dirname_and_basename() {
        assert_eq!(dirname("/a/b/c.vhd"), "/a/b");
        assert_eq!(dirname("/c.vhd"), "/");
        assert_eq!(basename("/a/b/c.vhd"), "c.vhd");
        assert_eq!(basename("c.vhd"), "c.vhd");
    }

    #[test]
    fn relative_walks_up_to_common_prefix() {
        assert_eq!(relative("/a/b", "/a/b/c.vhd"), "c.vhd");
        assert_eq!(relative("/a/b", "/a/x/c.vhd"), "../x/c.vhd");
        assert_eq!(resolve("/a/b", &relative("/a/b", "/q/r.vhd")), "/q/r.vhd");
    }
}
