//! Path utilities shared by mount resolution and the FAT32 driver.
//!
//! Ported near-verbatim from the donor's own `kernel/hadron-kernel/src/fs/path.rs`
//! -- these helpers are filesystem-agnostic string manipulation, unrelated
//! to the donor's async `Inode` design this crate otherwise replaces.

/// Splits `path` into its non-empty `/`-separated components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Returns `true` if `path` starts with `/`.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Finds the longest mount point in `mounts` that is a prefix of `path`.
///
/// The root mount (`"/"`) matches every path. A non-root mount `m`
/// matches `path` only if `path` starts with `m` and the next character
/// (if any) is `/` -- so `/mnt` matches `/mnt/x` but not `/mnt2`.
pub fn longest_prefix_match<'a, I>(path: &str, mounts: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<&str> = None;
    for mount in mounts {
        let matches = mount == "/"
            || (path.starts_with(mount)
                && path[mount.len()..].chars().next().is_none_or(|c| c == '/'));
        if matches && best.is_none_or(|b| mount.len() > b.len()) {
            best = Some(mount);
        }
    }
    best
}

/// Strips `mount`'s prefix from `path`, returning the path relative to the
/// mount's root. For the root mount, strips only the leading `/`.
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        return path.strip_prefix('/').unwrap_or(path);
    }
    if path == mount {
        return "";
    }
    path.get(mount.len() + 1..).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skips_empty_segments() {
        let parts: alloc::vec::Vec<&str> = components("/a//b/c/").collect();
        assert_eq!(parts, ["a", "b", "c"]);
    }

    #[test]
    fn root_matches_everything() {
        assert_eq!(longest_prefix_match("/etc/passwd", ["/"]), Some("/"));
    }

    #[test]
    fn longest_mount_wins() {
        let mounts = ["/", "/mnt", "/mnt/disk"];
        assert_eq!(
            longest_prefix_match("/mnt/disk/file.txt", mounts),
            Some("/mnt/disk")
        );
    }

    #[test]
    fn prefix_must_end_at_separator() {
        let mounts = ["/", "/mnt"];
        assert_eq!(longest_prefix_match("/mnt2/file", mounts), Some("/"));
    }

    #[test]
    fn strip_root_prefix() {
        assert_eq!(strip_mount_prefix("/etc/passwd", "/"), "etc/passwd");
    }

    #[test]
    fn strip_non_root_prefix() {
        assert_eq!(strip_mount_prefix("/mnt/disk/file.txt", "/mnt/disk"), "file.txt");
        assert_eq!(strip_mount_prefix("/mnt/disk", "/mnt/disk"), "");
    }
}
