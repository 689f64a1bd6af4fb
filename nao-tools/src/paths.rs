//! Virtual path mapping for the project folder.
//!
//! The model only ever sees virtual paths where `/` is the project root.
//! Paths are resolved lexically first; an existing path is then checked
//! again after symlinks are followed.

use crate::error::{Result, ToolError};
use std::path::{Component, Path, PathBuf};

/// Directory names hidden from every tool.
pub const EXCLUDED_DIRS: &[&str] = &[".meta"];

pub fn is_excluded_entry(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

/// Collapses `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn within_project(resolved: &Path, project_folder: &Path) -> bool {
    let Ok(rel) = resolved.strip_prefix(project_folder) else {
        return false;
    };
    !rel.components().any(|c| match c {
        Component::Normal(part) => part.to_str().is_some_and(is_excluded_entry),
        _ => false,
    })
}

/// `/foo/bar` and `foo/bar` both map to `{project}/foo/bar`; `/` and `` map to the project.
pub fn to_real_path(virtual_path: &str, project_folder: &Path) -> Result<PathBuf> {
    let relative = virtual_path.trim_start_matches('/');
    let resolved = normalize(&project_folder.join(relative));
    if !within_project(&resolved, project_folder) || escapes_via_symlink(&resolved, project_folder)
    {
        return Err(ToolError::AccessDenied(virtual_path.to_string()));
    }
    Ok(resolved)
}

/// True when the deepest existing part of `resolved` really lives outside
/// the project (or in an excluded dir) once links are followed.
fn escapes_via_symlink(resolved: &Path, project_folder: &Path) -> bool {
    let Ok(canonical_root) = std::fs::canonicalize(project_folder) else {
        return false;
    };
    let Some(existing) = resolved
        .ancestors()
        .find(|p| std::fs::symlink_metadata(p).is_ok())
    else {
        return false;
    };
    match std::fs::canonicalize(existing) {
        Ok(real) => !within_project(&real, &canonical_root),
        // A dangling link.
        Err(_) => true,
    }
}

pub fn to_virtual_path(real_path: &Path, project_folder: &Path) -> Result<String> {
    let resolved = normalize(real_path);
    if !within_project(&resolved, project_folder) {
        return Err(ToolError::AccessDenied(real_path.display().to_string()));
    }
    let rel = resolved
        .strip_prefix(project_folder)
        .map_err(|_| ToolError::AccessDenied(real_path.display().to_string()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(format!("/{}", parts.join("/")))
}

/// Lists every regular file under `start`, skipping excluded directories.
///
/// Blocking; call from `spawn_blocking`. Unreadable directories are skipped.
pub(crate) fn walk_files(start: &Path, limit: usize) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if start.is_file() {
        out.push(start.to_path_buf());
        return out;
    }

    let mut stack = vec![start.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(rd) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut entries: Vec<_> = rd.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        // Reverse so the stack pops directories in name order.
        for entry in entries.into_iter().rev() {
            let name = entry.file_name();
            if name.to_str().is_some_and(is_excluded_entry) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                out.push(entry.path());
                if out.len() >= limit {
                    out.sort();
                    return out;
                }
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/srv/project";

    #[test]
    fn virtual_paths_resolve_under_the_project() {
        let root = Path::new(ROOT);
        assert_eq!(to_real_path("/", root).expect("root"), root);
        assert_eq!(to_real_path("", root).expect("empty"), root);
        assert_eq!(
            to_real_path("/models/orders.sql", root).expect("abs"),
            root.join("models/orders.sql")
        );
        assert_eq!(
            to_real_path("models/./x/../orders.sql", root).expect("rel"),
            root.join("models/orders.sql")
        );
    }

    #[test]
    fn escaping_or_excluded_paths_are_denied() {
        let root = Path::new(ROOT);
        let err = to_real_path("/../etc/passwd", root).expect_err("escape");
        assert_eq!(
            err.to_string(),
            "Access denied: path '/../etc/passwd' is outside the project folder"
        );
        assert!(to_real_path("../project-other/x", root).is_err());
        assert!(to_real_path("/.meta/secrets", root).is_err());
        assert!(to_real_path("/docs/.meta", root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_out_of_the_project_are_denied() {
        let outside = tempfile::tempdir().expect("outside");
        std::fs::write(outside.path().join("secret.txt"), "s").expect("write");
        let project = tempfile::tempdir().expect("project");
        std::fs::write(project.path().join("notes.txt"), "n").expect("write");
        std::fs::create_dir(project.path().join(".meta")).expect("mkdir");
        std::os::unix::fs::symlink(outside.path(), project.path().join("escape")).expect("link");
        std::os::unix::fs::symlink(project.path().join("notes.txt"), project.path().join("alias.txt"))
            .expect("link");
        std::os::unix::fs::symlink(project.path().join(".meta"), project.path().join("meta"))
            .expect("link");

        let root = project.path();
        assert!(to_real_path("/escape/secret.txt", root).is_err());
        assert!(to_real_path("/escape", root).is_err());
        assert!(to_real_path("/escape/not-yet-created.txt", root).is_err());
        assert!(to_real_path("/meta", root).is_err());
        assert_eq!(
            to_real_path("/alias.txt", root).expect("inner link"),
            root.join("alias.txt")
        );
        assert_eq!(
            to_real_path("/new/file.txt", root).expect("missing path"),
            root.join("new/file.txt")
        );
    }

    #[test]
    fn real_paths_map_back_to_virtual() {
        let root = Path::new(ROOT);
        assert_eq!(to_virtual_path(root, root).expect("root"), "/");
        assert_eq!(
            to_virtual_path(&root.join("a/b.txt"), root).expect("file"),
            "/a/b.txt"
        );
        assert!(to_virtual_path(Path::new("/srv/other"), root).is_err());
    }

    #[test]
    fn walk_skips_excluded_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("a/.meta")).expect("mkdir");
        std::fs::write(dir.path().join("a/one.txt"), "1").expect("write");
        std::fs::write(dir.path().join("a/.meta/hidden.txt"), "x").expect("write");
        std::fs::write(dir.path().join("two.txt"), "2").expect("write");

        let files = walk_files(dir.path(), 100);
        assert_eq!(
            files,
            vec![dir.path().join("a/one.txt"), dir.path().join("two.txt")]
        );
    }
}
