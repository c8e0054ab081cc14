//! Working-directory context attached to terminal commands.

use std::fs;
use std::path::{Path, PathBuf};

/// Current git branch for `dir`, read from the nearest `.git/HEAD`.
///
/// A detached HEAD is reported as its abbreviated commit id.
pub fn git_branch(dir: &Path) -> Option<String> {
    let git_dir = find_git_dir(dir)?;
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    match head.strip_prefix("ref:") {
        Some(reference) => {
            let reference = reference.trim();
            Some(
                reference
                    .strip_prefix("refs/heads/")
                    .unwrap_or(reference)
                    .to_string(),
            )
        }
        None => head.get(..7).map(str::to_string),
    }
}

/// Walk up from `dir` to the repository's git directory.
///
/// Worktrees and submodules use a `.git` file pointing elsewhere.
fn find_git_dir(dir: &Path) -> Option<PathBuf> {
    for ancestor in dir.ancestors() {
        let candidate = ancestor.join(".git");
        if candidate.is_dir() {
            return Some(candidate);
        }
        if candidate.is_file() {
            let content = fs::read_to_string(&candidate).ok()?;
            let target = content.trim().strip_prefix("gitdir:")?.trim();
            let target = PathBuf::from(target);
            return Some(if target.is_absolute() {
                target
            } else {
                ancestor.join(target)
            });
        }
    }
    None
}

/// Project type from marker files in `dir`.
pub fn project_type(dir: &Path) -> Option<&'static str> {
    const MARKERS: &[(&str, &str)] = &[
        ("package.json", "node"),
        ("pyproject.toml", "python"),
        ("requirements.txt", "python"),
        ("Cargo.toml", "rust"),
        ("go.mod", "go"),
        ("pom.xml", "java"),
        ("Makefile", "c/cpp"),
        (".git", "git"),
    ];

    MARKERS
        .iter()
        .find(|(marker, _)| dir.join(marker).exists())
        .map(|(_, kind)| *kind)
}

/// Name of the user's login shell, from `$SHELL`.
pub fn shell_type() -> String {
    std::env::var("SHELL")
        .ok()
        .and_then(|shell| {
            Path::new(&shell)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
