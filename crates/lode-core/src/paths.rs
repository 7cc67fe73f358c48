use std::path::{Path, PathBuf};

/// Candidate entry modules, tried in order: project root first, then `src/`.
const ENTRY_CANDIDATES: &[&str] = &[
    "main.js",
    "main.ts",
    "main.jsx",
    "main.tsx",
    "src/main.js",
    "src/main.ts",
    "src/main.jsx",
    "src/main.tsx",
];

/// Find the project root by walking up from `cwd` looking for `package.json` or `.git`.
///
/// Returns the first directory containing either marker, or `None` if neither is found.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").exists() || current.join(".git").exists() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Locate the application entry module (`main.{js,ts,jsx,tsx}`).
#[must_use]
pub fn determine_entry_file(root: &Path) -> Option<PathBuf> {
    ENTRY_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

/// Convert a path to the forward-slash form used for module ids.
#[must_use]
pub fn normalize_path(path: &Path) -> String {
    let s = path.display().to_string();
    if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s
    }
}
