//! Locates the upstream `codex` binary when the caller hasn't pinned one
//! via an environment variable. Grounded on the original Python
//! prototype's `_find_codex_binary`: env override, then a short fixed list
//! of well-known install locations, then a `PATH` search, then a bundled
//! copy under a user's editor extension directory, newest by mtime.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

const FIXED_CANDIDATES: &[&str] = &["/opt/homebrew/bin/codex", "/usr/local/bin/codex"];
const EDITOR_EXTENSION_DIRS: &[&str] = &[".vscode-insiders/extensions", ".vscode/extensions"];

pub fn discover_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CODEX_BINARY") {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("CODEX_BIN") {
        return Some(PathBuf::from(path));
    }

    for candidate in FIXED_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Some(path);
        }
    }

    if let Some(path) = which("codex") {
        return Some(path);
    }

    find_bundled_copy()
}

fn which(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(program);
        candidate.is_file().then_some(candidate)
    })
}

/// Searches `~/.vscode[-insiders]/extensions/openai.chatgpt-*/bin/**/codex`
/// for a copy bundled with the ChatGPT editor extension, picking the one
/// with the newest modification time when more than one is found.
fn find_bundled_copy() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for extension_dir in EDITOR_EXTENSION_DIRS {
        let base = home.join(extension_dir);
        let Ok(entries) = fs::read_dir(&base) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("openai.chatgpt-") {
                continue;
            }
            let bin_dir = entry.path().join("bin");
            for found in walk_for_codex(&bin_dir) {
                if let Ok(metadata) = fs::metadata(&found) {
                    if let Ok(modified) = metadata.modified() {
                        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                            newest = Some((modified, found));
                        }
                    }
                }
            }
        }
    }

    newest.map(|(_, path)| path)
}

fn walk_for_codex(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(walk_for_codex(&path));
        } else if path.file_name().map(|n| n == "codex").unwrap_or(false) {
            found.push(path);
        }
    }
    found
}
