//! Executable resolution against `PATH` (and `PATHEXT` on Windows).

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Resolve a command token to an executable path.
///
/// Tokens containing a path separator are taken relative to `cwd`; bare
/// names are searched on `path_var` (falls back to the process `PATH`).
pub fn resolve_executable(
    token: &str,
    path_var: Option<&OsString>,
    cwd: Option<&Path>,
) -> Option<PathBuf> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    let expanded = expand_home(token);
    if has_separator(&expanded) {
        let candidate = PathBuf::from(&expanded);
        let candidate = match (candidate.is_absolute(), cwd) {
            (false, Some(dir)) => dir.join(candidate),
            _ => candidate,
        };
        return executable_candidates(&candidate)
            .into_iter()
            .find(|c| is_executable(c));
    }

    let path_var = match path_var {
        Some(p) => p.clone(),
        None => std::env::var_os("PATH")?,
    };
    for dir in std::env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let base = dir.join(&expanded);
        if let Some(found) = executable_candidates(&base)
            .into_iter()
            .find(|c| is_executable(c))
        {
            return Some(found);
        }
    }
    None
}

/// Resolve several names; unresolved names are omitted.
pub fn which_bins(bins: &[String], path_var: Option<&OsString>) -> BTreeMap<String, String> {
    bins.iter()
        .filter_map(|name| {
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            resolve_executable(name, path_var, None)
                .map(|path| (name.to_string(), path.to_string_lossy().into_owned()))
        })
        .collect()
}

/// Final path component of a command token or path.
pub fn executable_name(token: &str) -> String {
    let trimmed = token.trim();
    let name = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed);
    name.to_string()
}

pub(crate) fn expand_home(token: &str) -> String {
    if token == "~" || token.starts_with("~/") || token.starts_with("~\\") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.display(), &token[1..]);
        }
    }
    token.to_string()
}

fn has_separator(token: &str) -> bool {
    token.contains('/') || (cfg!(windows) && token.contains('\\'))
}

#[cfg(windows)]
fn executable_candidates(base: &Path) -> Vec<PathBuf> {
    let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let mut out = Vec::new();
    if base.extension().is_some() {
        out.push(base.to_path_buf());
    }
    for ext in pathext.split(';').filter(|e| !e.is_empty()) {
        let mut s = base.as_os_str().to_owned();
        s.push(ext.to_ascii_lowercase());
        out.push(PathBuf::from(s));
    }
    out
}

#[cfg(not(windows))]
fn executable_candidates(base: &Path) -> Vec<PathBuf> {
    vec![base.to_path_buf()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_exe(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_resolves_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = make_exe(dir.path(), "mytool");
        let path_var = OsString::from(dir.path());
        assert_eq!(resolve_executable("mytool", Some(&path_var), None), Some(exe));
        assert_eq!(resolve_executable("missing", Some(&path_var), None), None);
    }

    #[test]
    fn test_non_executable_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data"), "x").unwrap();
        let path_var = OsString::from(dir.path());
        assert_eq!(resolve_executable("data", Some(&path_var), None), None);
    }

    #[test]
    fn test_first_path_entry_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = make_exe(a.path(), "tool");
        make_exe(b.path(), "tool");
        let path_var = std::env::join_paths([a.path(), b.path()]).unwrap();
        assert_eq!(resolve_executable("tool", Some(&path_var), None), Some(first));
    }

    #[test]
    fn test_relative_path_uses_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        let exe = make_exe(&dir.path().join("bin"), "run");
        let empty = OsString::new();
        assert_eq!(
            resolve_executable("./bin/run", Some(&empty), Some(dir.path())),
            Some(dir.path().join("./bin/run"))
        );
        assert!(exe.exists());
    }

    #[test]
    fn test_which_bins_omits_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let exe = make_exe(dir.path(), "git");
        let path_var = OsString::from(dir.path());
        let found = which_bins(&["git".to_string(), "nope".to_string()], Some(&path_var));
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("git"), Some(&exe.to_string_lossy().into_owned()));
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(executable_name("/usr/bin/git"), "git");
        assert_eq!(executable_name("git"), "git");
        assert_eq!(executable_name("C:\\tools\\rg.exe"), "rg.exe");
    }
}
