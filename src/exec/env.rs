//! Environment sanitizing for spawned commands.
//!
//! Caller-supplied overrides may not redirect interpreter module resolution
//! or dynamic library loading in the child.

use std::collections::HashMap;
use std::ffi::OsString;

use crate::logging::targets;

/// Override keys that are always dropped (compared case-insensitively).
const BLOCKED_ENV_KEYS: &[&str] = &[
    "PATH",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONHOME",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYLIB",
    "RUBYOPT",
    "BASH_ENV",
    "ENV",
];

/// Dynamic loader prefixes (compared case-insensitively).
const BLOCKED_ENV_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Whether an override key is refused.
pub fn is_blocked_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    BLOCKED_ENV_KEYS.contains(&upper.as_str())
        || BLOCKED_ENV_PREFIXES
            .iter()
            .any(|prefix| upper.starts_with(prefix))
}

/// A complete child environment. Inherited values need not be UTF-8.
pub type EnvMap = HashMap<OsString, OsString>;

/// Merge overrides onto the inherited process environment.
///
/// Returns `None` when there is nothing to override; the child then simply
/// inherits the parent's environment.
pub fn sanitize_env(overrides: Option<&HashMap<String, String>>) -> Option<EnvMap> {
    let overrides = overrides.filter(|o| !o.is_empty())?;
    Some(merge_env_with_base(std::env::vars_os(), overrides))
}

/// Merge `overrides` onto `base`, dropping blocked keys from the overrides.
pub fn merge_env_with_base(
    base: impl IntoIterator<Item = (OsString, OsString)>,
    overrides: &HashMap<String, String>,
) -> EnvMap {
    let mut merged: EnvMap = base.into_iter().collect();
    for (key, value) in overrides {
        if key.is_empty() || key.contains('=') {
            continue;
        }
        if is_blocked_env_key(key) {
            tracing::debug!(target: targets::EXEC, key = %key, "dropping blocked env override");
            continue;
        }
        merged.insert(key.into(), value.into());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn get<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
        env.get(&OsString::from(key)).and_then(|v| v.to_str())
    }

    fn has(env: &EnvMap, key: &str) -> bool {
        env.contains_key(&OsString::from(key))
    }

    #[test]
    fn test_no_overrides_is_passthrough() {
        assert!(sanitize_env(None).is_none());
        assert!(sanitize_env(Some(&HashMap::new())).is_none());
    }

    #[test]
    fn test_blocked_keys_dropped() {
        let base = vec![(OsString::from("PATH"), OsString::from("/usr/bin"))];
        let overrides = map(&[
            ("PATH", "/evil"),
            ("LD_PRELOAD", "/evil.so"),
            ("ld_library_path", "/evil"),
            ("DYLD_INSERT_LIBRARIES", "/evil.dylib"),
            ("PythonPath", "/evil"),
            ("FOO", "bar"),
        ]);
        let merged = merge_env_with_base(base, &overrides);
        assert_eq!(get(&merged, "PATH"), Some("/usr/bin"));
        assert_eq!(get(&merged, "FOO"), Some("bar"));
        assert!(!has(&merged, "LD_PRELOAD"));
        assert!(!has(&merged, "ld_library_path"));
        assert!(!has(&merged, "DYLD_INSERT_LIBRARIES"));
        assert!(!has(&merged, "PythonPath"));
    }

    #[test]
    fn test_custom_key_verbatim() {
        let merged = merge_env_with_base(Vec::new(), &map(&[("FOO", "bar baz=1")]));
        assert_eq!(merged.len(), 1);
        assert_eq!(get(&merged, "FOO"), Some("bar baz=1"));
    }

    #[test]
    fn test_invalid_keys_skipped() {
        let merged = merge_env_with_base(Vec::new(), &map(&[("", "x"), ("A=B", "y")]));
        assert!(merged.is_empty());
    }

    #[test]
    fn test_is_blocked_env_key() {
        assert!(is_blocked_env_key("node_options"));
        assert!(is_blocked_env_key("LD_AUDIT"));
        assert!(!is_blocked_env_key("HOME"));
        assert!(!is_blocked_env_key("OLD_PATH"));
    }

    #[test]
    fn test_sanitize_env_includes_inherited() {
        let merged = sanitize_env(Some(&map(&[("CARAPACE_NODE_TEST_KEY", "1")]))).unwrap();
        assert_eq!(get(&merged, "CARAPACE_NODE_TEST_KEY"), Some("1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_inherited_values_survive() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(vec![b'a', 0xff, b'z']);
        let base = vec![
            (OsString::from("RAW_VALUE"), raw.clone()),
            (OsString::from_vec(vec![b'K', 0xfe]), OsString::from("v")),
        ];
        let merged = merge_env_with_base(base, &map(&[("FOO", "bar")]));
        assert_eq!(merged.get(&OsString::from("RAW_VALUE")), Some(&raw));
        assert!(merged.contains_key(&OsString::from_vec(vec![b'K', 0xfe])));
        assert_eq!(get(&merged, "FOO"), Some("bar"));
    }
}
