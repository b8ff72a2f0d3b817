//! Execution policy knobs and allowlist pattern matching.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::which::{executable_name, expand_home};

/// Agent id used when a request carries none.
pub const DEFAULT_AGENT_ID: &str = "main";

/// Allowlist key whose entries apply to every agent.
pub const WILDCARD_AGENT_ID: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecSecurity {
    /// Refuse every command.
    #[default]
    Deny,
    /// Only allowlisted (or skill, or approved) commands.
    Allowlist,
    /// Any command.
    #[serde(alias = "full")]
    Open,
}

impl ExecSecurity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Allowlist => "allowlist",
            Self::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Always,
    #[default]
    OnMiss,
    #[serde(alias = "off")]
    Never,
}

impl ExecAsk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnMiss => "on-miss",
            Self::Never => "never",
        }
    }
}

/// What to do when an approval prompt gets no answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AskFallback {
    Full,
    Allowlist,
    #[default]
    Deny,
}

impl AskFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Allowlist => "allowlist",
            Self::Deny => "deny",
        }
    }
}

/// Optional policy fields as they appear in the approvals file, both under
/// `defaults` and per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<ExecSecurity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<ExecAsk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_fallback: Option<AskFallback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_allow_skills: Option<bool>,
}

/// Effective policy for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecPolicy {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    pub ask_fallback: AskFallback,
    pub auto_allow_skills: bool,
}

impl ExecPolicy {
    /// Layer overrides on top of this policy; later layers win.
    pub fn apply(mut self, overrides: Option<&PolicyOverrides>) -> Self {
        if let Some(o) = overrides {
            if let Some(security) = o.security {
                self.security = security;
            }
            if let Some(ask) = o.ask {
                self.ask = ask;
            }
            if let Some(fallback) = o.ask_fallback {
                self.ask_fallback = fallback;
            }
            if let Some(skills) = o.auto_allow_skills {
                self.auto_allow_skills = skills;
            }
        }
        self
    }
}

/// Normalize an agent id, mapping blank to [`DEFAULT_AGENT_ID`].
pub fn normalize_agent_id(agent_id: Option<&str>) -> String {
    match agent_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_AGENT_ID.to_string(),
    }
}

/// Compile an allowlist glob.
///
/// `**` matches anything, `*` any run without a path separator, `?` one
/// character. Windows matching is case-insensitive.
pub fn compile_pattern(pattern: &str) -> Option<Regex> {
    let pattern = normalize_separators(&expand_home(pattern.trim()));
    if pattern.is_empty() {
        return None;
    }

    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                re.push_str(".*");
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    RegexBuilder::new(&re)
        .case_insensitive(cfg!(windows))
        .build()
        .ok()
}

/// Does `pattern` match this command?
///
/// Patterns with a path separator are matched against the resolved path;
/// bare patterns against the executable's file name.
pub fn pattern_matches(pattern: &str, resolved_path: Option<&str>, raw_executable: &str) -> bool {
    let Some(re) = compile_pattern(pattern) else {
        return false;
    };
    let normalized_pattern = normalize_separators(pattern);
    if normalized_pattern.contains('/') || normalized_pattern.starts_with('~') {
        let target = resolved_path.unwrap_or(raw_executable);
        return re.is_match(&normalize_separators(target));
    }
    let name = executable_name(resolved_path.unwrap_or(raw_executable));
    re.is_match(&name)
}

fn normalize_separators(s: &str) -> String {
    if cfg!(windows) {
        s.replace('\\', "/")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let p = ExecPolicy::default();
        assert_eq!(p.security, ExecSecurity::Deny);
        assert_eq!(p.ask, ExecAsk::OnMiss);
        assert_eq!(p.ask_fallback, AskFallback::Deny);
        assert!(!p.auto_allow_skills);
    }

    #[test]
    fn test_layering() {
        let defaults = PolicyOverrides {
            security: Some(ExecSecurity::Allowlist),
            ask_fallback: Some(AskFallback::Allowlist),
            ..Default::default()
        };
        let agent = PolicyOverrides {
            ask: Some(ExecAsk::Always),
            auto_allow_skills: Some(true),
            ..Default::default()
        };
        let p = ExecPolicy::default()
            .apply(Some(&defaults))
            .apply(Some(&agent));
        assert_eq!(p.security, ExecSecurity::Allowlist);
        assert_eq!(p.ask, ExecAsk::Always);
        assert_eq!(p.ask_fallback, AskFallback::Allowlist);
        assert!(p.auto_allow_skills);
    }

    #[test]
    fn test_full_is_open_alias() {
        let o: PolicyOverrides = serde_json::from_str(r#"{"security":"full"}"#).unwrap();
        assert_eq!(o.security, Some(ExecSecurity::Open));
        let o: PolicyOverrides =
            serde_json::from_str(r#"{"ask":"on-miss","askFallback":"allowlist"}"#).unwrap();
        assert_eq!(o.ask, Some(ExecAsk::OnMiss));
        assert_eq!(o.ask_fallback, Some(AskFallback::Allowlist));
    }

    #[test]
    fn test_normalize_agent_id() {
        assert_eq!(normalize_agent_id(None), "main");
        assert_eq!(normalize_agent_id(Some("  ")), "main");
        assert_eq!(normalize_agent_id(Some(" ops ")), "ops");
    }

    #[test]
    fn test_bare_pattern_matches_file_name() {
        assert!(pattern_matches("git", Some("/usr/bin/git"), "git"));
        assert!(pattern_matches("py*", Some("/usr/bin/python3"), "python3"));
        assert!(!pattern_matches("git", Some("/usr/bin/gitk"), "gitk"));
        assert!(pattern_matches("rg", None, "rg"));
    }

    #[test]
    fn test_path_pattern_matches_resolved_path() {
        assert!(pattern_matches("/usr/bin/git", Some("/usr/bin/git"), "git"));
        assert!(pattern_matches("/usr/bin/*", Some("/usr/bin/ls"), "ls"));
        assert!(!pattern_matches("/usr/bin/*", Some("/usr/bin/sub/ls"), "ls"));
        assert!(pattern_matches("/opt/**", Some("/opt/a/b/tool"), "tool"));
        assert!(pattern_matches("/usr/bin/l?", Some("/usr/bin/ls"), "ls"));
        assert!(!pattern_matches("/usr/local/bin/git", Some("/usr/bin/git"), "git"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(pattern_matches("g++", Some("/usr/bin/g++"), "g++"));
        assert!(!pattern_matches("a.b", Some("/bin/axb"), "axb"));
    }

    #[test]
    fn test_blank_pattern_never_matches() {
        assert!(!pattern_matches("   ", Some("/usr/bin/git"), "git"));
    }
}
