//! Focus-mute rule matching
//!
//! A rule with a directory part must equal the executable path. A bare rule
//! is compared against the executable's file name, and a rule without an
//! extension also matches the file name with its extension stripped, so
//! `reaper` matches `C:\Program Files\REAPER (x64)\reaper.exe`.
//!
//! Both `/` and `\` separate path components and comparisons ignore ASCII
//! case, following Windows file system semantics regardless of the host.

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn file_name(path: &str) -> &str {
    match path.rfind(is_separator) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

fn has_parent(path: &str) -> bool {
    path.contains(is_separator)
}

/// File name without its last extension. A leading dot is not an extension.
fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

fn has_extension(name: &str) -> bool {
    file_stem(name).len() != name.len()
}

fn same_path(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.chars().zip(b.chars()).all(|(x, y)| {
            (is_separator(x) && is_separator(y)) || x.eq_ignore_ascii_case(&y)
        })
}

/// Does the executable satisfy the rule?
///
/// An empty rule matches nothing; callers treat it as "no rule".
pub fn rule_matches(rule: &str, executable: &str) -> bool {
    let rule = rule.trim();
    if rule.is_empty() || executable.is_empty() {
        return false;
    }

    if has_parent(rule) {
        return same_path(rule, executable);
    }

    let exe_name = file_name(executable);
    (has_extension(rule) && rule.eq_ignore_ascii_case(exe_name))
        || rule.eq_ignore_ascii_case(file_stem(exe_name))
}

/// Focus-mute state of a target with `rule` while `executable` has focus
pub fn focus_muted(rule: &str, executable: &str) -> bool {
    !rule.trim().is_empty() && !rule_matches(rule, executable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const REAPER: &str = r"C:\Program Files\REAPER (x64)\reaper.exe";

    #[test]
    fn test_bare_name_ignores_extension() {
        assert!(rule_matches("reaper", REAPER));
        assert!(rule_matches("reaper.exe", REAPER));
        assert!(rule_matches("REAPER", REAPER));
        assert!(!rule_matches("reaper", r"C:\Windows\notepad.exe"));
        assert!(!rule_matches("reap", REAPER));
    }

    #[test]
    fn test_bare_name_with_wrong_extension() {
        assert!(!rule_matches("reaper.com", REAPER));
    }

    #[test]
    fn test_dotted_name_matches_stem() {
        assert!(rule_matches("MuseScore3.01", r"C:\apps\MuseScore3.01.exe"));
    }

    #[test]
    fn test_full_path_requires_exact_path() {
        assert!(rule_matches(REAPER, REAPER));
        assert!(rule_matches(
            "c:/program files/reaper (x64)/REAPER.EXE",
            REAPER
        ));
        assert!(!rule_matches(r"D:\REAPER\reaper.exe", REAPER));
        assert!(!rule_matches(r"C:\Program Files\REAPER (x64)\reaper", REAPER));
    }

    #[test]
    fn test_empty_rule_never_mutes() {
        assert!(!focus_muted("", REAPER));
        assert!(!focus_muted("   ", r"C:\Windows\notepad.exe"));
    }

    #[test]
    fn test_focus_muted_follows_foreground() {
        assert!(!focus_muted("reaper", REAPER));
        assert!(focus_muted("reaper", r"C:\Windows\System32\notepad.exe"));
    }

    #[test]
    fn test_unix_paths() {
        assert!(rule_matches("bitwig-studio", "/opt/bitwig-studio/bitwig-studio"));
        assert!(rule_matches("/usr/bin/ardour8", "/usr/bin/ardour8"));
    }

    proptest! {
        #[test]
        fn prop_bare_stem_matches_any_directory(
            dir in "[A-Za-z]:(\\\\[A-Za-z0-9 ]{1,8}){0,3}",
            stem in "[A-Za-z][A-Za-z0-9_]{0,10}",
        ) {
            let exe = format!("{}\\{}.exe", dir, stem);
            prop_assert!(rule_matches(&stem, &exe));
            prop_assert!(!focus_muted(&stem, &exe));
        }

        #[test]
        fn prop_full_path_matches_itself(
            parts in proptest::collection::vec("[A-Za-z0-9]{1,8}", 1..5),
        ) {
            let path = format!("/{}", parts.join("/"));
            prop_assert!(rule_matches(&path, &path));
        }
    }
}
