//! Load-time structural safety check for pattern sources.
//!
//! Rejects patterns that place an unbounded dot quantifier (`.*` or `.+`)
//! directly against an alternation group with two or more branches — the
//! construction behind most catastrophic-backtracking regexes.  The check
//! runs on the raw pattern source before compilation, so a rejected pattern
//! never reaches the matcher, and maintainers cannot reintroduce the shape
//! through the policy file.

/// Verdict of the structural check.
///
/// # Errors
///
/// Returns a human-readable reason when the pattern contains `.*`/`.+`
/// adjacent to an alternation group of size ≥ 2.
pub fn check_pattern_safety(source: &str) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();

    // Forward pass: per-character escaped / inside-character-class flags.
    let mut escaped = vec![false; n];
    let mut in_class = vec![false; n];
    let mut backslashes = 0usize;
    let mut class_depth = false;
    for i in 0..n {
        escaped[i] = backslashes % 2 == 1;
        in_class[i] = class_depth;
        if chars[i] == '\\' && !escaped[i] {
            backslashes += 1;
        } else {
            backslashes = 0;
        }
        if !escaped[i] {
            if chars[i] == '[' && !class_depth {
                class_depth = true;
            } else if chars[i] == ']' && class_depth {
                class_depth = false;
            }
        }
    }

    let plain = |i: usize| !escaped[i] && !in_class[i];

    for i in 0..n.saturating_sub(1) {
        if !(plain(i) && chars[i] == '.' && matches!(chars[i + 1], '*' | '+')) {
            continue;
        }

        // Token before the dot quantifier.
        if i > 0 && plain(i - 1) && chars[i - 1] == ')' {
            if let Some(open) = matching_open(&chars, &escaped, &in_class, i - 1)
                && has_top_level_alternation(&chars, &escaped, &in_class, open, i - 1)
            {
                return Err(format!(
                    "unbounded quantifier '.{}' follows an alternation group",
                    chars[i + 1],
                ));
            }
        }

        // Token after the quantifier (skipping a lazy marker).
        let mut k = i + 2;
        if k < n && plain(k) && chars[k] == '?' {
            k += 1;
        }
        if k < n && plain(k) && chars[k] == '(' {
            if let Some(close) = matching_close(&chars, &escaped, &in_class, k)
                && has_top_level_alternation(&chars, &escaped, &in_class, k, close)
            {
                return Err(format!(
                    "unbounded quantifier '.{}' precedes an alternation group",
                    chars[i + 1],
                ));
            }
        }
    }

    Ok(())
}

fn matching_open(
    chars: &[char],
    escaped: &[bool],
    in_class: &[bool],
    close: usize,
) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = close;
    while i > 0 {
        i -= 1;
        if escaped[i] || in_class[i] {
            continue;
        }
        match chars[i] {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn matching_close(
    chars: &[char],
    escaped: &[bool],
    in_class: &[bool],
    open: usize,
) -> Option<usize> {
    let mut depth = 1usize;
    for (i, ch) in chars.iter().enumerate().skip(open + 1) {
        if escaped[i] || in_class[i] {
            continue;
        }
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Whether the group spanning `(open, close)` contains a `|` at its own
/// nesting level — i.e. has at least two branches.
fn has_top_level_alternation(
    chars: &[char],
    escaped: &[bool],
    in_class: &[bool],
    open: usize,
    close: usize,
) -> bool {
    let mut depth = 0usize;
    for i in open + 1..close {
        if escaped[i] || in_class[i] {
            continue;
        }
        match chars[i] {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dot_star_before_alternation() {
        assert!(check_pattern_safety(r".*(a|b)").is_err());
        assert!(check_pattern_safety(r"x.+(foo|bar|baz)").is_err());
        assert!(check_pattern_safety(r".*?(a|b)").is_err());
    }

    #[test]
    fn rejects_dot_star_after_alternation() {
        assert!(check_pattern_safety(r"(a|b).*").is_err());
        assert!(check_pattern_safety(r"(?:one|two).+end").is_err());
    }

    #[test]
    fn accepts_bounded_and_separated_forms() {
        assert!(check_pattern_safety(r"(a|b)c.*").is_ok());
        assert!(check_pattern_safety(r"(abc).*").is_ok());
        assert!(check_pattern_safety(r"a.{0,80}(b|c)").is_ok());
        assert!(check_pattern_safety(r"(?i)ignore\s+previous").is_ok());
    }

    #[test]
    fn ignores_escaped_and_class_forms() {
        assert!(check_pattern_safety(r"\.\*(a|b)").is_ok());
        assert!(check_pattern_safety(r"[.*](a|b)").is_ok());
        assert!(check_pattern_safety(r"(a\|b).*").is_ok());
    }

    #[test]
    fn nested_alternation_does_not_count_for_outer_group() {
        // The outer group's own level has no `|`; the check is structural,
        // not semantic.
        assert!(check_pattern_safety(r"((a|b)c).*").is_ok());
    }
}
