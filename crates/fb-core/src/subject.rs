//! Dotted-segment subject matching.
//!
//! Subjects are dotted segments (`factory.line1.temp`).  Patterns may use
//! `*` for exactly one segment and `>` for one-or-more trailing segments.
//! `>` is only valid as the final pattern token.

/// True when `segment` contains only the allowed subject alphabet:
/// letters, digits, `_` and `-`.
fn valid_literal_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a concrete subject: non-empty, no empty segments, no wildcards.
pub fn valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.split('.').all(valid_literal_segment)
}

/// Validate a subscription/allow-list pattern.
///
/// Same alphabet as subjects, plus `*` anywhere and `>` only as the last
/// token.
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split('.').collect();
    let last = segments.len() - 1;
    segments.iter().enumerate().all(|(i, seg)| match *seg {
        "*" => true,
        ">" => i == last,
        other => valid_literal_segment(other),
    })
}

/// Match a concrete subject against a wildcard pattern.
///
/// Evaluated segment by segment, left to right.  Returns false for
/// syntactically invalid input on either side; matching is total and never
/// panics.
pub fn matches(pattern: &str, subject: &str) -> bool {
    if !valid_pattern(pattern) || !valid_subject(subject) {
        return false;
    }
    let pat: Vec<&str> = pattern.split('.').collect();
    let sub: Vec<&str> = subject.split('.').collect();

    for (i, pseg) in pat.iter().enumerate() {
        match *pseg {
            ">" => {
                // `>` needs at least one remaining subject segment.
                return sub.len() > i;
            }
            "*" => {
                if i >= sub.len() {
                    return false;
                }
            }
            literal => {
                if sub.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }
    pat.len() == sub.len()
}

/// Membership test against an ordered allow-list.
pub fn allowed(patterns: &[String], subject: &str) -> bool {
    patterns.iter().any(|p| matches(p, subject))
}

/// True when some concrete subject is matched by both patterns.
///
/// Used for stream resolution, where the requested side may itself be a
/// wildcard pattern.  For a concrete right-hand side this agrees with
/// [`matches`].
pub fn overlaps(a: &str, b: &str) -> bool {
    if !valid_pattern(a) || !valid_pattern(b) {
        return false;
    }
    let av: Vec<&str> = a.split('.').collect();
    let bv: Vec<&str> = b.split('.').collect();
    let mut i = 0;
    loop {
        match (av.get(i), bv.get(i)) {
            (Some(&">"), Some(_)) | (Some(_), Some(&">")) => return true,
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
            (Some(&x), Some(&y)) => {
                if x == "*" || y == "*" || x == y {
                    i += 1;
                } else {
                    return false;
                }
            }
        }
    }
}
