//! MQTT 3.1.1 / v5 topic filter matching.
//!
//! `+` matches exactly one level, `#` matches the remaining tail and
//! must be the last, standalone segment of the filter.

/// Returns whether `topic` (a concrete, wildcard-free topic name)
/// matches `pattern` (a filter which may contain `+`/`#`).
pub fn topic_match(pattern: &str, topic: &str) -> bool {
    let mut filter_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some("+"), None) => return false,
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

/// Returns whether `topic` contains an MQTT wildcard character,
/// which is illegal in publish topics and subscriber-count queries.
pub fn has_wildcard(topic: &str) -> bool {
    topic.split('/').any(|level| level.contains('+') || level.contains('#'))
}
