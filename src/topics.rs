//! MQTT topic filter matching
//!
//! Implements the MQTT 3.1.1 (section 4.7) matching rules used to route an inbound
//! PUBLISH to every subscription whose filter covers its topic.

/// Check whether `topic` is covered by the subscription `filter`.
///
/// - `+` matches exactly one topic level
/// - `#` matches the remaining levels (including the parent level) and must be last
/// - topics starting with `$` are not matched by a filter starting with a wildcard
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// The part of a subscription filter that is matched against topics.
///
/// Shared subscriptions (`$share/<group>/<filter>`) and queue subscriptions
/// (`$queue/<filter>`) are routed by the filter after the prefix.
pub fn routing_filter(filter: &str) -> &str {
    if let Some(rest) = filter.strip_prefix("$queue/") {
        return rest;
    }
    if let Some((_group, rest)) = filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
    {
        return rest;
    }
    filter
}

/// Whether a topic filter contains wildcard levels
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}
