//! Topic name and topic filter rules.

use crate::error::MqttError;

/// Checks that `topic` can be used as a PUBLISH topic name.
pub fn validate_topic_name(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() || topic.len() > u16::MAX as usize {
        return Err(MqttError::InvalidTopic);
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(MqttError::InvalidTopic);
    }
    Ok(())
}

/// Checks that `filter` is a well-formed subscription filter.
///
/// `+` must occupy a whole level and `#` must be the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), MqttError> {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return Err(MqttError::InvalidTopic);
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => return Err(MqttError::InvalidTopic),
            "#" | "+" => {}
            _ if level.contains(['+', '#']) => return Err(MqttError::InvalidTopic),
            _ => {}
        }
    }
    Ok(())
}

/// Wildcard topic matching.
///
/// - `+` (single-level): Matches exactly one topic level
/// - `#` (multi-level): Matches zero or more remaining levels (only at end)
///
/// Filters starting with a wildcard never match topics beginning with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
