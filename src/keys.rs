//! Key layout: derives hash-tagged keys for queues and child counters so
//! every key belonging to one queue (or one child counter) lands on a
//! single cluster slot, the way [`RedisQueueInfo`] does in the teacher
//! crate — just generalized from a fixed set of suffixes to the anchor
//! key each script needs, with the rest of the lane keys owned by the
//! scripts themselves (spec §6.2: "the client must never compose them").

use crate::error::{Error, Result};

const MAX_CHILD_KEY_LEN: usize = 128;

/// Wraps `name` in a Redis hash-tag unless it is already wrapped.
///
/// `queue_base("demo") == "{demo}"`, `queue_base("{demo}") == "{demo}"`.
pub fn queue_base(name: &str) -> String {
    if is_hash_tagged(name) {
        name.to_string()
    } else {
        format!("{{{name}}}")
    }
}

fn is_hash_tagged(name: &str) -> bool {
    name.starts_with('{') && name.ends_with('}') && name.len() >= 2
}

/// The single declared key every queue-scoped script call passes.
pub fn queue_anchor(name: &str) -> String {
    format!("{}:meta", queue_base(name))
}

/// The pause-flag key, checked directly by the client for `is_paused`.
pub fn paused_flag(name: &str) -> String {
    format!("{}:paused", queue_base(name))
}

/// The per-job hash key, read directly by the client for `job_timeout_ms`.
pub fn job_hash(name: &str, job_id: &str) -> String {
    format!("{}:job:{job_id}", queue_base(name))
}

/// Validates a child-counter key: non-empty, at most 128 bytes, and free
/// of `{`/`}` (which would break the hash-tag it's about to be wrapped in).
pub fn validate_child_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::configuration("child counter key must not be empty"));
    }
    if key.len() > MAX_CHILD_KEY_LEN {
        return Err(Error::configuration(format!(
            "child counter key must be at most {MAX_CHILD_KEY_LEN} characters, got {}",
            key.len()
        )));
    }
    if key.contains('{') || key.contains('}') {
        return Err(Error::configuration(
            "child counter key must not contain '{' or '}'",
        ));
    }
    Ok(())
}

/// The single declared key every child-counter script call passes.
pub fn childs_anchor(key: &str) -> Result<String> {
    validate_child_key(key)?;
    Ok(format!("{{cc:{key}}}:meta"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_base_wraps_bare_names() {
        assert_eq!(queue_base("demo"), "{demo}");
    }

    #[test]
    fn queue_base_leaves_already_tagged_names() {
        assert_eq!(queue_base("{demo}"), "{demo}");
    }

    #[test]
    fn queue_base_wraps_empty_name() {
        assert_eq!(queue_base(""), "{}");
    }

    #[test]
    fn queue_base_wraps_a_lone_open_brace() {
        // "{" has no matching '}', so `is_hash_tagged` doesn't recognize it
        // as already wrapped and wraps it like any other bare name.
        assert_eq!(queue_base("{"), "{{}");
    }

    #[test]
    fn queue_base_wraps_a_lone_close_brace() {
        assert_eq!(queue_base("}"), "{}}");
    }

    #[test]
    fn queue_base_treats_a_malformed_outer_pair_as_already_tagged() {
        // "{{}" merely starts with '{' and ends with '}', which is all
        // `is_hash_tagged` checks — it passes through unchanged rather than
        // being wrapped a second time, even though its interior isn't a
        // single well-formed pair. This is the chosen behavior, not an
        // oversight: re-wrapping would change the hash tag Redis computes
        // the slot from, which matters more than rejecting odd input.
        assert_eq!(queue_base("{{}"), "{{}");
    }

    #[test]
    fn queue_anchor_contains_hash_tag() {
        assert_eq!(queue_anchor("demo"), "{demo}:meta");
        assert_eq!(queue_anchor("{demo}"), "{demo}:meta");
    }

    #[test]
    fn queue_anchor_pathological_inputs() {
        assert_eq!(queue_anchor(""), "{}:meta");
        assert_eq!(queue_anchor("{"), "{{}:meta");
    }

    #[test]
    fn paused_and_job_keys_share_hash_tag() {
        assert_eq!(paused_flag("demo"), "{demo}:paused");
        assert_eq!(job_hash("demo", "01ABC"), "{demo}:job:01ABC");
    }

    #[test]
    fn childs_anchor_wraps_key_under_cc_prefix() {
        assert_eq!(
            childs_anchor("document:doc_123").unwrap(),
            "{cc:document:doc_123}:meta"
        );
    }

    #[test]
    fn childs_anchor_rejects_empty_key() {
        assert!(childs_anchor("").is_err());
    }

    #[test]
    fn childs_anchor_rejects_braces() {
        assert!(childs_anchor("foo{bar}").is_err());
        assert!(childs_anchor("foo{bar").is_err());
    }

    #[test]
    fn childs_anchor_rejects_overlong_key() {
        let key = "x".repeat(129);
        assert!(childs_anchor(&key).is_err());
    }

    #[test]
    fn childs_anchor_accepts_boundary_length() {
        let key = "x".repeat(128);
        assert!(childs_anchor(&key).is_ok());
    }

    // P1: every key derived for a queue contains its hash tag, and every
    // key derived for a child key contains its `{cc:...}` hash tag.
    #[test]
    fn p1_hash_tag_property_queue() {
        for name in ["demo", "{demo}", "a", "Queue-With-Dashes_1"] {
            let tag = format!("{{{}}}", name.trim_start_matches('{').trim_end_matches('}'));
            assert!(queue_anchor(name).contains(&tag));
            assert!(paused_flag(name).contains(&tag));
            assert!(job_hash(name, "x").contains(&tag));
        }
    }

    #[test]
    fn p1_hash_tag_property_child_key() {
        for key in ["k", "document:doc_123", "a.b.c"] {
            let anchor = childs_anchor(key).unwrap();
            assert!(anchor.contains(&format!("{{cc:{key}}}")));
        }
    }
}
