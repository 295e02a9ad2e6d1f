//! Painless scripts for atomic label updates.
//!
//! Labels live in a nested `timesketch_label` list on each event. Updates
//! run server-side so concurrent annotators never clobber each other's
//! entries: the scripts operate on the current document state inside the
//! backend's own update cycle.
//!
//! Matching semantics: removal and toggling match on `(name, sketch_id)`
//! only. The `user_id` in a label entry records who wrote it, but a label
//! is sketch-scoped, so any user's removal clears it.

use serde_json::{json, Value};

use traceline_core::{LabelOp, LabelUpdate};

/// Add or remove a label entry, driven by the `remove` parameter.
pub const UPDATE_LABEL_SCRIPT: &str = r#"
if (ctx._source.timesketch_label == null) {
    ctx._source.timesketch_label = new ArrayList()
}
if (params.remove == true) {
    ctx._source.timesketch_label.removeIf(label -> label.name == params.timesketch_label.name && label.sketch_id == params.timesketch_label.sketch_id);
} else {
    if( ! ctx._source.timesketch_label.contains (params.timesketch_label)) {
        ctx._source.timesketch_label.add(params.timesketch_label)
    }
}
"#;

/// Remove a label entry by `(name, sketch_id)`; add it if nothing matched.
pub const TOGGLE_LABEL_SCRIPT: &str = r#"
if (ctx._source.timesketch_label == null) {
    ctx._source.timesketch_label = new ArrayList()
}
boolean removedLabel = ctx._source.timesketch_label.removeIf(label -> label.name == params.timesketch_label.name && label.sketch_id == params.timesketch_label.sketch_id);
if (!removedLabel) {
    ctx._source.timesketch_label.add(params.timesketch_label)
}
"#;

/// Build the script object for a label update.
///
/// The same object works as the body of a single `_update` call (wrapped in
/// `{"script": ...}`) and as the payload of a bulk update action.
#[must_use]
pub fn label_script(update: &LabelUpdate) -> Value {
    let source = match update.op {
        LabelOp::Toggle => TOGGLE_LABEL_SCRIPT,
        LabelOp::Add | LabelOp::Remove => UPDATE_LABEL_SCRIPT,
    };
    json!({
        "lang": "painless",
        "source": source,
        "params": {
            "timesketch_label": {
                "name": update.label,
                "user_id": update.user_id,
                "sketch_id": update.sketch_id,
            },
            "remove": update.op == LabelOp::Remove,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(op: LabelOp) -> LabelUpdate {
        LabelUpdate {
            index: "sketch_1".to_owned(),
            event_id: "ev1".to_owned(),
            sketch_id: 7,
            user_id: 3,
            label: "__ts_star".to_owned(),
            op,
        }
    }

    #[test]
    fn add_uses_update_script_without_remove() {
        let script = label_script(&update(LabelOp::Add));
        assert_eq!(script["source"].as_str().unwrap(), UPDATE_LABEL_SCRIPT);
        assert_eq!(script["params"]["remove"], serde_json::json!(false));
    }

    #[test]
    fn remove_sets_remove_parameter() {
        let script = label_script(&update(LabelOp::Remove));
        assert_eq!(script["source"].as_str().unwrap(), UPDATE_LABEL_SCRIPT);
        assert_eq!(script["params"]["remove"], serde_json::json!(true));
    }

    #[test]
    fn toggle_uses_toggle_script() {
        let script = label_script(&update(LabelOp::Toggle));
        assert_eq!(script["source"].as_str().unwrap(), TOGGLE_LABEL_SCRIPT);
    }

    #[test]
    fn params_carry_full_label_triple() {
        let script = label_script(&update(LabelOp::Add));
        let label = &script["params"]["timesketch_label"];
        assert_eq!(label["name"], serde_json::json!("__ts_star"));
        assert_eq!(label["user_id"], serde_json::json!(3));
        assert_eq!(label["sketch_id"], serde_json::json!(7));
    }

    #[test]
    fn removal_scripts_match_name_and_sketch_only() {
        // The matcher must not mention user_id: removal is sketch-scoped.
        for script in [UPDATE_LABEL_SCRIPT, TOGGLE_LABEL_SCRIPT] {
            let matcher = script
                .lines()
                .find(|line| line.contains("removeIf"))
                .expect("removeIf present");
            assert!(matcher.contains("label.name"));
            assert!(matcher.contains("label.sketch_id"));
            assert!(!matcher.contains("label.user_id"));
        }
    }
}
