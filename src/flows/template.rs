//! `{{placeholder}}` substitution for outbound text.

use serde_json::Value;

/// Replaces `{{key}}` placeholders with values from `vars` (an object).
/// Unknown placeholders are left untouched so authoring mistakes stay
/// visible instead of silently vanishing.
pub fn render(text: &str, vars: &Value) -> String {
    let Some(map) = vars.as_object() else {
        return text.to_string();
    };
    let mut out = text.to_string();
    for (key, value) in map {
        let needle = format!("{{{{{key}}}}}");
        if !out.contains(&needle) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_placeholders() {
        let vars = json!({"username": "fan_account", "email": "fan@example.com"});
        assert_eq!(
            render("Hey {{username}}, confirming {{email}}", &vars),
            "Hey fan_account, confirming fan@example.com"
        );
    }

    #[test]
    fn unknown_placeholders_are_preserved() {
        let vars = json!({"username": "fan_account"});
        assert_eq!(render("Your link: {{link}}", &vars), "Your link: {{link}}");
    }

    #[test]
    fn null_renders_empty_and_numbers_render_bare() {
        let vars = json!({"name": null, "count": 3});
        assert_eq!(render("{{name}}x{{count}}", &vars), "x3");
    }

    #[test]
    fn non_object_vars_are_a_no_op() {
        assert_eq!(render("hi {{username}}", &json!(null)), "hi {{username}}");
    }
}
