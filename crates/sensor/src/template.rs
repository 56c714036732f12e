//! Template rendering for parameter `contextTemplate` / `dataTemplate`.
//!
//! Templates are Tera templates. Go-style templates (`{{ .Input.body.name }}`,
//! `{{ .Input.x | default "y" }}`) are converted before rendering so existing
//! sensor definitions keep working.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tera::{Context, Tera};

use crate::{Error, Result};

/// Name the resolved context or data is bound to inside a template.
pub const INPUT: &str = "Input";

lazy_static! {
    static ref DEFAULT_DOUBLE_QUOTED: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+"([^"]+)"(\s*)\}\}"#).unwrap();
    static ref DEFAULT_SINGLE_QUOTED: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+'([^']+)'(\s*)\}\}"#).unwrap();
    static ref DEFAULT_BARE: Regex =
        Regex::new(r#"\{\{([^}]+)\|\s*default\s+([^}\s(]+)(\s*)\}\}"#).unwrap();
}

/// Convert Go template syntax to Tera syntax
///
/// - {{ .Input.path }} -> {{ Input.path }}
/// - {{ .Input.value | default "x" }} -> {{ Input.value | default(value="x") }}
pub fn convert_go_to_tera(template: &str) -> String {
    let converted = template.replace("{{ .", "{{ ").replace("{{.", "{{");
    let converted = DEFAULT_DOUBLE_QUOTED.replace_all(&converted, "{{$1| default(value=\"$2\")$3}}");
    let converted = DEFAULT_SINGLE_QUOTED.replace_all(&converted, "{{$1| default(value=\"$2\")$3}}");
    DEFAULT_BARE
        .replace_all(&converted, "{{$1| default(value=\"$2\")$3}}")
        .to_string()
}

/// Render a template with every top-level field of `context` in scope.
pub fn render_template(template: &str, context: &Value) -> Result<String> {
    let converted = convert_go_to_tera(template);

    let mut tera = Tera::default();
    tera.add_raw_template("template", &converted)
        .map_err(|e| Error::Parameter(format!("failed to parse template: {}", e)))?;

    let mut tera_context = Context::new();
    match context {
        Value::Object(map) => {
            for (key, value) in map {
                tera_context.insert(key, value);
            }
        }
        other => tera_context.insert("data", other),
    }

    tera.render("template", &tera_context)
        .map_err(|e| Error::Parameter(format!("failed to render template: {}", e)))
}

/// Render a template with `input` bound to `Input`.
pub fn render_input(template: &str, input: &Value) -> Result<String> {
    let mut context = serde_json::Map::new();
    context.insert(INPUT.to_string(), input.clone());
    render_template(template, &Value::Object(context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convert_go_to_tera() {
        let tests = vec![
            ("{{ .Input.name }}", "{{ Input.name }}"),
            ("{{.Input.id}}", "{{Input.id}}"),
            (
                "{{ .Input.name | default \"unknown\" }}",
                "{{ Input.name | default(value=\"unknown\") }}",
            ),
            (
                "{{ .Input.count | default 0 }}",
                "{{ Input.count | default(value=\"0\") }}",
            ),
            (
                "{{.Input.tier|default 'free'}}",
                "{{Input.tier| default(value=\"free\")}}",
            ),
        ];

        for (input, expected) in tests {
            assert_eq!(convert_go_to_tera(input), expected);
        }
    }

    #[test]
    fn test_render_input() {
        let data = json!({"body": {"name": "fn-a", "region": "eu"}});
        let out = render_input("{{ .Input.body.name }}-{{ .Input.body.region }}", &data).unwrap();
        assert_eq!(out, "fn-a-eu");

        let out = render_input("{{ Input.body.tier | default(value=\"free\") }}", &data).unwrap();
        assert_eq!(out, "free");
    }

    #[test]
    fn test_render_error_is_parameter_error() {
        let err = render_input("{{ Input.missing.deeper }}", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Parameter(_)));
    }
}
