//! Minimal `{name}` placeholder substitution against a JSON context object.
//!
//! The original command templates are interpolated with Python's
//! `str.format(**context)`, which is a flat, non-recursive substitution, not
//! a general templating language. A small hand-written scanner reproduces
//! that exactly without pulling in a templating crate for one operation.

use sdcloud_core::{Error, Result};

/// Replace every `{name}` placeholder in `template` with the stringified
/// value of `context[name]`. Braces with no matching context key are an
/// error; `{{`/`}}` are not treated specially since the original command
/// templates never need literal braces.
pub fn interpolate(template: &str, context: &serde_json::Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        let mut closed = false;
        for (_, c2) in chars.by_ref() {
            if c2 == '}' {
                closed = true;
                break;
            }
            name.push(c2);
        }
        if !closed {
            return Err(Error::InvalidInput(format!(
                "unterminated placeholder in template: {template}"
            )));
        }
        let value = context.get(&name).ok_or_else(|| {
            Error::InvalidInput(format!("template references unknown context key: {name}"))
        })?;
        out.push_str(&stringify(value));
    }

    Ok(out)
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_keys() {
        let ctx = json!({"prior_renders_path": "01_priors", "random_subset_size": 12});
        let out = interpolate(
            "--input {prior_renders_path} --subset {random_subset_size}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, "--input 01_priors --subset 12");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let ctx = json!({});
        assert!(interpolate("{missing}", &ctx).is_err());
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        let ctx = json!({});
        assert!(interpolate("--flag {oops", &ctx).is_err());
    }
}
