//! Download-URL templates.
//!
//! A template may contain `{FULL_PATH}`, `{PATH}`, `{FILENAME}` and
//! `{SCHEME}`, replaced in a single pass over the template (text coming from
//! the key is never scanned again):
//!
//! | placeholder   | `sub/dir/file.txt` |
//! |---------------|--------------------|
//! | `{FULL_PATH}` | `sub/dir/file.txt` |
//! | `{PATH}`      | `sub/dir`          |
//! | `{FILENAME}`  | `file.txt`         |
//! | `{SCHEME}`    | `http` or `https`  |

use bnrepo_common::key::{basename, dirname};

/// Substitute the placeholders of `template` for `key`. `secure` forces the
/// scheme; otherwise it is inferred from the CGI-style environment.
pub fn expand(template: &str, key: &str, secure: Option<bool>) -> String {
    let scheme = match secure {
        Some(true) => "https",
        Some(false) => "http",
        None => active_scheme(),
    };
    let values = [
        ("{FULL_PATH}", key.trim_start_matches('/')),
        ("{PATH}", dirname(key)),
        ("{FILENAME}", basename(key)),
        ("{SCHEME}", scheme),
    ];

    let mut expanded = String::with_capacity(template.len() + key.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        expanded.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(name, _)| tail.starts_with(name)) {
            Some((name, value)) => {
                expanded.push_str(value);
                rest = &tail[name.len()..];
            }
            None => {
                expanded.push('{');
                rest = &tail[1..];
            }
        }
    }
    expanded.push_str(rest);
    expanded
}

/// Scheme of the request being served, from `HTTPS`, `SCRIPT_URI`,
/// `SERVER_PORT` or `SERVER_PROTOCOL` (first one set wins).
pub fn active_scheme() -> &'static str {
    scheme_from(|name| std::env::var(name).ok())
}

fn scheme_from<F>(lookup: F) -> &'static str
where
    F: Fn(&str) -> Option<String>,
{
    let is_https = if let Some(https) = lookup("HTTPS") {
        !https.is_empty() && https != "off"
    } else if let Some(uri) = lookup("SCRIPT_URI") {
        uri.starts_with("https://")
    } else if let Some(port) = lookup("SERVER_PORT") {
        port.trim() == "443"
    } else if let Some(protocol) = lookup("SERVER_PROTOCOL") {
        protocol.starts_with("HTTPS")
    } else {
        false
    };
    if is_https {
        "https"
    } else {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_expand_placeholders() {
        assert_eq!(
            expand("http://x/{PATH}/{FILENAME}", "sub/file.txt", None),
            "http://x/sub/file.txt"
        );
        assert_eq!(
            expand("{SCHEME}://cdn/{FULL_PATH}", "/a/b/c.png", Some(true)),
            "https://cdn/a/b/c.png"
        );
        assert_eq!(
            expand("{SCHEME}://cdn/{FILENAME}?dir={PATH}", "c.png", Some(false)),
            "http://cdn/c.png?dir="
        );
    }

    #[test]
    fn test_placeholder_text_in_key_is_kept() {
        assert_eq!(
            expand("https://cdn/{FULL_PATH}?name={FILENAME}", "docs/{PATH}.txt", None),
            "https://cdn/docs/{PATH}.txt?name={PATH}.txt"
        );
        assert_eq!(expand("{x}/{FILENAME}{", "a{b}", Some(true)), "{x}/a{b}{");
    }

    #[test]
    fn test_template_without_placeholders_is_verbatim() {
        assert_eq!(expand("https://example.com/download", "a.txt", None), "https://example.com/download");
    }

    #[test]
    fn test_scheme_inference() {
        assert_eq!(scheme_from(env(&[])), "http");
        assert_eq!(scheme_from(env(&[("HTTPS", "on")])), "https");
        assert_eq!(scheme_from(env(&[("HTTPS", "off"), ("SERVER_PORT", "443")])), "http");
        assert_eq!(scheme_from(env(&[("HTTPS", "")])), "http");
        assert_eq!(scheme_from(env(&[("SCRIPT_URI", "https://example.com/dl")])), "https");
        assert_eq!(scheme_from(env(&[("SERVER_PORT", "443")])), "https");
        assert_eq!(scheme_from(env(&[("SERVER_PORT", "8080")])), "http");
        assert_eq!(scheme_from(env(&[("SERVER_PROTOCOL", "HTTPS/1.1")])), "https");
    }
}
