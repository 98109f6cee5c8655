//! Selector construction and small in-page scripts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use headless_chrome::{Element, Tab};

use crate::types::SelectorEngine;

/// Any plain text-like input.
pub const GENERIC_INPUT_SELECTOR: &str =
    r#"input[type="text"], input:not([type]), textarea, [contenteditable="true"]"#;

/// The usual shapes of a site search box.
pub const SEARCH_INPUT_SELECTOR: &str = r#"input[type="search"], input[name="q"], input[name*="search" i], input[placeholder*="search" i], input[aria-label*="search" i]"#;

/// Empties an input before new text is typed into it.
const CLEAR_VALUE_JS: &str = r#"function() {
  this.focus();
  if ('value' in this) { this.value = ''; } else { this.textContent = ''; }
  this.dispatchEvent(new Event('input', { bubbles: true }));
}"#;

const IS_VISIBLE_JS: &str = r#"function() {
  const r = this.getBoundingClientRect();
  const s = getComputedStyle(this);
  return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none' && s.opacity !== '0';
}"#;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Quote `input` as an XPath 1.0 string literal.
pub fn xpath_literal(input: &str) -> String {
    if !input.contains('"') {
        return format!("\"{input}\"");
    }
    if !input.contains('\'') {
        return format!("'{input}'");
    }

    let segments: Vec<&str> = input.split('"').collect();
    let mut parts = Vec::new();
    for (index, part) in segments.iter().enumerate() {
        if !part.is_empty() {
            parts.push(format!("\"{part}\""));
        }
        if index + 1 < segments.len() {
            parts.push("'\"'".to_string());
        }
    }
    format!("concat({})", parts.join(","))
}

/// Clickable things (links, buttons, submit inputs) whose text contains `text`.
pub fn clickable_text_xpath(text: &str) -> String {
    let literal = xpath_literal(text.trim());
    format!(
        "//*[self::a or self::button or @role='button' or @role='link' or @role='tab' or @role='menuitem'][contains(normalize-space(.), {literal})] \
         | //input[@type='submit' or @type='button'][contains(@value, {literal})]"
    )
}

/// Elements that directly own a text node containing `text`.
pub fn text_xpath(text: &str) -> String {
    format!(
        "//*[text()[contains(normalize-space(.), {})]]",
        xpath_literal(text.trim())
    )
}

/// A form field identified by its name, placeholder or label text.
pub fn field_selector(name: &str) -> String {
    let n = css_attr_escape(name.trim());
    format!(
        r#"input[name="{n}"], textarea[name="{n}"], input[id="{n}"], input[placeholder*="{n}" i], textarea[placeholder*="{n}" i], [aria-label*="{n}" i]"#
    )
}

fn css_attr_escape(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', " ")
}

/// Wait for the first element matching `selector` in the given dialect.
pub fn find_element<'a>(
    tab: &'a Arc<Tab>,
    selector: &str,
    engine: SelectorEngine,
    timeout: Duration,
) -> Result<Element<'a>> {
    match engine {
        SelectorEngine::Css => tab.wait_for_element_with_custom_timeout(selector, timeout),
        SelectorEngine::Xpath => tab.wait_for_xpath_with_custom_timeout(selector, timeout),
    }
}

/// Replace the value of an input element with `text`.
pub fn replace_value(element: &Element<'_>, text: &str) -> Result<()> {
    element.call_js_fn(CLEAR_VALUE_JS, vec![], false)?;
    element.type_into(text)?;
    Ok(())
}

/// Poll until `element` is rendered and visible, or `deadline` passes.
pub fn wait_visible(element: &Element<'_>, deadline: Instant) -> Result<bool> {
    loop {
        let visible = element
            .call_js_fn(IS_VISIBLE_JS, vec![], false)?
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if visible {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Poll `document.readyState` until the page is at least interactive.
pub fn wait_interactive(tab: &Arc<Tab>, deadline: Instant) -> Result<bool> {
    loop {
        let state = tab
            .evaluate("document.readyState", false)?
            .value
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        if state == "interactive" || state == "complete" {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xpath_literal_quotes() {
        assert_eq!(xpath_literal("Search"), "\"Search\"");
        assert_eq!(xpath_literal(r#"say "hi""#), r#"'say "hi"'"#);
        assert_eq!(
            xpath_literal(r#"it's "x""#),
            r#"concat("it's ",'"',"x",'"')"#
        );
    }

    #[test]
    fn clickable_xpath_mentions_text_twice() {
        let xpath = clickable_text_xpath("  Sign in ");
        assert_eq!(xpath.matches("\"Sign in\"").count(), 2);
        assert!(xpath.starts_with("//*[self::a"));
    }

    #[test]
    fn field_selector_escapes_quotes() {
        let sel = field_selector(r#"zip "code""#);
        assert!(sel.contains(r#"input[name="zip \"code\""]"#));
    }
}
