//! Instruction parsing: free-form text in, ordered automation steps out.
//!
//! The heuristic parser walks a fixed list of intent categories (navigate,
//! click, type, wait, screenshot) and keeps the first match of each, in that
//! order. It is pure and total: the same text always yields the same steps and
//! the result is never empty.

use std::sync::LazyLock;

use regex::Regex;

use crate::address;
use crate::dom;
use crate::types::{Action, SelectorEngine, Step};

/// Strategy seam: anything that turns text into a non-empty step list.
pub trait InstructionParser: Send + Sync {
    fn parse(&self, text: &str) -> Vec<Step>;
}

/// Regex-driven parser for short imperative instructions.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicParser;

impl InstructionParser for HeuristicParser {
    fn parse(&self, text: &str) -> Vec<Step> {
        parse(text)
    }
}

/// Listing sites recognised by name when nothing else matched.
const KNOWN_SITES: [(&str, &str); 7] = [
    ("zillow", "https://www.zillow.com/"),
    ("redfin", "https://www.redfin.com/"),
    ("realtor", "https://www.realtor.com/"),
    ("trulia", "https://www.trulia.com/"),
    ("apartments.com", "https://www.apartments.com/"),
    ("craigslist", "https://www.craigslist.org/"),
    ("hotpads", "https://hotpads.com/"),
];

const EXAMPLE_PHRASINGS: [&str; 2] = [
    "go to zillow.com and take a screenshot",
    "open redfin.com, search for \"Austin TX\" and wait 3 seconds",
];

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|“[^”]*”|'[^']*'"#).unwrap());

static NAVIGATE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:go\s+to|navigate\s+to|browse\s+to|open|visit)\b").unwrap()
});

/// A phrase in straight double, curly double or single quotes. Each form
/// closes only on its own quote character.
const QUOTED_PHRASE: &str = r#"(?:"([^"]+)"|“([^”]+)”|'([^']+)')"#;

static CLICK_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bclick\s+(?:on\s+)?(?:the\s+)?{QUOTED_PHRASE}"
    ))
    .unwrap()
});

static CLICK_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bclick\s+(?:on\s+)?the\s+([\w][\w\s\-&]*?)\s+(?:button|link|tab)\b").unwrap()
});

static LEADING_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s*{QUOTED_PHRASE}")).unwrap());

// Field in groups 1-3, value in groups 4-6.
static FILL_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bfill\s+(?:in\s+|out\s+)?(?:the\s+)?{QUOTED_PHRASE}\s+(?:field\s+|box\s+|input\s+)?with\s+{QUOTED_PHRASE}"
    ))
    .unwrap()
});

// Text in groups 1-3, optional field in groups 4-6.
static TYPE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:type|enter|input|fill\s+in)\s+{QUOTED_PHRASE}(?:\s+(?:in|into)\s+(?:the\s+)?{QUOTED_PHRASE})?"
    ))
    .unwrap()
});

// Quoted query in groups 1-3, bare query in group 4.
static SEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bsearch\s+(?:for\s+)?(?:{QUOTED_PHRASE}|([^,;.!?]+?))(?:\s+(?:and|then)\b|[,;.!?]|$)"
    ))
    .unwrap()
});

static WAIT_FOR_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bwait\s+(?:for|until)\s+(?:the\s+)?{QUOTED_PHRASE}"
    ))
    .unwrap()
});

static WAIT_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwait\s+(?:for\s+)?(\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s)\b").unwrap()
});

static SCREENSHOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:screenshot|screen\s+shot|screen-shot|capture|snapshot)s?\b").unwrap()
});

/// Parse `text` into steps with the default heuristics.
pub fn parse(text: &str) -> Vec<Step> {
    let mut actions = Vec::new();

    if let Some(candidate) = navigation_target(text) {
        match address::normalize(&candidate) {
            Ok(url) => actions.push(Action::Navigate { url }),
            Err(e) => {
                let message = format!("cannot navigate to '{candidate}': {e}");
                return vec![Step::new(0, Action::DiagnosticError { message })];
            }
        }
    }

    actions.extend(click_intent(text));
    actions.extend(type_intent(text));
    actions.extend(wait_intent(text));

    if SCREENSHOT.is_match(text) {
        actions.push(Action::Screenshot);
    }

    if actions.is_empty() {
        if let Some(url) = known_site(text) {
            actions.push(Action::Navigate {
                url: url.to_string(),
            });
        }
    }

    if actions.is_empty() {
        let message = format!(
            "No actionable step could be derived from the instruction. Try e.g. \"{}\" or \"{}\".",
            EXAMPLE_PHRASINGS[0], EXAMPLE_PHRASINGS[1]
        );
        actions.push(Action::DiagnosticInfo { message });
    }

    actions
        .into_iter()
        .enumerate()
        .map(|(i, action)| Step::new(i, action))
        .collect()
}

/// The address after the first navigation verb that is neither inside a
/// quoted phrase nor part of a button name (`click the Open House button`).
/// A quoted phrase right after the verb is taken whole.
fn navigation_target(text: &str) -> Option<String> {
    let unquoted = QUOTED.replace_all(text, |caps: &regex::Captures<'_>| {
        " ".repeat(caps[0].len())
    });
    let button_names: Vec<std::ops::Range<usize>> = CLICK_BARE
        .captures_iter(&unquoted)
        .filter_map(|c| c.get(1).map(|m| m.range()))
        .collect();

    let verb = NAVIGATE_VERB
        .find_iter(&unquoted)
        .filter(|m| text[m.end()..].starts_with(char::is_whitespace))
        .find(|m| !button_names.iter().any(|r| r.contains(&m.start())))?;

    let rest = &text[verb.end()..];
    if let Some(c) = LEADING_QUOTE.captures(rest) {
        return quoted_group(&c, 1)
            .map(|phrase| phrase.trim().to_string())
            .filter(|phrase| !phrase.is_empty());
    }

    let token = rest
        .split_whitespace()
        .next()?
        .trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn click_intent(text: &str) -> Option<Action> {
    let phrase = CLICK_QUOTED
        .captures(text)
        .and_then(|c| first_group(&c, &[1, 2, 3]))
        .or_else(|| {
            CLICK_BARE
                .captures(text)
                .and_then(|c| first_group(&c, &[1]))
        })?;
    Some(Action::Click {
        selector: dom::clickable_text_xpath(&phrase),
        engine: SelectorEngine::Xpath,
    })
}

fn type_intent(text: &str) -> Option<Action> {
    if let Some(c) = FILL_WITH.captures(text) {
        let field = quoted_group(&c, 1)?;
        return Some(Action::Type {
            selector: dom::field_selector(&field),
            engine: SelectorEngine::Css,
            text: quoted_group(&c, 4)?,
        });
    }

    if let Some(c) = TYPE_TEXT.captures(text) {
        let selector = match quoted_group(&c, 4) {
            Some(field) => dom::field_selector(&field),
            None => dom::GENERIC_INPUT_SELECTOR.to_string(),
        };
        return Some(Action::Type {
            selector,
            engine: SelectorEngine::Css,
            text: quoted_group(&c, 1)?,
        });
    }

    let c = SEARCH.captures(text)?;
    let query = first_group(&c, &[1, 2, 3, 4])?;
    Some(Action::Type {
        selector: dom::SEARCH_INPUT_SELECTOR.to_string(),
        engine: SelectorEngine::Css,
        text: query,
    })
}

fn wait_intent(text: &str) -> Option<Action> {
    if let Some(phrase) = WAIT_FOR_ELEMENT
        .captures(text)
        .and_then(|c| quoted_group(&c, 1))
    {
        return Some(Action::WaitForElement {
            selector: dom::text_xpath(&phrase),
            engine: SelectorEngine::Xpath,
        });
    }

    let c = WAIT_DURATION.captures(text)?;
    let amount: f64 = c[1].parse().ok()?;
    let unit = c[2].to_ascii_lowercase();
    let ms = if unit == "ms" || unit.starts_with("milli") {
        amount
    } else {
        amount * 1000.0
    };
    Some(Action::Wait {
        ms: ms.round() as u64,
    })
}

fn known_site(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    KNOWN_SITES
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, url)| *url)
}

/// The contents of whichever of the three quote forms starting at `first`
/// matched, untrimmed.
fn quoted_group(caps: &regex::Captures<'_>, first: usize) -> Option<String> {
    (first..first + 3)
        .find_map(|g| caps.get(g))
        .map(|m| m.as_str().to_string())
}

fn first_group(caps: &regex::Captures<'_>, groups: &[usize]) -> Option<String> {
    groups
        .iter()
        .filter_map(|&g| caps.get(g))
        .map(|m| m.as_str().trim().to_string())
        .find(|s| !s.is_empty())
}
