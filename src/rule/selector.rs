//! Selector lists with ordered fallbacks.
//!
//! A rule field such as `"#info h1, .book-title@text"` is split on top-level
//! commas into alternatives. Each alternative is a CSS selector with an
//! optional `@target` suffix choosing what to read from the matched element:
//!
//! | Suffix       | Value                                   |
//! |--------------|-----------------------------------------|
//! | *(none)*     | collapsed text of the element           |
//! | `@text`      | same as no suffix                       |
//! | `@own`       | text nodes directly under the element   |
//! | `@html`      | inner HTML                              |
//! | `@<name>`    | attribute `<name>` (`@href`, `@src`...) |
//!
//! Selectors are parsed once when the rule is loaded.

use scraper::{ElementRef, Selector};

/// What to read from a matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Text,
    OwnText,
    Html,
    Attr(String),
}

/// One parsed alternative of a selector list.
#[derive(Debug, Clone)]
pub struct FieldSelector {
    raw: String,
    selector: Selector,
    target: Target,
}

impl FieldSelector {
    /// Parses a single alternative such as `a@href`.
    ///
    /// # Errors
    ///
    /// Returns the parser's message when the CSS part is invalid.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (css, target) = match split_target(raw) {
            Some((css, suffix)) => (css.trim(), parse_target(suffix)),
            None => (raw, Target::Text),
        };
        if css.is_empty() {
            return Err("empty selector".to_string());
        }
        let selector = Selector::parse(css).map_err(|e| e.to_string())?;
        Ok(Self {
            raw: raw.to_string(),
            selector,
            target,
        })
    }

    /// The alternative as written in the rule.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Reads this alternative's target from an element that already matched.
    #[must_use]
    pub fn read(&self, element: ElementRef<'_>) -> Option<String> {
        read_target(element, &self.target)
    }
}

/// Ordered alternatives for one rule field.
#[derive(Debug, Clone)]
pub struct SelectorList {
    alternatives: Vec<FieldSelector>,
}

impl SelectorList {
    /// Parses a comma-separated list of alternatives.
    ///
    /// # Errors
    ///
    /// Returns the offending alternative and the parser's message.
    pub fn parse(raw: &str) -> Result<Self, (String, String)> {
        Self::from_parts(split_top_level(raw))
    }

    /// Builds a list from several raw strings, each of which may itself be a
    /// comma-separated list.
    ///
    /// # Errors
    ///
    /// Returns the offending alternative and the parser's message.
    pub fn from_parts<I, S>(parts: I) -> Result<Self, (String, String)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut alternatives = Vec::new();
        for part in parts {
            for piece in split_top_level(part.as_ref()) {
                let parsed = FieldSelector::parse(&piece).map_err(|reason| (piece.clone(), reason))?;
                alternatives.push(parsed);
            }
        }
        if alternatives.is_empty() {
            return Err((String::new(), "no selector alternatives".to_string()));
        }
        Ok(Self { alternatives })
    }

    #[must_use]
    pub fn alternatives(&self) -> &[FieldSelector] {
        &self.alternatives
    }

    /// Returns the elements matched by the first alternative that matches
    /// anything under `scope`.
    #[must_use]
    pub fn select_all<'a>(&self, scope: ElementRef<'a>) -> Vec<ElementRef<'a>> {
        for alternative in &self.alternatives {
            let found: Vec<ElementRef<'a>> = scope.select(&alternative.selector).collect();
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    /// Returns the first element matched by any alternative, together with the
    /// alternative that matched.
    #[must_use]
    pub fn select_first<'a>(&self, scope: ElementRef<'a>) -> Option<(ElementRef<'a>, &FieldSelector)> {
        self.alternatives.iter().find_map(|alternative| {
            scope
                .select(&alternative.selector)
                .next()
                .map(|element| (element, alternative))
        })
    }

    /// Returns the first non-empty value any alternative yields under `scope`.
    #[must_use]
    pub fn first_value(&self, scope: ElementRef<'_>) -> Option<String> {
        self.alternatives.iter().find_map(|alternative| {
            scope
                .select(&alternative.selector)
                .filter_map(|element| alternative.read(element))
                .next()
        })
    }
}

/// Reads a target from an element, returning `None` for empty values.
#[must_use]
pub fn read_target(element: ElementRef<'_>, target: &Target) -> Option<String> {
    let value = match target {
        Target::Text => collapse_whitespace(&element.text().collect::<String>()),
        Target::OwnText => collapse_whitespace(
            &element
                .children()
                .filter_map(|child| child.value().as_text().map(|text| &**text))
                .collect::<String>(),
        ),
        Target::Html => element.inner_html().trim().to_string(),
        Target::Attr(name) => element.value().attr(name)?.trim().to_string(),
    };
    if value.is_empty() { None } else { Some(value) }
}

/// Collapses runs of whitespace (including full-width spaces) into single
/// spaces and trims the ends.
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{3000}' || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_target(suffix: &str) -> Target {
    match suffix.trim() {
        "" | "text" => Target::Text,
        "own" | "ownText" => Target::OwnText,
        "html" => Target::Html,
        name => Target::Attr(name.to_string()),
    }
}

/// Finds the last `@` outside brackets and quotes.
fn split_target(raw: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut split_at = None;
    for (index, ch) in raw.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth -= 1,
            (None, '@') if depth == 0 => split_at = Some(index),
            _ => {}
        }
    }
    split_at.map(|index| (&raw[..index], &raw[index + 1..]))
}

/// Splits on commas that are not nested inside brackets, parentheses or
/// quotes.
fn split_top_level(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for ch in raw.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                let piece = current.trim();
                if !piece.is_empty() {
                    parts.push(piece.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    let piece = current.trim();
    if !piece.is_empty() {
        parts.push(piece.to_string());
    }
    parts
}
