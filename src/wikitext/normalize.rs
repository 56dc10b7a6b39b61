//! Text normalization: strip wiki markup, boilerplate and short quoted
//! spans from revision text to produce comparison-ready plain text.
//!
//! The step order matters. Emphasis markup collapses first so quote
//! detection sees plain quote characters; categories and short quotes go
//! before link/tag handling; whitespace normalization runs last over
//! whatever survived. Quoted or referenced spans of fifty words or more
//! are kept on purpose: long quotes are themselves confirmable content.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Words below which a quoted span or a `<ref>`/`<blockquote>` body is
/// considered boilerplate and removed.
const SHORT_SPAN_WORDS: usize = 50;

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'''(.+?)'''").expect("valid regex"));
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"''(.+?)''").expect("valid regex"));
static QUOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["“«].+?["”»]"#).expect("valid regex"));
static COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static BRACKETED_EXTERNAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(?:https?|ftp)://[^ \[\]]*(?: +([^\[\]]*))?\]").expect("valid regex")
});
static BARE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:https?|ftp)://[^\s\[\]<>"]+"#).expect("valid regex"));
static SELF_CLOSING_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(?:ref|references|blockquote)\b[^<>]*/\s*>").expect("valid regex")
});
static REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<ref\b[^<>]*>(.*?)</ref\s*>").expect("valid regex"));
static REFERENCES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<references\b[^<>]*>(.*?)</references\s*>").expect("valid regex")
});
static BLOCKQUOTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<blockquote\b[^<>]*>(.*?)</blockquote\s*>").expect("valid regex")
});
static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("valid regex"));
static PIPED_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[[^\[\]|]*\|([^\[\]]*)\]\]").expect("valid regex"));
static PLAIN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]|]*)\]\]").expect("valid regex"));
static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*={1,6}\s*(.*?)\s*={1,6}\s*$").expect("valid regex"));
static HTML_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)</?[a-zA-Z][^<>]*>").expect("valid regex"));
static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid regex"));
static BLANK_LINES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?: ?\n){3,}").expect("valid regex"));

/// Site-dependent markup configuration: which namespace names introduce
/// category and file links, and which file extensions count.
#[derive(Debug, Clone)]
pub struct SiteMarkup {
    category_re: Regex,
    file_re: Regex,
}

impl SiteMarkup {
    pub fn new(
        category_namespaces: &[String],
        file_namespaces: &[String],
        file_extensions: &[String],
    ) -> Result<Self> {
        if category_namespaces.is_empty() || file_namespaces.is_empty() || file_extensions.is_empty()
        {
            return Err(Error::Config(
                "site markup needs category namespaces, file namespaces and file extensions"
                    .to_string(),
            ));
        }
        let categories = join_escaped(category_namespaces);
        let files = join_escaped(file_namespaces);
        let extensions = join_escaped(file_extensions);
        let category_re =
            Regex::new(&format!(r"(?i)\[\[\s*:?\s*(?:{categories})\s*:[^\]]+?\]\]\s*"))
                .map_err(|e| Error::Config(format!("category pattern: {e}")))?;
        let file_re = Regex::new(&format!(r"(?i)(?:{files})\s*:.+?\.(?:{extensions})"))
            .map_err(|e| Error::Config(format!("file pattern: {e}")))?;
        Ok(Self {
            category_re,
            file_re,
        })
    }
}

fn join_escaped(names: &[String]) -> String {
    names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|")
}

/// Normalize raw revision text. Empty input yields empty output.
pub fn normalize(text: &str, markup: &SiteMarkup) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    // emphasis markup collapses to its inner text
    let mut text = BOLD_RE.replace_all(trimmed, "$1").into_owned();
    text = ITALIC_RE.replace_all(&text, "$1").into_owned();

    text = markup.category_re.replace_all(&text, "").into_owned();

    text = remove_short_quotes(&text);

    // external links keep their visible title, bare URLs vanish
    text = BRACKETED_EXTERNAL_RE
        .replace_all(&text, |caps: &regex::Captures| {
            caps.get(1).map(|t| t.as_str().trim()).unwrap_or("").to_string()
        })
        .into_owned();
    text = BARE_URL_RE.replace_all(&text, "").into_owned();

    text = SELF_CLOSING_TAG_RE.replace_all(&text, "").into_owned();
    for tag_re in [&*REF_RE, &*REFERENCES_RE, &*BLOCKQUOTE_RE] {
        text = remove_short_tag_elements(&text, tag_re);
    }

    text = strip_markup(&text);

    text = markup.file_re.replace_all(&text, "").into_owned();

    // whitespace: single spaces, trimmed lines, at most one blank line
    text = MULTI_SPACE_RE.replace_all(&text, " ").into_owned();
    text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    text = BLANK_LINES_RE.replace_all(&text, "\n\n").into_owned();

    text.trim().to_string()
}

/// Remove quoted spans shorter than [`SHORT_SPAN_WORDS`]. Longer quotes
/// stay in the text.
fn remove_short_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in QUOTE_RE.find_iter(text) {
        if m.as_str().split_whitespace().count() < SHORT_SPAN_WORDS {
            out.push_str(&text[last..m.start()]);
            last = m.end();
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Remove whole tag elements whose stripped body is under the word
/// floor. The body word count intentionally counts single-space-separated
/// segments, empty body included.
fn remove_short_tag_elements(text: &str, tag_re: &Regex) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in tag_re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let inner = caps.get(1).map(|g| g.as_str()).unwrap_or("");
        let stripped = strip_markup(inner);
        if stripped.trim().split(' ').count() < SHORT_SPAN_WORDS {
            out.push_str(&text[last..whole.start()]);
            last = whole.end();
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Strip remaining markup while preserving human-visible text: wikilink
/// labels, template parameter values, heading titles. HTML tag markers
/// disappear, their contents stay.
fn strip_markup(text: &str) -> String {
    let mut text = COMMENT_RE.replace_all(text, "").into_owned();
    text = reduce_templates(text);
    text = PIPED_LINK_RE.replace_all(&text, "$1").into_owned();
    text = PLAIN_LINK_RE.replace_all(&text, "$1").into_owned();
    text = HEADING_RE.replace_all(&text, "$1").into_owned();
    text = BOLD_RE.replace_all(&text, "$1").into_owned();
    text = ITALIC_RE.replace_all(&text, "$1").into_owned();
    HTML_TAG_RE.replace_all(&text, "").into_owned()
}

/// Reduce templates innermost-first to the text of their parameter
/// values, so nested constructs unwind one layer per pass.
fn reduce_templates(text: String) -> String {
    let mut current = text;
    loop {
        let next = TEMPLATE_RE
            .replace_all(&current, |caps: &regex::Captures| {
                template_params_text(&caps[1])
            })
            .into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

fn template_params_text(inner: &str) -> String {
    inner
        .split('|')
        .skip(1) // the template name itself carries no article text
        .map(|param| match param.split_once('=') {
            Some((_, value)) => value.trim(),
            None => param.trim(),
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markup() -> SiteMarkup {
        SiteMarkup::new(
            &["Category".to_string()],
            &["File".to_string(), "Image".to_string()],
            &["png".to_string(), "jpg".to_string(), "svg".to_string()],
        )
        .unwrap()
    }

    fn words(n: usize) -> String {
        std::iter::repeat("word")
            .take(n)
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(normalize("", &markup()), "");
        assert_eq!(normalize("   \n\t  ", &markup()), "");
    }

    #[test]
    fn emphasis_collapses_to_plain_text() {
        assert_eq!(
            normalize("'''bold''' and ''italic'' text", &markup()),
            "bold and italic text"
        );
    }

    #[test]
    fn categories_are_removed() {
        assert_eq!(
            normalize("Some text.\n[[Category:Things]]\n[[ :category: Other ]]", &markup()),
            "Some text."
        );
    }

    #[test]
    fn short_quotes_go_long_quotes_stay() {
        let short = format!("before \"{}\" after", words(10));
        assert_eq!(normalize(&short, &markup()), "before after");

        let long_quote = words(60);
        let long = format!("before \"{long_quote}\" after");
        let result = normalize(&long, &markup());
        assert!(result.contains(&long_quote));
    }

    #[test]
    fn external_links_keep_their_title() {
        assert_eq!(
            normalize("see [https://example.com/a the article] here", &markup()),
            "see the article here"
        );
        assert_eq!(normalize("see [https://example.com/a] here", &markup()), "see here");
        assert_eq!(normalize("see https://example.com/a here", &markup()), "see here");
    }

    #[test]
    fn short_references_are_removed() {
        let text = format!("Fact.<ref>cite web</ref> More.<ref name=\"a\"/> End. {}", words(5));
        let result = normalize(&text, &markup());
        assert!(!result.contains("cite web"));
        assert!(result.starts_with("Fact. More. End."));

        let long_ref = format!("Fact.<ref>{}</ref>", words(60));
        let result = normalize(&long_ref, &markup());
        assert!(result.contains("word word"));
    }

    #[test]
    fn wikilinks_and_templates_keep_visible_text() {
        assert_eq!(
            normalize("[[Target|label]] and [[Plain link]]", &markup()),
            "label and Plain link"
        );
        assert_eq!(
            normalize("{{infobox|name=Alice|Bob}} rest", &markup()),
            "Alice Bob rest"
        );
    }

    #[test]
    fn file_links_are_removed() {
        let result = normalize("text [[File:Picture of a cat.png|thumb|a cat]] more", &markup());
        assert!(!result.contains("Picture of a cat"));
        assert!(result.contains("a cat"));
    }

    #[test]
    fn whitespace_is_normalized() {
        assert_eq!(
            normalize("a  b   c\nd   \n\n\n\n\ne", &markup()),
            "a b c\nd\n\ne"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let inputs = [
            format!(
                "'''Bold''' start [[Category:Test]] with \"{}\" quote\nand [[a|b]] link.",
                words(8)
            ),
            format!("plain text \"{}\" long quote", words(55)),
            "== Heading ==\nBody text here.\n\n\n\nMore.".to_string(),
        ];
        for input in inputs {
            let once = normalize(&input, &markup());
            let twice = normalize(&once, &markup());
            assert_eq!(once, twice, "normalize not idempotent for {input:?}");
        }
    }
}
