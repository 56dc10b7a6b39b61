//! Added-text extraction: decide whether a revision introduced enough
//! new content to be worth a similarity check, and extract it.

use std::ops::Range;

use imara_diff::{
    intern::{Interner, Token},
    Algorithm,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::services::wiki_client::WikiClient;
use crate::types::Site;

use super::normalize::{normalize, SiteMarkup};

/// Inserted spans at or below this many characters are ignored.
const MIN_INSERT_CHARS: u32 = 50;

/// Revisions (and extracted additions) below this many characters are
/// too small to be worth comparing.
const MIN_TEXT_CHARS: usize = 500;

static COMMENT_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[([^\[\]|#]+)(?:#[^\[\]|]*)?(?:\|[^\[\]]*)?\]\]").expect("valid regex")
});

/// Extract the text `new` added relative to `old`.
///
/// Both sides are normalized, then diffed character-wise with the
/// histogram algorithm over interned tokens. Only pure insertions longer
/// than [`MIN_INSERT_CHARS`] survive, and of those, lines whose trimmed
/// form already occurs in the normalized old text are dropped, so a
/// reordering edit does not look like new content.
pub fn added_text(old: &str, new: &str, markup: &SiteMarkup) -> String {
    let old = normalize(old, markup);
    let new = normalize(new, markup);

    let new_chars: Vec<char> = new.chars().collect();
    let mut interner = Interner::new(old.len() + new_chars.len());
    let old_tokens: Vec<Token> = old.chars().map(|c| interner.intern(c)).collect();
    let new_tokens: Vec<Token> = new_chars.iter().map(|&c| interner.intern(c)).collect();

    let mut inserted_spans: Vec<String> = Vec::new();
    imara_diff::diff_with_tokens(
        Algorithm::Histogram,
        &old_tokens,
        &new_tokens,
        interner.num_tokens(),
        |before: Range<u32>, after: Range<u32>| {
            // a hunk with nothing removed is a pure insertion
            if before.start == before.end && after.end - after.start > MIN_INSERT_CHARS {
                let span: String = new_chars[after.start as usize..after.end as usize]
                    .iter()
                    .collect();
                inserted_spans.push(span);
            }
        },
    );

    let mut lines: Vec<&str> = Vec::new();
    for span in &inserted_spans {
        for line in span.trim_matches(' ').lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || !old.contains(trimmed) {
                lines.push(line);
            }
        }
    }
    lines.join("\n").trim().to_string()
}

/// Self-reverting edits are not candidates.
pub fn is_self_revert(tags: &[String]) -> bool {
    tags.iter().any(|t| t == "mw-rollback")
        || (tags.iter().any(|t| t == "mw-undo") && tags.iter().any(|t| t == "twinkle"))
}

fn too_small(text: &str) -> bool {
    text.chars().count() < MIN_TEXT_CHARS
}

/// Top-level decision function: either the candidate added text, or
/// `None` when the revision is not applicable (deleted or hidden
/// content, self-revert, or not enough new text).
pub async fn check_diff(
    wiki: &WikiClient,
    markup: &SiteMarkup,
    site: &Site,
    old_rev_id: i64,
    new_rev_id: i64,
) -> Result<Option<String>> {
    let mut revids = Vec::with_capacity(2);
    if old_rev_id > 0 {
        revids.push(old_rev_id);
    }
    revids.push(new_rev_id);

    let Some(revisions) = wiki.load_revisions(site, &revids, true).await? else {
        debug!(rev_id = new_rev_id, "page or revision was deleted");
        return Ok(None);
    };
    let Some(new_rev) = revisions.get(&new_rev_id) else {
        return Ok(None);
    };

    if is_self_revert(&new_rev.tags) {
        debug!(rev_id = new_rev_id, "revision was a rollback");
        return Ok(None);
    }
    if new_rev.text_hidden {
        debug!(rev_id = new_rev_id, "revision text is hidden");
        return Ok(None);
    }
    let new_text = new_rev.text.clone().unwrap_or_default();
    if too_small(&new_text) {
        debug!(rev_id = new_rev_id, "revision too small to compare");
        return Ok(None);
    }

    let mut added = if old_rev_id > 0 {
        let Some(old_rev) = revisions.get(&old_rev_id) else {
            return Ok(None);
        };
        if old_rev.text_hidden {
            debug!(rev_id = old_rev_id, "prior revision text is hidden");
            return Ok(None);
        }
        let old_text = old_rev.text.clone().unwrap_or_default();
        run_diff(old_text, new_text, markup.clone()).await?
    } else {
        // new page: the whole normalized text is the addition
        let markup = markup.clone();
        tokio::task::spawn_blocking(move || normalize(&new_text, &markup))
            .await
            .map_err(|e| Error::Protocol(format!("diff task failed: {e}")))?
    };

    if too_small(&added) {
        debug!(rev_id = new_rev_id, "added text too small to compare");
        return Ok(None);
    }

    // the edit comment may name the page this text was copied from
    if !new_rev.comment_hidden {
        if let Some(comment) = new_rev.comment.as_deref().filter(|c| !c.is_empty()) {
            for target in comment_links(comment) {
                if !wiki.page_exists(site, &target).await.unwrap_or(false) {
                    continue;
                }
                for linked_rev in wiki.latest_revisions(site, &target, 2).await? {
                    if linked_rev.text_hidden {
                        continue;
                    }
                    let linked_text = linked_rev.text.clone().unwrap_or_default();
                    let linked_markup = markup.clone();
                    let linked_normalized =
                        tokio::task::spawn_blocking(move || normalize(&linked_text, &linked_markup))
                            .await
                            .map_err(|e| Error::Protocol(format!("diff task failed: {e}")))?;
                    added = added
                        .lines()
                        .filter(|line| line.trim().is_empty() || !linked_normalized.contains(*line))
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
            if too_small(&added) {
                debug!(rev_id = new_rev_id, "added text too small after comment-link filtering");
                return Ok(None);
            }
        }
    }

    Ok(Some(added))
}

async fn run_diff(old: String, new: String, markup: SiteMarkup) -> Result<String> {
    tokio::task::spawn_blocking(move || added_text(&old, &new, &markup))
        .await
        .map_err(|e| Error::Protocol(format!("diff task failed: {e}")))
}

/// Wiki-link targets named in an edit comment, with sections stripped.
/// Special-namespace and interwiki-style targets are skipped.
fn comment_links(comment: &str) -> Vec<String> {
    COMMENT_LINK_RE
        .captures_iter(comment)
        .filter_map(|caps| {
            let target = caps.get(1)?.as_str().trim().trim_start_matches(':').trim();
            if target.is_empty() {
                return None;
            }
            let lowered = target.to_lowercase();
            if lowered.starts_with("special:") || lowered.starts_with("media:") {
                return None;
            }
            Some(target.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markup() -> SiteMarkup {
        SiteMarkup::new(
            &["Category".to_string()],
            &["File".to_string(), "Image".to_string()],
            &["png".to_string(), "jpg".to_string()],
        )
        .unwrap()
    }

    fn sentence(word: &str, n: usize) -> String {
        std::iter::repeat(word).take(n).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn large_insertion_is_extracted() {
        let old = sentence("alpha", 100);
        let addition = sentence("completely new material", 30);
        let new = format!("{old}\n{addition}");
        let result = added_text(&old, &new, &markup());
        assert!(result.contains("completely new material"));
    }

    #[test]
    fn reordering_produces_no_added_text() {
        let first = sentence("alpha", 40);
        let second = sentence("beta", 40);
        let old = format!("{first}\n\n{second}");
        let new = format!("{second}\n\n{first}");
        assert_eq!(added_text(&old, &new, &markup()), "");
    }

    #[test]
    fn small_insertions_are_ignored()  {
        let old = sentence("gamma", 80);
        let new = format!("{old} tiny");
        assert_eq!(added_text(&old, &new, &markup()), "");
    }

    #[test]
    fn lines_already_in_old_text_are_dropped() {
        let kept_line = sentence("original paragraph text", 20);
        let new_line = sentence("genuinely new paragraph", 20);
        let old = format!("{kept_line}\nsomething else entirely here");
        // the insertion repeats an old line and adds a new one
        let new = format!("{old}\n{kept_line}\n{new_line}");
        let result = added_text(&old, &new, &markup());
        assert!(result.contains("genuinely new"));
        assert!(!result.contains("original paragraph"));
    }

    #[test]
    fn identical_texts_produce_nothing() {
        let text = sentence("delta", 60);
        assert_eq!(added_text(&text, &text, &markup()), "");
    }

    #[test]
    fn self_revert_tags() {
        let rollback = vec!["mw-rollback".to_string(), "other".to_string()];
        assert!(is_self_revert(&rollback));
        let undo_twinkle = vec!["mw-undo".to_string(), "twinkle".to_string()];
        assert!(is_self_revert(&undo_twinkle));
        let undo_only = vec!["mw-undo".to_string()];
        assert!(!is_self_revert(&undo_only));
        assert!(!is_self_revert(&[]));
    }

    #[test]
    fn comment_links_are_parsed_and_filtered() {
        let comment = "copied from [[Example page]] and [[Special:Log]] and [[Other|label]]";
        let links = comment_links(comment);
        assert_eq!(links, vec!["Example page".to_string(), "Other".to_string()]);
        assert!(comment_links("no links here").is_empty());
        assert_eq!(
            comment_links("see [[Target#Section]]"),
            vec!["Target".to_string()]
        );
    }
}
