//! Field extraction from portal markup.
//!
//! The portal's pages are scraped, not served from an API, so every field
//! comes out of a known landmark in the markup. Extraction is best-effort:
//! a missing landmark yields `None`, never an error, and callers decide
//! what a missing field means.
//!
//! All extracted text has numeric HTML entities (`&#NN;`) decoded.

use once_cell::sync::Lazy;
use regex::Regex;

/// One outline line: the full choice path to a chapter plus its title.
///
/// Outline listings address chapters with 1-based dash-joined segments
/// (`1-2-1: Some Title`); `path` holds the 0-based equivalent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub path: Vec<u8>,
    pub title: String,
}

static PAGE_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title>(.*?)</title>").expect("page title pattern"));

static STORY_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a[^>]*class="story-title"[^>]*>(.*?)</a>"#).expect("story title pattern")
});

static OWNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<span[^>]*class="owner-name"[^>]*>(.*?)</span>"#).expect("owner pattern")
});

static DESCRIPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta\s+name="description"\s+content="([^"]*)""#)
        .expect("description pattern")
});

static INFO_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<div[^>]*class="story-info"[^>]*>(.*?)</div>"#).expect("info text pattern")
});

static CHAPTER_AUTHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a[^>]*class="chapter-author"[^>]*>(.*?)</a>"#)
        .expect("chapter author pattern")
});

static CHAPTER_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<div[^>]*class="chapter-body"[^>]*>(.*?)</div>"#)
        .expect("chapter text pattern")
});

/// Choice links are rendered as `<p class="choice"><b>N.</b> <a ...>label</a></p>`
/// with a 1-based choice number in the bold prefix.
static CHOICE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<p[^>]*class="choice"[^>]*>\s*<b>(\d+)\.</b>\s*<a[^>]*>(.*?)</a>"#)
        .expect("choice label pattern")
});

static OUTLINE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<pre[^>]*class="outline"[^>]*>(.*?)</pre>"#).expect("outline pattern")
});

static OUTLINE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+(?:-\d+)*)\s*[:.]\s*(.+?)\s*$").expect("outline line"));

static NUMERIC_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(\d+);").expect("entity pattern"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag pattern"));

/// Decode numeric HTML entities and trim surrounding whitespace.
pub fn clean(raw: &str) -> String {
    let decoded = NUMERIC_ENTITY.replace_all(raw, |caps: &regex::Captures<'_>| {
        caps[1]
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    decoded.trim().to_string()
}

fn first_capture(re: &Regex, page: &str) -> Option<String> {
    re.captures(page).map(|caps| clean(&caps[1]))
}

/// The `<title>` of the page, used for busy-page and error detection.
pub fn page_title(page: &str) -> Option<String> {
    first_capture(&PAGE_TITLE, page)
}

/// The story's display title.
pub fn story_title(page: &str) -> Option<String> {
    first_capture(&STORY_TITLE, page)
}

/// The story owner's user name.
pub fn owner(page: &str) -> Option<String> {
    first_capture(&OWNER, page)
}

/// The story's short description from the page metadata.
pub fn description(page: &str) -> Option<String> {
    first_capture(&DESCRIPTION, page)
}

/// The free-form info text block on the story page.
pub fn info_text(page: &str) -> Option<String> {
    first_capture(&INFO_TEXT, page)
}

/// The author of one chapter page.
pub fn chapter_author(page: &str) -> Option<String> {
    first_capture(&CHAPTER_AUTHOR, page)
}

/// The body text of one chapter page, with markup stripped.
pub fn chapter_text(page: &str) -> Option<String> {
    CHAPTER_TEXT
        .captures(page)
        .map(|caps| clean(&TAG.replace_all(&caps[1], "")))
}

/// Explicit choice labels on a chapter page, as (0-based slot, label).
pub fn choice_labels(page: &str) -> Vec<(u8, String)> {
    CHOICE_LABEL
        .captures_iter(page)
        .filter_map(|caps| {
            let number: u16 = caps[1].parse().ok()?;
            // The page shows 1-based choice numbers.
            let slot = number.checked_sub(1)?;
            u8::try_from(slot).ok().map(|s| (s, clean(&caps[2])))
        })
        .collect()
}

/// Parse the outline listing into discovery entries.
///
/// Lines outside the outline block and lines that do not look like
/// `1-2-1: Title` are ignored; segment `0` or a segment above 255 marks a
/// malformed line, which is skipped rather than misread.
pub fn outline(page: &str) -> Vec<OutlineEntry> {
    let Some(block) = OUTLINE_BLOCK.captures(page) else {
        return Vec::new();
    };
    OUTLINE_LINE
        .captures_iter(&block[1])
        .filter_map(|caps| {
            let path = caps[1]
                .split('-')
                .map(|seg| {
                    let n: u16 = seg.parse().ok()?;
                    // Outline segments are 1-based.
                    u8::try_from(n.checked_sub(1)?).ok()
                })
                .collect::<Option<Vec<u8>>>()?;
            if path.is_empty() {
                return None;
            }
            Some(OutlineEntry {
                path,
                title: clean(&caps[2]),
            })
        })
        .collect()
}

/// Whether the page is the portal's "login failed" response.
pub fn is_login_failed(page: &str) -> bool {
    page_title(page).is_some_and(|t| t.contains("Login Failed"))
}

/// Whether the page is the portal's "no such item" response.
pub fn is_item_not_found(page: &str) -> bool {
    page_title(page).is_some_and(|t| t.contains("Item Not Found"))
}

/// Whether the page is a login wall instead of the requested content.
pub fn requires_login(page: &str) -> bool {
    page.contains(r#"id="login-required""#)
        || page_title(page).is_some_and(|t| t.contains("Please Login"))
}
