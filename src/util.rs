use once_cell::sync::Lazy;
use regex::Regex;

static DISAMBIGUATION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\(\d+\)$").expect("valid regex"));
static NUMBERED_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\(\d+\)").expect("valid regex"));
static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\(\[].*?[\)\]]").expect("valid regex"));
static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s]").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

pub fn expand_template(template: &str, folder_name: &str) -> String {
    template.replace("${folder_name}", folder_name)
}

/// Discogs appends " (2)", " (3)" ... to artists sharing a name. Drop it so
/// the destination search sees the plain name.
pub fn strip_disambiguation(artist: &str) -> String {
    DISAMBIGUATION_SUFFIX.replace(artist.trim(), "").into_owned()
}

/// Lower-case, drop bracketed qualifiers and punctuation, collapse whitespace.
pub fn normalize_for_match(text: &str) -> String {
    let text = text.to_lowercase();
    let text = NUMBERED_SUFFIX.replace_all(&text, "");
    let text = BRACKETED.replace_all(&text, "");
    let text = NON_ALNUM.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

pub fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
