use once_cell::sync::Lazy;
use regex::Regex;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid word regex"));

/// Approximate token count: the number of maximal word-character runs
/// (letters, digits and underscore) in `text`.
///
/// This is a throughput proxy, not a model tokenizer. Real BPE vocabularies
/// split text differently and no attempt is made to match any of them.
pub fn count_tokens(text: &str) -> usize {
    WORD.find_iter(text).count()
}
