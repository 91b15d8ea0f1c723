//! Transcript text cleanup shared by the pipeline and the webhook batcher.

/// Punctuation that closes a sentence. Covers the fullwidth variants the
/// translation providers emit for Japanese and Korean text.
const SENTENCE_TERMINATORS: &[char] = &['.', '?', '!', '。', '？', '！'];

/// Normalize recognizer text: collapse whitespace runs, drop spaces before
/// closing punctuation and just inside brackets.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            let suppress = matches!(ch, ',' | '.' | ';' | ':' | '?' | '!' | ')' | ']' | '}')
                || matches!(out.chars().last(), Some('(' | '[' | '{'));
            if !suppress && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
        }
        out.push(ch);
    }

    out
}

/// True when the trimmed text ends with a sentence terminator.
pub fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .chars()
        .next_back()
        .is_some_and(|ch| SENTENCE_TERMINATORS.contains(&ch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("Bonan   tagon\t al  vi"), "Bonan tagon al vi");
    }

    #[test]
    fn test_normalize_trims() {
        assert_eq!(normalize("  Saluton.  "), "Saluton.");
    }

    #[test]
    fn test_normalize_space_before_punctuation() {
        assert_eq!(normalize("Saluton , amiko ."), "Saluton, amiko.");
        assert_eq!(normalize("Ĉu vere ?"), "Ĉu vere?");
    }

    #[test]
    fn test_normalize_brackets() {
        assert_eq!(normalize("jen ( ekzemplo )"), "jen (ekzemplo)");
    }

    #[test]
    fn test_normalize_empty() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_ends_sentence_ascii() {
        assert!(ends_sentence("Bonan tagon."));
        assert!(ends_sentence("Ĉu vere?"));
        assert!(ends_sentence("Jes!"));
        assert!(!ends_sentence("Saluton"));
        assert!(!ends_sentence("do,"));
    }

    #[test]
    fn test_ends_sentence_fullwidth() {
        assert!(ends_sentence("こんにちは。"));
        assert!(ends_sentence("本当？"));
        assert!(ends_sentence("はい！"));
    }

    #[test]
    fn test_ends_sentence_trailing_whitespace() {
        assert!(ends_sentence("Bonan tagon.  "));
        assert!(!ends_sentence("   "));
        assert!(!ends_sentence(""));
    }
}
