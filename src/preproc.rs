//! Text normalisation applied to corpus lines before they become partitions.

use std::collections::HashSet;

/// Suffixes split off by word tokenizers (`do n't`, `it 's`), glued back on.
const CONTRACTIONS: [&str; 8] = ["n't", "'s", "'m", "'re", "'ve", "'ll", "'d", "'S"];

const CLOSING: &str = ".,;:!?%)]}";
const OPENING: &str = "([{";

fn is_closing(token: &str) -> bool {
    token.chars().all(|c| CLOSING.contains(c))
}

fn is_opening(token: &str) -> bool {
    token.chars().count() == 1 && token.chars().all(|c| OPENING.contains(c))
}

/// Unifies typographic quotes and dashes, re-attaches tokenized punctuation
/// and contractions, and collapses whitespace.
///
/// `"He said “ hi ” , did n't he ?"` becomes `"He said \"hi\", didn't he?"`
/// except that straight double quotes keep their surrounding spaces.
pub fn text_standardize(text: &str) -> String {
    let unified: String = text
        .chars()
        .map(|c| match c {
            '“' | '”' | '„' | '‟' | '«' | '»' => '"',
            '‘' | '’' | '‚' | '‛' | '`' | '´' => '\'',
            '–' | '—' | '‐' | '‑' | '−' => '-',
            c if c.is_whitespace() => ' ',
            c => c,
        })
        .collect();
    let unified = unified.replace('…', "...");

    let mut out = String::with_capacity(unified.len());
    let mut previous: Option<&str> = None;
    for token in unified.split_whitespace() {
        let attach = match previous {
            None => true,
            Some(prev) => CONTRACTIONS.contains(&token) || is_closing(token) || is_opening(prev),
        };
        if !attach {
            out.push(' ');
        }
        out.push_str(token);
        previous = Some(token);
    }
    out
}

/// Standardizes each line, drops characters outside `charset` and wraps the
/// result into word-bounded chunks of at most `limit` characters.
///
/// A single word longer than `limit` is split hard. Empty results are dropped.
pub fn normalize_text(lines: &[String], charset: &str, limit: usize) -> Vec<String> {
    let allowed: HashSet<char> = charset.chars().collect();
    let limit = limit.max(1);
    let mut normalized = Vec::with_capacity(lines.len());

    for line in lines {
        let filtered: String = text_standardize(line)
            .chars()
            .filter(|c| allowed.contains(c))
            .collect();
        normalized.extend(wrap_words(&filtered, limit));
    }
    normalized
}

fn wrap_words(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > limit {
            if current_len > 0 {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.push(word.drain(..limit).collect());
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
        if needed > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(word.iter());
        current_len += word.len();
    }
    if current_len > 0 {
        chunks.push(current);
    }
    chunks
}
