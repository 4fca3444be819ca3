//! Symmetric delete spelling correction.
//!
//! Every dictionary word registers the strings reachable from its prefix by
//! deleting up to `max_edit_distance` characters. A lookup generates the
//! deletes of the input prefix and verifies the words they lead to with the
//! optimal string alignment distance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const PREFIX_LENGTH: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub term: String,
    pub distance: usize,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct SymSpell {
    max_edit_distance: usize,
    /// Words in first-seen order, with their counts.
    words: Vec<(String, u64)>,
    ids: HashMap<String, usize>,
    deletes: HashMap<String, Vec<usize>>,
}

/// Optimal string alignment distance: Levenshtein plus adjacent transpositions.
pub fn osa_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut d = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for (i, row) in d.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        d[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            d[i][j] = (d[i - 1][j] + 1).min(d[i][j - 1] + 1).min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                d[i][j] = d[i][j].min(d[i - 2][j - 2] + 1);
            }
        }
    }
    d[a.len()][b.len()]
}

fn prefix(word: &str) -> String {
    word.chars().take(PREFIX_LENGTH).collect()
}

fn single_deletes(word: &str) -> impl Iterator<Item = String> + '_ {
    let chars: Vec<char> = word.chars().collect();
    (0..chars.len()).map(move |i| {
        chars
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, c)| c)
            .collect()
    })
}

/// Lower-cased runs of `[a-z0-9']` in `text`.
fn corpus_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
}

/// Copies the casing of `source` onto `term`: all caps stay all caps,
/// otherwise character by character where both have one.
fn transfer_casing(source: &str, term: &str) -> String {
    let mut letters = source.chars().filter(|c| c.is_alphabetic()).peekable();
    let shouting = letters.peek().is_some() && letters.all(char::is_uppercase);
    if shouting && source.chars().count() > 1 {
        return term.to_uppercase();
    }
    let mut casing = source.chars().map(char::is_uppercase);
    term.chars()
        .map(|c| match casing.next() {
            Some(true) => c.to_uppercase().collect::<String>(),
            _ => c.to_string(),
        })
        .collect()
}

impl SymSpell {
    fn empty(max_edit_distance: usize) -> Self {
        Self {
            max_edit_distance,
            words: Vec::new(),
            ids: HashMap::new(),
            deletes: HashMap::new(),
        }
    }

    /// Counts the words of `text`.
    pub fn from_corpus(text: &str, max_edit_distance: usize) -> Self {
        let mut symspell = Self::empty(max_edit_distance);
        for word in corpus_words(text) {
            symspell.add(&word, 1);
        }
        symspell
    }

    /// Reads a `term count` per line dictionary.
    pub fn load_dictionary(path: impl AsRef<Path>, max_edit_distance: usize) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut symspell = Self::empty(max_edit_distance);
        for (index, line) in content.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(term), Some(count)) = (fields.next(), fields.next()) else {
                continue;
            };
            let count = count
                .parse::<u64>()
                .map_err(|e| Error::Config(format!("dictionary line {}: {}", index + 1, e)))?;
            symspell.add(term, count);
        }
        Ok(symspell)
    }

    pub fn save_dictionary(&self, path: impl AsRef<Path>) -> Result<()> {
        let content: String = self
            .words
            .iter()
            .map(|(term, count)| format!("{} {}\n", term, count))
            .collect();
        fs::write(path, content)?;
        Ok(())
    }

    pub fn count(&self, term: &str) -> Option<u64> {
        self.ids.get(term).map(|&id| self.words[id].1)
    }

    fn add(&mut self, term: &str, count: u64) {
        if let Some(&id) = self.ids.get(term) {
            self.words[id].1 += count;
            return;
        }
        let id = self.words.len();
        self.words.push((term.to_string(), count));
        self.ids.insert(term.to_string(), id);

        let mut seen = HashSet::new();
        let mut frontier = vec![prefix(term)];
        for _ in 0..=self.max_edit_distance {
            let mut next = Vec::new();
            for candidate in frontier {
                if !seen.insert(candidate.clone()) {
                    continue;
                }
                next.extend(single_deletes(&candidate));
                self.deletes.entry(candidate).or_default().push(id);
            }
            frontier = next;
        }
    }

    /// The closest dictionary term within `max_edit_distance`, most frequent
    /// first on equal distance, with the input's casing transferred.
    pub fn lookup(&self, input: &str) -> Option<Suggestion> {
        let term = input.to_lowercase();
        if let Some(count) = self.count(&term) {
            return Some(Suggestion {
                term: transfer_casing(input, &term),
                distance: 0,
                count,
            });
        }

        let input_prefix = prefix(&term);
        let prefix_len = input_prefix.chars().count();
        let mut best: Option<(usize, usize, u64)> = None;
        let mut checked = HashSet::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([input_prefix]);

        while let Some(candidate) = queue.pop_front() {
            let deleted = prefix_len - candidate.chars().count();
            if let Some(best) = best {
                // Further deletes only reach words at a larger distance.
                if deleted > best.1 {
                    break;
                }
            }
            if let Some(ids) = self.deletes.get(&candidate) {
                for &id in ids {
                    if !checked.insert(id) {
                        continue;
                    }
                    let (word, count) = &self.words[id];
                    let distance = osa_distance(&term, word);
                    if distance > self.max_edit_distance {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((_, best_distance, best_count)) => {
                            distance < best_distance || (distance == best_distance && *count > best_count)
                        }
                    };
                    if better {
                        best = Some((id, distance, *count));
                    }
                }
            }
            if deleted < self.max_edit_distance {
                for shorter in single_deletes(&candidate) {
                    if seen.insert(shorter.clone()) {
                        queue.push_back(shorter);
                    }
                }
            }
        }

        best.map(|(id, distance, count)| Suggestion {
            term: transfer_casing(input, &self.words[id].0),
            distance,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_osa_distance() {
        assert_eq!(osa_distance("quikc", "quick"), 1);
        assert_eq!(osa_distance("ca", "abc"), 3);
        assert_eq!(osa_distance("", "abc"), 3);
        assert_eq!(osa_distance("same", "same"), 0);
    }

    #[test]
    fn test_corpus_words() {
        let words: Vec<String> = corpus_words("Don't stop-me now, 2 times!").collect();
        assert_eq!(words, vec!["don't", "stop", "me", "now", "2", "times"]);
    }

    #[test]
    fn test_lookup_prefers_distance_then_count() {
        let symspell = SymSpell::from_corpus("bat bat bat cat hat", 2);
        assert_eq!(symspell.lookup("cat").map(|s| s.distance), Some(0));
        let suggestion = symspell.lookup("xat");
        assert_eq!(suggestion.map(|s| (s.term, s.distance, s.count)), Some(("bat".to_string(), 1, 3)));
        assert_eq!(symspell.lookup("xyzzy"), None);
    }

    #[test]
    fn test_lookup_transfers_casing() {
        let symspell = SymSpell::from_corpus("hello world", 2);
        assert_eq!(symspell.lookup("Helo").map(|s| s.term).as_deref(), Some("Hello"));
        assert_eq!(symspell.lookup("WROLD").map(|s| s.term).as_deref(), Some("WORLD"));
        assert_eq!(symspell.lookup("World").map(|s| s.term).as_deref(), Some("World"));
    }

    #[test]
    fn test_long_words_use_prefix() {
        let symspell = SymSpell::from_corpus("internationalization", 2);
        let suggestion = symspell.lookup("internationalisation");
        assert_eq!(suggestion.map(|s| s.distance), Some(1));
    }

    #[test]
    fn test_dictionary_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dictionary.txt");
        let original = SymSpell::from_corpus("b a b c b", 1);
        original.save_dictionary(&path)?;
        assert_eq!(fs::read_to_string(&path)?, "b 3\na 1\nc 1\n");

        let loaded = SymSpell::load_dictionary(&path, 1)?;
        assert_eq!(loaded.count("b"), Some(3));
        assert_eq!(loaded.lookup("d").map(|s| s.term).as_deref(), Some("b"));
        Ok(())
    }
}
