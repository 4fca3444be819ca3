use std::collections::{BTreeSet, HashMap, HashSet};

/// Frequency-ranked edit-distance correction in the style of Peter Norvig's
/// spelling corrector.
#[derive(Debug, Clone)]
pub struct Norvig {
    frequencies: HashMap<String, u64>,
    letters: Vec<char>,
    distance: usize,
}

impl Norvig {
    /// Counts lower-cased `words`. Candidates are searched up to `distance`
    /// edits away, at most two.
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(words: I, distance: usize) -> Self {
        let mut frequencies = HashMap::new();
        let mut letters = BTreeSet::new();
        for word in words {
            let word = word.to_lowercase();
            letters.extend(word.chars());
            *frequencies.entry(word).or_insert(0) += 1;
        }
        Self {
            frequencies,
            letters: letters.into_iter().collect(),
            distance: distance.clamp(1, 2),
        }
    }

    pub fn frequency(&self, word: &str) -> u64 {
        self.frequencies.get(&word.to_lowercase()).copied().unwrap_or(0)
    }

    pub fn is_known(&self, word: &str) -> bool {
        self.frequency(word) > 0
    }

    /// Every string one deletion, transposition, replacement or insertion away.
    pub fn edits1(&self, word: &str) -> HashSet<String> {
        let chars: Vec<char> = word.chars().collect();
        let mut edits: HashSet<String> = HashSet::new();
        for i in 0..=chars.len() {
            let (left, right) = chars.split_at(i);
            if !right.is_empty() {
                edits.insert(left.iter().chain(&right[1..]).collect());
            }
            if right.len() > 1 {
                edits.insert(left.iter().chain([&right[1], &right[0]]).chain(&right[2..]).collect());
            }
            for letter in &self.letters {
                if !right.is_empty() {
                    edits.insert(left.iter().chain([letter]).chain(&right[1..]).collect());
                }
                edits.insert(left.iter().chain([letter]).chain(right).collect());
            }
        }
        edits
    }

    fn most_frequent<I: IntoIterator<Item = String>>(&self, candidates: I) -> Option<String> {
        candidates
            .into_iter()
            .filter_map(|c| self.frequencies.get(&c).map(|&f| (c, f)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(word, _)| word)
    }

    /// A known word unchanged, else the most frequent known word at the
    /// smallest edit distance. `None` when nothing is within reach.
    pub fn correction(&self, word: &str) -> Option<String> {
        if self.is_known(word) {
            return Some(word.to_string());
        }
        let lower = word.to_lowercase();
        let edits = self.edits1(&lower);
        if let Some(best) = self.most_frequent(edits.iter().cloned()) {
            return Some(best);
        }
        if self.distance < 2 {
            return None;
        }
        let second: HashSet<String> = edits.iter().flat_map(|e| self.edits1(e)).collect();
        self.most_frequent(second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corrector(distance: usize) -> Norvig {
        Norvig::new("the the the then they sun spelling".split_whitespace(), distance)
    }

    #[test]
    fn test_known_words_unchanged() {
        let norvig = corrector(2);
        assert_eq!(norvig.correction("The").as_deref(), Some("The"));
        assert_eq!(norvig.frequency("THE"), 3);
    }

    #[test]
    fn test_most_frequent_candidate_wins() {
        // "thn" is one edit from both "the" and "then".
        assert_eq!(corrector(1).correction("thn").as_deref(), Some("the"));
    }

    #[test]
    fn test_distance_two_only_when_allowed() {
        assert_eq!(corrector(1).correction("speling"), Some("spelling".to_string()));
        assert_eq!(corrector(1).correction("spllng"), None);
        assert_eq!(corrector(2).correction("spllng").as_deref(), Some("spelling"));
    }

    #[test]
    fn test_edits1_contains_each_kind() {
        let norvig = corrector(1);
        let edits = norvig.edits1("ab");
        for expected in ["b", "a", "ba", "tb", "abe", "eab"] {
            assert!(edits.contains(expected), "missing {}", expected);
        }
    }
}
