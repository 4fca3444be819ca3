use std::collections::{HashMap, HashSet};

const PAD_CHAR: char = '$';

/// Fuzzy word lookup over character n-grams.
///
/// Keys are lower-cased and padded with `n - 1` `$` on both sides. The
/// similarity of two keys is `shared / (|a| + |b| - shared)`, counted over
/// n-gram multisets.
#[derive(Debug, Clone)]
pub struct NGramIndex {
    n: usize,
    items: Vec<String>,
    lookup: HashSet<String>,
    gram_counts: Vec<usize>,
    postings: HashMap<String, Vec<(usize, usize)>>,
}

impl NGramIndex {
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(words: I, n: usize) -> Self {
        let mut index = Self {
            n: n.max(1),
            items: Vec::new(),
            lookup: HashSet::new(),
            gram_counts: Vec::new(),
            postings: HashMap::new(),
        };
        for word in words {
            index.add(word);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn add(&mut self, word: &str) {
        if !self.lookup.insert(word.to_string()) {
            return;
        }
        let id = self.items.len();
        let grams = self.grams(word);
        self.gram_counts.push(grams.values().sum());
        for (gram, count) in grams {
            self.postings.entry(gram).or_default().push((id, count));
        }
        self.items.push(word.to_string());
    }

    fn grams(&self, word: &str) -> HashMap<String, usize> {
        let pad: String = std::iter::repeat(PAD_CHAR).take(self.n - 1).collect();
        let padded: Vec<char> = format!("{}{}{}", pad, word.to_lowercase(), pad).chars().collect();

        let mut grams = HashMap::new();
        for window in padded.windows(self.n) {
            *grams.entry(window.iter().collect::<String>()).or_insert(0) += 1;
        }
        grams
    }

    /// Similarity of every item sharing at least one n-gram with `query`.
    pub fn search(&self, query: &str) -> Vec<(&str, f64)> {
        let grams = self.grams(query);
        let query_count: usize = grams.values().sum();

        let mut shared: HashMap<usize, usize> = HashMap::new();
        for (gram, count) in &grams {
            for &(id, item_count) in self.postings.get(gram).into_iter().flatten() {
                *shared.entry(id).or_insert(0) += (*count).min(item_count);
            }
        }

        let mut matches: Vec<(usize, f64)> = shared
            .into_iter()
            .map(|(id, same)| {
                let all = query_count + self.gram_counts[id] - same;
                (id, same as f64 / all as f64)
            })
            .collect();
        matches.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        matches
            .into_iter()
            .map(|(id, similarity)| (self.items[id].as_str(), similarity))
            .collect()
    }

    /// The exact word if indexed, else the most similar one (earliest added on ties).
    pub fn find(&self, query: &str) -> Option<&str> {
        if let Some(item) = self.lookup.get(query) {
            return Some(item.as_str());
        }
        self.search(query).first().map(|(item, _)| *item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_values() {
        let index = NGramIndex::new(["quick"], 2);
        let results = index.search("quikc");
        assert_eq!(results.len(), 1);
        // $q qu ui shared out of 6 + 6 grams.
        assert!((results[0].1 - 3.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_find_prefers_closest_then_first_seen() {
        let index = NGramIndex::new(["brown", "sun", "in"], 2);
        assert_eq!(index.find("brwn"), Some("brown"));

        let ties = NGramIndex::new(["ab", "ba", "AB"], 1);
        assert_eq!(ties.len(), 3);
        // All three score 0.5 against "aabb"; the first added wins.
        assert_eq!(ties.find("aabb"), Some("ab"));
    }

    #[test]
    fn test_find_exact_keeps_case() {
        let index = NGramIndex::new(["the", "The"], 3);
        assert_eq!(index.find("The"), Some("The"));
        assert_eq!(index.find("THE"), Some("the"));
    }

    #[test]
    fn test_no_shared_grams() {
        let index = NGramIndex::new(["xyz"], 3);
        assert_eq!(index.find("abc"), None);
    }
}
