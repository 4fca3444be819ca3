//! Statistical correction baselines sharing one word-by-word interface.
//!
//! Each whitespace token of a sentence is corrected on its own and the
//! sentence is rejoined with single spaces. Punctuation tokens, and tokens
//! the corrector has no suggestion for, pass through unchanged.

mod ngram;
mod norvig;
mod symspell;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

pub use ngram::NGramIndex;
pub use norvig::Norvig;
pub use symspell::{osa_distance, SymSpell};

use crate::error::{Error, Result};

/// ASCII punctuation, matched as a substring.
pub const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Similarity,
    Norvig,
    Symspell,
}

impl Strategy {
    pub fn name(self) -> &'static str {
        match self {
            Strategy::Similarity => "similarity",
            Strategy::Norvig => "norvig",
            Strategy::Symspell => "symspell",
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "similarity" => Ok(Strategy::Similarity),
            "norvig" => Ok(Strategy::Norvig),
            "symspell" => Ok(Strategy::Symspell),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Corrector {
    Similarity(NGramIndex),
    Norvig(Norvig),
    Symspell(SymSpell),
}

impl Corrector {
    fn correct(&self, word: &str) -> Option<String> {
        match self {
            Corrector::Similarity(index) => index.find(word).map(str::to_string),
            Corrector::Norvig(norvig) => norvig.correction(word),
            Corrector::Symspell(symspell) => symspell.lookup(word).map(|s| s.term),
        }
    }
}

pub struct LanguageModel {
    strategy: Strategy,
    source: PathBuf,
    n: usize,
    corpus: Option<String>,
    corrector: Option<Corrector>,
}

impl LanguageModel {
    /// `n` is the n-gram size for similarity and the maximum edit distance
    /// for Norvig and SymSpell.
    pub fn new(strategy: Strategy, source: impl AsRef<Path>, n: usize) -> Self {
        Self {
            strategy,
            source: source.as_ref().to_path_buf(),
            n: n.max(1),
            corpus: None,
            corrector: None,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn corpus(&self) -> Option<&str> {
        self.corpus.as_deref()
    }

    /// Joins `sentences`, strips ASCII punctuation and collapses whitespace.
    pub fn create_corpus(&self, sentences: &[String]) -> String {
        let joined = sentences.join(" ");
        let stripped: String = joined.chars().filter(|c| !PUNCTUATION.contains(*c)).collect();
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Loads the corpus file and builds the corrector for the strategy.
    ///
    /// For SymSpell the word counts are also written to `dictionary.txt`
    /// beside the corpus and read back from there.
    pub fn read_corpus(&mut self, corpus_path: impl AsRef<Path>) -> Result<()> {
        let corpus_path = corpus_path.as_ref();
        let content = fs::read_to_string(corpus_path)?;
        let corpus = content.lines().collect::<Vec<_>>().join(" ");

        let corrector = match self.strategy {
            Strategy::Similarity => Corrector::Similarity(NGramIndex::new(corpus.split_whitespace(), self.n)),
            Strategy::Norvig => Corrector::Norvig(Norvig::new(corpus.split_whitespace(), self.n)),
            Strategy::Symspell => {
                let dictionary_path = corpus_path
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join("dictionary.txt");
                SymSpell::from_corpus(&content, self.n).save_dictionary(&dictionary_path)?;
                Corrector::Symspell(SymSpell::load_dictionary(&dictionary_path, self.n)?)
            }
        };
        info!(
            strategy = %self.strategy,
            path = %corpus_path.display(),
            words = corpus.split_whitespace().count(),
            "loaded corpus"
        );

        self.corpus = Some(corpus);
        self.corrector = Some(corrector);
        Ok(())
    }

    pub fn autocorrect(&self, sentences: &[String]) -> Result<Vec<String>> {
        sentences.iter().map(|s| self.autocorrect_sentence(s)).collect()
    }

    pub fn autocorrect_sentence(&self, sentence: &str) -> Result<String> {
        let corrector = self.corrector.as_ref().ok_or(Error::CorpusNotLoaded)?;
        let tokens: Vec<String> = sentence
            .split_whitespace()
            .map(|token| {
                if PUNCTUATION.contains(token) {
                    return token.to_string();
                }
                corrector.correct(token).unwrap_or_else(|| token.to_string())
            })
            .collect();
        Ok(tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORPUS: &str = "the quick brown fox jumps over the lazy dog\nthe dog sleeps in the sun\n";

    fn loaded(strategy: Strategy, n: usize) -> Result<(tempfile::TempDir, LanguageModel)> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("corpus.txt");
        fs::write(&path, CORPUS)?;
        let mut model = LanguageModel::new(strategy, dir.path(), n);
        model.read_corpus(&path)?;
        Ok((dir, model))
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("norvig".parse::<Strategy>().ok(), Some(Strategy::Norvig));
        assert_eq!("SymSpell".parse::<Strategy>().ok(), Some(Strategy::Symspell));
        assert!(matches!("srilm".parse::<Strategy>(), Err(Error::UnknownStrategy(_))));
    }

    #[test]
    fn test_create_corpus_strips_punctuation() {
        let model = LanguageModel::new(Strategy::Norvig, "data", 2);
        let sentences = vec!["Hello, world!".to_string(), "  It's   fine. ".to_string()];
        assert_eq!(model.create_corpus(&sentences), "Hello world Its fine");
    }

    #[test]
    fn test_autocorrect_requires_corpus() {
        let model = LanguageModel::new(Strategy::Similarity, "data", 2);
        assert!(matches!(model.autocorrect_sentence("the dog"), Err(Error::CorpusNotLoaded)));
    }

    #[test]
    fn test_known_sentences_are_unchanged() -> Result<()> {
        let sentence = "the lazy dog sleeps in the sun".to_string();
        for strategy in [Strategy::Similarity, Strategy::Norvig, Strategy::Symspell] {
            let (_dir, model) = loaded(strategy, 2)?;
            assert_eq!(model.autocorrect(&[sentence.clone()])?, vec![sentence.clone()], "{}", strategy);
        }
        Ok(())
    }

    #[test]
    fn test_misspellings_are_corrected() -> Result<()> {
        for strategy in [Strategy::Similarity, Strategy::Norvig, Strategy::Symspell] {
            let (_dir, model) = loaded(strategy, 2)?;
            assert_eq!(model.autocorrect_sentence("the quikc brwn fox")?, "the quick brown fox", "{}", strategy);
        }
        Ok(())
    }

    #[test]
    fn test_punctuation_passes_through() -> Result<()> {
        let (_dir, model) = loaded(Strategy::Norvig, 2)?;
        assert_eq!(model.autocorrect_sentence("the  dgo , .")?, "the dog , .");
        Ok(())
    }

    #[test]
    fn test_symspell_writes_dictionary() -> Result<()> {
        let (dir, _model) = loaded(Strategy::Symspell, 2)?;
        let dictionary = fs::read_to_string(dir.path().join("dictionary.txt"))?;
        assert!(dictionary.lines().any(|line| line == "the 4"));
        Ok(())
    }
}
