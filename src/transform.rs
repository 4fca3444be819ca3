//! Builds train/validation/test partitions from a directory of M2 files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::{m2, preproc};

const PARTITION_FILES: [&str; 3] = ["train.txt", "valid.txt", "test.txt"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitions {
    pub train: Vec<String>,
    pub valid: Vec<String>,
    pub test: Vec<String>,
}

impl Partitions {
    /// Splits `lines` 80/10/10 in order: `train_i = floor(0.8 n)` and
    /// `valid_i = train_i + floor((n - train_i) / 2)`.
    pub fn split(lines: Vec<String>) -> Self {
        let total = lines.len();
        let train_i = total * 8 / 10;
        let valid_i = train_i + (total - train_i) / 2;

        let mut lines = lines;
        let test = lines.split_off(valid_i);
        let valid = lines.split_off(train_i);
        Self {
            train: lines,
            valid,
            test,
        }
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.valid.len() + self.test.len()
    }

    /// Writes one sentence per line into `train.txt`, `valid.txt` and `test.txt`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for (name, lines) in PARTITION_FILES.iter().zip(self.parts()) {
            let mut content = lines.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            fs::write(dir.join(name), content)?;
        }
        info!(dir = %dir.display(), train = self.train.len(), valid = self.valid.len(), test = self.test.len(), "saved partitions");
        Ok(())
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| -> Result<Vec<String>> {
            Ok(fs::read_to_string(dir.join(name))?
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect())
        };
        Ok(Self {
            train: read(PARTITION_FILES[0])?,
            valid: read(PARTITION_FILES[1])?,
            test: read(PARTITION_FILES[2])?,
        })
    }

    fn parts(&self) -> [&Vec<String>; 3] {
        [&self.train, &self.valid, &self.test]
    }
}

pub struct Transform {
    m2_dir: PathBuf,
    charset: String,
    max_text_length: usize,
}

impl Transform {
    pub fn new(source: impl AsRef<Path>, charset: &str, max_text_length: usize) -> Self {
        Self {
            m2_dir: source.as_ref().join("m2"),
            charset: charset.to_string(),
            max_text_length,
        }
    }

    /// Reads every file under `<source>/m2` in name order, drops duplicate
    /// sentences, normalizes them and splits the result.
    pub fn build(&self) -> Result<Partitions> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.m2_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        for file in &files {
            let sentences = m2::read_raw(file)?;
            info!(file = %file.display(), sentences = sentences.len(), "read m2 file");
            lines.extend(sentences.into_iter().filter(|s| seen.insert(s.clone())));
        }

        let lines = preproc::normalize_text(&lines, &self.charset, self.max_text_length);
        Ok(Partitions::split(lines))
    }
}
