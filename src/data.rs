use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Device, Tensor};

use crate::error::{Error, Result};
use crate::tokenizer::{TextTokenizer, PAD_ID};
use crate::transform::Partitions;

/// One training batch, already padded to the tokenizer's `maxlen`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Token ids of the (noisy) source sentences.
    pub encoder_inputs: Vec<Vec<i64>>,
    /// `[SOS] + target`, the teacher-forced decoder input.
    pub decoder_inputs: Vec<Vec<i64>>,
    /// `target + [EOS]`, what each decoder position must predict.
    pub labels: Vec<Vec<i64>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.encoder_inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder_inputs.is_empty()
    }

    /// Returns `(encoder_inputs, decoder_inputs, labels)` as `[batch_size, maxlen]` Int64 tensors.
    pub fn to_tensors(&self, device: Device) -> Result<(Tensor, Tensor, Tensor)> {
        Ok((
            rows_to_tensor(&self.encoder_inputs, device)?,
            rows_to_tensor(&self.decoder_inputs, device)?,
            rows_to_tensor(&self.labels, device)?,
        ))
    }
}

/// Stacks equally long id rows into a `[rows, cols]` tensor.
pub fn rows_to_tensor(rows: &[Vec<i64>], device: Device) -> Result<Tensor> {
    let cols = rows.first().map_or(0, |row| row.len());
    if let Some(row) = rows.iter().find(|row| row.len() != cols) {
        return Err(Error::ShapeMismatch {
            expected: vec![cols as i64],
            got: vec![row.len() as i64],
        });
    }
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_slice(&flat)
        .view([rows.len() as i64, cols as i64])
        .to_device(device))
}

/// Truncates or right-pads `ids` with the pad id to exactly `maxlen`.
pub fn pad_sequence(mut ids: Vec<i64>, maxlen: usize) -> Vec<i64> {
    ids.resize(maxlen, PAD_ID);
    ids
}

/// Applies random character-level edits (delete, duplicate, transpose,
/// substitute) to `sentence`.
///
/// About `len * max_prob` edits are drawn; the result is never empty for a
/// non-empty input.
pub fn add_noise<R: Rng>(sentence: &str, max_prob: f64, charset: &[char], rng: &mut R) -> String {
    let mut chars: Vec<char> = sentence.chars().collect();
    if chars.len() < 2 || max_prob <= 0.0 {
        return sentence.to_string();
    }

    let edits = (chars.len() as f64 * max_prob * rng.gen::<f64>()).round() as usize;
    for _ in 0..edits {
        if chars.len() < 2 {
            break;
        }
        let i = rng.gen_range(0..chars.len() - 1);
        match rng.gen_range(0..4) {
            0 => {
                chars.remove(i);
            }
            1 => {
                let c = chars[i];
                chars.insert(i, c);
            }
            2 => chars.swap(i, i + 1),
            _ => {
                if let Some(&c) = charset.choose(rng) {
                    chars[i] = c;
                }
            }
        }
    }
    chars.into_iter().collect()
}

/// Turns text partitions into padded `Batch` streams for the Transformer.
pub struct DataGenerator<T> {
    tokenizer: Arc<T>,
    partitions: Partitions,
    charset: Arc<Vec<char>>,
    batch_size: usize,
    noise_max_prob: f64,
    seed: u64,
}

impl<T: TextTokenizer + 'static> DataGenerator<T> {
    pub fn new(
        partitions: Partitions,
        tokenizer: Arc<T>,
        charset: &str,
        batch_size: usize,
        noise_max_prob: f64,
        seed: u64,
    ) -> Self {
        Self {
            tokenizer,
            partitions,
            charset: Arc::new(charset.chars().collect()),
            batch_size: batch_size.max(1),
            noise_max_prob,
            seed,
        }
    }

    pub fn partitions(&self) -> &Partitions {
        &self.partitions
    }

    fn steps_for(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }

    pub fn train_steps(&self) -> usize {
        self.steps_for(self.partitions.train.len())
    }

    pub fn valid_steps(&self) -> usize {
        self.steps_for(self.partitions.valid.len())
    }

    pub fn test_steps(&self) -> usize {
        self.steps_for(self.partitions.test.len())
    }

    /// Endless training stream, reshuffled and re-noised on every pass.
    pub fn train_batches(&self) -> BatchStream<T> {
        self.stream(&self.partitions.train, true, false, self.seed)
    }

    /// Endless validation stream; every pass yields the same batches.
    pub fn valid_batches(&self) -> BatchStream<T> {
        self.stream(&self.partitions.valid, false, true, self.seed.wrapping_add(1))
    }

    fn stream(&self, sentences: &[String], shuffle: bool, replay: bool, seed: u64) -> BatchStream<T> {
        BatchStream {
            tokenizer: self.tokenizer.clone(),
            order: (0..sentences.len()).collect(),
            sentences: Arc::new(sentences.to_vec()),
            charset: self.charset.clone(),
            batch_size: self.batch_size,
            noise_max_prob: self.noise_max_prob,
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
            seed,
            shuffle,
            replay,
        }
    }

    /// The noisy test inputs, identical across calls.
    pub fn test_inputs(&self) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(2));
        self.partitions
            .test
            .iter()
            .map(|sentence| add_noise(sentence, self.noise_max_prob, &self.charset, &mut rng))
            .collect()
    }

    /// The clean test sentences, aligned with [`test_inputs`](Self::test_inputs).
    pub fn test_ground_truth(&self) -> &[String] {
        &self.partitions.test
    }

    /// Finite stream of padded encoder inputs for the test partition.
    pub fn test_batches(&self) -> impl Iterator<Item = Result<Vec<Vec<i64>>>> + Send + 'static {
        let tokenizer = self.tokenizer.clone();
        let maxlen = tokenizer.maxlen();
        let chunks: Vec<Vec<String>> = self
            .test_inputs()
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        chunks.into_iter().map(move |chunk| {
            chunk
                .iter()
                .map(|sentence| Ok(pad_sequence(tokenizer.encode(sentence)?, maxlen)))
                .collect::<Result<Vec<_>>>()
        })
    }
}

/// Iterator over padded batches of one partition.
pub struct BatchStream<T> {
    tokenizer: Arc<T>,
    sentences: Arc<Vec<String>>,
    order: Vec<usize>,
    charset: Arc<Vec<char>>,
    batch_size: usize,
    noise_max_prob: f64,
    cursor: usize,
    rng: StdRng,
    seed: u64,
    /// Reshuffle the sentence order at the start of every pass.
    shuffle: bool,
    /// Restart the noise generator at the start of every pass.
    replay: bool,
}

impl<T: TextTokenizer> BatchStream<T> {
    fn make_batch(&mut self, indices: &[usize]) -> Result<Batch> {
        let maxlen = self.tokenizer.maxlen();
        let sos = self.tokenizer.sos();
        let eos = self.tokenizer.eos();

        let mut batch = Batch {
            encoder_inputs: Vec::with_capacity(indices.len()),
            decoder_inputs: Vec::with_capacity(indices.len()),
            labels: Vec::with_capacity(indices.len()),
        };
        for &i in indices {
            let target = &self.sentences[i];
            let noisy = add_noise(target, self.noise_max_prob, &self.charset, &mut self.rng);
            let target_ids = self.tokenizer.encode(target)?;

            let mut decoder_input = Vec::with_capacity(target_ids.len() + 1);
            decoder_input.push(sos);
            decoder_input.extend_from_slice(&target_ids);

            let mut label = target_ids;
            label.push(eos);

            batch.encoder_inputs.push(pad_sequence(self.tokenizer.encode(&noisy)?, maxlen));
            batch.decoder_inputs.push(pad_sequence(decoder_input, maxlen));
            batch.labels.push(pad_sequence(label, maxlen));
        }
        Ok(batch)
    }
}

impl<T: TextTokenizer> Iterator for BatchStream<T> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.sentences.is_empty() {
            return None;
        }
        if self.cursor == 0 {
            if self.replay {
                self.rng = StdRng::seed_from_u64(self.seed);
            }
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = if end == self.order.len() { 0 } else { end };

        Some(self.make_batch(&indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHARSET;
    use crate::tokenizer::CharsetTokenizer;

    fn partitions() -> Partitions {
        Partitions {
            train: (0..5).map(|i| format!("training sentence {}", i)).collect(),
            valid: vec!["a valid line".to_string(), "another one".to_string(), "third".to_string()],
            test: vec!["the test".to_string(), "of time".to_string()],
        }
    }

    fn generator(batch_size: usize) -> DataGenerator<CharsetTokenizer> {
        let tokenizer = Arc::new(CharsetTokenizer::new(DEFAULT_CHARSET, 30));
        DataGenerator::new(partitions(), tokenizer, DEFAULT_CHARSET, batch_size, 0.1, 7)
    }

    #[test]
    fn test_pad_sequence() {
        assert_eq!(pad_sequence(vec![4, 5], 4), vec![4, 5, 0, 0]);
        assert_eq!(pad_sequence(vec![4, 5, 6, 7, 8], 3), vec![4, 5, 6]);
    }

    #[test]
    fn test_rows_to_tensor_rejects_ragged_rows() {
        assert!(rows_to_tensor(&[vec![1, 2], vec![3]], Device::Cpu).is_err());
        let t = rows_to_tensor(&[vec![1, 2], vec![3, 4]], Device::Cpu).unwrap();
        assert_eq!(t.size(), &[2, 2]);
        assert_eq!(t.int64_value(&[1, 0]), 3);
    }

    #[test]
    fn test_add_noise_never_empties() {
        let charset: Vec<char> = DEFAULT_CHARSET.chars().collect();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            assert!(!add_noise("ab", 1.0, &charset, &mut rng).is_empty());
        }
        assert_eq!(add_noise("unchanged", 0.0, &charset, &mut rng), "unchanged");
        assert_eq!(add_noise("x", 1.0, &charset, &mut rng), "x");
    }

    #[test]
    fn test_batch_layout() -> Result<()> {
        let gen = generator(2);
        let tokenizer = CharsetTokenizer::new(DEFAULT_CHARSET, 30);
        let batch = gen.valid_batches().next().unwrap()?;
        assert_eq!(batch.len(), 2);

        let target = tokenizer.encode("a valid line")?;
        let decoder_input = &batch.decoder_inputs[0];
        let label = &batch.labels[0];
        assert_eq!(decoder_input.len(), tokenizer.maxlen());
        assert_eq!(decoder_input[0], tokenizer.sos());
        assert_eq!(&decoder_input[1..=target.len()], target.as_slice());
        assert_eq!(&label[..target.len()], target.as_slice());
        assert_eq!(label[target.len()], tokenizer.eos());
        assert!(label[target.len() + 1..].iter().all(|&id| id == PAD_ID));

        let (enc, dec, labels) = batch.to_tensors(Device::Cpu)?;
        assert_eq!(enc.size(), &[2, tokenizer.maxlen() as i64]);
        assert_eq!(dec.size(), labels.size());
        Ok(())
    }

    #[test]
    fn test_train_stream_is_endless() {
        let gen = generator(2);
        assert_eq!(gen.train_steps(), 3);
        let batches: Vec<Batch> = gen
            .train_batches()
            .take(10)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 10);
        // The last batch of each pass holds the remainder.
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn test_valid_stream_replays_each_pass() {
        let gen = generator(2);
        let steps = gen.valid_steps();
        let batches: Vec<Batch> = gen
            .valid_batches()
            .take(steps * 2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches[..steps], batches[steps..]);
    }

    #[test]
    fn test_test_batches_are_finite_and_stable() {
        let gen = generator(1);
        assert_eq!(gen.test_inputs(), gen.test_inputs());
        let batches: Vec<Vec<Vec<i64>>> = gen.test_batches().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), gen.test_steps());
        assert_eq!(gen.test_ground_truth(), &["the test".to_string(), "of time".to_string()]);
    }
}
