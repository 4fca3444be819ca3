use tch::Tensor;
use tracing::info;

use crate::error::Result;
use crate::model::Transformer;
use crate::prefetch::Prefetcher;
use crate::tokenizer::TextTokenizer;

impl<T: TextTokenizer> Transformer<T> {
    /// Corrects one encoded sentence by greedy decoding and returns the
    /// decoded text with whitespace collapsed.
    pub fn infer(&self, sentence: &[i64]) -> Result<String> {
        let ids = self.infer_ids(sentence)?;
        let text = self.tokenizer.decode(&ids)?;
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    /// Greedy decoding, returning the predicted ids.
    ///
    /// The sentence is encoded once. Starting from `[SOS]`, the decoder is run
    /// up to `maxlen` times and the argmax of the last position is appended,
    /// until that token is EOS or the decoder input has grown longer than the
    /// sentence. The leading SOS and any id outside the vocabulary are dropped.
    pub fn infer_ids(&self, sentence: &[i64]) -> Result<Vec<i64>> {
        let model = self.compiled()?;
        if sentence.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = tch::no_grad_guard();

        let sos = self.tokenizer.sos();
        let eos = self.tokenizer.eos();
        let vocab_size = self.tokenizer.vocab_size();

        let enc_input = Tensor::from_slice(sentence).unsqueeze(0).to_device(self.device);
        let (enc_outputs, enc_padding_mask) = model.encoder.forward_t(&enc_input, false)?;

        let mut dec_input = vec![sos];
        for _ in 0..self.tokenizer.maxlen() {
            let dec = Tensor::from_slice(&dec_input).unsqueeze(0).to_device(self.device);
            let logits = model
                .decoder
                .forward_t(&dec, &enc_outputs, &enc_padding_mask, false)?;
            let predicted = logits.select(1, -1).argmax(-1, false).int64_value(&[0]);

            if dec_input.len() > sentence.len() || predicted == eos {
                break;
            }
            dec_input.push(predicted);
        }

        Ok(dec_input
            .into_iter()
            .skip(1)
            .filter(|&id| id < vocab_size && id != sos)
            .collect())
    }

    /// Runs [`infer`](Self::infer) over `steps` batches of encoded sentences.
    ///
    /// Batches are prefetched on a background thread that is stopped before
    /// this returns, on success or failure. Predictions keep stream order.
    pub fn predict<I>(&self, batches: I, steps: usize, max_queue_size: usize, verbose: bool) -> Result<Vec<String>>
    where
        I: Iterator<Item = Result<Vec<Vec<i64>>>> + Send + 'static,
    {
        self.compiled()?;
        let mut prefetcher = Prefetcher::spawn("predict-batches", batches, max_queue_size)?;
        let result = self.predict_prefetched(&prefetcher, steps, verbose);
        prefetcher.stop();
        result
    }

    fn predict_prefetched(
        &self,
        prefetcher: &Prefetcher<Result<Vec<Vec<i64>>>>,
        steps: usize,
        verbose: bool,
    ) -> Result<Vec<String>> {
        let mut predicts = Vec::new();
        for step in 0..steps {
            let batch = prefetcher.next_batch(step, steps)?;
            for sentence in &batch {
                predicts.push(self.infer(sentence)?);
            }
            if verbose {
                info!(step = step + 1, steps, "predicted batch");
            }
        }
        Ok(predicts)
    }
}
