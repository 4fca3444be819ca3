use tch::{Kind, Reduction, Tensor};
use tracing::{debug, info, warn};

use crate::callbacks::{Callback, TrainingState};
use crate::data::Batch;
use crate::error::{Error, Result};
use crate::model::Transformer;
use crate::prefetch::Prefetcher;
use crate::tokenizer::{TextTokenizer, PAD_ID};

fn check_label_shape(logits: &Tensor, labels: &Tensor) -> Result<()> {
    let logits_shape = logits.size();
    let labels_shape = labels.size();
    if logits_shape.len() != 3 || labels_shape[..] != logits_shape[..2] {
        let mut expected = labels_shape.clone();
        expected.push(-1);
        return Err(Error::ShapeMismatch {
            expected,
            got: logits_shape,
        });
    }
    Ok(())
}

/// Cross-entropy over `logits` (`[batch, seq_len, vocab]`) and `labels`
/// (`[batch, seq_len]`), with pad positions zeroed and the mean taken over
/// every position.
pub fn loss_function(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    check_label_shape(logits, labels)?;
    let vocab_size = logits.size()[2];
    let labels = labels.reshape([-1i64]);

    let per_token = logits.reshape([-1, vocab_size]).cross_entropy_loss::<Tensor>(
        &labels,
        None,
        Reduction::None,
        -100,
        0.0,
    );
    let mask = labels.ne(PAD_ID).to_kind(Kind::Float);
    Ok((per_token * mask).mean(Kind::Float))
}

/// Fraction of positions, padding included, whose argmax matches the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    check_label_shape(logits, labels)?;
    Ok(logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .to_kind(Kind::Float)
        .mean(Kind::Float))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// Metrics of one finished epoch. `epoch` counts from 0.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochLogs {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub learning_rate: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

impl EpochLogs {
    /// Looks a metric up by its log name (`loss`, `accuracy`, `lr`, `val_loss`, `val_accuracy`).
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "loss" => Some(self.loss),
            "accuracy" => Some(self.accuracy),
            "lr" => Some(self.learning_rate),
            "val_loss" => self.val_loss,
            "val_accuracy" => self.val_accuracy,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
}

impl History {
    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    pub steps_per_epoch: usize,
    pub epochs: usize,
    pub validation_steps: usize,
    pub max_queue_size: usize,
    pub initial_epoch: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            steps_per_epoch: 1,
            epochs: 1,
            validation_steps: 0,
            max_queue_size: 10,
            initial_epoch: 0,
        }
    }
}

#[derive(Default)]
struct Running {
    loss: f64,
    accuracy: f64,
    steps: usize,
}

impl Running {
    fn add(&mut self, metrics: StepMetrics) {
        self.loss += metrics.loss;
        self.accuracy += metrics.accuracy;
        self.steps += 1;
    }

    fn mean(&self) -> StepMetrics {
        let n = self.steps.max(1) as f64;
        StepMetrics {
            loss: self.loss / n,
            accuracy: self.accuracy / n,
        }
    }
}

impl<T: TextTokenizer> Transformer<T> {
    /// One optimizer step on `batch`. The step counter starts at 1.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let (enc_inputs, dec_inputs, labels) = batch.to_tensors(self.device)?;
        let model = self.compiled_mut()?;

        model.step += 1;
        let learning_rate = model.current_learning_rate();
        model.optimizer.set_lr(learning_rate);

        let logits = model.forward_t(&enc_inputs, &dec_inputs, true)?;
        let loss = loss_function(&logits, &labels)?;
        model.optimizer.backward_step(&loss);

        let acc = tch::no_grad(|| accuracy(&logits, &labels))?;
        Ok(StepMetrics {
            loss: loss.double_value(&[]),
            accuracy: acc.double_value(&[]),
        })
    }

    /// Loss and accuracy on `batch` without dropout or gradient tracking.
    pub fn evaluate(&self, batch: &Batch) -> Result<StepMetrics> {
        let (enc_inputs, dec_inputs, labels) = batch.to_tensors(self.device)?;
        let model = self.compiled()?;
        let _guard = tch::no_grad_guard();

        let logits = model.forward_t(&enc_inputs, &dec_inputs, false)?;
        Ok(StepMetrics {
            loss: loss_function(&logits, &labels)?.double_value(&[]),
            accuracy: accuracy(&logits, &labels)?.double_value(&[]),
        })
    }

    /// Trains for `options.epochs` epochs of `options.steps_per_epoch` batches.
    ///
    /// Both streams are drained through background [`Prefetcher`]s, which are
    /// stopped before this returns, whether training finished, was stopped by a
    /// callback or failed. A stream ending early yields `ProducerClosed`.
    pub fn fit<I, V>(
        &mut self,
        train: I,
        validation: Option<V>,
        options: &FitOptions,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<History>
    where
        I: Iterator<Item = Result<Batch>> + Send + 'static,
        V: Iterator<Item = Result<Batch>> + Send + 'static,
    {
        self.compiled()?;
        let mut train = Prefetcher::spawn("train-batches", train, options.max_queue_size)?;
        let mut validation = match validation {
            Some(stream) => Some(Prefetcher::spawn("valid-batches", stream, options.max_queue_size)?),
            None => None,
        };

        let result = self.run_epochs(&train, validation.as_ref(), options, callbacks);

        train.stop();
        if let Some(validation) = validation.as_mut() {
            validation.stop();
        }
        result
    }

    fn run_epochs(
        &mut self,
        train: &Prefetcher<Result<Batch>>,
        validation: Option<&Prefetcher<Result<Batch>>>,
        options: &FitOptions,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<History> {
        let mut history = History::default();
        if validation.is_some() && options.validation_steps == 0 {
            warn!("validation stream given with zero validation steps, skipping validation");
        }

        for epoch in options.initial_epoch..options.epochs {
            let mut running = Running::default();
            for step in 0..options.steps_per_epoch {
                let batch = train.next_batch(step, options.steps_per_epoch)?;
                let metrics = self.train_step(&batch)?;
                debug!(epoch, step, loss = metrics.loss, accuracy = metrics.accuracy, "train step");
                running.add(metrics);
            }
            let train_metrics = running.mean();

            let val_metrics = match validation {
                Some(stream) if options.validation_steps > 0 => {
                    let mut running = Running::default();
                    for step in 0..options.validation_steps {
                        let batch = stream.next_batch(step, options.validation_steps)?;
                        running.add(self.evaluate(&batch)?);
                    }
                    Some(running.mean())
                }
                _ => None,
            };

            let model = self.compiled_mut()?;
            let logs = EpochLogs {
                epoch,
                loss: train_metrics.loss,
                accuracy: train_metrics.accuracy,
                learning_rate: model.current_learning_rate(),
                val_loss: val_metrics.map(|m| m.loss),
                val_accuracy: val_metrics.map(|m| m.accuracy),
            };
            info!(
                epoch = epoch + 1,
                epochs = options.epochs,
                loss = logs.loss,
                accuracy = logs.accuracy,
                val_loss = ?logs.val_loss,
                val_accuracy = ?logs.val_accuracy,
                lr = logs.learning_rate,
                "epoch finished"
            );

            let mut state = TrainingState {
                var_store: &model.var_store,
                lr_scale: model.lr_scale,
                stop_training: false,
            };
            for callback in callbacks.iter_mut() {
                callback.on_epoch_end(&logs, &mut state)?;
            }
            let (lr_scale, stop_training) = (state.lr_scale, state.stop_training);
            model.lr_scale = lr_scale;
            history.epochs.push(logs);

            if stop_training {
                info!(epoch, "training stopped by callback");
                break;
            }
        }

        let model = self.compiled()?;
        let mut state = TrainingState {
            var_store: &model.var_store,
            lr_scale: model.lr_scale,
            stop_training: false,
        };
        for callback in callbacks.iter_mut() {
            callback.on_train_end(&mut state)?;
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::get_callbacks;
    use crate::test_util::{tiny_config, tiny_transformer, DigitTokenizer};
    use std::sync::Arc;
    use tch::Device;

    type Stream = std::vec::IntoIter<Result<Batch>>;

    fn copy_batch() -> Batch {
        Batch {
            encoder_inputs: vec![vec![4, 5, 6, 0, 0, 0], vec![7, 8, 0, 0, 0, 0]],
            decoder_inputs: vec![vec![1, 4, 5, 6, 0, 0], vec![1, 7, 8, 0, 0, 0]],
            labels: vec![vec![4, 5, 6, 2, 0, 0], vec![7, 8, 2, 0, 0, 0]],
        }
    }

    fn batches(n: usize) -> Stream {
        (0..n).map(|_| Ok(copy_batch())).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_loss_ignores_padding() -> Result<()> {
        let logits = Tensor::zeros([1, 3, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice2(&[&[1i64, 2, 0]]);
        let loss = loss_function(&logits, &labels)?.double_value(&[]);
        // Uniform logits give ln(4) per real token; the pad position counts as 0.
        let expected = 2.0 * 4f64.ln() / 3.0;
        assert!((loss - expected).abs() < 1e-5, "loss {} != {}", loss, expected);
        Ok(())
    }

    #[test]
    fn test_loss_rejects_mismatched_labels() {
        let logits = Tensor::zeros([1, 3, 4], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice2(&[&[1i64, 2]]);
        assert!(matches!(loss_function(&logits, &labels), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_accuracy_counts_every_position() -> Result<()> {
        let logits = Tensor::from_slice(&[0.0f32, 0.0, 9.0, 0.0, 9.0, 0.0]).view([1, 2, 3]);
        let labels = Tensor::from_slice2(&[&[2i64, 0]]);
        assert!((accuracy(&logits, &labels)?.double_value(&[]) - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_epoch_logs_metric_lookup() {
        let logs = EpochLogs {
            epoch: 0,
            loss: 1.5,
            accuracy: 0.25,
            learning_rate: 0.001,
            val_loss: None,
            val_accuracy: Some(0.5),
        };
        assert_eq!(logs.metric("loss"), Some(1.5));
        assert_eq!(logs.metric("lr"), Some(0.001));
        assert_eq!(logs.metric("val_loss"), None);
        assert_eq!(logs.metric("val_accuracy"), Some(0.5));
        assert_eq!(logs.metric("bleu"), None);
    }

    #[test]
    fn test_train_step_reduces_loss() -> Result<()> {
        let mut model = tiny_transformer(10, 6)?;
        let batch = copy_batch();
        let first = model.train_step(&batch)?;
        let mut last = first;
        for _ in 0..40 {
            last = model.train_step(&batch)?;
        }
        assert!(last.loss < first.loss, "loss went from {} to {}", first.loss, last.loss);
        assert_eq!(model.compiled()?.step, 41);
        Ok(())
    }

    #[test]
    fn test_train_step_requires_compile() {
        let mut model = Transformer::new(tiny_config(), Arc::new(DigitTokenizer::new(10, 6)), Device::Cpu).unwrap();
        assert!(matches!(model.train_step(&copy_batch()), Err(Error::NotCompiled)));
    }

    #[test]
    fn test_fit_with_validation_and_callbacks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut model = tiny_transformer(10, 6)?;
        let mut callbacks = get_callbacks(dir.path(), "weights.ot", "val_loss");
        let options = FitOptions {
            steps_per_epoch: 2,
            epochs: 3,
            validation_steps: 1,
            max_queue_size: 2,
            initial_epoch: 0,
        };

        let train = std::iter::repeat_with(|| Ok(copy_batch()));
        let validation = std::iter::repeat_with(|| Ok(copy_batch()));
        let history = model.fit(train, Some(validation), &options, &mut callbacks)?;

        assert_eq!(history.epochs.len(), 3);
        assert!(history.epochs.iter().all(|e| e.val_loss.is_some()));
        assert_eq!(history.last().map(|e| e.epoch), Some(2));

        let log = std::fs::read_to_string(dir.path().join("epochs.log"))?;
        assert_eq!(log.lines().count(), 4);
        assert!(log.starts_with("epoch;accuracy;loss;lr;val_accuracy;val_loss"));
        assert!(dir.path().join("weights.ot").is_file());
        Ok(())
    }

    #[test]
    fn test_fit_without_validation() -> Result<()> {
        let mut model = tiny_transformer(10, 6)?;
        let options = FitOptions {
            steps_per_epoch: 2,
            epochs: 2,
            ..FitOptions::default()
        };
        let history = model.fit(batches(4), None::<Stream>, &options, &mut [])?;
        assert_eq!(history.epochs.len(), 2);
        assert!(history.epochs.iter().all(|e| e.val_loss.is_none()));
        Ok(())
    }

    #[test]
    fn test_fit_reports_short_stream() -> Result<()> {
        let mut model = tiny_transformer(10, 6)?;
        let options = FitOptions {
            steps_per_epoch: 3,
            epochs: 1,
            ..FitOptions::default()
        };
        match model.fit(batches(1), None::<Stream>, &options, &mut []) {
            Err(Error::ProducerClosed { received, expected }) => assert_eq!((received, expected), (1, 3)),
            other => panic!("expected ProducerClosed, got {:?}", other.map(|h| h.epochs.len())),
        }
        Ok(())
    }

    struct StopAfterFirst;

    impl Callback for StopAfterFirst {
        fn on_epoch_end(&mut self, _logs: &EpochLogs, state: &mut TrainingState<'_>) -> Result<()> {
            state.lr_scale = 0.5;
            state.stop_training = true;
            Ok(())
        }
    }

    #[test]
    fn test_callback_state_is_applied() -> Result<()> {
        let mut model = tiny_transformer(10, 6)?;
        let options = FitOptions {
            steps_per_epoch: 1,
            epochs: 5,
            ..FitOptions::default()
        };
        let mut callbacks: Vec<Box<dyn Callback>> = vec![Box::new(StopAfterFirst)];
        let history = model.fit(
            std::iter::repeat_with(|| Ok(copy_batch())),
            None::<Stream>,
            &options,
            &mut callbacks,
        )?;
        assert_eq!(history.epochs.len(), 1);
        assert_eq!(model.compiled()?.lr_scale, 0.5);
        Ok(())
    }
}
