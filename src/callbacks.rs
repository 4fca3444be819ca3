//! Epoch-end hooks run by [`Transformer::fit`](crate::model::Transformer::fit).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tch::{nn, Tensor};
use tracing::{info, warn};

use crate::error::Result;
use crate::training::EpochLogs;

/// What a callback may read or change on the model between epochs.
pub struct TrainingState<'a> {
    pub var_store: &'a nn::VarStore,
    /// Multiplier on top of the learning-rate schedule.
    pub lr_scale: f64,
    /// Set to end training after the current epoch.
    pub stop_training: bool,
}

pub trait Callback {
    fn on_epoch_end(&mut self, logs: &EpochLogs, state: &mut TrainingState<'_>) -> Result<()>;

    fn on_train_end(&mut self, _state: &mut TrainingState<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    /// Accuracy-like metrics are maximised, everything else minimised.
    pub fn for_metric(name: &str) -> Self {
        if name.contains("acc") {
            MonitorMode::Max
        } else {
            MonitorMode::Min
        }
    }

    fn is_improvement(self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            MonitorMode::Min => current < best - min_delta,
            MonitorMode::Max => current > best + min_delta,
        }
    }
}

/// Tracks the best value seen for one metric.
#[derive(Debug, Clone)]
struct Monitor {
    metric: String,
    mode: MonitorMode,
    min_delta: f64,
    best: Option<f64>,
}

impl Monitor {
    fn new(metric: &str, min_delta: f64) -> Self {
        Self {
            metric: metric.to_string(),
            mode: MonitorMode::for_metric(metric),
            min_delta,
            best: None,
        }
    }

    /// `Some(improved)` for the epoch, or `None` when the metric is absent.
    fn observe(&mut self, logs: &EpochLogs, owner: &str) -> Option<bool> {
        let Some(current) = logs.metric(&self.metric) else {
            warn!(callback = owner, metric = %self.metric, "monitored metric not available, skipping");
            return None;
        };
        let improved = match self.best {
            None => true,
            Some(best) => self.mode.is_improvement(current, best, self.min_delta),
        };
        if improved {
            self.best = Some(current);
        }
        Some(improved)
    }
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Appends one `;`-separated row per epoch to a log file.
pub struct CsvLogger {
    path: PathBuf,
    file: Option<File>,
}

impl CsvLogger {
    pub const HEADER: &'static str = "epoch;accuracy;loss;lr;val_accuracy;val_loss";

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let is_new = fs::metadata(&self.path).map_or(true, |m| m.len() == 0);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if is_new {
            writeln!(file, "{}", Self::HEADER)?;
        }
        Ok(file)
    }
}

impl Callback for CsvLogger {
    fn on_epoch_end(&mut self, logs: &EpochLogs, _state: &mut TrainingState<'_>) -> Result<()> {
        let row = format!(
            "{};{};{};{};{};{}",
            logs.epoch,
            logs.accuracy,
            logs.loss,
            logs.learning_rate,
            format_metric(logs.val_accuracy),
            format_metric(logs.val_loss),
        );
        let file = match self.file.take() {
            Some(file) => file,
            None => self.open()?,
        };
        let file = self.file.insert(file);
        writeln!(file, "{}", row)?;
        file.flush()?;
        Ok(())
    }

    fn on_train_end(&mut self, _state: &mut TrainingState<'_>) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Saves the weights whenever the monitored metric improves.
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: Monitor,
}

impl ModelCheckpoint {
    pub fn new(path: impl AsRef<Path>, monitor: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            monitor: Monitor::new(monitor, 0.0),
        }
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, logs: &EpochLogs, state: &mut TrainingState<'_>) -> Result<()> {
        if self.monitor.observe(logs, "model_checkpoint") != Some(true) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        state.var_store.save(&self.path)?;
        info!(
            epoch = logs.epoch,
            metric = %self.monitor.metric,
            value = ?self.monitor.best,
            path = %self.path.display(),
            "saved checkpoint"
        );
        Ok(())
    }
}

/// Stops training once the monitored metric has not improved for `patience`
/// epochs, then restores the best weights seen.
pub struct EarlyStopping {
    monitor: Monitor,
    patience: usize,
    wait: usize,
    best_weights: Option<HashMap<String, Tensor>>,
}

impl EarlyStopping {
    pub fn new(monitor: &str, patience: usize) -> Self {
        Self {
            monitor: Monitor::new(monitor, 0.0),
            patience,
            wait: 0,
            best_weights: None,
        }
    }

    fn snapshot(var_store: &nn::VarStore) -> HashMap<String, Tensor> {
        var_store
            .variables()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.detach().copy()))
            .collect()
    }

    fn restore(var_store: &nn::VarStore, snapshot: &HashMap<String, Tensor>) -> Result<()> {
        tch::no_grad(|| -> Result<()> {
            for (name, mut variable) in var_store.variables() {
                if let Some(saved) = snapshot.get(&name) {
                    variable.f_copy_(saved)?;
                }
            }
            Ok(())
        })
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(&mut self, logs: &EpochLogs, state: &mut TrainingState<'_>) -> Result<()> {
        let Some(improved) = self.monitor.observe(logs, "early_stopping") else {
            return Ok(());
        };
        if improved {
            self.wait = 0;
            self.best_weights = Some(Self::snapshot(state.var_store));
            return Ok(());
        }

        self.wait += 1;
        if self.wait >= self.patience {
            state.stop_training = true;
            info!(epoch = logs.epoch, patience = self.patience, "early stopping");
            if let Some(best) = &self.best_weights {
                Self::restore(state.var_store, best)?;
                info!(metric = %self.monitor.metric, value = ?self.monitor.best, "restored best weights");
            }
        }
        Ok(())
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// improvement.
pub struct ReduceLrOnPlateau {
    monitor: Monitor,
    factor: f64,
    patience: usize,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(monitor: &str, factor: f64, patience: usize) -> Self {
        Self {
            monitor: Monitor::new(monitor, 0.0),
            factor,
            patience,
            wait: 0,
        }
    }
}

impl Callback for ReduceLrOnPlateau {
    fn on_epoch_end(&mut self, logs: &EpochLogs, state: &mut TrainingState<'_>) -> Result<()> {
        match self.monitor.observe(logs, "reduce_lr_on_plateau") {
            None => {}
            Some(true) => self.wait = 0,
            Some(false) => {
                self.wait += 1;
                if self.wait >= self.patience {
                    state.lr_scale *= self.factor;
                    self.wait = 0;
                    info!(
                        epoch = logs.epoch,
                        learning_rate = logs.learning_rate * self.factor,
                        "reducing learning rate"
                    );
                }
            }
        }
        Ok(())
    }
}

/// The standard training callbacks: CSV epoch log, best-weights checkpoint,
/// early stopping (patience 20) and plateau reduction (patience 10, factor 0.2).
pub fn get_callbacks(logdir: impl AsRef<Path>, checkpoint: &str, monitor: &str) -> Vec<Box<dyn Callback>> {
    let logdir = logdir.as_ref();
    vec![
        Box::new(CsvLogger::new(logdir.join("epochs.log"))),
        Box::new(ModelCheckpoint::new(logdir.join(checkpoint), monitor)),
        Box::new(EarlyStopping::new(monitor, 20)),
        Box::new(ReduceLrOnPlateau::new(monitor, 0.2, 10)),
    ]
}
