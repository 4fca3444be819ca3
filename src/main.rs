use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tch::Device;
use tracing::{info, warn};

use text_correction::callbacks::MonitorMode;
use text_correction::data::pad_sequence;
use text_correction::metrics::{ocr_metrics, Metrics};
use text_correction::{
    get_callbacks, logging, CharsetTokenizer, Config, DataGenerator, FitOptions, LanguageModel, Partitions,
    Strategy, TextTokenizer, Transform, Transformer,
};

/// Transformer text correction with statistical baselines.
#[derive(Parser)]
#[command(name = "text-correction", version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. `info`, `text_correction=debug`)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build train/valid/test partitions from `<source>/m2`
    Transform {
        #[arg(long)]
        source: PathBuf,
        /// Directory receiving train.txt, valid.txt and test.txt
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 128)]
        max_text_length: usize,
    },
    /// Train the Transformer on a partition directory
    Train {
        #[arg(long)]
        data: PathBuf,
        /// Directory for checkpoints, logs and the model summary
        #[arg(long)]
        output: PathBuf,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Constant learning rate instead of the warmup schedule
        #[arg(long)]
        learning_rate: Option<f64>,
    },
    /// Correct the test partition with a trained model and report CER/WER/SER
    Test {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Correct a single sentence with a trained model
    Infer {
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        sentence: String,
    },
    /// Correct the test partition with a statistical strategy
    Baseline {
        #[arg(long)]
        data: PathBuf,
        /// similarity, norvig or symspell
        #[arg(long)]
        mode: Strategy,
        /// N-gram size or maximum edit distance
        #[arg(short, default_value_t = 2)]
        n: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    match cli.command {
        Commands::Transform {
            source,
            output,
            max_text_length,
        } => transform(&source, &output, max_text_length),
        Commands::Train {
            data,
            output,
            config,
            epochs,
            batch_size,
            learning_rate,
        } => {
            let mut config = load_config(config.as_deref(), None)?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if learning_rate.is_some() {
                config.training.learning_rate = learning_rate;
            }
            config.validate()?;
            train(&data, &output, config)
        }
        Commands::Test { data, output, config } => {
            let config = load_config(config.as_deref(), Some(&output))?;
            test(&data, &output, config)
        }
        Commands::Infer {
            output,
            config,
            sentence,
        } => {
            let config = load_config(config.as_deref(), Some(&output))?;
            infer(&output, config, &sentence)
        }
        Commands::Baseline { data, mode, n } => baseline(&data, mode, n),
    }
}

/// An explicit file wins, then `config.json` saved by `train` in `output`, then defaults.
fn load_config(path: Option<&Path>, output: Option<&Path>) -> Result<Config> {
    let saved = output.map(|dir| dir.join("config.json")).filter(|p| p.is_file());
    match path.map(Path::to_path_buf).or(saved) {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            Config::from_file(&path).with_context(|| format!("reading config {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn transform(source: &Path, output: &Path, max_text_length: usize) -> Result<()> {
    let config = Config::default();
    let start = Instant::now();
    let partitions = Transform::new(source, &config.charset, max_text_length)
        .build()
        .with_context(|| format!("transforming {}", source.display()))?;

    for (name, lines) in [("train", &partitions.train), ("valid", &partitions.valid), ("test", &partitions.test)] {
        if lines.is_empty() {
            warn!(partition = name, "partition is empty");
        }
    }
    partitions.save(output)?;
    info!(total = partitions.total(), elapsed = ?start.elapsed(), "transform finished");
    Ok(())
}

fn build_model(config: &Config, tokenizer: Arc<CharsetTokenizer>) -> Result<Transformer<CharsetTokenizer>> {
    let device = Device::cuda_if_available();
    info!(?device, "using device");
    let mut model = Transformer::new(config.model.clone(), tokenizer, device)?;
    model.compile(config.training.learning_rate)?;
    Ok(model)
}

fn load_generator(data: &Path, config: &Config, tokenizer: Arc<CharsetTokenizer>) -> Result<DataGenerator<CharsetTokenizer>> {
    let partitions = Partitions::load(data).with_context(|| format!("loading partitions from {}", data.display()))?;
    Ok(DataGenerator::new(
        partitions,
        tokenizer,
        &config.charset,
        config.training.batch_size,
        config.training.noise_max_prob,
        config.training.seed,
    ))
}

fn train(data: &Path, output: &Path, config: Config) -> Result<()> {
    let training = config.training.clone();
    let tokenizer = Arc::new(CharsetTokenizer::new(&config.charset, training.max_text_length));
    let generator = load_generator(data, &config, tokenizer.clone())?;

    let mut model = build_model(&config, tokenizer)?;
    model.load_checkpoint(output.join(&training.checkpoint))?;
    model.write_summary(output, "summary.txt")?;
    config.save(output.join("config.json"))?;

    let options = FitOptions {
        steps_per_epoch: generator.train_steps(),
        epochs: training.epochs,
        validation_steps: generator.valid_steps(),
        max_queue_size: training.max_queue_size,
        initial_epoch: 0,
    };
    if options.steps_per_epoch == 0 {
        bail!("training partition in {} is empty", data.display());
    }
    let validation = (options.validation_steps > 0).then(|| generator.valid_batches());
    let mut callbacks = get_callbacks(output, &training.checkpoint, &training.monitor);

    let start = Instant::now();
    let history = model.fit(generator.train_batches(), validation, &options, &mut callbacks)?;
    let elapsed = start.elapsed();

    let epochs = history.epochs.len().max(1);
    let scored = history
        .epochs
        .iter()
        .filter_map(|e| e.metric(&training.monitor).map(|v| (e.epoch, v)));
    let best = match MonitorMode::for_metric(&training.monitor) {
        MonitorMode::Min => scored.min_by(|a, b| a.1.total_cmp(&b.1)),
        MonitorMode::Max => scored.max_by(|a, b| a.1.total_cmp(&b.1)),
    };
    let report = format!(
        "Total train sentences:      {}\nTotal validation sentences: {}\nBatch:                      {}\n\n\
         Total time:           {:?}\nTime per epoch:       {:?}\n\n\
         Total epochs:         {}\nBest epoch:           {}\nBest {}: {}\n",
        generator.partitions().train.len(),
        generator.partitions().valid.len(),
        training.batch_size,
        elapsed,
        elapsed / epochs as u32,
        history.epochs.len(),
        best.map_or("-".to_string(), |(epoch, _)| (epoch + 1).to_string()),
        training.monitor,
        best.map_or("-".to_string(), |(_, value)| format!("{:.8}", value)),
    );
    fs::write(output.join("train.txt"), &report)?;
    info!(epochs = history.epochs.len(), ?elapsed, "training finished");
    Ok(())
}

fn report_metrics(dir: &Path, metrics: &Metrics, elapsed: std::time::Duration) -> Result<()> {
    info!(cer = metrics.cer, wer = metrics.wer, ser = metrics.ser, ?elapsed, "evaluation");
    let report = format!(
        "Total time:           {:?}\n\nMetrics:\nCharacter Error Rate: {:.8}\nWord Error Rate:      {:.8}\nSequence Error Rate:  {:.8}\n",
        elapsed, metrics.cer, metrics.wer, metrics.ser
    );
    fs::write(dir.join("evaluate.txt"), report)?;
    Ok(())
}

fn test(data: &Path, output: &Path, config: Config) -> Result<()> {
    let training = config.training.clone();
    let tokenizer = Arc::new(CharsetTokenizer::new(&config.charset, training.max_text_length));
    let generator = load_generator(data, &config, tokenizer.clone())?;

    let mut model = build_model(&config, tokenizer)?;
    let checkpoint = output.join(&training.checkpoint);
    if !model.load_checkpoint(&checkpoint)? {
        bail!("no checkpoint at {}", checkpoint.display());
    }

    let start = Instant::now();
    let predicts = model.predict(generator.test_batches(), generator.test_steps(), training.max_queue_size, true)?;
    let elapsed = start.elapsed();

    fs::write(output.join("predict.txt"), predicts.join("\n") + "\n")?;
    let metrics = ocr_metrics(&predicts, generator.test_ground_truth())?;
    report_metrics(output, &metrics, elapsed)
}

fn infer(output: &Path, config: Config, sentence: &str) -> Result<()> {
    let tokenizer = Arc::new(CharsetTokenizer::new(&config.charset, config.training.max_text_length));
    let mut model = build_model(&config, tokenizer.clone())?;
    let checkpoint = output.join(&config.training.checkpoint);
    if !model.load_checkpoint(&checkpoint)? {
        bail!("no checkpoint at {}", checkpoint.display());
    }

    let ids = pad_sequence(tokenizer.encode(sentence)?, tokenizer.maxlen());
    println!("{}", model.infer(&ids)?);
    Ok(())
}

fn baseline(data: &Path, strategy: Strategy, n: usize) -> Result<()> {
    let config = Config::default();
    let tokenizer = Arc::new(CharsetTokenizer::new(&config.charset, config.training.max_text_length));
    let generator = load_generator(data, &config, tokenizer)?;

    let workdir = data.join(strategy.name());
    fs::create_dir_all(&workdir)?;
    let corpus_path = workdir.join("corpus.txt");

    let mut model = LanguageModel::new(strategy, data, n);
    let corpus = model.create_corpus(&generator.partitions().train);
    fs::write(&corpus_path, corpus)?;
    model.read_corpus(&corpus_path)?;

    let start = Instant::now();
    let predicts = model.autocorrect(&generator.test_inputs())?;
    let elapsed = start.elapsed();

    fs::write(workdir.join("predict.txt"), predicts.join("\n") + "\n")?;
    let metrics = ocr_metrics(&predicts, generator.test_ground_truth())?;
    report_metrics(&workdir, &metrics, elapsed)
}
