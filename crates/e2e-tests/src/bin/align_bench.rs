use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;

use e2e_tests::{random_document, HIDDEN_SIZE, NUM_HIDDEN_STATES};
use embed_transformer::mock::{MockModel, MockTokenizer};
use embed_transformer::{load_bert, parse_pooling, TokenEmbeddings, TransformerWordEmbeddings};
use embed_types::{ContextMode, Document, EmbedSettings};

const ALPHABET: [char; 8] = ['a', 'e', 'i', 'n', 'r', 's', 't', 'o'];
const MOCK_MORPHS: [&str; 6] = ["an", "er", "in", "st", "tion", "es"];

#[derive(Parser, Debug)]
#[command(name = "align_bench", about = "Token alignment and windowing benchmark")]
struct Args {
    /// Settings file; defaults and EMBED_* variables apply as usual
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Pooling rule: first, last, first_last or mean
    #[arg(long)]
    pooling: Option<String>,
    #[arg(long, default_value_t = 20)]
    documents: usize,
    #[arg(long, default_value_t = 12)]
    sentences: usize,
    #[arg(long, default_value_t = 40)]
    max_words: usize,
    /// Model maximum length for the mock tokenizer
    #[arg(long, default_value_t = 512)]
    max_length: usize,
    #[arg(long, default_value_t = 3)]
    iterations: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Run the BERT checkpoint named in the settings instead of the mock model
    #[arg(long)]
    real_model: bool,
    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_settings: bool,
    /// Also write the results as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum ModeArg {
    Sentence,
    DocumentSliding,
    DocumentContext,
}

impl From<ModeArg> for ContextMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sentence => ContextMode::Sentence,
            ModeArg::DocumentSliding => ContextMode::DocumentSliding,
            ModeArg::DocumentContext => ContextMode::DocumentContext,
        }
    }
}

#[derive(Debug, Serialize)]
struct BenchmarkOutput {
    provider: String,
    mode: ContextMode,
    documents: usize,
    tokens: usize,
    iterations: usize,
    embedding_length: usize,
    p50_ms: f64,
    p90_ms: f64,
    p99_ms: f64,
    tokens_per_sec: f64,
    zero_vector_tokens: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = EmbedSettings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(mode) = args.mode {
        settings.transformer.context_mode = mode.into();
    }
    if let Some(pooling) = &args.pooling {
        settings.transformer.pooling = parse_pooling(pooling)?;
    }

    if args.print_settings {
        let rendered = toml::to_string_pretty(&settings).context("Failed to render settings")?;
        println!("{}", rendered);
        return Ok(());
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let provider = build_provider(&args, &settings)?;
    info!(
        name = provider.name(),
        dim = provider.embedding_length(),
        mode = ?settings.transformer.context_mode,
        "Benchmark provider ready"
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let corpus: Vec<Document> = (0..args.documents)
        .map(|_| random_document(&mut rng, &ALPHABET, args.sentences, args.max_words, 9))
        .collect();
    let tokens: usize = corpus
        .iter()
        .flat_map(|d| d.sentences())
        .map(|s| s.len())
        .sum();

    let mut samples_ms = Vec::with_capacity(args.iterations * corpus.len());
    let mut total_secs = 0.0;
    let mut zero_vector_tokens = 0;
    for iteration in 0..args.iterations {
        let mut documents = corpus.clone();
        for document in &mut documents {
            let started = Instant::now();
            provider
                .embed_document(document)
                .context("Embedding a document failed")?;
            let elapsed = started.elapsed();
            samples_ms.push(elapsed.as_secs_f64() * 1000.0);
            total_secs += elapsed.as_secs_f64();
        }
        if iteration == 0 {
            zero_vector_tokens = count_zero_vectors(&documents, provider.name());
        }
    }
    samples_ms.sort_by(|a, b| a.total_cmp(b));

    let output = BenchmarkOutput {
        provider: provider.name().to_string(),
        mode: settings.transformer.context_mode,
        documents: corpus.len(),
        tokens,
        iterations: args.iterations,
        embedding_length: provider.embedding_length(),
        p50_ms: percentile(&samples_ms, 50.0),
        p90_ms: percentile(&samples_ms, 90.0),
        p99_ms: percentile(&samples_ms, 99.0),
        tokens_per_sec: if total_secs > 0.0 {
            (tokens * args.iterations) as f64 / total_secs
        } else {
            0.0
        },
        zero_vector_tokens,
    };

    println!("{}", render_table(&output));
    if let Some(path) = &args.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialize results")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

fn build_provider(args: &Args, settings: &EmbedSettings) -> Result<Box<dyn TokenEmbeddings>> {
    if args.real_model {
        let (tokenizer, model) = load_bert(settings).context("Failed to load model")?;
        let provider = TransformerWordEmbeddings::new(tokenizer, model, settings.transformer.clone())
            .context("Invalid transformer settings")?;
        return Ok(Box::new(provider));
    }

    let tokenizer = MockTokenizer::bert(args.max_length).with_morphs(&MOCK_MORPHS);
    let model = MockModel::new(NUM_HIDDEN_STATES, HIDDEN_SIZE);
    let provider = TransformerWordEmbeddings::new(tokenizer, model, settings.transformer.clone())
        .context("Invalid transformer settings")?;
    Ok(Box::new(provider))
}

/// Tokens whose vector is all zeros: dropped or truncated by the tokenizer.
fn count_zero_vectors(documents: &[Document], name: &str) -> usize {
    documents
        .iter()
        .flat_map(|d| d.sentences())
        .flat_map(|s| s.tokens())
        .filter(|t| {
            t.embedding(name)
                .map(|v| v.iter().all(|&x| x == 0.0))
                .unwrap_or(true)
        })
        .count()
}

fn percentile(values: &[f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (percentile / 100.0) * (values.len() as f64 - 1.0);
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        values[low]
    } else {
        let weight = rank - low as f64;
        values[low] + (values[high] - values[low]) * weight
    }
}

fn render_table(output: &BenchmarkOutput) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "Alignment Benchmark (provider={}, mode={:?}, documents={}, tokens={}, iterations={})",
        output.provider, output.mode, output.documents, output.tokens, output.iterations
    ));
    lines.push("dim\tp50_ms\tp90_ms\tp99_ms\ttokens_per_sec\tzero_vectors".to_string());
    lines.push(format!(
        "{}\t{:.2}\t{:.2}\t{:.2}\t{:.0}\t{}",
        output.embedding_length,
        output.p50_ms,
        output.p90_ms,
        output.p99_ms,
        output.tokens_per_sec,
        output.zero_vector_tokens
    ));
    lines.join("\n")
}
