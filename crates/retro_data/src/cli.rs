//! Command-line tools for inspecting split matrices, Retro samples and
//! tensor-logger dumps.

use crate::config::{Blend, GptDatasetConfig};
use crate::dataset::Dataset;
use crate::multi_split::{multi_split_train_valid_test_datasets_provider, MultiSplitGptDatasetConfig};
use crate::sample::{DOCUMENT_IDS, TEXT};
use crate::split::{
    convert_split_vector_to_split_matrix, format_split_matrix, parse_and_normalize_split,
    split_vectors_close, Split,
};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tensor_logging::load_logged_tensors;

#[derive(Parser, Debug)]
#[command(
    name = "retro-data",
    version,
    about = "Inspect Retro dataset splits, samples and logged tensors."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the split matrix reconciling a pretraining split with the preprocessing split
    SplitMatrix(SplitMatrixArgs),
    /// List the labels and shapes stored in a tensor-logger dump
    InspectLoggedTensors(InspectArgs),
    /// Print one sample of a Retro dataset
    Sample(SampleArgs),
}

#[derive(Args, Debug)]
pub struct SplitMatrixArgs {
    #[arg(long)]
    pub split: String,
    #[arg(long)]
    pub split_preprocessing: String,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SampleArgs {
    /// Corpus prefix, or `weight prefix` pairs
    #[arg(long, num_args = 1.., required = true)]
    pub data_prefix: Vec<String>,
    #[arg(long)]
    pub split: String,
    #[arg(long)]
    pub split_preprocessing: String,
    #[arg(long)]
    pub seq_len: usize,
    #[arg(long, default_value_t = 0)]
    pub index: usize,
    /// Which split to sample from
    #[arg(long, value_enum, default_value_t = SplitArg::Train)]
    pub from_split: SplitArg,
    #[arg(long, default_value_t = 1)]
    pub num_samples: usize,
    #[arg(long, default_value_t = 1234)]
    pub seed: u64,
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitArg {
    Train,
    Valid,
    Test,
}

impl From<SplitArg> for Split {
    fn from(split: SplitArg) -> Self {
        match split {
            SplitArg::Train => Split::Train,
            SplitArg::Valid => Split::Valid,
            SplitArg::Test => Split::Test,
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::SplitMatrix(args) => run_split_matrix(args),
            Commands::InspectLoggedTensors(args) => run_inspect(args),
            Commands::Sample(args) => run_sample(args),
        }
    }
}

fn run_split_matrix(args: SplitMatrixArgs) -> Result<()> {
    let split = parse_and_normalize_split(&args.split)?;
    let preprocessing = parse_and_normalize_split(&args.split_preprocessing)?;
    let matrix = if split_vectors_close(&split, &preprocessing) {
        convert_split_vector_to_split_matrix(&split, None)
    } else {
        convert_split_vector_to_split_matrix(&split, Some(&preprocessing))
    };
    println!("{}", format_split_matrix(&matrix));
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let tensors = load_logged_tensors(&args.path)?;
    for logged in &tensors {
        println!(
            "{}\t{:?}\t{:?}",
            logged.label,
            logged.tensor.size(),
            logged.tensor.kind()
        );
    }
    tracing::info!("{} tensors in {}", tensors.len(), args.path.display());
    Ok(())
}

fn run_sample(args: SampleArgs) -> Result<()> {
    let from_split = Split::from(args.from_split);

    let mut base = GptDatasetConfig::builder()
        .random_seed(args.seed)
        .sequence_length(args.seq_len)
        .blend(Blend::parse(&args.data_prefix)?)
        .split(&args.split);
    if let Some(cache_dir) = &args.cache_dir {
        base = base.path_to_cache(cache_dir);
    }
    let config = MultiSplitGptDatasetConfig::builder(base)
        .return_document_ids(true)
        .split_preprocessing(&args.split_preprocessing)
        .build()?;

    let mut sizes = [0; 3];
    sizes[from_split.index()] = args.num_samples.max(args.index + 1);
    let datasets = multi_split_train_valid_test_datasets_provider(Arc::new(config), sizes)?;
    let dataset = datasets[from_split.index()]
        .as_ref()
        .ok_or_else(|| anyhow!("The {} split is empty for split {}", from_split, args.split))?;

    let sample = dataset.get(args.index)?;
    println!("{}: {:?}", TEXT, sample.to_vec_i64(TEXT)?);
    println!("{}: {:?}", DOCUMENT_IDS, sample.to_vec_i64(DOCUMENT_IDS)?);
    Ok(())
}
