use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use clap::Parser;
use scada_prep::{
    init_logging, log_app_start, logging_config_from_env, CheckpointStore, FixedOffsetEstimator,
    MemoryCheckpointStore, Pipeline, PipelineConfig, SqliteCheckpointStore,
    WakeAlignmentEstimator, WideTable,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Clean and normalize wide wind-farm SCADA tables",
    long_about = None
)]
struct Cli {
    /// Wide CSV with a `time` column and `{feature}_{turbine}` columns.
    #[arg(long, env = "SCADA_INPUT")]
    input: PathBuf,
    /// Pipeline JSON; the built-in default pipeline is used when absent.
    #[arg(long, env = "SCADA_CONFIG")]
    config: Option<PathBuf>,
    /// SQLite file for stage checkpoints; checkpoints stay in memory when absent.
    #[arg(long, env = "SCADA_CHECKPOINT_DB")]
    checkpoint_db: Option<PathBuf>,
    #[arg(long, env = "SCADA_OUTPUT")]
    output: PathBuf,
    #[arg(long, env = "SCADA_NORMALIZATION_OUT")]
    normalization_out: Option<PathBuf>,
    /// Per-pair Northing offsets in degrees, e.g. `2.5,3.1`.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    northing_offsets: Option<Vec<f64>>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    let pipeline = Pipeline::new(config)?;

    let input = WideTable::from_csv_reader(
        BufReader::new(File::open(&cli.input)?),
        pipeline.config().dt_ms(),
    )?;

    let mut store: Box<dyn CheckpointStore> = match &cli.checkpoint_db {
        Some(path) => Box::new(SqliteCheckpointStore::open(path)?),
        None => Box::new(MemoryCheckpointStore::new()),
    };
    let estimator = cli.northing_offsets.clone().map(FixedOffsetEstimator::new);
    let estimator_ref = estimator
        .as_ref()
        .map(|e| e as &dyn WakeAlignmentEstimator);

    let output = pipeline.run(&input, store.as_mut(), estimator_ref)?;

    output
        .table
        .to_csv_writer(BufWriter::new(File::create(&cli.output)?))?;
    if let (Some(path), Some(constants)) = (&cli.normalization_out, &output.normalization) {
        constants.to_csv_writer(BufWriter::new(File::create(path)?))?;
    }

    println!(
        "scada_preprocess done | rows_in={} rows_out={} stages={} cached={} output={}",
        input.len(),
        output.table.len(),
        output.stage_reports.len(),
        output.stage_reports.iter().filter(|r| r.cached).count(),
        cli.output.display()
    );
    Ok(())
}
