use clap::Parser;
use regression_training::{run, RunArgs, RunConfig, RunSummary};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RunConfig::try_from(RunArgs::parse())?;
    match run(&config)? {
        RunSummary::Train(summary) => tracing::info!(
            epochs = summary.epochs_run,
            checkpoints = ?summary.checkpoints,
            train_loss = ?summary.last_train_loss,
            val_loss = ?summary.last_val_loss,
            "training finished"
        ),
        RunSummary::Test(summary) => tracing::info!(
            epoch = summary.epoch,
            samples = summary.samples,
            mean_loss = summary.mean_loss,
            "test finished"
        ),
    }
    Ok(())
}
