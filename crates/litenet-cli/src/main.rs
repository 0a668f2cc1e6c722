use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod rundir;

use commands::train::TrainArgs;

/// litenet — lightweight image-classifier training with knowledge distillation
#[derive(Debug, Parser)]
#[command(name = "litenet", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a classifier, optionally distilling from a frozen teacher.
    ///
    /// SM_CHANNEL_TRAIN overrides the dataset path and SM_MODEL_DIR the
    /// output directory (default exp/latest).
    Train(TrainArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    match cli.command {
        Commands::Train(args) => {
            let summary = commands::train::run(&args, &|key| std::env::var(key).ok())?;
            info!(
                best_f1 = summary.outcome.best_f1,
                best_acc = summary.outcome.best_acc,
                best_epoch = summary.outcome.best_epoch,
                "Training finished"
            );
            println!(
                "test loss {:.4} | f1 {:.4} | acc {:.4} | {}",
                summary.test.loss,
                summary.test.f1,
                summary.test.accuracy,
                summary.log_dir.display()
            );
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_flags_and_defaults() {
        let cli = Cli::parse_from(["litenet", "train", "--distill-mode", "--data", "d.yaml"]);
        let Commands::Train(args) = cli.command;
        assert!(args.distill_mode);
        assert_eq!(args.data, std::path::PathBuf::from("d.yaml"));
        assert_eq!(args.seed, 42);
        assert_eq!(args.run_name, "exp");
        assert_eq!(args.teacher_key_prefix, "head.");
        assert!(!args.strict_teacher);
        assert_eq!(cli.log_format, "pretty");
    }

    #[test]
    fn test_log_format_is_global() {
        let cli = Cli::parse_from(["litenet", "train", "--log-format", "json", "--seed", "7"]);
        assert_eq!(cli.log_format, "json");
        let Commands::Train(args) = cli.command;
        assert_eq!(args.seed, 7);
    }
}
