use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use yolo_dataset_tools::config::EngineConfig;
use yolo_dataset_tools::core::analysis::{
    compare_datasets, write_csv, write_html, CategoryPolicy, ValidationReport,
};
use yolo_dataset_tools::core::dataset::{Dataset, DatasetSplit};
use yolo_dataset_tools::core::operations::BulkCopier;
use yolo_dataset_tools::core::progress::{CancelToken, ProgressReporter};
use yolo_dataset_tools::core::transform::{
    consolidate_to_train, execute_balance, extract_subset, filter_dataset, find_duplicates,
    get_recommendations, merge_datasets, plan_balance, remap_classes, split_by_count,
    split_into_parts, BalanceConfig, BalanceStrategy, ClassCombinator, ClassPolarity,
    ClassPredicate, FilterMode, GreedySelector, RemapRule, SelectionStrategy, TransformContext,
    TransformSummary,
};
use yolo_dataset_tools::logging::{setup_logging, LoggingOptions};

#[derive(Parser)]
#[command(name = "yolo-dataset-tools")]
#[command(about = "Merge, split, filter, balance and validate YOLO datasets")]
struct Cli {
    /// Engine config file (JSON); defaults to the per-user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for a timestamped log file
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Worker threads for parallel scans
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Never use the external bulk-copy tool
    #[arg(long, global = true)]
    no_copy_tool: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SplitSelection {
    /// Splits to include, comma separated (default: all)
    #[arg(long, value_delimiter = ',')]
    splits: Vec<DatasetSplit>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a dataset for label problems
    Validate {
        dataset: PathBuf,
        /// Minimum annotations per image
        #[arg(long)]
        min_roi: Option<usize>,
        /// Categorise by severity instead of last check to fire
        #[arg(long)]
        severity: bool,
        /// File listing verified stems, one per line, to skip
        #[arg(long)]
        verified: Option<PathBuf>,
        /// Print every invalid image
        #[arg(long)]
        details: bool,
    },
    /// Class and annotation statistics
    Stats {
        dataset: PathBuf,
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        html: Option<PathBuf>,
    },
    /// Compare class counts of two datasets
    Compare { first: PathBuf, second: PathBuf },
    /// Merge datasets into one
    Merge {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(required = true)]
        datasets: Vec<PathBuf>,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// Split a dataset into several
    Split {
        #[command(subcommand)]
        mode: SplitCommand,
    },
    /// Copy the images matching a filter
    Filter {
        #[command(subcommand)]
        mode: FilterCommand,
    },
    /// Report byte-identical images
    Dedup {
        dataset: PathBuf,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// Move val and test into train
    Consolidate { dataset: PathBuf },
    /// Build a class-balanced dataset
    Balance {
        dataset: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Dataset to draw extra images from
        #[arg(long)]
        secondary: Option<PathBuf>,
        /// Same instance target for every class
        #[arg(long, conflicts_with_all = ["to_minimum", "custom"])]
        equal: Option<usize>,
        /// Reduce every class to the rarest class's count
        #[arg(long)]
        to_minimum: bool,
        /// Per-class targets as id=count, comma separated
        #[arg(long, value_delimiter = ',', value_parser = parse_pair::<'=', usize>)]
        custom: Vec<(u32, usize)>,
        /// random, fewest, oldest or newest
        #[arg(long, default_value = "random", value_parser = parse_selection)]
        selection: SelectionStrategy,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// Copy a dataset with class ids rewritten
    Remap {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// old:new, repeatable or comma separated
        #[arg(long = "rule", required = true, value_delimiter = ',', value_parser = parse_pair::<':', u32>)]
        rules: Vec<(u32, u32)>,
        #[command(flatten)]
        splits: SplitSelection,
    },
}

#[derive(Subcommand)]
enum SplitCommand {
    /// Into N parts of near-equal size
    Parts {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        parts: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// Into parts of a fixed image count
    Count {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// A random subset of each split
    Subset {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        splits: SplitSelection,
    },
}

#[derive(Subcommand)]
enum FilterCommand {
    /// By class membership
    Class {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, required = true, value_delimiter = ',')]
        classes: Vec<u32>,
        /// Match any selected class instead of all
        #[arg(long)]
        any: bool,
        /// Keep images lacking the classes instead of containing them
        #[arg(long)]
        excludes: bool,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// The first N images of each split
    First {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short = 'n', long)]
        count: usize,
        #[command(flatten)]
        splits: SplitSelection,
    },
    /// N random images of each split
    Random {
        dataset: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short = 'n', long)]
        count: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        splits: SplitSelection,
    },
}

fn parse_pair<const SEP: char, T: FromStr>(s: &str) -> std::result::Result<(u32, T), String> {
    let (a, b) = s
        .split_once(SEP)
        .ok_or_else(|| format!("expected A{}B, got '{}'", SEP, s))?;
    let a = a.trim().parse().map_err(|_| format!("bad class id '{}'", a))?;
    let b = b.trim().parse().map_err(|_| format!("bad number '{}'", b))?;
    Ok((a, b))
}

fn parse_selection(s: &str) -> std::result::Result<SelectionStrategy, String> {
    match s.to_ascii_lowercase().as_str() {
        "random" => Ok(SelectionStrategy::Random),
        "fewest" | "fewest-detections" => Ok(SelectionStrategy::FewestDetections),
        "oldest" => Ok(SelectionStrategy::OldestFirst),
        "newest" => Ok(SelectionStrategy::NewestFirst),
        other => Err(format!("unknown selection strategy '{}'", other)),
    }
}

/// Renders engine progress on a terminal bar.
struct BarProgress(ProgressBar);

impl BarProgress {
    fn new() -> Result<Self> {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self(pb))
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

impl ProgressReporter for BarProgress {
    fn report(&self, percentage: u8, status: &str) {
        self.0.set_position(u64::from(percentage.min(100)));
        self.0.set_message(status.to_string());
    }
}

fn load_verified(path: &Path) -> Result<HashSet<String>> {
    let content = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn print_summary(summary: &TransformSummary) {
    for output in &summary.outputs {
        let per_split: Vec<String> = output
            .images_per_split
            .iter()
            .map(|(split, n)| format!("{}={}", split, n))
            .collect();
        println!("{}: {} images ({})", output.root.display(), output.total_images(), per_split.join(", "));
    }
    println!(
        "Copied {} images and {} labels, skipped {}",
        summary.images_copied, summary.labels_copied, summary.skipped
    );
}

fn print_validation(report: &ValidationReport, details: bool) {
    println!(
        "Scanned {} images ({} verified skipped), {} with issues, {} issues total",
        report.total_scanned,
        report.skipped_verified,
        report.invalid().count(),
        report.issue_count()
    );
    for (category, count) in &report.category_counts {
        println!("  {:<20} {}", category.as_str(), count);
    }
    if details {
        for result in report.invalid() {
            println!("{}/{} [{}]", result.split, result.stem, result.category.as_str());
            for issue in &result.issues {
                match issue.line_number {
                    Some(line) => println!("    line {}: {}", line, issue.description),
                    None => println!("    {}", issue.description),
                }
            }
        }
    }
}

fn run(cli: Cli, config: EngineConfig) -> Result<()> {
    let bar = BarProgress::new()?;
    let cancel = CancelToken::new();
    let copier = if cli.no_copy_tool {
        BulkCopier::direct()
    } else {
        config.bulk_copier()
    };
    let ctx = TransformContext::new(copier, &bar)
        .with_workers(config.worker_threads)
        .with_cancel(cancel.clone());

    match cli.command {
        Command::Validate {
            dataset,
            min_roi,
            severity,
            verified,
            details,
        } => {
            let mut config = config;
            if let Some(min_roi) = min_roi {
                config.validation.min_roi = min_roi;
            }
            if severity {
                config.category_policy = CategoryPolicy::Severity;
            }
            let engine = config.validation_engine();
            let report = match verified {
                Some(path) => {
                    let verified = load_verified(&path)?;
                    engine.validate_with(&dataset, &verified, &bar, &cancel)?
                }
                None => engine.validate(&dataset, &bar, &cancel)?,
            };
            bar.finish();
            print_validation(&report, details);
        }
        Command::Stats { dataset, csv, html } => {
            let stats = config.statistics_engine().analyze(&dataset, &bar, &cancel)?;
            bar.finish();
            println!(
                "Images: {} (train {}, val {}, test {}), unlabeled {}",
                stats.total_images, stats.train_images, stats.val_images, stats.test_images, stats.images_without_labels
            );
            println!(
                "Annotations: {} (avg {:.2}, min {}, max {} per image)",
                stats.total_annotations,
                stats.average_annotations_per_image,
                stats.min_annotations_per_image,
                stats.max_annotations_per_image
            );
            for class in stats.classes_by_frequency() {
                println!(
                    "  {:>4} {:<24} {:>8} instances {:>7} images {:>6.2}%",
                    class.class_id, class.class_name, class.instance_count, class.image_count, class.percentage
                );
            }
            if let Some(path) = csv {
                write_csv(&stats, &path)?;
            }
            if let Some(path) = html {
                let title = format!("Dataset Analysis: {}", Dataset::open(&dataset)?.name());
                write_html(&stats, &title, &path)?;
            }
        }
        Command::Compare { first, second } => {
            let engine = config.statistics_engine();
            let a = engine.analyze(&first, &bar, &cancel)?;
            let b = engine.analyze(&second, &bar, &cancel)?;
            bar.finish();
            let cmp = compare_datasets(&a, &b);
            println!("Images: {} vs {}", cmp.dataset1_images, cmp.dataset2_images);
            println!("Annotations: {} vs {}", cmp.dataset1_annotations, cmp.dataset2_annotations);
            for class in &cmp.classes {
                println!(
                    "  {:>4} {:<24} {:>8} {:>8} {:>+8} {:>+8.1}%",
                    class.class_id,
                    class.class_name,
                    class.dataset1_count,
                    class.dataset2_count,
                    class.difference(),
                    class.percentage_difference()
                );
            }
        }
        Command::Merge {
            output,
            datasets,
            splits,
        } => {
            let summary = merge_datasets(&ctx, &datasets, &output, &splits.splits)?;
            bar.finish();
            print_summary(&summary);
        }
        Command::Split { mode } => {
            let summary = match mode {
                SplitCommand::Parts {
                    dataset,
                    output,
                    parts,
                    seed,
                    splits,
                } => split_into_parts(&ctx, &dataset, &output, parts, &splits.splits, seed)?,
                SplitCommand::Count {
                    dataset,
                    output,
                    count,
                    seed,
                    splits,
                } => split_by_count(&ctx, &dataset, &output, count, &splits.splits, seed)?,
                SplitCommand::Subset {
                    dataset,
                    output,
                    count,
                    seed,
                    splits,
                } => extract_subset(&ctx, &dataset, &output, count, &splits.splits, seed)?,
            };
            bar.finish();
            print_summary(&summary);
        }
        Command::Filter { mode } => {
            let (dataset, output, mode, splits, seed) = match mode {
                FilterCommand::Class {
                    dataset,
                    output,
                    classes,
                    any,
                    excludes,
                    splits,
                } => {
                    let combinator = if any { ClassCombinator::Or } else { ClassCombinator::And };
                    let polarity = if excludes {
                        ClassPolarity::Excludes
                    } else {
                        ClassPolarity::Contains
                    };
                    let predicate = ClassPredicate::new(classes, combinator, polarity);
                    (dataset, output, FilterMode::ByClass(predicate), splits, None)
                }
                FilterCommand::First {
                    dataset,
                    output,
                    count,
                    splits,
                } => (dataset, output, FilterMode::FirstN(count), splits, None),
                FilterCommand::Random {
                    dataset,
                    output,
                    count,
                    seed,
                    splits,
                } => (dataset, output, FilterMode::RandomN(count), splits, seed),
            };
            let summary = filter_dataset(&ctx, &dataset, &output, &mode, &splits.splits, seed)?;
            bar.finish();
            print_summary(&summary);
        }
        Command::Dedup { dataset, splits } => {
            let report = find_duplicates(&ctx, &dataset, &splits.splits)?;
            bar.finish();
            for group in &report.groups {
                println!("{}", &group.hash[..16.min(group.hash.len())]);
                for (split, path) in &group.images {
                    println!("    [{}] {}", split, path.display());
                }
            }
            println!(
                "{} duplicate groups, {} redundant images, {} scanned, {} unreadable",
                report.groups.len(),
                report.redundant_images(),
                report.images_scanned,
                report.unreadable
            );
        }
        Command::Consolidate { dataset } => {
            let summary = consolidate_to_train(&ctx, &dataset)?;
            bar.finish();
            print_summary(&summary);
        }
        Command::Balance {
            dataset,
            output,
            secondary,
            equal,
            to_minimum,
            custom,
            selection,
            seed,
            splits,
        } => {
            let strategy = match (equal, to_minimum, custom.is_empty()) {
                (Some(target), _, _) => BalanceStrategy::EqualForAll(target),
                (None, true, true) => BalanceStrategy::ToMinimumClass,
                (None, false, false) => {
                    BalanceStrategy::CustomPerClass(custom.into_iter().collect::<BTreeMap<_, _>>())
                }
                _ => bail!("choose exactly one of --equal, --to-minimum or --custom"),
            };
            let mut balance = BalanceConfig::new(dataset, strategy);
            balance.secondary = secondary;
            balance.selection = selection;
            balance.seed = seed;
            balance.splits = splits.splits;

            let plan = plan_balance(&ctx, &balance, &GreedySelector)?;
            for line in get_recommendations(&plan) {
                println!("{}", line);
            }
            match output {
                Some(output) => {
                    let summary = execute_balance(&ctx, &plan, &output)?;
                    bar.finish();
                    print_summary(&summary);
                }
                None => {
                    bar.finish();
                    println!("Plan selects {} images; pass --output to write them", plan.len());
                }
            }
        }
        Command::Remap {
            dataset,
            output,
            rules,
            splits,
        } => {
            let rules: Vec<RemapRule> = rules.into_iter().map(|(old, new)| RemapRule::new(old, new)).collect();
            let summary = remap_classes(&ctx, &dataset, &output, &rules, &splits.splits)?;
            bar.finish();
            print_summary(&summary);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&LoggingOptions {
        log_dir: cli.log_dir.clone(),
        ..Default::default()
    })
    .context("setting up logging")?;
    info!("Starting yolo-dataset-tools {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    };
    if let Some(threads) = cli.threads {
        config.worker_threads = Some(threads.max(1));
    }

    run(cli, config)
}
