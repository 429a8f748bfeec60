//! `catalog classify`

use catalog_taxonomy::{CatalogEngine, RunReport};
use clap::Parser;

use crate::{EXIT_OK, EXIT_SOFT_FAIL, GlobalArgs, PASS, WARN, print_json};

#[derive(Debug, Parser)]
pub struct ClassifyArgs {
    /// Classify and record the run without writing labels back
    #[arg(long)]
    pub dry_run: bool,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

/// Run the pipeline; exit 1 when any record hit a predicate failure.
pub fn run_classify(global: &GlobalArgs, args: ClassifyArgs) -> anyhow::Result<i32> {
    let cfg = global.load_config()?;
    let mut engine = CatalogEngine::with_config(cfg)?;
    let report = engine.classify(args.dry_run)?;

    if args.json {
        print_json(&serde_json::json!({
            "stats": report.stats,
            "errors": report.classification.errors,
        }));
    } else {
        print_human(&report);
    }

    if report.classification.errors.is_empty() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_SOFT_FAIL)
    }
}

fn print_human(report: &RunReport) {
    let stats = &report.stats;
    let mode = if stats.dry_run { " (dry run)" } else { "" };
    println!("\n Catalog classification{mode}\n");
    println!("run {}  rules {}", stats.run_id, short(&stats.fingerprint));
    println!();

    for pass in &stats.passes {
        println!(
            "  {:<28} eligible {:>7}  changed {:>7}  errors {:>4}",
            pass.name, pass.eligible, pass.changed, pass.errors
        );
    }
    println!();

    let errors = &report.classification.errors;
    if errors.is_empty() {
        println!(
            "{PASS} {} records, {} changed, {} field writes, {} written",
            stats.records, stats.changed_records, stats.field_changes, stats.written
        );
    } else {
        println!(
            "{WARN} {} records, {} changed, {} record errors",
            stats.records,
            stats.changed_records,
            errors.len()
        );
        for error in errors {
            println!(
                "       product {} [{} / {}]: {}",
                error.product_id, error.pass, error.rule_id, error.message
            );
        }
    }
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}
