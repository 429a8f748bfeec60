//! `catalog check-rules` and `catalog runs`

use catalog_taxonomy::{SqliteStore, Taxonomy};
use clap::Parser;

use crate::{EXIT_OK, GlobalArgs, PASS, print_json};

#[derive(Debug, Parser)]
pub struct CheckRulesArgs {
    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RunsArgs {
    /// Number of runs to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

/// Compile the rules document. Never opens the warehouse.
pub fn run_check_rules(global: &GlobalArgs, args: CheckRulesArgs) -> anyhow::Result<i32> {
    let cfg = global.load_config()?;
    let path = cfg.resolved_rules_path();
    let taxonomy = Taxonomy::load_from_path(&path)?;

    if args.json {
        let passes: Vec<serde_json::Value> = taxonomy
            .passes()
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name(),
                    "kind": p.kind().as_str(),
                    "rules": p.len(),
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "fingerprint": taxonomy.fingerprint(),
            "rules": taxonomy.rule_count(),
            "passes": passes,
            "catch_alls": taxonomy.catch_all_buckets(),
        }));
        return Ok(EXIT_OK);
    }

    println!("\n Rules {}\n", path.display());
    for pass in taxonomy.passes() {
        println!("  {:<28} {:<12} {:>4} rules", pass.name(), pass.kind().as_str(), pass.len());
    }
    println!();
    for bucket in taxonomy.catch_all_buckets() {
        let scope = bucket.category.as_deref().unwrap_or("*");
        println!("  catch-all {scope} / {}", bucket.label);
    }
    println!();
    println!(
        "{PASS} {} passes, {} rules, fingerprint {}",
        taxonomy.passes().len(),
        taxonomy.rule_count(),
        taxonomy.fingerprint()
    );
    Ok(EXIT_OK)
}

pub fn run_runs(global: &GlobalArgs, args: RunsArgs) -> anyhow::Result<i32> {
    let cfg = global.load_config()?;
    let store = SqliteStore::open(&cfg)?;
    let runs = store.ledger().list_recent_runs(args.limit)?;

    if args.json {
        print_json(&serde_json::json!({ "runs": runs }));
        return Ok(EXIT_OK);
    }

    if runs.is_empty() {
        println!("No classification runs recorded");
        return Ok(EXIT_OK);
    }
    for run in &runs {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let dry = if run.dry_run { " dry-run" } else { "" };
        println!(
            "{:<24} {:<10} {}  {finished}{dry}",
            run.run_id,
            run.status.as_str(),
            run.started_at.to_rfc3339(),
        );
    }
    Ok(EXIT_OK)
}
