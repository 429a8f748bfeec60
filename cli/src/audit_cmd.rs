//! `catalog audit` and `catalog offenders`

use catalog_taxonomy::{AuditReport, CatalogEngine, Offender, ShareBasis};
use clap::Parser;

use crate::{EXIT_OK, EXIT_SOFT_FAIL, GlobalArgs, PASS, WARN, print_json};

#[derive(Debug, Parser)]
pub struct AuditArgs {
    /// Catch-all share above which a bucket is flagged (default from config)
    #[arg(long, value_name = "FRACTION")]
    pub threshold: Option<f64>,

    /// Share basis: records or units (default from config)
    #[arg(long, value_parser = parse_basis)]
    pub basis: Option<ShareBasis>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct OffendersArgs {
    /// Category to inspect
    #[arg(long)]
    pub category: String,

    /// Catch-all bucket (default: "Other <category>")
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum rows (default from config)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

fn parse_basis(s: &str) -> Result<ShareBasis, String> {
    ShareBasis::parse(s).ok_or_else(|| format!("unknown basis `{s}` (expected records or units)"))
}

/// Summarize labels; exit 1 when any catch-all bucket is over the threshold.
pub fn run_audit(global: &GlobalArgs, args: AuditArgs) -> anyhow::Result<i32> {
    let cfg = global.load_config()?;
    let engine = CatalogEngine::with_config(cfg)?;
    let report = engine.audit(args.threshold, args.basis)?;

    if args.json {
        print_json(&serde_json::to_value(&report)?);
    } else {
        print_audit(&report);
    }

    if report.warnings.is_empty() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_SOFT_FAIL)
    }
}

fn print_audit(report: &AuditReport) {
    println!(
        "\n Catalog convergence audit (basis: {}, threshold {:.1}%)\n",
        report.basis.as_str(),
        report.threshold * 100.0
    );
    println!(
        "{:<24} {:<28} {:>9} {:>12}",
        "CATEGORY", "SUBCATEGORY", "RECORDS", "UNITS"
    );
    for row in &report.rows {
        println!(
            "{:<24} {:<28} {:>9} {:>12}",
            row.category, row.subcategory, row.records, row.units
        );
    }
    println!(
        "{:<24} {:<28} {:>9} {:>12}",
        "TOTAL", "", report.totals.records, report.totals.units
    );
    println!();

    if report.warnings.is_empty() {
        println!("{PASS} All catch-all buckets within threshold");
        return;
    }
    for warning in &report.warnings {
        println!("{WARN} {warning}");
    }
    println!(
        "\nResult: {} catch-all bucket(s) above threshold; see `catalog offenders`",
        report.warnings.len()
    );
}

pub fn run_offenders(global: &GlobalArgs, args: OffendersArgs) -> anyhow::Result<i32> {
    let cfg = global.load_config()?;
    let engine = CatalogEngine::with_config(cfg)?;
    let offenders = engine.top_offenders(&args.category, args.bucket.as_deref(), args.limit)?;

    if args.json {
        print_json(&serde_json::json!({
            "category": args.category,
            "bucket": args.bucket,
            "offenders": offenders,
        }));
    } else {
        print_offenders(&args.category, &offenders);
    }
    Ok(EXIT_OK)
}

fn print_offenders(category: &str, offenders: &[Offender]) {
    if offenders.is_empty() {
        println!("{PASS} No {category} products left in the catch-all bucket");
        return;
    }
    println!("{:>12} {:>10}  {:<16} NAME", "UNITS", "PRODUCT", "SKU");
    for o in offenders {
        println!(
            "{:>12} {:>10}  {:<16} {}",
            o.units, o.product_id, o.sku_code, o.display_name
        );
    }
}
