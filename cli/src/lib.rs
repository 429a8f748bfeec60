//! `catalog` command-line interface
//!
//! ## Commands
//!
//! - `catalog classify` - run the taxonomy pipeline over the warehouse
//! - `catalog audit` - label summary and convergence warnings
//! - `catalog offenders` - highest-volume products left in a catch-all bucket
//! - `catalog check-rules` - compile the rules document without touching data
//! - `catalog runs` - recent classification runs from the ledger
//!
//! ## Exit Codes
//! - 0: Success
//! - 1: Soft fail (record errors, convergence warnings)
//! - 2: Hard fail (configuration or store error)

pub mod audit_cmd;
pub mod classify_cmd;
pub mod rules_cmd;

use std::path::PathBuf;

use catalog_taxonomy::CatalogConfig;
use clap::{Args, Parser, Subcommand};

pub const EXIT_OK: i32 = 0;
pub const EXIT_SOFT_FAIL: i32 = 1;
pub const EXIT_HARD_FAIL: i32 = 2;

pub(crate) const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
pub(crate) const WARN: &str = "\x1b[33m[WARN]\x1b[0m";
pub(crate) const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";

/// Catalog taxonomy tooling
#[derive(Debug, Parser)]
#[command(name = "catalog", version, about = "Product taxonomy classification")]
pub struct CatalogCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: CatalogSubcommand,
}

/// Options shared by every subcommand
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Config file (default: $CATALOG_CONFIG or ~/.config/catalog/catalog.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Warehouse database, overriding `db_path`
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Rules document, overriding `rules_path`
    #[arg(long, global = true, value_name = "PATH")]
    pub rules: Option<PathBuf>,
}

impl GlobalArgs {
    /// Resolve config, then apply command-line path overrides
    pub fn load_config(&self) -> catalog_taxonomy::Result<CatalogConfig> {
        let mut cfg = match &self.config {
            Some(path) => CatalogConfig::load_from_path(path)?,
            None => CatalogConfig::load()?,
        };
        if let Some(db) = &self.db {
            cfg.db_path = db.to_string_lossy().into_owned();
        }
        if let Some(rules) = &self.rules {
            cfg.rules_path = rules.to_string_lossy().into_owned();
        }
        Ok(cfg)
    }
}

#[derive(Debug, Subcommand)]
pub enum CatalogSubcommand {
    /// Classify every product and write the labels back
    Classify(classify_cmd::ClassifyArgs),

    /// Summarize labels and flag oversized catch-all buckets
    Audit(audit_cmd::AuditArgs),

    /// List the highest-volume products still in a catch-all bucket
    ///
    /// Use this to decide which refinement rule to write next.
    Offenders(audit_cmd::OffendersArgs),

    /// Compile the rules document and report its passes
    CheckRules(rules_cmd::CheckRulesArgs),

    /// Show recent classification runs
    Runs(rules_cmd::RunsArgs),
}

impl CatalogCli {
    pub fn run(self) -> i32 {
        let global = self.global;
        let result = match self.command {
            CatalogSubcommand::Classify(args) => classify_cmd::run_classify(&global, args),
            CatalogSubcommand::Audit(args) => audit_cmd::run_audit(&global, args),
            CatalogSubcommand::Offenders(args) => audit_cmd::run_offenders(&global, args),
            CatalogSubcommand::CheckRules(args) => rules_cmd::run_check_rules(&global, args),
            CatalogSubcommand::Runs(args) => rules_cmd::run_runs(&global, args),
        };

        match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{FAIL} {err:#}");
                EXIT_HARD_FAIL
            }
        }
    }
}

/// Render a JSON value to stdout
pub(crate) fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_parse_after_subcommand() {
        let cli = CatalogCli::try_parse_from([
            "catalog",
            "audit",
            "--db",
            "/tmp/w.db",
            "--threshold",
            "0.4",
        ])
        .expect("parse");
        assert_eq!(cli.global.db, Some(PathBuf::from("/tmp/w.db")));
        match cli.command {
            CatalogSubcommand::Audit(args) => assert_eq!(args.threshold, Some(0.4)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_offenders_requires_category() {
        assert!(CatalogCli::try_parse_from(["catalog", "offenders"]).is_err());
    }

    #[test]
    fn test_path_overrides_win_over_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("catalog.toml");
        std::fs::write(&config, "db_path = \"/srv/a.db\"\nrules_path = \"/srv/r.toml\"\n")
            .expect("write");

        let global = GlobalArgs {
            config: Some(config),
            db: Some(PathBuf::from("/tmp/b.db")),
            rules: None,
        };
        let cfg = global.load_config().expect("config");
        assert_eq!(cfg.db_path, "/tmp/b.db");
        assert_eq!(cfg.rules_path, "/srv/r.toml");
    }
}
