use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "flowrunner")]
#[command(about = "Job execution orchestrator for declarative CI/CD flows")]
#[command(version)]
pub struct Args {
    /// Path to the settings file (YAML)
    #[arg(required = true)]
    pub settings_file: PathBuf,

    /// Directory of flow definition files to load at startup
    #[arg(long, value_name = "DIR")]
    pub flows_dir: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate settings and flows without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Override the default bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

use crate::config::Settings;
use crate::tree::FlowRegistry;

/// Format a dry-run output showing the loaded flows.
/// Pure function - returns a formatted string.
pub fn format_dry_run(settings: &Settings, flows: &FlowRegistry, args: &Args) -> String {
    let mut output = String::new();

    output.push_str("flowrunner v0.1.0 - Dry Run Mode\n\n");
    output.push_str(&format!("Settings: {}\n", args.settings_file.display()));
    output.push_str(&format!("  Domain: {}\n", settings.domain));
    output.push_str(&format!("  Zone: {}\n", settings.zone));
    output.push_str(&format!("  Queue URL: {}\n", settings.queue_url));
    output.push_str(&format!("  Cmd URL: {}\n", settings.cmd_url));
    output.push_str(&format!(
        "  Callback workers: {} (queue capacity {})\n\n",
        settings.callback_workers, settings.queue_capacity
    ));

    let mut names = flows.names();
    names.sort();
    output.push_str(&format!("Flows ({}):\n", names.len()));
    for name in &names {
        if let Some(entry) = flows.find(name) {
            let steps = entry
                .tree
                .iter_preorder()
                .filter(|&id| entry.tree.runnable(id))
                .count();
            output.push_str(&format!("  - {} ({} steps)\n", name, steps));
        }
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to orchestrate. Remove --dry-run to serve.\n");

    output
}
