//! Config validation CLI tool
//!
//! Validates a rollcalld configuration file and reports any errors.

use rollcall_util::{default_config_path, format_duration};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a rollcalld configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match rollcall_config::load_config(&config_path) {
        Ok(policy) => {
            let engine = &policy.engine;
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", rollcall_config::CURRENT_CONFIG_VERSION);
            println!("  Subjects: {}", policy.subjects.len());
            println!("  Tardy after: {:.0}% of the slot", engine.tardy_fraction * 100.0);
            println!(
                "  Sync tolerance: -{}ms / +{}ms",
                engine.sync_tolerance_before.as_millis(),
                engine.sync_tolerance_after.as_millis()
            );
            println!(
                "  Timeout finalization: {} after scheduled end",
                format_duration(engine.finalize_timeout)
            );
            println!("  Tokens required: {}", engine.require_token);

            if !policy.subjects.is_empty() {
                println!();
                println!("Subjects:");
                for subject in &policy.subjects {
                    let code = subject
                        .meet_code
                        .as_ref()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".into());
                    let instructor = subject
                        .instructor
                        .as_ref()
                        .map(|i| i.name.as_str())
                        .unwrap_or("unassigned");
                    println!(
                        "  - {} [{}]: {} ({} slots, {} students, instructor: {})",
                        subject.id,
                        code,
                        subject.name,
                        subject.schedule.len(),
                        subject.roster.len(),
                        instructor
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                rollcall_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                rollcall_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                rollcall_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                rollcall_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        rollcall_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
