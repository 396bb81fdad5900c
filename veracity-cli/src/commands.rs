//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use veracity_core::audit::{AuditSystem, load_log};
use veracity_core::config::{VeracityConfig, load_config, user_config_path};
use veracity_core::pipeline::{TurnRequest, ValidationPipeline};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_file: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Check {
            turn,
            strict,
            no_semantic,
            session,
        } => {
            let mut config = load_checked(config_file)?;
            if strict {
                config.validation.strict_mode = true;
            }
            if no_semantic {
                config.semantic.enabled = false;
            }
            handle_check(config, &turn, session).await
        }
        Commands::Report { log } => {
            let config = load_checked(config_file)?;
            handle_report(config, log)
        }
        Commands::Config { action } => handle_config(action, config_file),
    }
}

fn load_config_file(config_file: Option<&Path>) -> anyhow::Result<VeracityConfig> {
    Ok(load_config(config_file, None)?)
}

/// Load configuration and refuse to continue when it has problems.
fn load_checked(config_file: Option<&Path>) -> anyhow::Result<VeracityConfig> {
    let config = load_config_file(config_file)?;
    if let Err(e) = config.ensure_valid() {
        for problem in config.validate() {
            tracing::error!(%problem, "Invalid configuration");
        }
        return Err(e.into());
    }
    Ok(config)
}

async fn handle_check(
    config: VeracityConfig,
    turn_path: &Path,
    session: Option<String>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(turn_path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", turn_path.display(), e))?;
    let mut request: TurnRequest = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid turn file {}: {}", turn_path.display(), e))?;
    if let Some(session) = session {
        request.session_id = session;
    }
    if request.results.is_none() {
        tracing::warn!("Turn file has no results; validating against an empty source set");
        request.results = Some(Vec::new());
    }

    let audit = Arc::new(AuditSystem::new(config.audit.clone(), config.privacy.clone()));
    let pipeline = ValidationPipeline::from_config(config, audit.clone())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; abandoning semantic verification");
            on_interrupt.cancel();
        }
    });

    let outcome = pipeline.validate_turn(request, &cancel).await;
    interrupt.abort();

    if let Err(e) = audit.flush().await {
        tracing::error!(error = %e, "Audit entry not persisted");
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn handle_report(config: VeracityConfig, log: Option<PathBuf>) -> anyhow::Result<()> {
    let Some(path) = log.or_else(|| config.audit.log_path.clone()) else {
        anyhow::bail!("no audit log: pass --log or set audit.log_path");
    };
    let entries = load_log(&path)?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "Loaded audit log");

    let audit = AuditSystem::new(config.audit, config.privacy);
    audit.replay(entries);
    println!("{}", serde_json::to_string_pretty(&audit.report())?);
    Ok(())
}

fn handle_config(action: ConfigAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            let Some(config_path) = path.or_else(user_config_path) else {
                anyhow::bail!("cannot determine a config directory; pass --path");
            };
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_path, default_config_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config_file(config_file)?;
            println!("{}", toml::to_string_pretty(&config)?);
            for problem in config.validate() {
                eprintln!("warning: {problem}");
            }
            Ok(())
        }
    }
}

fn default_config_toml() -> anyhow::Result<String> {
    Ok(toml::to_string_pretty(&VeracityConfig::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_toml_roundtrips() {
        let text = default_config_toml().unwrap();
        assert!(text.contains("[sanitizer]"));
        let parsed: VeracityConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sanitizer.block_threshold, 0.80);
        assert!(parsed.validate().is_empty());
    }

    #[test]
    fn test_config_init_writes_file_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        handle_config(ConfigAction::Init { path: Some(path.clone()) }, None).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        std::fs::write(&path, "# edited\n").unwrap();
        handle_config(ConfigAction::Init { path: Some(path.clone()) }, None).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# edited\n");
        assert!(first.contains("block_threshold"));
    }

    #[test]
    fn test_load_checked_rejects_bad_thresholds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(
            &path,
            "[sanitizer]\nblock_threshold = 0.2\nredact_threshold = 0.5\nwarn_threshold = 0.3\n",
        )
        .unwrap();
        let err = load_checked(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("Invalid configuration"));
        assert!(err.to_string().contains("block > redact > warn"));
    }

    #[test]
    fn test_load_config_file_reports_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[audit]\nmax_memory_entries = \"lots\"\n").unwrap();
        let err = load_config_file(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to load configuration"));
    }

    #[test]
    fn test_report_requires_a_log() {
        let err = handle_report(VeracityConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("no audit log"));
    }
}
