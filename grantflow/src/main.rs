//! grantflow: negotiate capabilities against a simulated host from the terminal

mod host;
mod tracing_support;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use grantflow_api::{Capability, CapabilitySet, DialogConfig, GrantStatus};
use grantflow_host::{
    app_config_dir, FileAuditSink, FileHistoryStore, HeadlessInterstitial, HistoryStore, Interstitial,
    NegotiationOutcome, NegotiationRequest, Negotiator, NegotiatorConfigBuilder, OutcomeReporter,
    TerminalInterstitial,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use host::{SimulatedHost, SimulatedInterstitial};
use tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};

#[derive(Debug, Parser)]
#[command(name = "grantflow", version, about = "Negotiate runtime capabilities with a host")]
struct Cli {
    /// Application name, used for default config paths
    #[arg(long, global = true, env = "GRANTFLOW_APP", default_value = "grantflow")]
    app: String,

    /// Host state file (defaults to <config dir>/<app>/host_state.json)
    #[arg(long, global = true, env = "GRANTFLOW_STATE")]
    state: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "compact")]
    log_format: TracingFormat,

    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<tracing::Level>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Negotiate capabilities (every declared one if none are given)
    Negotiate(NegotiateArgs),
    /// Resume a negotiation interrupted while in settings
    Resume(SessionArgs),
    /// Show the grant status of capabilities
    Status {
        /// Capabilities to inspect (every declared one if none are given)
        capabilities: Vec<String>,
    },
    /// List capabilities that were prompted for before
    History,
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Never show dialogs; anything needing the user fails
    #[arg(long)]
    headless: bool,

    /// Don't list the capabilities under each dialog
    #[arg(long)]
    brief: bool,
}

#[derive(Debug, Args)]
struct NegotiateArgs {
    /// Capabilities to request
    capabilities: Vec<String>,

    #[command(flatten)]
    session: SessionArgs,

    /// Prompt for this capability without a rationale dialog (repeatable)
    #[arg(long = "skip-rationale", value_name = "CAPABILITY")]
    skip_rationale: Vec<String>,

    /// Rationale dialog message
    #[arg(long)]
    rationale_message: Option<String>,

    /// Settings dialog message
    #[arg(long)]
    settings_message: Option<String>,
}

impl NegotiateArgs {
    fn dialog(&self) -> DialogConfig {
        let mut dialog = DialogConfig::new();
        if let Some(message) = &self.rationale_message {
            dialog = dialog.with_rationale_message(message);
        }
        if let Some(message) = &self.settings_message {
            dialog = dialog.with_settings(message, "", "");
        }
        self.skip_rationale
            .iter()
            .fold(dialog, |dialog, capability| {
                dialog.skip_rationale_for(capability.as_str())
            })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_subscriber_with_config(TracingConfig {
        level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    });

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| SimulatedHost::default_path(&cli.app));
    let host = Arc::new(SimulatedHost::open(&state_path)?);
    tracing::debug!(state = %host.path().display(), "Loaded host state");

    match cli.command {
        Command::Negotiate(args) => {
            let negotiator = build_negotiator(&cli.app, host, &args.session)?;
            let (reporter, rx) = OutcomeReporter::channel();

            if args.capabilities.is_empty() {
                negotiator.negotiate_manifest(args.dialog(), reporter).await;
            } else {
                let capabilities: CapabilitySet =
                    args.capabilities.iter().map(String::as_str).collect();
                let request = NegotiationRequest::new(capabilities).with_dialog(args.dialog());
                negotiator.negotiate(request, reporter).await;
            }

            let outcome = rx.await.context("negotiation ended without an outcome")?;
            print_outcome(&outcome)
        }
        Command::Resume(args) => {
            let negotiator = build_negotiator(&cli.app, host, &args)?;
            let (reporter, rx) = OutcomeReporter::channel();

            if !negotiator.resume(reporter).await {
                println!("No interrupted negotiation to resume");
                return Ok(ExitCode::SUCCESS);
            }
            let outcome = rx.await.context("resumed negotiation ended without an outcome")?;
            print_outcome(&outcome)
        }
        Command::Status { capabilities } => {
            let negotiator = build_negotiator(&cli.app, host, &SessionArgs {
                    headless: true,
                    brief: false,
                })?;
            let registry = negotiator.registry();

            let capabilities: CapabilitySet = if capabilities.is_empty() {
                registry.manifest_capabilities()?
            } else {
                capabilities.iter().map(String::as_str).collect()
            };

            let report: Vec<StatusLine> = capabilities
                .iter()
                .map(|capability| StatusLine {
                    capability: capability.clone(),
                    status: registry.grant_status(capability),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::History => {
            let history = FileHistoryStore::default_for_app(&cli.app)?;
            let requested = history.list()?;
            println!("{}", serde_json::to_string_pretty(&requested)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusLine {
    capability: Capability,
    status: GrantStatus,
}

fn build_negotiator(app: &str, host: Arc<SimulatedHost>, args: &SessionArgs) -> Result<Negotiator> {
    let inner: Arc<dyn Interstitial> = if args.headless {
        Arc::new(HeadlessInterstitial)
    } else if args.brief {
        Arc::new(TerminalInterstitial::minimal())
    } else {
        Arc::new(TerminalInterstitial::new())
    };
    let interstitial = SimulatedInterstitial::new(inner, host.clone());

    let audit_path = app_config_dir(app).join("audit.jsonl");
    let audit = FileAuditSink::new(&audit_path)
        .with_context(|| format!("failed to open audit log {}", audit_path.display()))?;

    let config = NegotiatorConfigBuilder::new()
        .app_name(app)
        .interstitial(interstitial)
        .audit(audit)
        .build()?;

    Ok(Negotiator::new(host, config))
}

fn print_outcome(outcome: &NegotiationOutcome) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(if outcome.all_granted {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_negotiate() {
        let cli = Cli::try_parse_from([
            "grantflow",
            "--log-format",
            "json",
            "negotiate",
            "camera",
            "location",
            "--skip-rationale",
            "location",
            "--headless",
        ])
        .unwrap();

        assert_eq!(cli.log_format, TracingFormat::Json);
        match cli.command {
            Command::Negotiate(args) => {
                assert_eq!(args.capabilities, vec!["camera", "location"]);
                assert!(args.session.headless);
                assert!(args
                    .dialog()
                    .skip_rationale
                    .contains(&Capability::new("location")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_empty_dialog_flags_keep_defaults() {
        let cli = Cli::try_parse_from(["grantflow", "negotiate", "--rationale-message", ""]).unwrap();
        let Command::Negotiate(args) = cli.command else {
            panic!("expected negotiate");
        };
        assert_eq!(args.dialog(), DialogConfig::default());
    }

    #[test]
    fn test_parse_resume_brief() {
        let cli = Cli::try_parse_from(["grantflow", "resume", "--brief"]).unwrap();
        let Command::Resume(args) = cli.command else {
            panic!("expected resume");
        };
        assert!(args.brief);
        assert!(!args.headless);
    }

    #[test]
    fn test_parse_status_without_capabilities() {
        let cli = Cli::try_parse_from(["grantflow", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status { capabilities } if capabilities.is_empty()));
    }
}
