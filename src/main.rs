//! toolhost - operator CLI for the plugin host
//!
//! Prints results as JSON on stdout. Tool errors are printed as
//! `{"error": {"code", "message"}}` with exit status 1.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command, LogFormat, SecretCommand};
use toolhost::auth::{BrowserLauncher, ManualBrowser, SystemBrowser};
use toolhost::plugins::FieldKind;
use toolhost::safety::{ApproveAll, TerminalApprover};
use toolhost::{Config, Host, InvokeOptions, ToolError};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.debug, args.log_format);

    info!("Starting toolhost v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_with(args.config.as_deref(), args.config_dir.as_deref())
        .context("Failed to load configuration")?;
    debug!("Using config dir {:?}", config.host.config_dir);

    match run(args.command, config).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => match e.downcast_ref::<ToolError>() {
            Some(tool_error) => {
                println!("{}", serde_json::to_string_pretty(&tool_error.to_json())?);
                std::process::exit(1);
            }
            None => Err(e),
        },
    }
}

async fn run(command: Command, config: Config) -> Result<Value> {
    let open_browser = config.oauth.open_browser;
    let mut host = Host::open(config).context("Failed to open the secret store")?;

    match command {
        Command::Plugins => {
            host.load_all().await;
            let mut rows = Vec::new();
            for descriptor in host.catalog() {
                let status = host.status(&descriptor.id).await;
                rows.push(json!({
                    "id": descriptor.id,
                    "version": descriptor.version,
                    "description": descriptor.description,
                    "loaded": status.loaded,
                    "configured": status.configured,
                }));
            }
            Ok(Value::Array(rows))
        }

        Command::Tools { plugin } => {
            host.load_all().await;
            let tools = host
                .registry()
                .tools()
                .await
                .into_iter()
                .filter(|(owner, _)| plugin.as_deref().map_or(true, |p| p == owner.as_str()))
                .map(|(_, tool)| tool.manifest())
                .collect();
            Ok(Value::Array(tools))
        }

        Command::Status { plugin } => {
            host.load_all().await;
            if host.descriptor(&plugin).is_none() {
                return Err(ToolError::NoSuchPlugin(plugin).into());
            }
            Ok(serde_json::to_value(host.status(&plugin).await)?)
        }

        Command::Configure { plugin, values } => configure(&host, &plugin, &values).await,

        Command::Auth { plugin, no_browser } => {
            host.load_all().await;
            let browser: &dyn BrowserLauncher = if no_browser || !open_browser {
                &ManualBrowser
            } else {
                &SystemBrowser
            };
            let authorized = host.authenticate(&plugin, browser).await?;
            Ok(json!({ "plugin": plugin, "authorized": authorized }))
        }

        Command::Invoke {
            plugin,
            tool,
            args,
            yes,
            timeout,
        } => {
            let args: Value = serde_json::from_str(&args)
                .map_err(|e| ToolError::invalid("args", e.to_string()))?;

            if yes {
                host.set_approval(Some(Arc::new(ApproveAll)));
            } else {
                host.set_approval(Some(Arc::new(TerminalApprover)));
            }
            host.load_all().await;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let mut options = InvokeOptions::default().with_cancel(cancel);
            if let Some(secs) = timeout {
                options = options.with_timeout(Duration::from_secs(secs));
            }
            Ok(host.invoke_with(&plugin, &tool, args, options).await?)
        }

        Command::Secret { action } => secret(&host, action).await,
    }
}

async fn configure(host: &Host, plugin: &str, values: &[String]) -> Result<Value> {
    let descriptor = host
        .find_descriptor(plugin)
        .await
        .ok_or_else(|| ToolError::NoSuchPlugin(plugin.to_string()))?;

    let mut entries = Vec::new();
    if !values.is_empty() {
        for raw in values {
            let entry = cli::parse_assignment(raw)
                .ok_or_else(|| ToolError::invalid(raw.clone(), "expected KEY=VALUE"))?;
            entries.push(entry);
        }
    } else {
        eprintln!("Configuring '{}' (leave empty to skip)", plugin);
        for field in &descriptor.config_schema {
            if !field.description.is_empty() {
                eprintln!("  {}", field.description);
            }
            let prompt = if field.required {
                format!("{}: ", field.label)
            } else {
                format!("{} (optional): ", field.label)
            };
            let value = match field.kind {
                FieldKind::Password => cli::read_hidden(&prompt)?,
                FieldKind::String => cli::read_line(&prompt)?,
            };
            match value.map(|v| v.trim().to_string()) {
                Some(v) if !v.is_empty() => entries.push((field.key.clone(), v)),
                _ if field.required => {
                    return Err(ToolError::invalid(field.key.clone(), "is required").into())
                }
                _ => {}
            }
        }
    }

    host.configure(plugin, &entries).await?;
    let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
    Ok(json!({ "plugin": plugin, "stored": keys }))
}

async fn secret(host: &Host, action: SecretCommand) -> Result<Value> {
    let broker = host.broker();
    match action {
        SecretCommand::Get { service, key } => {
            let value = broker.get(&service, &key).await.map_err(ToolError::from)?;
            Ok(json!({ "service": service, "key": key, "value": value }))
        }
        SecretCommand::Set {
            service,
            key,
            value,
            secret,
        } => {
            broker
                .set(&service, &key, &value, secret)
                .await
                .map_err(ToolError::from)?;
            Ok(json!({ "service": service, "key": key, "stored": true }))
        }
        SecretCommand::Delete { service, key } => {
            let deleted = broker.delete(&service, &key).await.map_err(ToolError::from)?;
            Ok(json!({ "service": service, "key": key, "deleted": deleted }))
        }
        SecretCommand::List { service: Some(service) } => {
            let keys = broker.list(&service).await.map_err(ToolError::from)?;
            Ok(json!({ "service": service, "keys": keys }))
        }
        SecretCommand::List { service: None } => {
            let services = broker.services().await.map_err(ToolError::from)?;
            Ok(json!({ "services": services }))
        }
    }
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool, format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
