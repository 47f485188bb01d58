//! Command-line interface for toolhost

use clap::{Parser, Subcommand, ValueEnum};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::io::{self, Write};
use std::path::PathBuf;

/// toolhost - plugin host and credential store for agent tools
#[derive(Parser, Debug)]
#[command(name = "toolhost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Configuration directory (holds secrets.json)
    #[arg(long, value_name = "DIR", global = true, env = "TOOLHOST_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List catalog plugins and whether they are loaded and configured
    Plugins,

    /// Print tool manifests
    Tools {
        /// Only tools of this plugin
        #[arg(long)]
        plugin: Option<String>,
    },

    /// Show a plugin's status
    Status { plugin: String },

    /// Store a plugin's settings and credentials
    Configure {
        plugin: String,

        /// Set a field without prompting (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        values: Vec<String>,
    },

    /// Run a plugin's interactive authorization
    Auth {
        plugin: String,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Invoke a tool
    Invoke {
        plugin: String,
        tool: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Approve destructive tools without prompting
        #[arg(long)]
        yes: bool,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Inspect or edit the secret store directly
    Secret {
        #[command(subcommand)]
        action: SecretCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SecretCommand {
    /// Print a value
    Get { service: String, key: String },

    /// Store a value
    Set {
        service: String,
        key: String,
        value: String,

        /// Tag the value as secret (redacted in logs)
        #[arg(long)]
        secret: bool,
    },

    /// Remove a value
    Delete { service: String, key: String },

    /// List keys of a service, or all services
    List { service: Option<String> },
}

/// Split `KEY=VALUE`
pub fn parse_assignment(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// Read a line with editing support
pub fn read_line(prompt: &str) -> io::Result<Option<String>> {
    let mut editor = rustyline::DefaultEditor::new()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    match editor.readline(prompt) {
        Ok(line) => Ok(Some(line)),
        Err(rustyline::error::ReadlineError::Eof)
        | Err(rustyline::error::ReadlineError::Interrupted) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

/// Read a line without echo; `None` on Esc or Ctrl-C
pub fn read_hidden(prompt: &str) -> io::Result<Option<String>> {
    eprint!("{}", prompt);
    io::stderr().flush()?;

    crossterm::terminal::enable_raw_mode()?;
    let result = read_hidden_raw();
    let _ = crossterm::terminal::disable_raw_mode();
    eprintln!();
    result
}

fn read_hidden_raw() -> io::Result<Option<String>> {
    let mut input = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(Some(input)),
            KeyCode::Esc => return Ok(None),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return Ok(None),
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(c) => input.push(c),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_with_flags() {
        let args = Args::parse_from([
            "toolhost",
            "--debug",
            "--config",
            "/tmp/config.toml",
            "plugins",
        ]);
        assert!(args.debug);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/config.toml")));
        assert!(matches!(args.command, Command::Plugins));
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_invoke_args() {
        let args = Args::parse_from([
            "toolhost",
            "invoke",
            "rest",
            "rest_get",
            "--args",
            r#"{"path":"/x"}"#,
            "--log-format",
            "json",
        ]);
        match args.command {
            Command::Invoke {
                plugin, tool, args: raw, yes, ..
            } => {
                assert_eq!(plugin, "rest");
                assert_eq!(tool, "rest_get");
                assert_eq!(raw, r#"{"path":"/x"}"#);
                assert!(!yes);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_secret_set_args() {
        let args = Args::parse_from(["toolhost", "secret", "set", "google", "token", "v", "--secret"]);
        match args.command {
            Command::Secret {
                action:
                    SecretCommand::Set {
                        service,
                        key,
                        value,
                        secret,
                    },
            } => {
                assert_eq!((service.as_str(), key.as_str(), value.as_str()), ("google", "token", "v"));
                assert!(secret);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("token=a=b"),
            Some(("token".to_string(), "a=b".to_string()))
        );
        assert_eq!(parse_assignment("=x"), None);
        assert_eq!(parse_assignment("novalue"), None);
    }
}
