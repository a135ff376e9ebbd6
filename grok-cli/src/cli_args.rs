use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use grok_authz::AuthzConfig;
use grok_authz::RequestContext;
use grok_authz::User;

/// Inspect and exercise the authorization stack.
#[derive(Debug, Parser)]
#[command(name = "grok-authz", version, about, long_about = None)]
pub struct Cli {
    /// Authorization configuration file.
    #[arg(short, long, default_value = "authz.toml", global = true)]
    pub config: PathBuf,

    /// Overrides `plugin_directory` from the configuration.
    #[arg(long, value_name = "DIR", global = true)]
    pub plugin_directory: Option<PathBuf>,

    /// Log reload progress (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan the plugin directory and report what was found.
    Reload {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Decide one request against the loaded stack.
    Check(CheckArgs),
    /// Print the effective stack hierarchy.
    Stack,
    /// Print the state of every stack entry.
    Status {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Decide the given requests and print the collected statistics.
    Stats(CheckArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Args)]
pub struct CheckArgs {
    /// Project to check; may be repeated.
    #[arg(long = "project", value_name = "NAME", required_unless_present = "groups")]
    pub projects: Vec<String>,

    /// Group to check; may be repeated.
    #[arg(long = "group", value_name = "NAME")]
    pub groups: Vec<String>,

    /// Name of the requesting user.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Identifier of the requesting user.
    #[arg(long, requires = "user")]
    pub id: Option<String>,

    /// Request header as NAME=VALUE; may be repeated.
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

impl CheckArgs {
    pub fn request(&self) -> RequestContext {
        let mut request = RequestContext::new();
        if let Some(username) = &self.user {
            let mut user = User::new(username.as_str());
            if let Some(id) = &self.id {
                user = user.with_id(id.as_str());
            }
            request = request.with_user(user);
        }
        for (name, value) in &self.headers {
            request = request.with_header(name, value.as_str());
        }
        request
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got \"{raw}\"")),
    }
}

impl Cli {
    /// Reads the configuration file and applies command line overrides.
    pub fn load_config(&self) -> grok_authz::Result<AuthzConfig> {
        let mut config = AuthzConfig::from_path(&self.config)?;
        if let Some(directory) = &self.plugin_directory {
            config.plugin_directory = Some(directory.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_check_args() {
        let cli = Cli::try_parse_from([
            "grok-authz",
            "--config",
            "/etc/grok/authz.toml",
            "check",
            "--project",
            "kernel",
            "--group",
            "system",
            "--user",
            "alice",
            "--id",
            "42",
            "--header",
            "X-Forwarded-For=10.0.0.1",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/grok/authz.toml"));
        let Command::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(args.projects, vec!["kernel".to_string()]);
        assert_eq!(args.groups, vec!["system".to_string()]);

        let request = args.request();
        let user = request.user().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.id.as_deref(), Some("42"));
        assert_eq!(request.header("x-forwarded-for"), Some("10.0.0.1"));
    }

    #[test]
    fn test_check_requires_a_target() {
        assert!(Cli::try_parse_from(["grok-authz", "check", "--user", "alice"]).is_err());
        assert!(Cli::try_parse_from(["grok-authz", "check", "--project", "p", "--id", "1"]).is_err());
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(
            parse_header("Accept=a=b"),
            Ok(("Accept".to_string(), "a=b".to_string()))
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=x").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "grok-authz",
            "status",
            "--format",
            "json",
            "--plugin-directory",
            "/tmp/plugins",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.plugin_directory, Some(PathBuf::from("/tmp/plugins")));
        assert!(matches!(cli.command, Command::Status { format: OutputFormat::Json }));
    }
}
