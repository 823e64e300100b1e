//! CLI argument parsing tests

use clap::{CommandFactory, Parser};

use crate::{Cli, Commands, ConfigAction, OutputFormat, PluginAction};

#[test]
fn test_cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn test_serve_overrides() {
    let cli = Cli::try_parse_from(["keelson", "serve", "--host", "0.0.0.0", "-p", "3443"]).expect("parse");
    match cli.command {
        Commands::Serve { host, port } => {
            assert_eq!(host.as_deref(), Some("0.0.0.0"));
            assert_eq!(port, Some(3443));
        }
        _ => panic!("expected serve"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["keelson", "plugins", "list", "--format", "json", "-q"]).expect("parse");
    assert!(matches!(cli.format, OutputFormat::Json));
    assert!(cli.quiet);
    assert!(matches!(
        cli.command,
        Commands::Plugins {
            action: PluginAction::List
        }
    ));
}

#[test]
fn test_config_set_takes_key_and_value() {
    let cli = Cli::try_parse_from(["keelson", "config", "set", "server.port", "8080"]).expect("parse");
    match cli.command {
        Commands::Config {
            action: ConfigAction::Set { key, value },
        } => {
            assert_eq!(key, "server.port");
            assert_eq!(value, "8080");
        }
        _ => panic!("expected config set"),
    }
}

#[test]
fn test_invalid_port_is_rejected() {
    assert!(Cli::try_parse_from(["keelson", "serve", "--port", "70000"]).is_err());
    assert!(Cli::try_parse_from(["keelson", "inspect"]).is_err());
}
