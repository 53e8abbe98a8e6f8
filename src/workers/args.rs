//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` or `--config <file>`)
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::DEFAULT_IDEA_ID;

/// Scenecast - push media to remote screens and drive scenes on them.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default, rename_all = "kebab-case")]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (cache, logs).
    /// Defaults to ~/.scenecast/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    /// TOML file with default values for these options.
    /// Defaults to ./config.toml when present.
    #[clap(long, global = true)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Identifier announced to peers. A random one is generated when unset.
    #[clap(long, global = true)]
    pub client_id: Option<String>,

    /// Carry upload traffic over a second, dedicated connection.
    #[clap(long, global = true)]
    pub bulk_channel: bool,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Mode>,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Mode {
    /// Receive uploads and play scenes on this machine.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:7878")]
        listen: String,
    },
    /// Upload files to a receiver.
    Push {
        /// Receiver address (host:port).
        peer: String,
        /// Files to send.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Idea the files belong to.
        #[arg(long, default_value = DEFAULT_IDEA_ID)]
        idea: String,
    },
    /// Start a scene described by a JSON file on a receiver.
    Scene {
        peer: String,
        file: PathBuf,
    },
    /// Stop the scene running on a receiver.
    Stop { peer: String },
    /// Remove every file of an idea from a receiver.
    Clear {
        peer: String,
        #[arg(long, default_value = DEFAULT_IDEA_ID)]
        idea: String,
    },
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);

        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        if let Some(file_args) = Self::from_file(&path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.client_id.is_some() {
            file.client_id = cli.client_id;
        }
        if cli.bulk_channel {
            file.bulk_channel = true;
        }
        file.config = cli.config;
        file.command = cli.command;
        file
    }

    /// Configured client id, or a fresh random one.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_fill_gaps_and_cli_wins() {
        let file: Args = toml::from_str(
            r#"
            verbose = 2
            client-id = "studio-a"
            bulk-channel = true
            "#,
        )
        .unwrap();
        let cli = Args::parse_from(["scenecast", "--client-id", "stage-left", "stop", "10.0.0.2:7878"]);

        let merged = Args::merge(file, cli);
        assert_eq!(merged.verbose, 2);
        assert!(merged.bulk_channel);
        assert_eq!(merged.client_id.as_deref(), Some("stage-left"));
        assert_eq!(
            merged.command,
            Some(Mode::Stop {
                peer: "10.0.0.2:7878".into()
            })
        );
    }

    #[test]
    fn push_defaults_to_the_default_idea() {
        let args = Args::parse_from(["scenecast", "push", "host:1", "a.mp4", "b.png"]);
        match args.command {
            Some(Mode::Push { files, idea, .. }) => {
                assert_eq!(files.len(), 2);
                assert_eq!(idea, DEFAULT_IDEA_ID);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let args = Args::default();
        assert_ne!(args.client_id(), args.client_id());
    }
}
