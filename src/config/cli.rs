use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the staticplus binary.
#[derive(Debug, Parser)]
#[command(
    name = "staticplus",
    version,
    about = "Incremental site builder fed by a CouchDB change feed"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STATICPLUS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Prepare a staged site and keep its staging design document built.
    Site(Box<SiteArgs>),
    /// Build pages from one database with a single template.
    Build(BuildArgs),
}

impl Command {
    pub fn common(&self) -> &CommonOverrides {
        match self {
            Command::Site(args) => &args.common,
            Command::Build(args) => &args.common,
        }
    }
}

/// Overrides shared by every subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Credentials for the store, as `user:password`.
    #[arg(long = "creds", value_name = "USER:PASS")]
    pub creds: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SiteArgs {
    /// Store server URL, e.g. http://127.0.0.1:5984.
    #[arg(value_name = "STORE_URL", value_hint = ValueHint::Url)]
    pub store_url: String,

    /// Database holding the site.
    #[arg(value_name = "DATABASE")]
    pub database: String,

    /// Site hostname; virtual hosts are the prefixes plus this name.
    #[arg(value_name = "HOSTNAME")]
    pub hostname: String,

    #[command(flatten)]
    pub overrides: SiteOverrides,

    /// Replace the seed document's attachments with this directory.
    #[arg(long = "seed", value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub seed: Option<PathBuf>,

    /// Merge this directory into the staging design document.
    #[arg(long = "publish", value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub publish: Option<PathBuf>,

    /// Keep publishing files from --publish as they change.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub watch: bool,

    /// Flag the staging design document for promotion and exit.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub promote: bool,

    #[command(flatten)]
    pub common: CommonOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SiteOverrides {
    /// Override the production host prefix.
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub production_prefix: Option<String>,

    /// Override the staging host prefix.
    #[arg(long = "staging-prefix", value_name = "PREFIX")]
    pub staging_prefix: Option<String>,

    /// Host prefix bounced to production after each promotion.
    #[arg(long = "bounce-prefix", value_name = "PREFIX")]
    pub bounce_prefix: Option<String>,

    /// Override the push cycle in milliseconds.
    #[arg(long = "cycle", value_name = "MS")]
    pub cycle_ms: Option<u64>,

    /// Install a validation function that only admins and editors pass.
    #[arg(
        long = "read-only",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub read_only: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct BuildArgs {
    /// Source database URL.
    #[arg(value_name = "SOURCE_DB_URL", value_hint = ValueHint::Url)]
    pub source: String,

    /// Template applied to every document.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub template: PathBuf,

    /// Output directory, or a document URL for remote output.
    #[arg(long, value_name = "DIR|URL")]
    pub output: String,

    /// Stop after the first deploy.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub autostop: bool,

    #[command(flatten)]
    pub common: CommonOverrides,
}
