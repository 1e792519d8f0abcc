use std::path::PathBuf;

use clap::Parser;

use crate::models::Ecosystem;

#[derive(Parser, Debug)]
#[command(
    name = "manifest-recoverr",
    about = "Reconstruct dependency manifests from declared, scanned and SBOM evidence",
    version
)]
pub struct Cli {
    /// Project path to recover (ignored with --repo-file)
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// JSON list of repositories to clone and recover: [{"repo", "branch"?, "product"?}]
    #[arg(long, value_name = "FILE")]
    pub repo_file: Option<PathBuf>,

    /// Config file [default: ./.manifest-recoverr/config.toml, fallback ~/.config/manifest-recoverr/config.toml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory to store manifest backups (overrides config)
    #[arg(long, value_name = "DIR")]
    pub backup: Option<PathBuf>,

    /// YAML curation rule file (overrides config)
    #[arg(long, value_name = "FILE")]
    pub curations: Option<PathBuf>,

    /// SBOM scanner binary (overrides config)
    #[arg(long, value_name = "BIN")]
    pub scanner: Option<String>,

    /// Skip SBOM generation; versions come from manifests and lockfiles only
    #[arg(long)]
    pub no_sbom: bool,

    /// Exclude an ecosystem from recovery (repeatable)
    #[arg(long = "exclude-lang", value_name = "LANG")]
    pub exclude_lang: Vec<EcosystemArg>,

    /// Report format
    #[arg(long, default_value = "terminal", value_name = "FORMAT")]
    pub report: ReportFormat,

    /// Keep cloned repositories after the run
    #[arg(long)]
    pub keep_temp: bool,

    /// Also append plain-text logs to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print the totals line
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum ReportFormat {
    Terminal,
    Json,
}

#[derive(Debug, Clone, clap::ValueEnum)]
pub enum EcosystemArg {
    Go,
    Node,
    Python,
    Java,
    Rust,
    Dotnet,
    Ruby,
    Php,
}

impl From<&EcosystemArg> for Ecosystem {
    fn from(arg: &EcosystemArg) -> Self {
        match arg {
            EcosystemArg::Go => Ecosystem::Go,
            EcosystemArg::Node => Ecosystem::Node,
            EcosystemArg::Python => Ecosystem::Python,
            EcosystemArg::Java => Ecosystem::Java,
            EcosystemArg::Rust => Ecosystem::Rust,
            EcosystemArg::Dotnet => Ecosystem::DotNet,
            EcosystemArg::Ruby => Ecosystem::Ruby,
            EcosystemArg::Php => Ecosystem::Php,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "manifest-recoverr",
            "--repo-file",
            "repos.json",
            "--no-sbom",
            "--exclude-lang",
            "dotnet",
            "--exclude-lang",
            "php",
            "--report",
            "json",
            "-q",
        ])
        .unwrap();

        assert_eq!(cli.path, PathBuf::from("."));
        assert_eq!(cli.repo_file, Some(PathBuf::from("repos.json")));
        assert!(cli.no_sbom);
        assert!(cli.quiet);
        assert!(matches!(cli.report, ReportFormat::Json));
        let excluded: Vec<Ecosystem> = cli.exclude_lang.iter().map(Into::into).collect();
        assert_eq!(excluded, vec![Ecosystem::DotNet, Ecosystem::Php]);
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        assert!(Cli::try_parse_from(["manifest-recoverr", "--exclude-lang", "swift"]).is_err());
    }
}
