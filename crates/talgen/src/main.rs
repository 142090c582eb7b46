use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use snafu::{ResultExt, Snafu, ensure};
use talgen_config::{
    command::{self, CommandKind, Selector},
    config::{ClusterSpec, loader::{self, Loader}},
    constants::{CLIENT_CONFIG_FILE_NAME, LOG_ENV},
    emission::{self, CompileOptions, Compiler, client},
    logging::{self, LogFormat},
    secret::SopsDecryptor,
    secrets::{self, SecretsBundle},
    substitution::SubstitutionContext,
    synthesis::V1Alpha1Generator,
    validation::{self, Report},
};

const APP_NAME: &str = "talgen";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to load the cluster description"))]
    LoadCluster { source: loader::Error },

    #[snafu(display("the cluster description has {count} error(s)"))]
    InvalidCluster { count: usize },

    #[snafu(display("failed to load the secrets bundle"))]
    LoadSecrets { source: secrets::Error },

    #[snafu(display("failed to reuse the existing client configuration"))]
    ReconcileClientConfig { source: client::Error },

    #[snafu(display("failed to write the generated configurations"))]
    WriteArtifacts { source: emission::Error },

    #[snafu(display("{count} node(s) failed to compile"))]
    NodesFailed { count: usize },

    #[snafu(display("failed to generate commands"))]
    GenerateCommands { source: command::Error },
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// The format of log lines, the level is set with TALGEN_LOG.
    #[arg(long, env = "TALGEN_LOG_FORMAT", value_enum, default_value_t)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate the machine configuration of every node and the client configuration.
    Genconfig(GenconfigArgs),

    /// Check the cluster description without generating anything.
    Validate(SourceArgs),

    /// Print control CLI commands for the generated configurations.
    Gencommand(GencommandArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// The cluster description.
    #[arg(short, long, env = "TALGEN_CONFIG", default_value = "talconfig.yaml")]
    config_file: PathBuf,

    /// Files with KEY=VALUE lines to substitute variables from. Variables of the environment
    /// take precedence.
    #[arg(short, long = "env-file", env = "TALGEN_ENV_FILE", value_delimiter = ',')]
    env_files: Vec<PathBuf>,

    /// The sops binary used to decrypt encrypted documents.
    #[arg(long, env = "TALGEN_SOPS", default_value = "sops")]
    sops: String,
}

#[derive(Debug, Args)]
struct GenconfigArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// The secrets bundle, as written by `talosctl gen secrets`.
    #[arg(short, long, env = "TALGEN_SECRET_FILE", default_value = "talsecret.yaml")]
    secret_file: PathBuf,

    #[arg(short, long, env = "TALGEN_OUT_DIR", default_value = "./clusterconfig")]
    out_dir: PathBuf,

    /// Don't add the generated files to the .gitignore of the output directory.
    #[arg(long)]
    no_gitignore: bool,
}

#[derive(Debug, Args)]
struct GencommandArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// One of apply-config, bootstrap, reset, upgrade, upgrade-k8s, kubeconfig, health.
    kind: CommandKind,

    /// Only target the node with this IP address or hostname.
    #[arg(short, long)]
    node: Option<Selector>,

    #[arg(short, long, env = "TALGEN_OUT_DIR", default_value = "./clusterconfig")]
    out_dir: PathBuf,

    /// The client configuration, defaults to the one in the output directory.
    #[arg(long)]
    talosconfig: Option<PathBuf>,

    /// Flags appended verbatim to every command, given after `--`.
    #[arg(last = true)]
    extra_flags: Vec<String>,
}

#[snafu::report]
fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    logging::initialize_logging(LOG_ENV, APP_NAME, cli.log_format)
        .context(InitializeLoggingSnafu)?;

    match cli.command {
        Command::Genconfig(args) => genconfig(args),
        Command::Validate(source) => validate(&source),
        Command::Gencommand(args) => gencommand(args),
    }
}

fn loader<'a>(source: &SourceArgs, decryptor: &'a SopsDecryptor) -> Result<Loader<'a>, Error> {
    let mut loader = Loader::new(decryptor, SubstitutionContext::from_process_env());
    for env_file in &source.env_files {
        loader = loader.with_env_file(env_file).context(LoadClusterSnafu)?;
    }
    Ok(loader)
}

fn load(source: &SourceArgs, loader: &mut Loader<'_>) -> Result<(ClusterSpec, Report), Error> {
    let cluster = loader
        .load_cluster(&source.config_file)
        .context(LoadClusterSnafu)?;
    let report = validation::validate(&cluster);
    Ok((cluster, report))
}

/// Prints every issue, grouped by the field it refers to.
fn print_report(report: &Report) {
    for (field, issues) in report.by_field() {
        let messages = issues
            .iter()
            .map(|issue| {
                format!(
                    "[{severity}] {message} ({kind})",
                    severity = issue.kind.severity(),
                    message = issue.message,
                    kind = issue.kind
                )
            })
            .join("; ");
        println!("{field}: {messages}");
    }
}

fn validate(source: &SourceArgs) -> Result<(), Error> {
    let decryptor = SopsDecryptor::with_program(&source.sops);
    let mut loader = loader(source, &decryptor)?;
    let (_, report) = load(source, &mut loader)?;

    print_report(&report);
    ensure!(
        !report.has_errors(),
        InvalidClusterSnafu {
            count: report.errors.len()
        }
    );
    println!(
        "{config} is valid ({warnings} warning(s))",
        config = source.config_file.display(),
        warnings = report.warnings.len()
    );
    Ok(())
}

fn genconfig(args: GenconfigArgs) -> Result<(), Error> {
    let decryptor = SopsDecryptor::with_program(&args.source.sops);
    let mut loader = loader(&args.source, &decryptor)?;
    let (cluster, report) = load(&args.source, &mut loader)?;

    for warning in &report.warnings {
        tracing::warn!(field = %warning.field, kind = %warning.kind, "{}", warning.message);
    }
    if report.has_errors() {
        print_report(&report);
        return InvalidClusterSnafu {
            count: report.errors.len(),
        }
        .fail();
    }

    let options = CompileOptions {
        out_dir: args.out_dir,
        update_gitignore: !args.no_gitignore,
    };

    let mut bundle =
        SecretsBundle::from_file(&args.secret_file, &mut loader).context(LoadSecretsSnafu)?;
    client::reconcile_existing(
        &mut bundle,
        &options.out_dir.join(CLIENT_CONFIG_FILE_NAME),
        &cluster.cluster_name,
    )
    .context(ReconcileClientConfigSnafu)?;

    let compiler = Compiler::new(
        bundle.freeze(),
        &V1Alpha1Generator,
        &decryptor,
        loader.into_context(),
    );
    let compiled = compiler.compile(&cluster);

    compiled
        .write_artifacts(&options.out_dir)
        .context(WriteArtifactsSnafu)?;
    if options.update_gitignore {
        emission::update_gitignore(&options.out_dir, &compiled.file_names())
            .context(WriteArtifactsSnafu)?;
    }

    for failure in &compiled.failures {
        eprintln!("{failure}");
    }
    ensure!(
        compiled.is_success(),
        NodesFailedSnafu {
            count: compiled.failures.len()
        }
    );
    Ok(())
}

fn gencommand(args: GencommandArgs) -> Result<(), Error> {
    let decryptor = SopsDecryptor::with_program(&args.source.sops);
    let mut loader = loader(&args.source, &decryptor)?;
    let (cluster, _) = load(&args.source, &mut loader)?;

    let talosconfig = args
        .talosconfig
        .unwrap_or_else(|| args.out_dir.join(CLIENT_CONFIG_FILE_NAME));
    let commands = command::generate(
        &cluster,
        args.kind,
        &args.node.unwrap_or_default(),
        &talosconfig,
        &args.out_dir,
        &args.extra_flags,
    )
    .context(GenerateCommandsSnafu)?;

    for command in commands {
        println!("{command}");
    }
    Ok(())
}
