//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwright::cli::{Cli, Commands, OutputFormat, OutputFormatter, ProgramArgs, StateCommands};
use stackwright::config::{
    find_config_file, ConfigParser, ConfigValidator, StackwrightConfig, StateBackend,
};
use stackwright::coordinator::LifecycleCoordinator;
use stackwright::error::{ConfigError, Result, StackwrightError};
use stackwright::planner::events::{self, EventReceiver};
use stackwright::program::kubernetes::{deployment_program, DeploymentArgs};
use stackwright::program::Program;
use stackwright::provider::{KubernetesProvider, ResourceProvider};
use stackwright::state::{LocalStateStore, S3StateStore, StackRef, StateStore, STATE_DIR};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    // Pick up PROJECT_NAME / STACK_NAME from ./.env before clap reads the environment.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, formatter)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", formatter.error(&format!("Error: {e}")));
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, output: OutputFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: OutputFormatter) -> Result<()> {
    let context = Context::load(&cli)?;

    match cli.command {
        Commands::Create { program } => {
            cmd_apply(&context, Apply::Create, &program, formatter).await
        }
        Commands::Update { program } => {
            cmd_apply(&context, Apply::Update, &program, formatter).await
        }
        Commands::Up { program } => cmd_apply(&context, Apply::Up, &program, formatter).await,
        Commands::Preview { program, detailed } => {
            cmd_preview(&context, &program, detailed, formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(&context, yes, formatter).await,
        Commands::Outputs => cmd_outputs(&context, formatter).await,
        Commands::List => cmd_list(&context, formatter).await,
        Commands::Validate { program, warnings } => {
            cmd_validate(&context, &program, warnings, formatter)
        }
        Commands::State { command } => cmd_state(&context, command, formatter).await,
    }
}

/// Lifecycle operations that deploy a program.
#[derive(Debug, Clone, Copy)]
enum Apply {
    Create,
    Update,
    Up,
}

/// Create, update or up a stack.
async fn cmd_apply(
    context: &Context,
    apply: Apply,
    args: &ProgramArgs,
    formatter: OutputFormatter,
) -> Result<()> {
    let stack = context.stack_ref()?;
    let program = load_program(args)?;

    let (sender, receiver) = events::channel();
    let printer = tokio::spawn(print_events(receiver, formatter));
    let coordinator = context.coordinator().await?.with_events(sender);

    let result = match apply {
        Apply::Create => coordinator.create(&stack, &program).await,
        Apply::Update => coordinator.update(&stack, &program).await,
        Apply::Up => coordinator.up(&stack, &program).await,
    };
    drop(coordinator);
    let _ = printer.await;

    let outputs = result?;
    write_stdout(&formatter.format_outputs(&outputs))?;

    if !formatter.is_json() {
        eprintln!("{}", formatter.applied(&outputs));
    }

    Ok(())
}

/// Show the plan an update would apply.
async fn cmd_preview(
    context: &Context,
    args: &ProgramArgs,
    detailed: bool,
    formatter: OutputFormatter,
) -> Result<()> {
    let stack = context.stack_ref()?;
    let program = load_program(args)?;
    let coordinator = context.coordinator().await?;

    let plan = coordinator.preview(&stack, &program).await?;
    write_stdout(&formatter.format_plan(&plan, detailed))
}

/// Destroy a stack.
async fn cmd_destroy(context: &Context, auto_approve: bool, formatter: OutputFormatter) -> Result<()> {
    let stack = context.stack_ref()?;

    if !auto_approve {
        eprint!("All resources of '{stack}' will be deleted. Type 'destroy' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let (sender, receiver) = events::channel();
    let printer = tokio::spawn(print_events(receiver, formatter));
    let coordinator = context.coordinator().await?.with_events(sender);

    let result = coordinator.destroy(&stack).await;
    drop(coordinator);
    let _ = printer.await;
    result?;

    eprintln!(
        "{}",
        formatter.success(&format!("Stack '{stack}' successfully deleted!"))
    );
    Ok(())
}

/// Show stack outputs.
async fn cmd_outputs(context: &Context, formatter: OutputFormatter) -> Result<()> {
    let stack = context.stack_ref()?;
    let outputs = context.coordinator().await?.outputs(&stack).await?;
    write_stdout(&formatter.format_outputs(&outputs))
}

/// List the stacks of a project.
async fn cmd_list(context: &Context, formatter: OutputFormatter) -> Result<()> {
    let project = context.project()?;
    let stacks = context.coordinator().await?.list(&project).await?;
    write_stdout(&formatter.format_stacks(&project, &stacks))
}

/// Validate configuration and program.
fn cmd_validate(
    context: &Context,
    args: &ProgramArgs,
    show_warnings: bool,
    formatter: OutputFormatter,
) -> Result<()> {
    let validator = ConfigValidator::new();

    let mut result = validator.validate(&context.config)?;
    if context.stack.is_some() {
        context.stack_ref()?;
    }

    let program = load_program(args)?;
    let program_result = validator.validate_program(&program)?;
    result.warnings.extend(program_result.warnings);

    write_stdout(&formatter.format_validation(&result, show_warnings))?;
    if !formatter.is_json() {
        eprintln!("\nConfiguration summary:");
        if let Some(config_file) = &context.config_file {
            eprintln!("  File: {}", config_file.display());
        }
        eprintln!("  Project: {}", context.project().unwrap_or_else(|_| String::from("-")));
        eprintln!("  Stack: {}", context.stack.as_deref().unwrap_or("-"));
        eprintln!("  State backend: {:?}", context.config.state.backend);
        eprintln!("  Resources: {}", program.resources().len());
    }

    Ok(())
}

/// State management commands.
async fn cmd_state(context: &Context, command: StateCommands, formatter: OutputFormatter) -> Result<()> {
    let stack = context.stack_ref()?;
    let store = context.store().await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load(&stack).await? {
                write_stdout(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found for {stack}.");
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info(&stack).await? {
                    store.release_lock(&stack, &lock_info.lock_id).await?;
                    eprintln!("Stack {stack} forcefully unlocked (was held by {}).", lock_info.holder);
                } else {
                    eprintln!("Stack {stack} is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&stack, &id).await?;
                eprintln!("Stack {stack} unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolved configuration and stack identity.
struct Context {
    /// Loaded configuration.
    config: StackwrightConfig,
    /// Configuration file, if one was found.
    config_file: Option<PathBuf>,
    /// Directory relative paths are resolved against.
    base_dir: PathBuf,
    /// Project name from the command line or environment.
    project: Option<String>,
    /// Stack name from the command line, environment or configuration.
    stack: Option<String>,
}

impl Context {
    /// Loads the configuration named on the command line, or the nearest
    /// `stackwright.yaml`, or the defaults.
    fn load(cli: &Cli) -> Result<Self> {
        let config_file = match &cli.config {
            Some(path) => Some(path.clone()),
            None => find_config_file(std::env::current_dir()?).ok(),
        };

        let base_dir = config_file
            .as_deref()
            .and_then(Path::parent)
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;

        let config = match &config_file {
            Some(path) => parser.load_with_env(path)?,
            None => {
                debug!("No configuration file found, using defaults");
                let mut config = StackwrightConfig::default();
                ConfigParser::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
                config
            }
        };
        ConfigValidator::new().validate(&config)?;

        let project = cli
            .project
            .clone()
            .or_else(|| config.project.clone())
            .or_else(|| std::env::var("PROJECT_NAME").ok());
        let stack = cli
            .stack
            .clone()
            .or_else(|| config.stack.clone())
            .or_else(|| std::env::var("STACK_NAME").ok());

        Ok(Self {
            config,
            config_file,
            base_dir,
            project,
            stack,
        })
    }

    fn project(&self) -> Result<String> {
        self.project.clone().ok_or_else(|| {
            StackwrightError::Config(ConfigError::MissingEnvVar {
                name: String::from("PROJECT_NAME"),
            })
        })
    }

    fn stack_ref(&self) -> Result<StackRef> {
        let stack = self.stack.clone().ok_or_else(|| {
            StackwrightError::Config(ConfigError::MissingEnvVar {
                name: String::from("STACK_NAME"),
            })
        })?;
        let stack = StackRef::new(self.project()?, stack);
        ConfigValidator::new().validate_stack(&stack)?;
        Ok(stack)
    }

    /// Creates the configured state store.
    async fn store(&self) -> Result<Arc<dyn StateStore>> {
        let state = &self.config.state;
        let store: Arc<dyn StateStore> = match state.backend {
            StateBackend::Local => {
                let path = state
                    .path
                    .as_ref()
                    .map_or_else(|| self.base_dir.join(STATE_DIR), PathBuf::from);
                debug!("Using local state in {}", path.display());
                Arc::new(LocalStateStore::with_base_dir(path))
            }
            StateBackend::S3 => {
                let bucket = state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| StackwrightError::internal("S3 bucket not configured"))?;
                info!("Using S3 state in bucket {bucket}");
                Arc::new(S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref()).await?)
            }
        };
        Ok(store)
    }

    /// Creates the Kubernetes provider.
    fn provider(&self) -> Result<Arc<dyn ResourceProvider>> {
        let kube = &self.config.provider.kubernetes;
        let provider_config = kube.provider_config(|name| std::env::var(name).ok())?;
        debug!(
            "Using Kubernetes API server {} (namespace {})",
            provider_config.api_server, provider_config.namespace
        );
        Ok(Arc::new(KubernetesProvider::new(provider_config)?))
    }

    async fn coordinator(&self) -> Result<LifecycleCoordinator> {
        Ok(LifecycleCoordinator::new(self.store().await?, self.provider()?)
            .with_options(self.config.execution.options()))
    }
}

/// Loads the program file, or builds the nginx Deployment.
fn load_program(args: &ProgramArgs) -> Result<Program> {
    match &args.program {
        Some(path) => Program::load_file(path),
        None => Ok(deployment_program(&DeploymentArgs::nginx(args.replicas))),
    }
}

/// Prints progress events until every sender is gone.
async fn print_events(mut receiver: EventReceiver, formatter: OutputFormatter) {
    while let Some(event) = receiver.recv().await {
        eprintln!("{}", formatter.format_event(&event));
    }
}

/// Writes command output to stdout.
fn write_stdout(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}
