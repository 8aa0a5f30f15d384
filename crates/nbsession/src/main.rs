use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};

use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use nbsession::api::{self, AppState, SlackState};
use nbsession::container::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
use nbsession::dispatch::Dispatcher;
use nbsession::notify::{
    ACCESS_EMAIL_TEMPLATE, Mailer, Notifier, OpsChannel, SPARKPOST_API_URL, SparkPostClient,
    WebhookClient,
};
use nbsession::session::{
    DEFAULT_IMAGE, DEFAULT_MOUNT_PATH, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS, NOTEBOOK_PORT,
    SessionService, SessionServiceConfig, StartQueue,
};
use nbsession::token::ScanLimits;
use nbsession::workspace::{Ownership, WorkspaceConfig, WorkspacePolicy, WorkspaceProvisioner};

const APP_NAME: &str = "nbsession";

/// Legacy Slack deployment variables, mapped onto config keys.
const LEGACY_ENV: [(&str, LegacyKey); 4] = [
    ("SLACK_INCOMING_HOOK", LegacyKey::WebhookUrl),
    ("SPARKPOST_API_KEY", LegacyKey::EmailApiKey),
    ("SLACK_SLASH_TOKEN", LegacyKey::SlackToken),
    ("SLACK_SLASH_TEAM_ID", LegacyKey::SlackTeamId),
];

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_sessions(ctx: RuntimeContext, cmd: SessionCommand) -> Result<()> {
    handle_sessions(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::List => async_sessions(ctx, SessionCommand::List),
        Command::Start(cmd) => async_sessions(ctx, SessionCommand::Start(cmd)),
        Command::Stop(cmd) => async_sessions(ctx, SessionCommand::Stop(cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "nbsession - on-demand notebook sandboxes driven by chat commands.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk or in the container runtime
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server answering slash commands
    Serve(ServeCommand),
    /// List sandbox containers
    List,
    /// Start (or reuse) a user's sandbox and print its access URL
    Start(StartCommand),
    /// Stop one user's sandbox, or all of them
    Stop(StopCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct StartCommand {
    /// User whose sandbox to start
    #[arg(value_name = "USER")]
    user: String,
    /// Hostname used in the access URL (defaults to server.public_hostname or localhost)
    #[arg(long)]
    hostname: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct StopCommand {
    /// User whose sandbox to stop; stops every sandbox when omitted
    #[arg(value_name = "USER")]
    user: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

/// One-shot session operations run from the command line.
#[derive(Debug)]
enum SessionCommand {
    List,
    Start(StartCommand),
    Stop(StopCommand),
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Library modules log through the `log` facade
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    /// Controller root: holds the `exam/` template and `sandboxes/`.
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref root) = cfg.workspace.root {
            self.data_dir = expand_str_path(root)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    server: ServerConfig,
    container: ContainerSection,
    workspace: WorkspaceSection,
    token: TokenSection,
    notify: NotifySection,
    email: EmailSection,
    slack: SlackSection,
    workers: WorkersSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Hostname put into access URLs instead of the request's `Host` header
    public_hostname: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            public_hostname: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerSection {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Sandbox image
    image: String,
    cpuset: String,
    memory: String,
    /// Notebook port inside the container
    internal_port: String,
    /// Where the workspace is mounted inside the container
    mount_path: String,
    ready_timeout_secs: u64,
}

impl Default for ContainerSection {
    fn default() -> Self {
        let defaults = SessionServiceConfig::default();
        Self {
            runtime: None,
            binary: None,
            image: DEFAULT_IMAGE.to_string(),
            cpuset: defaults.cpuset_cpus,
            memory: defaults.memory,
            internal_port: NOTEBOOK_PORT.to_string(),
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            ready_timeout_secs: defaults.ready_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct WorkspaceSection {
    /// Controller root (defaults to the data directory)
    root: Option<String>,
    /// Template tree (defaults to `<root>/exam`)
    template_dir: Option<String>,
    /// Parent of per-user workspaces (defaults to `<root>/sandboxes`)
    sandboxes_dir: Option<String>,
    /// Owner uid applied to new workspaces
    sandbox_uid: u32,
    /// Group applied to new workspaces; unset leaves ownership alone
    sandbox_gid: Option<u32>,
    /// Octal permission bits, e.g. "770"
    mode: String,
    /// Identities that get the controller root instead of a workspace
    privileged_identities: Vec<String>,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: None,
            template_dir: None,
            sandboxes_dir: None,
            sandbox_uid: 0,
            sandbox_gid: Some(100),
            mode: "770".to_string(),
            privileged_identities: vec!["admin".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct TokenSection {
    scan_timeout_secs: u64,
    max_lines: usize,
}

impl Default for TokenSection {
    fn default() -> Self {
        let limits = ScanLimits::default();
        Self {
            scan_timeout_secs: limits.timeout.as_secs(),
            max_lines: limits.max_lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct NotifySection {
    /// Incoming webhook for operator messages; unset disables them
    webhook_url: Option<String>,
    retries: u32,
    retry_delay_ms: u64,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retries: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct EmailSection {
    enabled: bool,
    api_key: Option<String>,
    api_url: String,
    template: String,
}

impl Default for EmailSection {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            api_url: SPARKPOST_API_URL.to_string(),
            template: ACCESS_EMAIL_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SlackSection {
    /// Verification token of the slash command; unset accepts any
    token: Option<String>,
    /// Workspace id the command must come from; unset accepts any
    team_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct WorkersSection {
    start_concurrency: usize,
    queue_capacity: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            start_concurrency: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LegacyKey {
    WebhookUrl,
    EmailApiKey,
    SlackToken,
    SlackTeamId,
}

impl AppConfig {
    /// Apply the legacy deployment variables found by `lookup`.
    fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (name, key) in LEGACY_ENV {
            let Some(value) = lookup(name).filter(|v| !v.is_empty()) else {
                continue;
            };
            debug!("applying {name} from the environment");
            let slot = match key {
                LegacyKey::WebhookUrl => &mut self.notify.webhook_url,
                LegacyKey::EmailApiKey => &mut self.email.api_key,
                LegacyKey::SlackToken => &mut self.slack.token,
                LegacyKey::SlackTeamId => &mut self.slack.team_id,
            };
            *slot = Some(value);
        }
    }

    fn session_config(&self) -> SessionServiceConfig {
        SessionServiceConfig {
            image: self.container.image.clone(),
            cpuset_cpus: self.container.cpuset.clone(),
            memory: self.container.memory.clone(),
            internal_port: self.container.internal_port.clone(),
            mount_path: self.container.mount_path.clone(),
            ready_timeout: Duration::from_secs(self.container.ready_timeout_secs),
            scan_limits: ScanLimits {
                timeout: Duration::from_secs(self.token.scan_timeout_secs),
                max_lines: self.token.max_lines,
            },
            ..SessionServiceConfig::default()
        }
    }

    fn workspace_config(&self, root: &Path) -> Result<WorkspaceConfig> {
        let mut config = WorkspaceConfig::with_root(root);
        if let Some(ref template) = self.workspace.template_dir {
            config.template_dir = expand_str_path(template)?;
        }
        if let Some(ref sandboxes) = self.workspace.sandboxes_dir {
            config.sandboxes_dir = expand_str_path(sandboxes)?;
        }
        config.ownership = self.workspace.sandbox_gid.map(|gid| Ownership {
            uid: self.workspace.sandbox_uid,
            gid,
        });
        config.mode = parse_mode(&self.workspace.mode)?;
        Ok(config)
    }
}

/// Parse octal permission bits such as `770`, `0770` or `0o770`.
fn parse_mode(text: &str) -> Result<u32> {
    let digits = text.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid workspace mode {text:?}"))?;
    if mode > 0o7777 {
        return Err(anyhow!("workspace mode {text:?} out of range"));
    }
    Ok(mode)
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {} and create {}",
            ctx.paths.config_file.display(),
            ctx.paths.data_dir.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)?;
    let workspace = ctx.config.workspace_config(&ctx.paths.data_dir)?;
    for dir in [&workspace.template_dir, &workspace.sandboxes_dir] {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Pick the container runtime named in config, or auto-detect one.
fn build_runtime(config: &ContainerSection) -> ContainerRuntime {
    match (config.runtime, &config.binary) {
        (Some(runtime_type), Some(binary)) => ContainerRuntime::with_binary(runtime_type, binary),
        (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary),
        (Some(runtime_type), None) => ContainerRuntime::with_type(runtime_type),
        (None, None) => ContainerRuntime::new(),
    }
}

fn build_notifier(config: &AppConfig) -> Result<Notifier> {
    let channel: Option<Arc<dyn OpsChannel>> = match config.notify.webhook_url {
        Some(ref url) => Some(Arc::new(
            WebhookClient::new(url).context("creating webhook client")?,
        )),
        None => {
            warn!("notify.webhook_url is not set, operator messages are only logged");
            None
        }
    };

    let mailer: Option<Arc<dyn Mailer>> = match (config.email.enabled, &config.email.api_key) {
        (true, Some(key)) => Some(Arc::new(
            SparkPostClient::new(&config.email.api_url, key).context("creating mail client")?,
        )),
        (true, None) => {
            warn!("email.api_key is not set, access emails are disabled");
            None
        }
        (false, _) => None,
    };

    Ok(Notifier::new(channel, mailer)
        .template(&config.email.template)
        .retries(config.notify.retries)
        .retry_delay(Duration::from_millis(config.notify.retry_delay_ms)))
}

/// Wire the session service from configuration.
async fn build_service(ctx: &RuntimeContext) -> Result<SessionService> {
    let runtime = build_runtime(&ctx.config.container);
    match runtime.health_check().await {
        Ok(_) => info!("Using {} container runtime", runtime.runtime_type()),
        Err(e) => warn!(
            "{} runtime health check failed (continuing anyway): {}",
            runtime.runtime_type(),
            e
        ),
    }
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);

    let workspace = ctx.config.workspace_config(&ctx.paths.data_dir)?;
    if !workspace.template_dir.is_dir() {
        warn!(
            "workspace template {} does not exist, new workspaces start empty",
            workspace.template_dir.display()
        );
    }
    let policy = WorkspacePolicy::with_privileged(&ctx.config.workspace.privileged_identities);
    let provisioner = WorkspaceProvisioner::new(workspace, policy);

    Ok(SessionService::new(
        runtime,
        provisioner,
        build_notifier(&ctx.config)?,
        ctx.config.session_config(),
    ))
}

async fn handle_sessions(ctx: &RuntimeContext, cmd: SessionCommand) -> Result<()> {
    if ctx.common.dry_run && !matches!(cmd, SessionCommand::List) {
        info!("dry-run: would run {cmd:?}");
        return Ok(());
    }

    let service = build_service(ctx).await?;
    let output = match cmd {
        SessionCommand::List => service.list().await.context("listing sandboxes")?,
        SessionCommand::Start(start) => {
            let hostname = start
                .hostname
                .or_else(|| ctx.config.server.public_hostname.clone())
                .unwrap_or_else(|| "localhost".to_string());
            service
                .start(&start.user, &hostname)
                .await
                .with_context(|| format!("starting sandbox for {}", start.user))?
        }
        SessionCommand::Stop(stop) => service
            .stop(stop.user.as_deref())
            .await
            .context("stopping sandboxes")?,
    };

    let output = output.trim_end();
    if ctx.common.json {
        println!("{}", serde_json::json!({ "text": output }));
    } else if ctx.common.yaml {
        print!(
            "{}",
            serde_yaml::to_string(&serde_json::json!({ "text": output }))
                .context("serializing output to YAML")?
        );
    } else {
        println!("{output}");
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let service = build_service(ctx).await?;

    let workers = ctx.config.workers.start_concurrency;
    let capacity = ctx.config.workers.queue_capacity;
    info!("Starting {workers} start worker(s), queue capacity {capacity}");
    let queue = Arc::new(StartQueue::spawn(service.clone(), workers, capacity));

    if ctx.config.slack.token.is_none() {
        warn!("slack.token is not set, slash commands are not verified");
    }
    let slack = SlackState {
        token: ctx.config.slack.token.clone(),
        team_id: ctx.config.slack.team_id.clone(),
    };
    let state = AppState::new(
        Dispatcher::new(service, Arc::clone(&queue)),
        slack,
        ctx.config.server.public_hostname.clone(),
    );
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    // The router owned the other handle; wait for starts already accepted
    match Arc::try_unwrap(queue) {
        Ok(queue) => {
            info!("Waiting for queued starts to finish...");
            queue.shutdown().await;
        }
        Err(_) => warn!("start queue still in use, not waiting for queued starts"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining requests...");
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;
    config.apply_legacy_env(|name| env::var(name).ok());

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Secrets may also come from SLACK_INCOMING_HOOK, SPARKPOST_API_KEY,\n");
    buffer.push_str("# SLACK_SLASH_TOKEN and SLACK_SLASH_TEAM_ID.\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}
