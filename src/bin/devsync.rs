// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use devsync::{
    command,
    config::{EngineConfig, PushTarget},
    descriptor::{Descriptor, GroupKind},
    event::{OutputMode, Reporter},
    path::{default_config_path, descriptor_path},
    platform::PlatformError,
    push::{PushOptions, PushPipeline, DEFAULT_DEBUG_PORT},
    watch::WatchLoop,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use inquire::Confirm;
use std::{
    io::{stdout, Write},
    path::PathBuf,
    process::exit,
    sync::Arc,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "devsync [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Synchronization root, defaults to the current directory.
    #[arg(long, global = true, value_name = "dir")]
    pub root: Option<PathBuf>,

    /// Component descriptor, defaults to devfile.yaml under the root.
    #[arg(long, global = true, value_name = "file")]
    pub descriptor: Option<PathBuf>,

    /// Engine configuration file.
    #[arg(long, global = true, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Render progress for humans, or as JSON lines for tools.
    #[arg(short, long, global = true, default_value_t = OutputMode::Human, value_name = "mode")]
    pub output: OutputMode,

    /// Cluster namespace to push into.
    #[arg(long, global = true, value_name = "namespace")]
    pub namespace: Option<String>,

    /// Platform to push to.
    #[arg(long, global = true, value_name = "platform")]
    pub platform: Option<PlatformArg>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let engine = Engine::open(&self)?;
        match self.command {
            Command::Push(opts) => run_push(engine, opts),
            Command::Watch(opts) => run_watch(engine, opts).await,
            Command::Exec(opts) => run_exec(engine, opts),
            Command::Logs(opts) => run_logs(engine, opts).await,
            Command::Test(opts) => run_test(engine, opts),
            Command::Delete(opts) => run_delete(engine, opts),
            Command::Status => run_status(engine),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlatformArg {
    Cluster,
    Local,
}

impl From<PlatformArg> for PushTarget {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Cluster => PushTarget::Cluster,
            PlatformArg::Local => PushTarget::Local,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Synchronize local changes, build, and (re)start the component.
    #[command(override_usage = "devsync push [options]")]
    Push(PushArgs),

    /// Push whenever the synchronization root changes.
    #[command(override_usage = "devsync watch [options]")]
    Watch(WatchArgs),

    /// Run command inside the component.
    #[command(override_usage = "devsync exec -- <command>...")]
    Exec(ExecArgs),

    /// Show output of the run command.
    #[command(override_usage = "devsync logs [options]")]
    Logs(LogsArgs),

    /// Run test command inside the component.
    #[command(override_usage = "devsync test [options]")]
    Test(TestArgs),

    /// Delete component from its platform.
    #[command(override_usage = "devsync delete [options]")]
    Delete(DeleteArgs),

    /// Follow status changes of the component.
    #[command(override_usage = "devsync status")]
    Status,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PushArgs {
    /// Synchronize every file, rebuild, and restart.
    #[arg(short, long)]
    pub force_build: bool,

    /// Start debug command instead of run command.
    #[arg(short, long)]
    pub debug: bool,

    /// Port handed to the debug command.
    #[arg(long, default_value_t = DEFAULT_DEBUG_PORT, value_name = "port")]
    pub debug_port: u16,

    /// Build command to use instead of the default one.
    #[arg(long, value_name = "id")]
    pub build_command: Option<String>,

    /// Run command to use instead of the default one.
    #[arg(long, value_name = "id")]
    pub run_command: Option<String>,

    /// Debug command to use instead of the default one.
    #[arg(long, value_name = "id")]
    pub debug_command: Option<String>,
}

impl From<PushArgs> for PushOptions {
    fn from(args: PushArgs) -> Self {
        Self {
            force_build: args.force_build,
            debug: args.debug,
            debug_port: args.debug_port,
            build_command: args.build_command,
            run_command: args.run_command,
            debug_command: args.debug_command,
            show_progress: false,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct WatchArgs {
    /// Quiet period in milliseconds before changes trigger a push.
    #[arg(long, value_name = "ms")]
    pub delay: Option<u64>,

    /// Additional glob of paths to ignore.
    #[arg(short, long, value_name = "glob")]
    pub ignore: Vec<String>,

    #[command(flatten)]
    pub push: PushArgs,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExecArgs {
    /// Command line to run.
    #[arg(required = true, last = true, value_name = "command")]
    pub command: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LogsArgs {
    /// Keep streaming new output.
    #[arg(short, long)]
    pub follow: bool,

    /// Command to show output of instead of the default run command.
    #[arg(long, value_name = "id")]
    pub command: Option<String>,

    /// Show output of the default debug command.
    #[arg(short, long, conflicts_with = "command")]
    pub debug: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TestArgs {
    /// Test command to use instead of the default one.
    #[arg(long, value_name = "id")]
    pub test_command: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeleteArgs {
    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub force: bool,

    /// Wait until the platform confirms removal.
    #[arg(short, long)]
    pub wait: bool,
}

/// Everything a command needs, built once from the command line.
struct Engine {
    config: EngineConfig,
    root: PathBuf,
    descriptor: Arc<Descriptor>,
    reporter: Arc<Reporter>,
    show_progress: bool,
}

impl Engine {
    fn open(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let mut config = EngineConfig::load(&config_path)?;
        if let Some(namespace) = &cli.namespace {
            config.settings.namespace = namespace.clone();
        }
        if let Some(platform) = cli.platform {
            config.settings.push_target = platform.into();
        }

        let root = match cli.root.clone().or_else(|| config.settings.sync_root.clone()) {
            Some(root) => root,
            None => std::env::current_dir().context("cannot determine current directory")?,
        };
        let descriptor_path = cli
            .descriptor
            .clone()
            .unwrap_or_else(|| descriptor_path(&root));
        let descriptor = Descriptor::load(&descriptor_path)?;

        Ok(Self {
            config,
            root,
            descriptor: Arc::new(descriptor),
            reporter: Arc::new(Reporter::stdout(cli.output)),
            show_progress: cli.output == OutputMode::Human,
        })
    }

    fn pipeline(&self) -> Result<PushPipeline> {
        Ok(PushPipeline::new(
            &self.config,
            &self.root,
            Arc::clone(&self.descriptor),
            Arc::clone(&self.reporter),
        )?)
    }
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn run_push(engine: Engine, opts: PushArgs) -> Result<()> {
    let pipeline = engine.pipeline()?;
    let options = PushOptions {
        show_progress: engine.show_progress,
        ..opts.into()
    };
    pipeline.push(&options)?;
    Ok(())
}

async fn run_watch(mut engine: Engine, opts: WatchArgs) -> Result<()> {
    if let Some(delay) = opts.delay {
        engine.config.watch.delay_ms = delay;
    }
    engine.config.watch.ignore.extend(opts.ignore);

    let pipeline = engine.pipeline()?;
    let options = PushOptions {
        show_progress: engine.show_progress,
        ..opts.push.into()
    };
    let mut watcher = WatchLoop::new(engine.config.watch.delay(), pipeline.ignore_set()?);
    let stop = watcher.stop_handle();

    let mut task = tokio::task::spawn_blocking(move || -> Result<()> {
        // INVARIANT: Component starts out in sync before watching begins.
        if let Err(err) = pipeline.push(&options) {
            if err.stops_watch() {
                return Err(err.into());
            }
            warn!("initial push failed, still watching: {err}");
        }

        // INVARIANT: Only the first push of a watch session may force a rebuild.
        let options = PushOptions {
            force_build: false,
            ..options
        };
        let summary = watcher.watch(|_| pipeline.push(&options).map(|_| ()))?;
        info!(
            "{} push(es) triggered, {} failed",
            summary.triggers, summary.failures
        );
        Ok(())
    });

    tokio::select! {
        result = &mut task => return result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("stopping watch, letting running push finish");
            stop.stop();
        }
    }

    task.await?
}

fn run_exec(engine: Engine, opts: ExecArgs) -> Result<()> {
    let pipeline = engine.pipeline()?;
    let command_line = shlex::try_join(opts.command.iter().map(String::as_str))?;
    let mut out = stdout().lock();
    pipeline.adapter().exec(&command_line, &mut out)?;
    out.flush()?;
    Ok(())
}

async fn run_logs(engine: Engine, opts: LogsArgs) -> Result<()> {
    let pipeline = engine.pipeline()?;
    let kind = if opts.debug { GroupKind::Debug } else { GroupKind::Run };
    let command = command::resolve(pipeline.descriptor(), kind, opts.command.as_deref())?;
    let stream = pipeline.adapter().log(opts.follow, &command)?;
    let canceller = stream.canceller();

    let task = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut out = stdout().lock();
        for line in stream {
            writeln!(out, "{}", line?)?;
        }
        Ok(())
    });

    if opts.follow {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                canceller.cancel();
            }
        });
    }

    task.await?
}

fn run_test(engine: Engine, opts: TestArgs) -> Result<()> {
    let pipeline = engine.pipeline()?;
    match pipeline
        .adapter()
        .test(opts.test_command.as_deref(), engine.show_progress)
    {
        Ok(()) => Ok(()),
        Err(PlatformError::Resolve(err)) if !err.is_fatal() => {
            warn!("skip test: {err}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_delete(engine: Engine, opts: DeleteArgs) -> Result<()> {
    let pipeline = engine.pipeline()?;
    if !opts.force {
        let confirmed = Confirm::new(&format!("delete component {}?", pipeline.descriptor().name()))
            .with_default(false)
            .prompt()?;
        if !confirmed {
            info!("nothing deleted");
            return Ok(());
        }
    }

    pipeline.delete(engine.show_progress, opts.wait)?;
    Ok(())
}

fn run_status(engine: Engine) -> Result<()> {
    let pipeline = engine.pipeline()?;
    let mut out = stdout().lock();
    let mut seen = false;
    for event in pipeline.adapter().watch_remote_status()? {
        let event = event?;
        writeln!(out, "{}\t{}", event.name, event.phase)?;
        seen = true;
    }

    if !seen {
        info!("{} platform reported no status changes", pipeline.adapter().name());
    }

    Ok(())
}
