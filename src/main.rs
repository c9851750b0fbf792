//! Jackify - modlist setup for Steam/Proton on Linux
//!
//! # Commands
//!
//! - `jackify shortcut create|remove|list` - manage non-Steam shortcuts
//! - `jackify compat set` - map an AppID to a compatibility tool
//! - `jackify runtime find|list|paths` - locate installed Proton runtimes
//! - `jackify ini rewrite` - point ModOrganizer.ini loaders at Proton drive paths
//! - `jackify engine install` - run the install engine under supervision
//! - `jackify steam restart` - restart the Steam client

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use jackify_rust::config::{AppConfig, EngineConfig};
use jackify_rust::logging::{init_logger, log_action, log_error, log_info, log_install};
use jackify_rust::mo2::anchors::is_removable_media;
use jackify_rust::mo2::{self, RewriteTarget};
use jackify_rust::process::engine::API_KEY_VAR;
use jackify_rust::process::env::env_flag;
use jackify_rust::process::{locate_engine, EngineCommand, EngineRun, LineKind, MonitorThresholds};
use jackify_rust::steam::{self, RegistrarError, ShortcutRecord};

type CliResult = Result<(), Box<dyn Error>>;

/// Jackify - modlist setup for Steam/Proton on Linux
#[derive(Parser)]
#[command(name = "jackify")]
#[command(about = "Set up Wabbajack modlists for Steam and Proton")]
#[command(version)]
struct Cli {
    /// Override the detected Steam root
    #[arg(long, global = true)]
    steam_root: Option<PathBuf>,

    /// Emit debug log lines
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage non-Steam shortcuts
    #[command(subcommand)]
    Shortcut(ShortcutCommand),

    /// Compatibility tool mappings in config.vdf
    #[command(subcommand)]
    Compat(CompatCommand),

    /// Locate installed Proton runtimes
    #[command(subcommand)]
    Runtime(RuntimeCommand),

    /// ModOrganizer.ini maintenance
    #[command(subcommand)]
    Ini(IniCommand),

    /// Drive the install engine
    #[command(subcommand)]
    Engine(EngineSubcommand),

    /// Control the Steam client
    #[command(subcommand)]
    Steam(SteamCommand),
}

#[derive(Subcommand)]
enum ShortcutCommand {
    /// Create a shortcut and assign its compatibility tool
    Create(CreateArgs),
    /// Remove a shortcut by name
    Remove {
        name: String,
    },
    /// List shortcuts
    List,
}

#[derive(Args)]
struct CreateArgs {
    /// Display name in Steam
    #[arg(long)]
    name: String,
    /// Executable, usually ModOrganizer.exe
    #[arg(long)]
    exe: PathBuf,
    #[arg(long)]
    start_dir: Option<PathBuf>,
    #[arg(long, default_value = "%command%")]
    launch_options: String,
    /// Extra tags (the configured tag is used when none are given)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Compatibility tool name, e.g. proton_experimental
    #[arg(long)]
    compat_tool: Option<String>,
    /// Only write the shortcut
    #[arg(long)]
    no_compat: bool,
}

#[derive(Subcommand)]
enum CompatCommand {
    /// Map an AppID to a compatibility tool
    Set {
        #[arg(long)]
        app_id: u32,
        #[arg(long)]
        tool: String,
    },
}

#[derive(Subcommand)]
enum RuntimeCommand {
    /// Resolve a runtime label to its wine binary
    Find { label: String },
    /// List installed runtimes
    List,
    /// Show the prefix and runtime used by an AppID
    Paths { app_id: String },
}

#[derive(Subcommand)]
enum IniCommand {
    /// Rewrite loader paths to Z:/D: drive paths
    Rewrite(RewriteArgs),
}

#[derive(Args)]
struct RewriteArgs {
    /// Modlist install directory
    #[arg(long)]
    install_root: PathBuf,
    /// Steam library holding the base game
    #[arg(long)]
    library_root: PathBuf,
    /// ModOrganizer.ini (found under the install root when omitted)
    #[arg(long)]
    ini: Option<PathBuf>,
}

#[derive(Subcommand)]
enum EngineSubcommand {
    /// Install a modlist
    Install(InstallArgs),
}

#[derive(Args)]
struct InstallArgs {
    /// Modlist name or .wabbajack file
    #[arg(long)]
    modlist: String,
    #[arg(long)]
    install_dir: PathBuf,
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SteamCommand {
    /// Shut Steam down and start it again
    Restart {
        /// Seconds to wait for Steam to come back
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

fn engine_config(app: &AppConfig) -> Result<EngineConfig, Box<dyn Error>> {
    EngineConfig::from_app(app).ok_or_else(|| "Steam installation not found".into())
}

fn shortcut(app: &AppConfig, command: ShortcutCommand) -> CliResult {
    let engine = engine_config(app)?;
    let registrar = engine.registrar();

    match command {
        ShortcutCommand::Create(args) => {
            let exe = args.exe.to_string_lossy().to_string();
            let start_dir = args.start_dir.map(|d| d.to_string_lossy().to_string());
            let mut record = ShortcutRecord::new(&args.name, &exe, start_dir.as_deref())
                .with_launch_options(&args.launch_options);
            for tag in &args.tags {
                record = record.with_tag(tag);
            }

            log_action(&format!("Creating shortcut '{}'", args.name));
            let app_id = if args.no_compat {
                registrar.create_shortcut(record)?
            } else {
                match registrar.create_shortcut_with_compat(record, args.compat_tool.as_deref()) {
                    Ok(id) => id,
                    Err(RegistrarError::PartialSuccess { unsigned_id, reason }) => {
                        log_error(&format!("Compatibility tool not set: {}", reason));
                        println!("{}", unsigned_id);
                        return Err(format!("retry with `jackify compat set --app-id {}`", unsigned_id).into());
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            println!("{}", app_id);
        }
        ShortcutCommand::Remove { name } => {
            log_action(&format!("Removing shortcut '{}'", name));
            registrar.remove_shortcut(&name)?;
        }
        ShortcutCommand::List => {
            for record in registrar.list_shortcuts()? {
                println!(
                    "{:>4}  {:>10}  {}  [{}]",
                    record.slot,
                    record.unsigned_id(),
                    record.name,
                    record.tags.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn compat(app: &AppConfig, command: CompatCommand) -> CliResult {
    let engine = engine_config(app)?;
    match command {
        CompatCommand::Set { app_id, tool } => {
            log_action(&format!("Setting compatibility tool for {} to {}", app_id, tool));
            engine.registrar().set_compatibility_tool(app_id, &tool)?;
        }
    }
    Ok(())
}

fn runtime(app: &AppConfig, command: RuntimeCommand) -> CliResult {
    let engine = engine_config(app)?;
    let resolver = engine.resolver();

    match command {
        RuntimeCommand::Find { label } => {
            println!("{}", resolver.find_runtime_binary(&label)?.display());
        }
        RuntimeCommand::List => {
            for candidate in resolver.list_runtimes() {
                println!("{:<32} {:<28} {}", candidate.label, candidate.compat_name, candidate.install_dir.display());
            }
        }
        RuntimeCommand::Paths { app_id } => {
            let paths = resolver.get_runtime_paths(&app_id)?;
            println!("label:       {}", paths.label);
            println!("compatdata:  {}", paths.compat_data_dir.display());
            println!("runtime dir: {}", paths.runtime_dir.display());
            println!("binary:      {}", paths.binary.display());
        }
    }
    Ok(())
}

fn ini(command: IniCommand) -> CliResult {
    match command {
        IniCommand::Rewrite(args) => {
            let ini = match args.ini {
                Some(path) => path,
                None => mo2::find_mo2_ini(&args.install_root)
                    .ok_or_else(|| format!("No {} under {}", mo2::MO2_INI, args.install_root.display()))?,
            };

            let install_root = args.install_root.to_string_lossy().to_string();
            let library_root = args.library_root.to_string_lossy().to_string();
            let target = RewriteTarget {
                on_removable_media: is_removable_media(&install_root),
                basegame_on_removable_media: is_removable_media(&library_root),
                install_root,
                library_root,
            };

            log_action(&format!("Rewriting loader paths in {}", ini.display()));
            let report = mo2::PathTranslator::default().rewrite_binary_paths(&ini, &target)?;
            for entry in &report.updated {
                println!("{}\\binary={}", entry.index, entry.binary);
            }
        }
    }
    Ok(())
}

fn engine(app: &AppConfig, command: EngineSubcommand) -> CliResult {
    match command {
        EngineSubcommand::Install(args) => {
            if mo2::is_dangerous_install_root(&args.install_dir) {
                return Err(format!("Refusing to install into {}", args.install_dir.display()).into());
            }
            let downloads_dir = args
                .downloads_dir
                .or_else(|| app.downloads_dir.clone())
                .unwrap_or_else(|| args.install_dir.join("downloads"));
            let engine_path = locate_engine(app.engine_path.as_deref())
                .ok_or("jackify-engine not found; set engine_path in the config")?;

            let mut command = EngineCommand::new(engine_path, &args.modlist, &args.install_dir, downloads_dir)
                .debug(app.debug_mode);
            if let Ok(key) = std::env::var(API_KEY_VAR) {
                command = command.api_key(key);
            }

            let run = EngineRun::start(&command, MonitorThresholds::default(), |event| match event.kind {
                LineKind::Output => println!("{}", event.text),
                LineKind::Progress => print!("\r{}", event.text),
            })?;

            let cancel = run.cancel_handle();
            ctrlc::set_handler(move || {
                log_install("Cancelling install");
                if let Err(e) = cancel.cancel() {
                    log_error(&format!("Cancel failed: {}", e));
                }
            })?;

            let (status, _) = run.wait()?;
            if !status.success() {
                return Err(format!("Install engine exited with {}", status).into());
            }
            log_install(&format!("Modlist installed to {}", args.install_dir.display()));
        }
    }
    Ok(())
}

fn steam_control(command: SteamCommand) -> CliResult {
    match command {
        SteamCommand::Restart { timeout } => steam::restart_steam(Duration::from_secs(timeout)),
    }
}

fn main() -> CliResult {
    let cli = Cli::parse();

    let mut app = AppConfig::load();
    if cli.steam_root.is_some() {
        app.steam_root = cli.steam_root;
    }
    app.debug_mode |= cli.debug || env_flag("JACKIFY_DEBUG");

    init_logger(&app.data_dir, app.debug_mode);
    log_info("Jackify starting up...");

    match cli.command {
        Commands::Shortcut(command) => shortcut(&app, command),
        Commands::Compat(command) => compat(&app, command),
        Commands::Runtime(command) => runtime(&app, command),
        Commands::Ini(command) => ini(command),
        Commands::Engine(command) => engine(&app, command),
        Commands::Steam(command) => steam_control(command),
    }
}
