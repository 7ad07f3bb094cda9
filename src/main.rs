use anyhow::{Context, Result, anyhow, bail};
use autumnus::{FormatterOption, Options, highlight, themes};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint};
use clap_complete::{ArgValueCompleter, CompletionCandidate};
use futures::StreamExt;
use futures::stream::BoxStream;
use iocraft::prelude::*;
use serde_json::Value;
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    pin::pin,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tempfile::NamedTempFile;
use tokio::{runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{Layer, layer::SubscriberExt as _, util::SubscriberInitExt as _};
use url::Url;

use crate::{
    config::Config,
    platform::PlatformClient,
    poll::{PollState, ReadinessPoller},
    rest_types::{EntryInfo, ModelInfo, Storage},
    session::Session,
    supervisor::{Credentials, SupervisorClient},
    ui::{
        AppList, ConfigHeader, ErrorMessage, FileList, InputPrompt, ProgressBar,
        ReadinessProgress, ServiceStatusView, SuccessMessage,
    },
    upload::{UploadEvent, UploadOptions, UploadSource},
};

mod client;
mod config;
mod platform;
mod poll;
mod rest_types;
mod serde_utils;
mod session;
mod supervisor;
mod ui;
mod upload;

#[derive(Parser)]
#[command(name = "rcam")]
#[command(version)]
#[command(about = "A tool for managing reCamera devices and SenseCraft")]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StatusArgs {
    /// Keep polling until every service is running
    #[arg(short, long)]
    wait: bool,
    /// Number of status queries before giving up
    #[arg(long, default_value_t = poll::DEFAULT_MAX_ATTEMPTS)]
    attempts: u32,
    /// Delay between status queries
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    interval: Duration,
    /// Expected boot time, used to estimate progress
    #[arg(long, default_value = "100s", value_parser = humantime::parse_duration)]
    ramp_up: Duration,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure rcam interactively
    Config,
    /// Store the device password in the OS keyring
    SetPassword { password: String },
    /// Log in to the device and store the session
    Login,
    /// Forget the stored device session
    Logout,
    /// Show the state of the device's services
    Status(StatusArgs),
    /// Show device information
    Info,
    /// Manage files on the device
    Files {
        #[command(subcommand)]
        command: FilesCommand,
    },
    /// Inspect and upload AI models
    Model {
        #[command(subcommand)]
        command: ModelCommand,
    },
    /// Use the SenseCraft platform
    Platform {
        #[command(subcommand)]
        command: PlatformCommand,
    },
}

#[derive(Subcommand)]
enum FilesCommand {
    /// List a directory
    Ls {
        #[arg(default_value = "", add = ArgValueCompleter::new(remote_path_completer))]
        path: String,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Remove a file or directory
    Rm {
        #[arg(add = ArgValueCompleter::new(remote_path_completer))]
        path: String,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Rename or move a file or directory
    Mv {
        #[arg(add = ArgValueCompleter::new(remote_path_completer))]
        from: String,
        to: String,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Show details of a file or directory
    Stat {
        #[arg(add = ArgValueCompleter::new(remote_path_completer))]
        path: String,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Download a file
    Get {
        #[arg(add = ArgValueCompleter::new(remote_path_completer))]
        path: String,
        /// Where to write the file, defaults to its name in the current directory
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Upload files, one after another
    Put {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
        /// Destination directory on the device
        #[arg(short, long)]
        dir: Option<String>,
        #[arg(short, long, value_enum, default_value_t = Storage::Local)]
        storage: Storage,
    },
    /// Check whether an SD card is available
    Sd,
}

#[derive(Subcommand)]
enum ModelCommand {
    /// Show the model currently installed
    Info,
    /// Upload a model to the device
    Upload {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        /// A JSON file describing the model, sent as-is
        #[arg(short, long, value_hint = ValueHint::FilePath, conflicts_with_all = ["name", "classes"])]
        info: Option<PathBuf>,
        /// Model name, defaults to the file name without extension
        #[arg(short, long)]
        name: Option<String>,
        /// Comma separated class labels
        #[arg(short, long, value_delimiter = ',')]
        classes: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PlatformCommand {
    /// Store SenseCraft tokens in the OS keyring
    SetToken {
        token: String,
        #[arg(short, long)]
        refresh_token: Option<String>,
    },
    /// Show the signed-in SenseCraft user
    Whoami,
    /// List SenseCraft applications
    Apps,
    /// Show a SenseCraft application
    App { app_id: String },
    /// Forget the stored SenseCraft tokens
    Logout,
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(env_filter),
        )
        .try_init()?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            element!(ErrorMessage(message: format!("{:#}", e))).print();
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let _rt_guard = rt.enter();
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    rt.block_on(async {
        match cli.command {
            Commands::Config => interactive_config(),
            Commands::SetPassword { password } => {
                let config = config::read_config()?;
                config::set_password_keyring(&config.device_url, password)
            }
            Commands::Platform { command } => {
                let config = config::read_config()?;
                platform_command(&platform_client(&config)?, command).await
            }
            requires_device => {
                let config = config::read_config()?;
                let client = device_client(&config)?;

                match requires_device {
                    Commands::Login => login(&client, &config).await,
                    Commands::Logout => {
                        client.logout()?;
                        element!(SuccessMessage(
                            message: format!("Forgot the session for {}", client.base_url())
                        ))
                        .print();
                        Ok(())
                    }
                    Commands::Status(args) => service_status(client, args).await,
                    Commands::Info => print_json(&client.device_info().await?),
                    Commands::Files { command } => files_command(&client, command).await,
                    Commands::Model { command } => model_command(&client, command).await,
                    Commands::Config | Commands::SetPassword { .. } | Commands::Platform { .. } => {
                        bail!("Command does not talk to the device")
                    }
                }
            }
        }
    })
}

fn credentials(config: &Config) -> Option<Credentials> {
    config.password.clone().map(|password| Credentials {
        username: config.username.clone(),
        password,
    })
}

fn device_client(config: &Config) -> Result<SupervisorClient> {
    let session = Arc::new(Session::load(config.device_session_store()?));
    Ok(SupervisorClient::new(
        config.device_url.clone(),
        session,
        credentials(config),
    )?)
}

fn platform_client(config: &Config) -> Result<PlatformClient> {
    let session = Arc::new(Session::load(config.platform_session_store()?));
    PlatformClient::new(config.platform()?.clone(), session)
}

async fn login(client: &SupervisorClient, config: &Config) -> Result<()> {
    let credentials = credentials(config).ok_or(anyhow!(
        "No device password configured, run `rcam set-password` or set RCAM_PASSWORD"
    ))?;
    let response = client.login(&credentials).await?;
    if let Some(retry_count) = response.retry_count {
        tracing::debug!("Login attempts remaining: {}", retry_count);
    }
    element!(SuccessMessage(
        message: format!("Logged in to {} as {}", client.base_url(), credentials.username)
    ))
    .print();
    Ok(())
}

async fn service_status(client: SupervisorClient, args: StatusArgs) -> Result<()> {
    if !args.wait {
        let status = client.service_status().await?;
        element!(ServiceStatusView(status: Some(status))).print();
        return Ok(());
    }

    let handle = ReadinessPoller::new(client)
        .max_attempts(args.attempts)
        .interval(args.interval)
        .ramp_up(args.ramp_up)
        .spawn();

    element!(ReadinessProgress(updates: Some(handle.subscribe()), max_attempts: args.attempts))
        .render_loop()
        .await?;

    match handle.wait().await? {
        PollState::Running => {
            element!(SuccessMessage(message: "All services are running".to_string())).print();
            Ok(())
        }
        PollState::Failed | PollState::Starting => bail!(
            "Services did not start after {} attempts",
            args.attempts
        ),
    }
}

fn print_json(value: &Value) -> Result<()> {
    let output = highlight(
        &serde_json::to_string_pretty(value)?,
        Options {
            formatter: FormatterOption::Terminal {
                theme: themes::get("ayu_light").into_iter().next(),
            },
            lang_or_file: Some("json"),
        },
    );
    println!("{}", output);
    Ok(())
}

fn print_entry_info(info: &EntryInfo) {
    println!("Path:     {}:/{}", info.storage, info.path.trim_start_matches('/'));
    println!(
        "Type:     {}",
        if info.is_directory { "directory" } else { "file" }
    );
    if let Some(size) = info.size {
        println!("Size:     {} ({} bytes)", ui::format_size(size), size);
    }
    if let Some(modified) = info.modified {
        println!("Modified: {}", humantime::format_rfc3339_seconds(modified));
    }
}

async fn files_command(client: &SupervisorClient, command: FilesCommand) -> Result<()> {
    match command {
        FilesCommand::Ls { path, storage } => {
            let listing = client.list(storage, &path).await?;
            element!(FileList(listing: Some(listing))).print();
        }
        FilesCommand::Mkdir { path, storage } => {
            client.mkdir(storage, &path).await?;
            element!(SuccessMessage(message: format!("Created {}:/{}", storage, path))).print();
        }
        FilesCommand::Rm { path, storage } => {
            client.remove(storage, &path).await?;
            element!(SuccessMessage(message: format!("Removed {}:/{}", storage, path))).print();
        }
        FilesCommand::Mv { from, to, storage } => {
            client.rename(storage, &from, &to).await?;
            element!(SuccessMessage(message: format!("Renamed {} to {}", from, to))).print();
        }
        FilesCommand::Stat { path, storage } => {
            print_entry_info(&client.info(storage, &path).await?);
        }
        FilesCommand::Get {
            path,
            output,
            storage,
        } => {
            let destination = match output {
                Some(output) => output,
                None => default_download_path(&path)?,
            };
            let bytes = client.download(storage, &path).await?;
            write_atomically(&destination, &bytes)?;
            element!(SuccessMessage(message: format!(
                "Saved {} ({}) to {}",
                path,
                ui::format_size(bytes.len() as u64),
                destination.display()
            )))
            .print();
        }
        FilesCommand::Put {
            files,
            dir,
            storage,
        } => {
            let sources = files
                .iter()
                .map(|file| UploadSource::from_path(file))
                .collect::<Result<Vec<_>>>()?;
            let transport = client.file_upload(storage, dir);
            let cancel = CancellationToken::new();
            let stream = upload::upload(&transport, sources, UploadOptions::files(), cancel.clone());
            let uploaded = drive_upload("Uploading files", stream, cancel).await?;
            element!(SuccessMessage(message: format!("Uploaded {} file(s)", uploaded.len()))).print();
        }
        FilesCommand::Sd => {
            if client.sd_available().await {
                element!(SuccessMessage(message: "SD card available".to_string())).print();
            } else {
                println!("No SD card detected");
            }
        }
    }
    Ok(())
}

fn default_download_path(remote: &str) -> Result<PathBuf> {
    let name = remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("Cannot derive a file name from {:?}, pass --output", remote))?;
    Ok(PathBuf::from(name))
}

/// Writes through a temporary file so an interrupted download never leaves a
/// truncated file behind.
fn write_atomically(destination: &Path, bytes: &[u8]) -> Result<()> {
    let directory = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = NamedTempFile::new_in(&directory)
        .with_context(|| format!("Failed to create a file in {}", directory.display()))?;
    file.write_all(bytes)?;
    file.persist(destination)
        .with_context(|| format!("Failed to write {}", destination.display()))?;
    Ok(())
}

/// Drives an upload stream while rendering a progress bar. Ctrl-C cancels the
/// upload before the next chunk is sent.
async fn drive_upload<R>(
    title: &str,
    mut stream: BoxStream<'_, Result<UploadEvent<R>>>,
    cancel: CancellationToken,
) -> Result<Vec<(String, Option<R>)>> {
    let (tx, rx) = watch::channel(0.0f32);

    let process_stream = async {
        let mut uploaded = Vec::new();
        while let Some(event) = stream.next().await {
            match event? {
                UploadEvent::Progress(p) => {
                    tracing::debug!(
                        "{}: {}/{} bytes",
                        p.file_name,
                        p.bytes_sent,
                        p.total_bytes
                    );
                    let _ = tx.send(p.percent as f32);
                }
                UploadEvent::FileUploaded {
                    file_name,
                    response,
                } => uploaded.push((file_name, response)),
            }
        }
        Ok::<_, anyhow::Error>(uploaded)
    };
    let mut process_stream = pin!(process_stream);

    let mut progress_bar = element!(ProgressBar(title: title.to_string(), progress: Some(rx)));

    tokio::select! {
        result = &mut process_stream => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            process_stream.await
        }
        _ = progress_bar.render_loop() => bail!("Progress display stopped unexpectedly"),
    }
}

fn model_info_json(file: &Path, info: Option<PathBuf>, name: Option<String>, classes: Vec<String>) -> Result<String> {
    if let Some(info) = info {
        let text = std::fs::read_to_string(&info)
            .with_context(|| format!("Failed to read {}", info.display()))?;
        serde_json::from_str::<Value>(&text)
            .with_context(|| format!("{} is not valid JSON", info.display()))?;
        return Ok(text);
    }

    let stem = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", file.display()))?;
    Ok(serde_json::to_string(&ModelInfo {
        model_id: stem.clone(),
        model_name: name.unwrap_or(stem),
        classes: (!classes.is_empty()).then_some(classes),
    })?)
}

async fn model_command(client: &SupervisorClient, command: ModelCommand) -> Result<()> {
    match command {
        ModelCommand::Info => print_json(&client.model_info().await?),
        ModelCommand::Upload {
            file,
            info,
            name,
            classes,
        } => {
            let model_info = model_info_json(&file, info, name, classes)?;
            let source = UploadSource::from_path(&file)?;
            let transport = client.model_upload();
            let cancel = CancellationToken::new();
            let stream = upload::upload(
                &transport,
                vec![source],
                UploadOptions::model(Some(model_info)),
                cancel.clone(),
            );

            let uploaded = drive_upload("Uploading model", stream, cancel).await?;
            element!(SuccessMessage(message: format!("Uploaded {}", file.display()))).print();
            if let Some((_, Some(Some(response)))) = uploaded.into_iter().next() {
                print_json(&response)?;
            }
            Ok(())
        }
    }
}

async fn platform_command(client: &PlatformClient, command: PlatformCommand) -> Result<()> {
    match command {
        PlatformCommand::SetToken {
            token,
            refresh_token,
        } => {
            client.set_tokens(token, refresh_token)?;
            element!(SuccessMessage(message: "SenseCraft token stored".to_string())).print();
        }
        PlatformCommand::Whoami => {
            let user = client.user_info().await?;
            println!("{}", user.nickname.unwrap_or_else(|| "<no nickname>".to_string()));
        }
        PlatformCommand::Apps => {
            element!(AppList(apps: client.apps().await?)).print();
        }
        PlatformCommand::App { app_id } => print_json(&client.app(&app_id).await?)?,
        PlatformCommand::Logout => {
            client.logout()?;
            element!(SuccessMessage(message: "SenseCraft tokens removed".to_string())).print();
        }
    }
    Ok(())
}

fn remote_path_completer(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let Some(current) = current.to_str() else {
        return vec![];
    };
    let (directory, prefix) = current.rsplit_once('/').unwrap_or(("", current));

    let Ok(client) = config::read_config().and_then(|config| device_client(&config)) else {
        return vec![];
    };

    let storage = storage_from_args(std::env::args());
    let handle = Handle::current();
    let Ok(listing) = handle.block_on(client.list(storage, directory)) else {
        return vec![];
    };

    listing
        .directories
        .iter()
        .map(|entry| format!("{}/", entry.name))
        .chain(listing.files.iter().map(|entry| entry.name.clone()))
        .filter(|name| name.starts_with(prefix))
        .map(|name| {
            if directory.is_empty() {
                CompletionCandidate::new(name)
            } else {
                CompletionCandidate::new(format!("{}/{}", directory, name))
            }
        })
        .collect()
}

/// Completion only sees the word being completed, so `--storage` is picked
/// out of the raw command line.
fn storage_from_args(args: impl IntoIterator<Item = String>) -> Storage {
    let mut args = args.into_iter();
    let mut storage = Storage::Local;
    while let Some(arg) = args.next() {
        let value = match arg.as_str() {
            "--storage" | "-s" => args.next(),
            other => other.strip_prefix("--storage=").map(str::to_string),
        };
        if let Some(parsed) = value.and_then(|value| Storage::from_str(&value, true).ok()) {
            storage = parsed;
        }
    }
    storage
}

fn read_input(prompt: &str, default: Option<&str>, description: Option<&str>) -> Result<String> {
    element! {
        InputPrompt(
            prompt: prompt.to_string(),
            default: default.map(|s| s.to_string()),
            description: description.map(|s| s.to_string())
        )
    }
    .print();

    print!("> ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();

    if input.is_empty() {
        if let Some(def) = default {
            Ok(def.to_string())
        } else {
            Ok(input)
        }
    } else {
        Ok(input)
    }
}

fn read_url(prompt: &str, default: Option<&Url>, description: &str, required: bool) -> Result<Option<Url>> {
    let default = default.map(Url::to_string);
    loop {
        let input = read_input(prompt, default.as_deref(), Some(description))?;
        if input.is_empty() && !required {
            return Ok(None);
        }
        match Url::parse(&input) {
            Ok(url) => return Ok(Some(url)),
            Err(e) => {
                element!(ErrorMessage(message: format!("Invalid URL: {}", e))).print();
                println!();
            }
        }
    }
}

fn interactive_config() -> Result<()> {
    element!(ConfigHeader()).print();

    let existing = config::read_config_file()?;
    let default_device_url = match &existing.device_url {
        Some(url) => url.clone(),
        None => Url::parse(config::DEFAULT_DEVICE_URL)?,
    };

    let device_url = read_url(
        "Device URL",
        Some(&default_device_url),
        "Address of the reCamera supervisor",
        true,
    )?
    .ok_or(anyhow!("A device URL is required"))?;

    let username = read_input(
        "Username",
        Some(existing.username.as_deref().unwrap_or(config::DEFAULT_USERNAME)),
        None,
    )?;

    let password = read_input(
        "Password",
        None,
        Some("Optional: stored securely in the OS keyring and used to renew expired sessions"),
    )?;

    let portal_url = read_url(
        "SenseCraft portal URL",
        existing.portal_url.as_ref(),
        "Optional: needed for `rcam platform` commands",
        false,
    )?;
    let sensecraft_url = read_url(
        "SenseCraft API URL",
        existing.sensecraft_url.as_ref(),
        "Optional: base URL for aiserverapi requests",
        false,
    )?;
    let train_url = read_url(
        "SenseCraft training API URL",
        existing.train_url.as_ref(),
        "Optional: base URL for v1/api and v2/api requests",
        false,
    )?;

    if !password.is_empty() {
        config::set_password_keyring(&device_url, password)?;
    }

    config::write_config(config::ConfigFile {
        device_url: Some(device_url),
        username: Some(username),
        portal_url,
        sensecraft_url,
        train_url,
    })?;

    element!(SuccessMessage(message: "Configuration complete!".to_string())).print();

    Ok(())
}
