//! vault: e2e-vault command-line interface
//!
//! Runs client and server in one process against the configured record file
//! and blob storage.
//!
//!   init                        - create the server setup and data dirs
//!   register                    - create an account
//!   put <local> [--name]        - encrypt and upload a file
//!   get <file-id> [<out>]       - download and decrypt a file
//!   ls                          - list your files
//!   passwd                      - change password, rewrapping every file key
//!   share <file-id>             - share one file under its own password
//!   shares                      - list your shares
//!   open-share <share-id> [out] - open a share (no account needed)
//!   revoke <share-id>           - revoke a share
//!   config show                 - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use vault_client::{VaultClient, VaultSession};
use vault_core::config::{expand_tilde, VaultConfig};
use vault_core::{FileId, ShareId, VaultError};
use vault_server::{load_or_generate, VaultServer};
use vault_store::{build_operator, check_health, BlobStore, LocalRecordStore};

/// Attempts for a password change that keeps hitting retryable failures
const PASSWD_ATTEMPTS: u32 = 3;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "vault",
    version,
    about = "End-to-end encrypted file vault",
    long_about = "vault: store files encrypted under keys only your password can recover"
)]
struct Cli {
    /// Path to vault.toml configuration file
    #[arg(long, short = 'c', env = "VAULT_CONFIG", default_value = "~/.config/e2e-vault/vault.toml")]
    config: PathBuf,

    /// Account email
    #[arg(long, short = 'u', env = "VAULT_USER", global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the OPAQUE server setup and data directories
    Init,

    /// Create an account for --user
    Register,

    /// Encrypt and upload a local file
    Put {
        local: PathBuf,
        /// Name stored with the file (default: local file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
    },

    /// Download and decrypt a file
    Get {
        file_id: String,
        /// Output path (default: the stored file name)
        out: Option<PathBuf>,
    },

    /// List your files
    Ls,

    /// Change your password; every file key is rewrapped atomically
    Passwd,

    /// Share one file under a separate password
    Share { file_id: String },

    /// List your shares
    Shares,

    /// Open a share with its password
    #[command(name = "open-share")]
    OpenShare {
        share_id: String,
        /// Output path (default: the shared file's name)
        out: Option<PathBuf>,
    },

    /// Revoke a share
    Revoke { share_id: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;
    init_logging(&config.log.level, &config.log.format);
    config.validate().context("invalid configuration")?;

    let user = cli.user.as_deref();

    match cli.command {
        Commands::Init => cmd_init(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Register => cmd_register(&open_vault(&config)?, require_user(user)?).await,
        Commands::Put { local, name } => {
            let vault = open_vault(&config)?;
            cmd_put(&vault, require_user(user)?, &local, name.as_deref()).await
        }
        Commands::Get { file_id, out } => {
            let vault = open_vault(&config)?;
            cmd_get(&vault, require_user(user)?, &file_id, out.as_deref()).await
        }
        Commands::Ls => cmd_ls(&open_vault(&config)?, require_user(user)?).await,
        Commands::Passwd => cmd_passwd(&open_vault(&config)?, require_user(user)?).await,
        Commands::Share { file_id } => {
            cmd_share(&open_vault(&config)?, require_user(user)?, &file_id).await
        }
        Commands::Shares => cmd_shares(&open_vault(&config)?, require_user(user)?).await,
        Commands::OpenShare { share_id, out } => {
            cmd_open_share(&open_vault(&config)?, &share_id, out.as_deref()).await
        }
        Commands::Revoke { share_id } => {
            cmd_revoke(&open_vault(&config)?, require_user(user)?, &share_id).await
        }
    }
}

fn require_user(user: Option<&str>) -> Result<&str> {
    user.context("--user (or VAULT_USER) is required for this command")
}

// ── Config + logging ──────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<VaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        // Logging is not up yet
        eprintln!(
            "warning: config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(VaultConfig::default())
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn open_vault(config: &VaultConfig) -> Result<VaultClient<LocalRecordStore>> {
    let records = match &config.records.path {
        Some(path) => {
            let path = expand_tilde(path);
            LocalRecordStore::open(&path)
                .with_context(|| format!("opening record store: {}", path.display()))?
        }
        None => {
            tracing::warn!("records.path unset: records are in memory and lost on exit");
            LocalRecordStore::in_memory()
        }
    };

    let op = build_operator(&config.storage).context("building storage operator")?;
    let setup_path = expand_tilde(&config.server.server_setup_file);
    let setup = load_or_generate(&setup_path)
        .with_context(|| format!("loading server setup: {}", setup_path.display()))?;

    let server = VaultServer::new(
        &config.server,
        config.crypto.ksf_params(),
        setup,
        Arc::new(records),
        BlobStore::new(op),
    )
    .with_legacy_ksf(config.crypto.legacy_ksf.clone());
    Ok(VaultClient::new(
        Arc::new(server),
        config.crypto.algorithm()?,
        config.crypto.worker_concurrency(),
    ))
}

/// Password from `env_var` if set (scripts, CI), otherwise an interactive prompt.
fn read_password(prompt: &str, env_var: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(value))
}

fn read_new_password(prompt: &str, env_var: &str) -> Result<SecretString> {
    if std::env::var(env_var).is_ok() {
        return read_password(prompt, env_var);
    }
    let first = read_password(prompt, env_var)?;
    let confirm = read_password("Confirm: ", env_var)?;
    if first.expose_secret() != confirm.expose_secret() {
        anyhow::bail!("passwords do not match");
    }
    if first.expose_secret().is_empty() {
        anyhow::bail!("password must not be empty");
    }
    Ok(first)
}

/// Authentication, replay and integrity failures collapse into their public
/// message; the detail only goes to the debug log.
fn user_facing(err: VaultError) -> anyhow::Error {
    match err {
        VaultError::AuthenticationFailure
        | VaultError::ReplayOrExpiredState
        | VaultError::IntegrityFailure(_) => {
            tracing::debug!(error = %err, "operation refused");
            anyhow::anyhow!("{}", err.public_message())
        }
        other => other.into(),
    }
}

async fn login(vault: &VaultClient<LocalRecordStore>, user: &str) -> Result<VaultSession> {
    let password = read_password("Password: ", "VAULT_PASSWORD")?;
    vault.login(user, &password).await.map_err(user_facing)
}

// ── `vault init` ──────────────────────────────────────────────────────────────

async fn cmd_init(config: &VaultConfig) -> Result<()> {
    let setup_path = expand_tilde(&config.server.server_setup_file);
    let existed = setup_path.exists();
    load_or_generate(&setup_path)
        .with_context(|| format!("initializing server setup: {}", setup_path.display()))?;

    let op = build_operator(&config.storage).context("building storage operator")?;
    let health = check_health(&BlobStore::new(op)).await;

    println!(
        "server setup: {} ({})",
        setup_path.display(),
        if existed { "existing" } else { "generated" }
    );
    match &config.records.path {
        Some(path) => println!("records:      {}", expand_tilde(path).display()),
        None => println!("records:      in memory"),
    }
    println!("storage:      {} at {}", config.storage.backend, config.storage.root);
    match health {
        Ok(()) => println!("storage:      healthy"),
        Err(e) => println!("storage:      UNHEALTHY ({e})"),
    }
    Ok(())
}

// ── `vault register` ──────────────────────────────────────────────────────────

async fn cmd_register(vault: &VaultClient<LocalRecordStore>, user: &str) -> Result<()> {
    let password = read_new_password("New password: ", "VAULT_PASSWORD")?;
    vault.register(user, &password).await.map_err(user_facing)?;
    println!("registered {user}");
    Ok(())
}

// ── `vault put` ───────────────────────────────────────────────────────────────

async fn cmd_put(
    vault: &VaultClient<LocalRecordStore>,
    user: &str,
    local: &Path,
    name: Option<&str>,
) -> Result<()> {
    let plaintext = tokio::fs::read(local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let file_name = match name {
        Some(n) => n.to_string(),
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("no file name in {}; pass --name", local.display()))?,
    };

    let session = login(vault, user).await?;
    let record = vault
        .upload(&session, &file_name, plaintext)
        .await
        .map_err(user_facing)?;
    vault.logout(session)?;

    println!("stored {}", record.file_name);
    println!("  id:     {}", record.file_id);
    println!("  bytes:  {}", fmt_bytes(record.file_size));
    println!("  cipher: {}", record.algorithm);
    Ok(())
}

// ── `vault get` ───────────────────────────────────────────────────────────────

async fn cmd_get(
    vault: &VaultClient<LocalRecordStore>,
    user: &str,
    file_id: &str,
    out: Option<&Path>,
) -> Result<()> {
    let file_id: FileId = file_id.parse()?;
    let session = login(vault, user).await?;
    let result = vault.download(&session, &file_id).await;
    vault.logout(session)?;
    let (record, plaintext) = result.map_err(user_facing)?;

    let out = output_path(out, &record.file_name)?;
    write_new_file(&out, &plaintext).await?;
    println!("{} → {} ({})", record.file_id, out.display(), fmt_bytes(record.file_size));
    Ok(())
}

/// Where a download lands: `--out` if given, otherwise the stored file name
/// in the current directory. The stored name comes from the server or a
/// share's owner, so only its final component is used.
fn output_path(out: Option<&Path>, stored_name: &str) -> Result<PathBuf> {
    if let Some(out) = out {
        return Ok(out.to_path_buf());
    }
    let stored = Path::new(stored_name);
    if stored.is_absolute()
        || stored
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("refusing stored file name {stored_name:?}; pass --out");
    }
    match stored.file_name() {
        Some(name) => Ok(PathBuf::from(name)),
        None => anyhow::bail!("stored file name {stored_name:?} is not usable; pass --out"),
    }
}

/// Refuse to clobber an existing file.
async fn write_new_file(path: &Path, contents: &[u8]) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        anyhow::bail!("{} already exists", path.display());
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

// ── `vault ls` ────────────────────────────────────────────────────────────────

async fn cmd_ls(vault: &VaultClient<LocalRecordStore>, user: &str) -> Result<()> {
    let session = login(vault, user).await?;
    let files = vault.list(&session).await;
    vault.logout(session)?;
    let files = files?;

    if files.is_empty() {
        println!("no files");
        return Ok(());
    }
    for f in &files {
        println!(
            "{}  {:>10}  {:<18}  {}",
            f.file_id,
            fmt_bytes(f.file_size),
            f.algorithm.to_string(),
            f.file_name
        );
    }
    println!("{} file(s)", files.len());
    Ok(())
}

// ── `vault passwd` ────────────────────────────────────────────────────────────

async fn cmd_passwd(vault: &VaultClient<LocalRecordStore>, user: &str) -> Result<()> {
    let old = read_password("Current password: ", "VAULT_PASSWORD")?;
    let new = read_new_password("New password: ", "VAULT_NEW_PASSWORD")?;
    let mut session = vault.login(user, &old).await.map_err(user_facing)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted: abandoning password change");
            on_interrupt.cancel();
        }
    });

    let mut attempt = 1;
    let result = loop {
        match vault.change_password(&mut session, &old, &new, &cancel).await {
            Ok(()) => break Ok(()),
            Err(e) if e.is_retryable() && attempt < PASSWD_ATTEMPTS && !cancel.is_cancelled() => {
                tracing::warn!(attempt, error = %e, "password change failed, retrying");
                attempt += 1;
            }
            Err(e) => break Err(e),
        }
    };
    interrupt.abort();

    let files = vault.list(&session).await.map(|f| f.len()).unwrap_or(0);
    vault.logout(session)?;
    match result {
        Ok(()) => {
            println!("password changed; {files} file key(s) rewrapped");
            Ok(())
        }
        Err(e @ VaultError::RotationAbort(_)) => {
            Err(anyhow::Error::new(e).context("password unchanged"))
        }
        Err(e) => Err(user_facing(e)),
    }
}

// ── Shares ────────────────────────────────────────────────────────────────────

async fn cmd_share(vault: &VaultClient<LocalRecordStore>, user: &str, file_id: &str) -> Result<()> {
    let file_id: FileId = file_id.parse()?;
    let session = login(vault, user).await?;
    let share_password = read_new_password("Share password: ", "VAULT_SHARE_PASSWORD")?;
    let result = vault.create_share(&session, &file_id, &share_password).await;
    vault.logout(session)?;
    let share_id = result.map_err(user_facing)?;

    println!("shared {file_id}");
    println!("  share id: {share_id}");
    println!("  open with: vault open-share {share_id}");
    Ok(())
}

async fn cmd_shares(vault: &VaultClient<LocalRecordStore>, user: &str) -> Result<()> {
    let session = login(vault, user).await?;
    let shares = vault.list_shares(&session).await;
    vault.logout(session)?;
    let shares = shares?;

    if shares.is_empty() {
        println!("no shares");
        return Ok(());
    }
    for s in &shares {
        println!("{}  file {}  created {}", s.share_id, s.file_id, s.created_at);
    }
    Ok(())
}

async fn cmd_open_share(
    vault: &VaultClient<LocalRecordStore>,
    share_id: &str,
    out: Option<&Path>,
) -> Result<()> {
    let share_id: ShareId = share_id.parse()?;
    let password = read_password("Share password: ", "VAULT_SHARE_PASSWORD")?;
    let (record, plaintext) = vault
        .open_share(&share_id, &password)
        .await
        .map_err(user_facing)?;

    let out = output_path(out, &record.file_name)?;
    write_new_file(&out, &plaintext).await?;
    println!("{} → {} ({})", share_id, out.display(), fmt_bytes(record.file_size));
    Ok(())
}

async fn cmd_revoke(vault: &VaultClient<LocalRecordStore>, user: &str, share_id: &str) -> Result<()> {
    let share_id: ShareId = share_id.parse()?;
    let session = login(vault, user).await?;
    let result = vault.revoke_share(&session, &share_id).await;
    vault.logout(session)?;
    result?;
    println!("revoked {share_id}");
    Ok(())
}

// ── `vault config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &VaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
