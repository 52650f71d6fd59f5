use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use stick_core::machine::{ConfirmOutcome, Confirmation};
use stick_core::state::ConfirmStage;
use stick_core::{Device, FlashConfig, FlashMachine, Notice};
use tokio::sync::watch;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "stick")]
#[command(about = "A safe, interactive USB image flasher", version)]
struct Cli {
    /// Print debug logs to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash an image onto a removable drive interactively
    Flash {
        /// Image file to flash
        #[arg(required = true)]
        image: PathBuf,

        /// Target drive, e.g. /dev/sdb (prompted for when omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        #[command(flatten)]
        options: FlashOptions,
    },
    /// List available removable drives
    List,
}

#[derive(Args)]
struct FlashOptions {
    /// Block size handed to dd
    #[arg(long, default_value = stick_core::config::DEFAULT_BLOCK_SIZE)]
    block_size: String,

    /// Run dd directly instead of through pkexec (when already root)
    #[arg(long)]
    no_elevate: bool,

    /// Ask for the system drive warning on this device too (repeatable)
    #[arg(long = "high-risk", value_name = "PATH")]
    high_risk: Vec<PathBuf>,
}

impl FlashOptions {
    fn into_config(self) -> FlashConfig {
        let mut config = FlashConfig {
            block_size: self.block_size,
            ..FlashConfig::default()
        }
        .with_system_disk();
        if self.no_elevate {
            config.elevation.clear();
        }
        for path in self.high_risk {
            config.add_high_risk(path);
        }
        config
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` makes the terminal print Ctrl+C as `^C`, which would land in the
/// middle of the progress bar. The original state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "warn,stick=debug,stick_core=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Presents an interactive menu for the user to select the target drive.
fn select_device(devices: &[Device], current: Option<&Device>) -> Result<PathBuf> {
    let items: Vec<String> = devices.iter().map(Device::label).collect();
    let default = current
        .and_then(|c| devices.iter().position(|d| d == c))
        .unwrap_or(0);

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the target drive to FLASH")
        .items(&items)
        .default(default)
        .interact()?;

    Ok(devices[selection].path.clone())
}

/// Shows one confirmation and returns the user's answer.
fn ask(confirmation: &Confirmation) -> Result<bool> {
    let title = match confirmation.stage {
        ConfirmStage::HighRiskWarning => style(confirmation.title()).red().bold(),
        ConfirmStage::Standard => style(confirmation.title()).yellow().bold(),
    };
    println!("{}", title);
    println!("{}", confirmation.detail());

    let answer = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Continue?")
        .default(false)
        .interact()?;
    println!();
    Ok(answer)
}

fn show_notice(notice: &Notice) {
    if notice.is_error() {
        eprintln!("{} {}", style(notice.title()).red().bold(), notice.message());
    } else {
        println!("{} {}", style(notice.title()).green().bold(), notice.message());
    }
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_prefix("Flashing");
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
            )?
            .progress_chars("■ "),
    );
    Ok(bar)
}

fn list(config: FlashConfig) -> Result<()> {
    let mut machine = FlashMachine::new(config);
    let outcome = machine.refresh_devices()?;
    if let Some(warning) = &outcome.warning {
        eprintln!("{} {}", style("Warning:").yellow().bold(), warning);
    }
    if let Some(placeholder) = machine.device_placeholder() {
        println!("{}", placeholder);
        return Ok(());
    }

    println!("Found {} removable drives:", outcome.devices.len());
    println!(
        "\n  {:<14} {:<28} {:>8}  {}",
        "DEVICE", "MODEL", "SIZE", "TRANSPORT"
    );
    println!("  {:-<14} {:-<28} {:->8}  {:-<9}", "", "", "", "");
    for device in &outcome.devices {
        let model = if device.model.is_empty() {
            "(unknown)"
        } else {
            &device.model
        };
        println!(
            "  {:<14} {:<28} {:>8}  {}",
            device.path.display(),
            model,
            device.size,
            device.transport()
        );
    }
    Ok(())
}

/// Renders the running copy until it exits or Ctrl+C arrives. Only an
/// interrupt delivered after this point cancels the copy.
async fn follow_flash(
    machine: &mut FlashMachine,
    bar: &ProgressBar,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Option<Notice>> {
    cancel.borrow_and_update();
    loop {
        tokio::select! {
            event = machine.next_flash_event() => {
                let Some(event) = event else { return Ok(None) };
                let notice = machine.handle_flash_event(event)?;
                bar.set_position(machine.session().bytes_written());
                bar.set_message(machine.status());
                if notice.is_some() {
                    return Ok(notice);
                }
            }
            Ok(()) = cancel.changed() => {
                debug!("Interrupted by the user");
                return Ok(machine.shutdown());
            }
        }
    }
}

async fn flash(
    image: &Path,
    device: Option<PathBuf>,
    config: FlashConfig,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let mut machine = FlashMachine::new(config);
    machine.select_image(image)?;

    let outcome = machine.refresh_devices()?;
    if let Some(warning) = &outcome.warning {
        eprintln!("{} {}", style("Warning:").yellow().bold(), warning);
    }
    if let Some(placeholder) = machine.device_placeholder() {
        bail!("{}", placeholder);
    }

    let target = match device {
        Some(path) => path,
        None => {
            let session = machine.session();
            select_device(session.devices().unwrap_or_default(), session.selected_device())?
        }
    };
    machine
        .select_device(&target)
        .with_context(|| format!("{} is not a removable drive", target.display()))?;

    let (Some(image), Some(device)) = (
        machine.session().image().cloned(),
        machine.session().selected_device().cloned(),
    ) else {
        bail!("{}", machine.status());
    };
    println!();
    println!("  Device: {}", style(device.label()).cyan());
    println!(
        "  Image:  {} ({} bytes)",
        style(image.path.display()).cyan(),
        image.size_bytes
    );
    println!();

    let mut confirmation = machine.request_flash()?;
    loop {
        if !ask(&confirmation)? {
            machine.confirm(false)?;
            println!("Flash cancelled.");
            return Ok(());
        }
        match machine.confirm(true)? {
            ConfirmOutcome::Prompt(next) => confirmation = next,
            ConfirmOutcome::Started => break,
            ConfirmOutcome::Declined => return Ok(()),
            ConfirmOutcome::SpawnFailed(notice) => return Err(anyhow!("{}", notice.message())),
        }
    }

    let bar = progress_bar(image.size_bytes)?;
    bar.set_message(machine.status());

    let notice = follow_flash(&mut machine, &bar, &mut cancel).await?;
    if let Some(notice) = notice {
        bar.abandon_with_message(machine.status());
        return Err(anyhow!("{}", notice.message()));
    }
    bar.finish_with_message(machine.status());

    println!(
        "\n✨ Successfully flashed {} with {}.",
        style(device.path.display()).cyan(),
        style(image.file_name()).cyan()
    );

    let eject = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("{} now?", machine.controls().primary_label))
        .default(true)
        .interact()?;
    if eject {
        let (_, notice) = machine.eject()?;
        show_notice(&notice);
    } else {
        println!(
            "Eject {} before removing it.",
            style(device.path.display()).cyan()
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        cancel_tx.send_replace(true);
    })?;

    match cli.command {
        Commands::List => list(FlashConfig::default()),
        Commands::Flash {
            image,
            device,
            options,
        } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(flash(&image, device, options.into_config(), cancel_rx))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use stick_core::scan::{ScanOutcome, parse_listing};
    use stick_core::FlashState;

    fn started(script: &str, image: &tempfile::NamedTempFile) -> FlashMachine {
        let config = FlashConfig {
            elevation: vec!["sh".into(), "-c".into(), script.into(), "sh".into()],
            ..FlashConfig::default()
        };
        let mut machine = FlashMachine::new(config);
        machine
            .apply_scan(ScanOutcome::found(parse_listing(
                "NAME=\"sdb\" SIZE=\"16G\" MODEL=\"SanDisk\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
            )))
            .unwrap();
        machine.select_image(image.path()).unwrap();
        machine.request_flash().unwrap();
        assert!(matches!(machine.confirm(true).unwrap(), ConfirmOutcome::Started));
        machine
    }

    fn image() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 100]).unwrap();
        file
    }

    #[tokio::test]
    async fn interrupt_before_the_copy_does_not_cancel_it() {
        let image = image();
        let mut machine = started("echo '100 bytes copied' >&2", &image);
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);

        let notice = follow_flash(&mut machine, &ProgressBar::hidden(), &mut rx)
            .await
            .unwrap();
        assert_eq!(notice, None);
        assert_eq!(machine.state(), FlashState::Completed);
    }

    #[tokio::test]
    async fn interrupt_during_the_copy_cancels_it() {
        let image = image();
        let mut machine = started("sleep 30", &image);
        let (tx, mut rx) = watch::channel(false);

        let bar = ProgressBar::hidden();
        let (notice, _) = tokio::join!(
            follow_flash(&mut machine, &bar, &mut rx),
            async {
                tokio::task::yield_now().await;
                tx.send_replace(true);
            }
        );
        assert_eq!(notice.unwrap().unwrap().message(), "Flashing was cancelled.");
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert!(!machine.session().has_child());
    }
}
