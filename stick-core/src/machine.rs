//! The flashing state machine.
//!
//! [`FlashMachine`] is the single owner of the [`FlashSession`]. Front-ends
//! send intents (select image, select device, refresh, flash, answer a
//! confirmation, eject) and read back the state, a status line, the control
//! sensitivity and any [`Notice`] to display. The running copy process is only
//! touched through the [`FlashHandle`] the supervisor returned.
//!
//! A typical front-end loop:
//!
//! ```rust,no_run
//! use stick_core::{FlashConfig, FlashMachine, machine::ConfirmOutcome};
//!
//! # async fn run() -> Result<(), stick_core::FlashError> {
//! let mut machine = FlashMachine::new(FlashConfig::default());
//! machine.refresh_devices()?;
//! machine.select_image("debian.iso")?;
//!
//! let mut confirmation = machine.request_flash()?;
//! loop {
//!     println!("{}: {}", confirmation.title(), confirmation.detail());
//!     match machine.confirm(true)? {
//!         ConfirmOutcome::Prompt(next) => confirmation = next,
//!         _ => break,
//!     }
//! }
//!
//! while let Some(event) = machine.next_flash_event().await {
//!     if let Some(notice) = machine.handle_flash_event(event)? {
//!         eprintln!("{}", notice.message());
//!     }
//!     println!("{}", machine.status());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

use crate::config::FlashConfig;
use crate::device::{Device, ImageSource};
use crate::eject::{self, EjectOutcome};
use crate::error::{FlashError, FlashFailure, FlashResult};
use crate::progress::{ProgressTracker, extract_bytes_written};
use crate::scan::{DeviceScanner, ScanOutcome};
use crate::state::{ConfirmStage, Controls, FlashState};
use crate::supervisor::{FlashEvent, FlashHandle, FlashSupervisor};

/// Placeholder shown in the device picker after a scan found nothing.
pub const NO_DEVICES_PLACEHOLDER: &str = "No removable drives found";

/// A message the front-end must show as a dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Error(String),
    Info(String),
}

impl Notice {
    pub fn title(&self) -> &'static str {
        match self {
            Notice::Error(_) => "Error",
            Notice::Info(_) => "Success",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::Error(m) | Notice::Info(m) => m,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Notice::Error(_))
    }
}

/// A confirmation the user has to answer before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub stage: ConfirmStage,
    pub device: PathBuf,
}

impl Confirmation {
    pub fn title(&self) -> String {
        match self.stage {
            ConfirmStage::HighRiskWarning => {
                format!("Warning: Target is {}", self.device.display())
            }
            ConfirmStage::Standard => "Confirm Flash".to_string(),
        }
    }

    pub fn detail(&self) -> String {
        match self.stage {
            ConfirmStage::HighRiskWarning => {
                "This is often the system drive. Are you absolutely sure?".to_string()
            }
            ConfirmStage::Standard => format!(
                "This will erase ALL data on {}\nAre you sure you want to continue?",
                self.device.display()
            ),
        }
    }
}

/// What answering a confirmation led to.
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// Another confirmation must be answered first.
    Prompt(Confirmation),
    /// The user said no; nothing happened.
    Declined,
    /// The copy process is running.
    Started,
    /// The copy process could not be started; the session is back to
    /// `ReadyToFlash`.
    SpawnFailed(Notice),
}

/// Everything the state machine knows about the current run.
#[derive(Debug)]
pub struct FlashSession {
    state: FlashState,
    /// `None` until the first scan.
    devices: Option<Vec<Device>>,
    selected_device: Option<PathBuf>,
    image: Option<ImageSource>,
    progress: ProgressTracker,
    last_failure: Option<FlashFailure>,
    /// Present exactly while `state == Flashing`.
    flash: Option<FlashHandle>,
}

impl FlashSession {
    fn new() -> Self {
        Self {
            state: FlashState::Idle,
            devices: None,
            selected_device: None,
            image: None,
            progress: ProgressTracker::default(),
            last_failure: None,
            flash: None,
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// The devices from the last scan, or `None` if no scan has run yet.
    pub fn devices(&self) -> Option<&[Device]> {
        self.devices.as_deref()
    }

    pub fn has_devices(&self) -> bool {
        self.devices.as_ref().is_some_and(|d| !d.is_empty())
    }

    pub fn selected_device(&self) -> Option<&Device> {
        let path = self.selected_device.as_ref()?;
        self.devices.as_ref()?.iter().find(|d| &d.path == path)
    }

    pub fn image(&self) -> Option<&ImageSource> {
        self.image.as_ref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.progress.bytes_written()
    }

    /// Progress of the current (or last successful) attempt in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        self.progress.fraction()
    }

    pub fn percent(&self) -> u8 {
        self.progress.percent()
    }

    pub fn is_syncing(&self) -> bool {
        self.state == FlashState::Flashing && self.progress.is_syncing()
    }

    pub fn last_failure(&self) -> Option<&FlashFailure> {
        self.last_failure.as_ref()
    }

    pub fn has_child(&self) -> bool {
        self.flash.is_some()
    }
}

/// The orchestrator: validates intents, drives the supervisor and owns the
/// session.
#[derive(Debug)]
pub struct FlashMachine {
    config: FlashConfig,
    scanner: DeviceScanner,
    supervisor: FlashSupervisor,
    session: FlashSession,
}

impl FlashMachine {
    pub fn new(config: FlashConfig) -> Self {
        Self {
            scanner: DeviceScanner::new(config.lister.clone()),
            supervisor: FlashSupervisor::new(&config),
            session: FlashSession::new(),
            config,
        }
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    pub fn state(&self) -> FlashState {
        self.session.state
    }

    pub fn controls(&self) -> Controls {
        Controls::for_state(self.session.state, self.session.has_devices())
    }

    /// The placeholder for an empty device picker, once a scan came back
    /// empty.
    pub fn device_placeholder(&self) -> Option<&'static str> {
        match &self.session.devices {
            Some(devices) if devices.is_empty() => Some(NO_DEVICES_PLACEHOLDER),
            _ => None,
        }
    }

    /// One-line status for the current state.
    pub fn status(&self) -> String {
        let session = &self.session;
        match session.state {
            FlashState::Idle | FlashState::ReadyToFlash | FlashState::Failed => {
                if session.last_failure.is_some() {
                    "Flashing Failed".to_string()
                } else if let Some(image) = &session.image {
                    format!("Ready to flash {}", image.file_name())
                } else {
                    "Ready to flash".to_string()
                }
            }
            FlashState::ConfirmPending(_) => "Waiting for confirmation".to_string(),
            FlashState::Flashing => {
                if session.progress.is_syncing() {
                    "Syncing data... DO NOT REMOVE!".to_string()
                } else if session.progress.bytes_written() == 0 {
                    "Starting...".to_string()
                } else {
                    format!("Flashing: {}%", session.progress.percent())
                }
            }
            FlashState::Completed => "Flashing Completed!".to_string(),
            FlashState::Ejecting => "Ejecting...".to_string(),
        }
    }

    fn transition(&mut self, next: FlashState) -> FlashResult<()> {
        let from = self.session.state;
        if !from.can_transition_to(next) {
            error!("Refusing illegal transition {} -> {}", from, next);
            return Err(FlashError::IllegalTransition { from, to: next });
        }
        if from != next {
            debug!("{} -> {}", from, next);
        }
        self.session.state = next;
        Ok(())
    }

    /// Moves to `ReadyToFlash` when both selections are present, else `Idle`.
    fn settle(&mut self) -> FlashResult<()> {
        let ready = self.session.image.is_some() && self.session.selected_device.is_some();
        self.transition(if ready {
            FlashState::ReadyToFlash
        } else {
            FlashState::Idle
        })
    }

    fn require_selectable(&self, action: &'static str) -> FlashResult<()> {
        if self.session.state.accepts_selection() {
            Ok(())
        } else {
            Err(FlashError::InvalidState {
                action,
                state: self.session.state,
            })
        }
    }

    /// Rescans with the configured lister and replaces the device list.
    ///
    /// Blocks while the lister runs. Scan problems are not errors: the
    /// returned outcome carries the warning and the list is empty.
    pub fn refresh_devices(&mut self) -> FlashResult<ScanOutcome> {
        self.require_selectable("refresh devices")?;
        let outcome = self.scanner.scan();
        self.apply_scan(outcome.clone())?;
        Ok(outcome)
    }

    /// Replaces the device list wholesale with a scan result.
    ///
    /// The selected device is kept when it is still present, otherwise the
    /// first listed device is selected. A previous failure is forgotten.
    pub fn apply_scan(&mut self, outcome: ScanOutcome) -> FlashResult<()> {
        self.require_selectable("refresh devices")?;
        if let Some(warning) = &outcome.warning {
            warn!("Device scan failed, showing no drives: {}", warning);
        }

        let devices = outcome.devices;
        self.session.last_failure = None;
        let kept = self
            .session
            .selected_device
            .take()
            .filter(|path| devices.iter().any(|d| &d.path == path));
        self.session.selected_device = kept.or_else(|| devices.first().map(|d| d.path.clone()));
        info!("{} removable drive(s) available", devices.len());
        self.session.devices = Some(devices);
        self.settle()
    }

    /// Selects the image to flash, resolving its size now. On failure the
    /// previous image stays selected.
    pub fn select_image(&mut self, path: impl AsRef<Path>) -> FlashResult<()> {
        self.require_selectable("select an image")?;
        let image = ImageSource::open(path.as_ref()).inspect_err(|e| {
            warn!("Rejected image selection: {}", e);
        })?;
        info!("Selected image {} ({} bytes)", image.path.display(), image.size_bytes);
        self.session.last_failure = None;
        self.session.image = Some(image);
        self.settle()
    }

    /// Selects a device from the last scan.
    pub fn select_device(&mut self, path: impl AsRef<Path>) -> FlashResult<()> {
        self.require_selectable("select a device")?;
        let path = path.as_ref();
        let known = self
            .session
            .devices
            .as_ref()
            .is_some_and(|devices| devices.iter().any(|d| d.path == path));
        if !known {
            warn!("Rejected unknown device {}", path.display());
            return Err(FlashError::UnknownDevice(path.to_path_buf()));
        }
        debug!("Selected device {}", path.display());
        self.session.last_failure = None;
        self.session.selected_device = Some(path.to_path_buf());
        self.settle()
    }

    /// The user asked to flash. Returns the first confirmation to show; for a
    /// high-risk target that is always the extra warning.
    pub fn request_flash(&mut self) -> FlashResult<Confirmation> {
        if self.session.state != FlashState::ReadyToFlash {
            return Err(FlashError::InvalidState {
                action: "flash",
                state: self.session.state,
            });
        }
        let confirmation = self.confirmation_for(self.first_stage());
        self.transition(FlashState::ConfirmPending(confirmation.stage))?;
        Ok(confirmation)
    }

    fn first_stage(&self) -> ConfirmStage {
        match &self.session.selected_device {
            Some(device) if self.config.is_high_risk(device) => ConfirmStage::HighRiskWarning,
            _ => ConfirmStage::Standard,
        }
    }

    fn confirmation_for(&self, stage: ConfirmStage) -> Confirmation {
        Confirmation {
            stage,
            device: self.session.selected_device.clone().unwrap_or_default(),
        }
    }

    /// The confirmation currently awaiting an answer.
    pub fn pending_confirmation(&self) -> Option<Confirmation> {
        match self.session.state {
            FlashState::ConfirmPending(stage) => Some(self.confirmation_for(stage)),
            _ => None,
        }
    }

    /// Answers the pending confirmation. Declining at any stage returns to
    /// `ReadyToFlash` with no side effects; accepting the standard
    /// confirmation starts the copy.
    ///
    /// Starting the copy spawns a process and must happen inside a tokio
    /// runtime.
    pub fn confirm(&mut self, accepted: bool) -> FlashResult<ConfirmOutcome> {
        let FlashState::ConfirmPending(stage) = self.session.state else {
            return Err(FlashError::InvalidState {
                action: "answer a confirmation",
                state: self.session.state,
            });
        };

        if !accepted {
            info!("Flash declined");
            self.transition(FlashState::ReadyToFlash)?;
            return Ok(ConfirmOutcome::Declined);
        }

        match stage {
            ConfirmStage::HighRiskWarning => {
                self.transition(FlashState::ConfirmPending(ConfirmStage::Standard))?;
                Ok(ConfirmOutcome::Prompt(self.confirmation_for(ConfirmStage::Standard)))
            }
            ConfirmStage::Standard => self.start_flash(),
        }
    }

    fn start_flash(&mut self) -> FlashResult<ConfirmOutcome> {
        let (Some(image), Some(device)) = (
            self.session.image.clone(),
            self.session.selected_device.clone(),
        ) else {
            self.transition(FlashState::ReadyToFlash)?;
            return Err(FlashError::InvalidState {
                action: "flash without an image and a device",
                state: self.session.state,
            });
        };

        match self.supervisor.start(&image.path, &device) {
            Ok(handle) => {
                self.transition(FlashState::Flashing)?;
                self.session.progress = ProgressTracker::new(image.size_bytes);
                self.session.last_failure = None;
                self.session.flash = Some(handle);
                info!("Flashing {} onto {}", image.path.display(), device.display());
                Ok(ConfirmOutcome::Started)
            }
            Err(err) => {
                error!("Could not start flashing: {}", err);
                let failure = FlashFailure::from(&err);
                let notice = Notice::Error(failure.message());
                self.session.last_failure = Some(failure);
                self.transition(FlashState::ReadyToFlash)?;
                Ok(ConfirmOutcome::SpawnFailed(notice))
            }
        }
    }

    /// Waits for the next event of the running copy. Returns `None` when
    /// nothing is being flashed.
    ///
    /// Cancel safe, so it can be raced against other branches in
    /// `tokio::select!`.
    pub async fn next_flash_event(&mut self) -> Option<FlashEvent> {
        match self.session.flash.as_mut() {
            Some(handle) => handle.next_event().await,
            None => None,
        }
    }

    /// Applies one event of the running copy. Returns a notice when the
    /// attempt failed.
    ///
    /// An `Exited` event is only taken once the copy process has actually
    /// been reaped; anything else is refused and the attempt keeps running.
    pub fn handle_flash_event(&mut self, event: FlashEvent) -> FlashResult<Option<Notice>> {
        if self.session.state != FlashState::Flashing {
            return Err(FlashError::InvalidState {
                action: "apply copy output",
                state: self.session.state,
            });
        }

        match event {
            FlashEvent::Output(record) => {
                match extract_bytes_written(&record) {
                    Some(bytes) => {
                        if self.session.progress.observe(bytes) {
                            trace!("{} bytes written ({}%)", bytes, self.session.progress.percent());
                        }
                    }
                    None => trace!("copy: {}", record),
                }
                Ok(None)
            }
            FlashEvent::Exited(code) => {
                let reported = self
                    .session
                    .flash
                    .as_ref()
                    .is_some_and(|handle| handle.is_finished());
                if !reported {
                    warn!("Ignoring exit code {} the copy process has not reported", code);
                    return Err(FlashError::InvalidState {
                        action: "finish a copy that is still running",
                        state: self.session.state,
                    });
                }
                self.finish_flash(code)
            }
        }
    }

    fn finish_flash(&mut self, code: i32) -> FlashResult<Option<Notice>> {
        if let Some(mut handle) = self.session.flash.take() {
            handle.release();
        }

        if code == 0 {
            self.session.progress.complete();
            self.transition(FlashState::Completed)?;
            info!("Flashing completed");
            return Ok(None);
        }

        let failure = FlashFailure::from_exit_code(code);
        error!("Flashing failed: {}", failure);
        let notice = Notice::Error(failure.message());
        self.session.last_failure = Some(failure);
        self.transition(FlashState::Failed)?;
        self.settle()?;
        Ok(Some(notice))
    }

    /// Drives the running copy to its end, calling `on_update` after every
    /// event. Returns the failure notice, if any.
    pub async fn run_to_exit(
        &mut self,
        mut on_update: impl FnMut(&FlashMachine),
    ) -> FlashResult<Option<Notice>> {
        let mut last = None;
        while let Some(event) = self.next_flash_event().await {
            last = self.handle_flash_event(event)?;
            on_update(self);
        }
        Ok(last)
    }

    /// Ejects the freshly written device and resets for another run. The
    /// eject tool's verdict is logged, never treated as a failure.
    pub fn eject(&mut self) -> FlashResult<(EjectOutcome, Notice)> {
        if self.session.state != FlashState::Completed {
            return Err(FlashError::InvalidState {
                action: "eject",
                state: self.session.state,
            });
        }
        self.transition(FlashState::Ejecting)?;

        let outcome = match &self.session.selected_device {
            Some(device) => eject::eject(&self.config.eject_tool, device),
            None => EjectOutcome::Unavailable("no device selected".to_string()),
        };

        self.session.progress = ProgressTracker::default();
        self.session.last_failure = None;
        self.settle()?;
        Ok((
            outcome,
            Notice::Info("Drive ejected. You can now remove it.".to_string()),
        ))
    }

    /// Tears the session down. A running copy is asked to terminate and its
    /// stream released without waiting for it to exit.
    pub fn shutdown(&mut self) -> Option<Notice> {
        let mut handle = self.session.flash.take()?;
        warn!("Shutting down while flashing; terminating the copy process");
        handle.terminate();
        handle.release();

        self.session.last_failure = Some(FlashFailure::Cancelled);
        if let Err(e) = self.transition(FlashState::Failed) {
            error!("{}", e);
        } else if let Err(e) = self.settle() {
            error!("{}", e);
        }
        Some(Notice::Error(FlashFailure::Cancelled.message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::parse_listing;
    use std::io::Write;

    const LISTING: &str = concat!(
        "NAME=\"sda\" SIZE=\"14.9G\" MODEL=\"Card Reader\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
        "NAME=\"sdb\" SIZE=\"16G\" MODEL=\"SanDisk\" RM=\"1\" TYPE=\"disk\" TRAN=\"usb\"\n",
    );

    fn image(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file
    }

    fn machine_with_copy(script: &str) -> FlashMachine {
        let config = FlashConfig {
            elevation: vec!["sh".into(), "-c".into(), script.into(), "sh".into()],
            eject_tool: "true".into(),
            ..FlashConfig::default()
        };
        let mut machine = FlashMachine::new(config);
        machine
            .apply_scan(ScanOutcome::found(parse_listing(LISTING)))
            .unwrap();
        machine
    }

    #[test]
    fn starts_idle_and_unscanned() {
        let machine = FlashMachine::new(FlashConfig::default());
        assert_eq!(machine.state(), FlashState::Idle);
        assert!(machine.session().devices().is_none());
        assert_eq!(machine.device_placeholder(), None);
        assert_eq!(machine.status(), "Ready to flash");
        assert!(!machine.controls().primary);
    }

    #[test]
    fn empty_scan_is_distinct_from_no_scan() {
        let mut machine = FlashMachine::new(FlashConfig::default());
        machine.apply_scan(ScanOutcome::failed("lsblk missing")).unwrap();
        assert_eq!(machine.session().devices(), Some(&[][..]));
        assert_eq!(machine.device_placeholder(), Some(NO_DEVICES_PLACEHOLDER));
        assert!(!machine.controls().device_picker);
    }

    #[test]
    fn scan_selects_first_device_and_keeps_existing_selection() {
        let mut machine = machine_with_copy("exit 0");
        assert_eq!(
            machine.session().selected_device().unwrap().path,
            PathBuf::from("/dev/sda")
        );
        machine.select_device("/dev/sdb").unwrap();
        machine
            .apply_scan(ScanOutcome::found(parse_listing(LISTING)))
            .unwrap();
        assert_eq!(
            machine.session().selected_device().unwrap().path,
            PathBuf::from("/dev/sdb")
        );
    }

    #[test]
    fn both_selections_make_ready() {
        let file = image(1024);
        let mut machine = machine_with_copy("exit 0");
        assert_eq!(machine.state(), FlashState::Idle);
        machine.select_image(file.path()).unwrap();
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert!(machine.controls().primary);
        assert!(machine.status().starts_with("Ready to flash "));
    }

    #[test]
    fn bad_image_keeps_previous_selection() {
        let file = image(2048);
        let mut machine = machine_with_copy("exit 0");
        machine.select_image(file.path()).unwrap();
        assert!(machine.select_image("/nonexistent/other.iso").is_err());
        assert_eq!(machine.session().image().unwrap().size_bytes, 2048);
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let mut machine = machine_with_copy("exit 0");
        assert!(matches!(
            machine.select_device("/dev/sdz"),
            Err(FlashError::UnknownDevice(_))
        ));
    }

    #[test]
    fn flash_requires_ready_state() {
        let mut machine = machine_with_copy("exit 0");
        assert!(matches!(
            machine.request_flash(),
            Err(FlashError::InvalidState { .. })
        ));
        assert!(matches!(machine.confirm(true), Err(FlashError::InvalidState { .. })));
    }

    #[test]
    fn declining_returns_to_ready_without_side_effects() {
        let file = image(1024);
        let mut machine = machine_with_copy("exit 0");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();

        let confirmation = machine.request_flash().unwrap();
        assert_eq!(confirmation.stage, ConfirmStage::Standard);
        assert!(confirmation.detail().contains("/dev/sdb"));
        assert!(!machine.controls().image_picker);
        assert!(machine.select_device("/dev/sda").is_err());

        assert!(matches!(machine.confirm(false).unwrap(), ConfirmOutcome::Declined));
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert!(!machine.session().has_child());
    }

    #[test]
    fn high_risk_target_asks_twice_and_either_no_aborts() {
        let file = image(1024);
        let mut machine = machine_with_copy("exit 0");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sda").unwrap();

        let warning = machine.request_flash().unwrap();
        assert_eq!(warning.stage, ConfirmStage::HighRiskWarning);
        assert_eq!(warning.title(), "Warning: Target is /dev/sda");
        assert!(matches!(machine.confirm(false).unwrap(), ConfirmOutcome::Declined));
        assert_eq!(machine.state(), FlashState::ReadyToFlash);

        machine.request_flash().unwrap();
        match machine.confirm(true).unwrap() {
            ConfirmOutcome::Prompt(next) => assert_eq!(next.stage, ConfirmStage::Standard),
            other => panic!("expected the standard confirmation, got {other:?}"),
        }
        assert_eq!(
            machine.pending_confirmation().unwrap().stage,
            ConfirmStage::Standard
        );
        assert!(matches!(machine.confirm(false).unwrap(), ConfirmOutcome::Declined));
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_ready_without_flashing() {
        let file = image(1024);
        let config = FlashConfig {
            elevation: vec!["/nonexistent/pkexec".into()],
            ..FlashConfig::default()
        };
        let mut machine = FlashMachine::new(config);
        machine
            .apply_scan(ScanOutcome::found(parse_listing(LISTING)))
            .unwrap();
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();

        match machine.confirm(true).unwrap() {
            ConfirmOutcome::SpawnFailed(notice) => {
                assert!(notice.is_error());
                assert!(notice.message().starts_with("Failed to start flashing"));
            }
            other => panic!("expected a spawn failure, got {other:?}"),
        }
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert!(!machine.session().has_child());
        assert!(matches!(
            machine.session().last_failure(),
            Some(FlashFailure::Spawn(_))
        ));
    }

    #[tokio::test]
    async fn selection_is_blocked_while_flashing_and_until_ejected() {
        let file = image(1000);
        let mut machine = machine_with_copy("sleep 0.2; echo '1000 bytes copied' >&2");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        assert!(matches!(machine.confirm(true).unwrap(), ConfirmOutcome::Started));

        assert_eq!(machine.state(), FlashState::Flashing);
        assert!(machine.session().has_child());
        assert_eq!(machine.status(), "Starting...");
        assert!(machine.select_device("/dev/sda").is_err());
        assert!(machine.select_image(file.path()).is_err());
        assert!(machine.refresh_devices().is_err());
        assert!(machine.request_flash().is_err());

        assert_eq!(machine.run_to_exit(|_| {}).await.unwrap(), None);
        assert_eq!(machine.state(), FlashState::Completed);
        assert!(!machine.session().has_child());
        assert!(matches!(
            machine.select_device("/dev/sda"),
            Err(FlashError::InvalidState { .. })
        ));

        let (outcome, notice) = machine.eject().unwrap();
        assert!(outcome.is_ejected());
        assert_eq!(notice.message(), "Drive ejected. You can now remove it.");
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert_eq!(machine.session().fraction(), 0.0);
        assert_eq!(machine.controls().primary_label, "Flash!");
        machine.select_device("/dev/sda").unwrap();
    }

    #[tokio::test]
    async fn failing_eject_is_tolerated() {
        let file = image(10);
        let config = FlashConfig {
            elevation: vec!["sh".into(), "-c".into(), "exit 0".into(), "sh".into()],
            eject_tool: "false".into(),
            ..FlashConfig::default()
        };
        let mut machine = FlashMachine::new(config);
        machine
            .apply_scan(ScanOutcome::found(parse_listing(LISTING)))
            .unwrap();
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        machine.confirm(true).unwrap();
        machine.run_to_exit(|_| {}).await.unwrap();

        let (outcome, notice) = machine.eject().unwrap();
        assert!(!outcome.is_ejected());
        assert!(!notice.is_error());
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
    }

    #[tokio::test]
    async fn shutdown_terminates_and_releases() {
        let file = image(10);
        let mut machine = machine_with_copy("sleep 30");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        machine.confirm(true).unwrap();
        assert!(machine.session().has_child());

        let notice = machine.shutdown().unwrap();
        assert!(notice.is_error());
        assert!(!machine.session().has_child());
        assert_eq!(machine.state(), FlashState::ReadyToFlash);
        assert_eq!(
            machine.session().last_failure(),
            Some(&FlashFailure::Cancelled)
        );
        assert_eq!(machine.next_flash_event().await, None);
        assert!(machine.shutdown().is_none());
    }

    #[tokio::test]
    async fn unreported_exit_cannot_finish_a_running_copy() {
        let file = image(10);
        let mut machine = machine_with_copy("sleep 30");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        machine.confirm(true).unwrap();

        assert!(matches!(
            machine.handle_flash_event(FlashEvent::Exited(0)),
            Err(FlashError::InvalidState { .. })
        ));
        assert_eq!(machine.state(), FlashState::Flashing);
        assert!(machine.session().has_child());
        assert!(machine.eject().is_err());
        machine.shutdown();
    }

    #[tokio::test]
    async fn exit_is_applied_when_waits_are_abandoned() {
        let file = image(10);
        let mut machine = machine_with_copy("exec 2>&-; sleep 0.5; exit 0");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        machine.confirm(true).unwrap();

        let mut events = Vec::new();
        while machine.state() == FlashState::Flashing {
            tokio::select! {
                event = machine.next_flash_event() => {
                    let event = event.expect("a running copy always reports its exit");
                    events.push(event.clone());
                    machine.handle_flash_event(event).unwrap();
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
        assert_eq!(events, vec![FlashEvent::Exited(0)]);
        assert_eq!(machine.state(), FlashState::Completed);
        assert!(!machine.session().has_child());
    }

    #[tokio::test]
    async fn rescan_clears_the_failed_status() {
        let file = image(10);
        let mut machine = machine_with_copy("exit 1");
        machine.select_image(file.path()).unwrap();
        machine.select_device("/dev/sdb").unwrap();
        machine.request_flash().unwrap();
        machine.confirm(true).unwrap();
        machine.run_to_exit(|_| {}).await.unwrap();
        assert_eq!(machine.status(), "Flashing Failed");

        machine
            .apply_scan(ScanOutcome::found(parse_listing(LISTING)))
            .unwrap();
        assert!(machine.session().last_failure().is_none());
        assert!(machine.status().starts_with("Ready to flash "));
    }

    #[test]
    fn events_outside_flashing_are_refused() {
        let mut machine = machine_with_copy("exit 0");
        assert!(
            machine
                .handle_flash_event(FlashEvent::Output("5 bytes".into()))
                .is_err()
        );
        assert!(machine.eject().is_err());
    }
}
