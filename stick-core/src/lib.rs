//! The core, UI-agnostic library for the `stick` USB image flasher.
//!
//! `stick-core` owns everything a front-end needs to write a disk image onto a
//! removable drive without doing any privileged I/O itself: it discovers
//! candidate drives with `lsblk`, runs `dd` through an elevation wrapper
//! (`pkexec` by default), turns the copy's stderr into progress, and tracks
//! the whole session in a small state machine that decides which controls a
//! front-end may offer.
//!
//! The library is structured into several key modules:
//! - [`device`]: The `Device` and `ImageSource` types.
//! - [`scan`]: Runs the block device lister and parses its output.
//! - [`supervisor`]: Spawns the elevated copy and streams its events.
//! - [`progress`]: Extracts byte counts and keeps the progress fraction.
//! - [`state`]: Flash states, the transition table and control sensitivity.
//! - [`machine`]: The [`FlashMachine`] every user intent goes through.
//! - [`eject`]: Ejecting the target after a successful run.
//! - [`config`]: Tools, block size and high-risk device settings.
//! - [`platform`]: Linux-specific helpers, such as locating the system disk.
//!
//! All process work happens on the caller's tokio runtime. A current-thread
//! runtime is enough; the machine is never shared between threads.
//!
//! ## Example: Flashing the First Removable Drive
//!
//! ```rust,no_run
//! use stick_core::{FlashConfig, FlashMachine, machine::ConfirmOutcome};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let mut machine = FlashMachine::new(FlashConfig::default().with_system_disk());
//!     machine.refresh_devices()?;
//!     machine.select_image("path/to/image.img")?;
//!
//!     machine.request_flash()?;
//!     while let ConfirmOutcome::Prompt(_) = machine.confirm(true)? {}
//!
//!     let failure = machine
//!         .run_to_exit(|m| println!("{}", m.status()))
//!         .await?;
//!     match failure {
//!         Some(notice) => eprintln!("{}", notice.message()),
//!         None => println!("{}", machine.status()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod eject;
pub mod error;
pub mod machine;
pub mod platform;
pub mod progress;
pub mod scan;
pub mod state;
pub mod supervisor;

pub use config::FlashConfig;
pub use device::{Device, ImageSource};
pub use error::{FlashError, FlashFailure, FlashResult};
pub use machine::{FlashMachine, Notice};
pub use state::{Controls, FlashState};
