//! Flashing states, the legal transitions between them, and which controls a
//! front-end may offer in each.

use std::fmt;

/// Which confirmation the user is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStage {
    /// Extra warning for a target that looks like the system disk. Always
    /// shown before [`ConfirmStage::Standard`].
    HighRiskWarning,
    /// The regular "this will erase everything" confirmation.
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Image or device (or both) missing.
    Idle,
    /// Image and device selected.
    ReadyToFlash,
    ConfirmPending(ConfirmStage),
    /// The copy process is running.
    Flashing,
    /// The copy exited 0; the target may be ejected.
    Completed,
    /// The copy failed. Settles straight back to `ReadyToFlash`.
    Failed,
    Ejecting,
}

impl FlashState {
    /// The transition table. Anything not listed here is refused.
    pub fn can_transition_to(self, next: FlashState) -> bool {
        use ConfirmStage::*;
        use FlashState::*;

        matches!(
            (self, next),
            (Idle, Idle | ReadyToFlash)
                | (ReadyToFlash, Idle | ReadyToFlash | ConfirmPending(_))
                | (ConfirmPending(HighRiskWarning), ConfirmPending(Standard))
                | (ConfirmPending(Standard), Flashing)
                | (ConfirmPending(_), ReadyToFlash)
                | (Flashing, Completed | Failed)
                | (Failed, Idle | ReadyToFlash)
                | (Completed, Ejecting)
                | (Ejecting, Idle | ReadyToFlash)
        )
    }

    /// Image and device selection (and rescans) are only taken in these states.
    pub fn accepts_selection(self) -> bool {
        matches!(self, FlashState::Idle | FlashState::ReadyToFlash)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "Idle"),
            FlashState::ReadyToFlash => write!(f, "ReadyToFlash"),
            FlashState::ConfirmPending(ConfirmStage::HighRiskWarning) => {
                write!(f, "ConfirmPending(high-risk warning)")
            }
            FlashState::ConfirmPending(ConfirmStage::Standard) => write!(f, "ConfirmPending"),
            FlashState::Flashing => write!(f, "Flashing"),
            FlashState::Completed => write!(f, "Completed"),
            FlashState::Failed => write!(f, "Failed"),
            FlashState::Ejecting => write!(f, "Ejecting"),
        }
    }
}

/// Which controls are interactive, and what the primary button says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub image_picker: bool,
    pub device_picker: bool,
    pub refresh: bool,
    pub primary: bool,
    pub primary_label: &'static str,
}

impl Controls {
    pub const FLASH_LABEL: &'static str = "Flash!";
    pub const FLASHING_LABEL: &'static str = "Flashing...";
    pub const EJECT_LABEL: &'static str = "Eject Drive";

    /// Derives control sensitivity from the state alone (plus whether the
    /// last scan found anything to pick from).
    pub fn for_state(state: FlashState, has_devices: bool) -> Self {
        match state {
            FlashState::Idle | FlashState::ReadyToFlash | FlashState::Failed => Controls {
                image_picker: true,
                device_picker: has_devices,
                refresh: true,
                primary: state != FlashState::Idle,
                primary_label: Self::FLASH_LABEL,
            },
            FlashState::ConfirmPending(_) => Controls::locked(Self::FLASH_LABEL, false),
            FlashState::Flashing => Controls::locked(Self::FLASHING_LABEL, false),
            FlashState::Completed => Controls::locked(Self::EJECT_LABEL, true),
            FlashState::Ejecting => Controls::locked(Self::EJECT_LABEL, false),
        }
    }

    fn locked(primary_label: &'static str, primary: bool) -> Self {
        Controls {
            image_picker: false,
            device_picker: false,
            refresh: false,
            primary,
            primary_label,
        }
    }
}
