use std::path::{Path, PathBuf};

use crate::error::Severity;
use crate::scanner::SessionMarker;

/// Lifecycle of one handling facility. The only transition is
/// `Disabled -> Enabled`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FacilityState {
    #[default]
    Disabled,
    Enabled,
}

impl FacilityState {
    pub fn is_enabled(self) -> bool {
        self == FacilityState::Enabled
    }

    /// Moves to `Enabled`. Returns true only on the actual transition.
    pub(crate) fn enable(&mut self) -> bool {
        let changed = *self == FacilityState::Disabled;
        *self = FacilityState::Enabled;
        changed
    }
}

/// Per-session handler configuration.
///
/// Mutated only through [`HandlerRegistry`](super::HandlerRegistry)
/// operations; everything else gets a shared reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerState {
    pub(crate) conversion: FacilityState,
    pub(crate) exception_handling: FacilityState,
    pub(crate) fatal_capture: FacilityState,
    pub(crate) conversion_mask: Severity,
    pub(crate) session_marker: Option<SessionMarker>,
    pub(crate) notify_targets: Vec<String>,
    pub(crate) message_file: Option<PathBuf>,
    pub(crate) debug_mode: bool,
}

impl HandlerState {
    pub fn conversion(&self) -> FacilityState {
        self.conversion
    }

    pub fn exception_handling(&self) -> FacilityState {
        self.exception_handling
    }

    pub fn fatal_capture(&self) -> FacilityState {
        self.fatal_capture
    }

    pub fn conversion_mask(&self) -> Severity {
        self.conversion_mask
    }

    /// Marker of the current session; `None` until fatal capture is enabled.
    pub fn session_marker(&self) -> Option<&SessionMarker> {
        self.session_marker.as_ref()
    }

    /// Validated, de-duplicated notification addresses in insertion order.
    pub fn notify_targets(&self) -> &[String] {
        &self.notify_targets
    }

    pub fn message_file(&self) -> Option<&Path> {
        self.message_file.as_deref()
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_enable_is_one_way() {
        let mut facility = FacilityState::default();
        assert!(!facility.is_enabled());
        assert!(facility.enable());
        assert!(!facility.enable());
        assert!(facility.is_enabled());
    }

    #[test]
    fn test_default_state() {
        let state = HandlerState::default();
        assert_eq!(state.conversion_mask(), Severity::DEFAULT_CONVERSION);
        assert!(state.session_marker().is_none());
        assert!(state.notify_targets().is_empty());
        assert!(!state.debug_mode());
    }
}
