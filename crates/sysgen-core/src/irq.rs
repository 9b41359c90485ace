//! Hardware interrupt bindings.

use serde::{Deserialize, Serialize};

/// Interrupt trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Edge-triggered: signaled on a level transition.
    Edge,
    /// Level-triggered: stays asserted until acknowledged.
    Level,
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::Edge
    }
}

/// A hardware interrupt line, bound into a PD's local id space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Irq {
    number: u32,
    trigger: TriggerMode,
    id: Option<u8>,
}

impl Irq {
    /// Creates an interrupt binding; the local id is allocated when the IRQ
    /// is bound to a PD unless fixed here first.
    #[must_use]
    pub const fn new(number: u32, trigger: TriggerMode) -> Self {
        Self {
            number,
            trigger,
            id: None,
        }
    }

    /// Fixes the local id the binding must use.
    #[must_use]
    pub const fn with_id(mut self, id: u8) -> Self {
        self.id = Some(id);
        self
    }

    /// Hardware interrupt number.
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// Trigger mode.
    #[must_use]
    pub const fn trigger(&self) -> TriggerMode {
        self.trigger
    }

    /// Local id within the owning PD, once bound.
    #[must_use]
    pub const fn id(&self) -> Option<u8> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u8) {
        self.id = Some(id);
    }
}
