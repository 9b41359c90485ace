//! Device-tree collaborator interface.
//!
//! Device-tree parsing happens outside this crate. A collaborator resolves a
//! node path against raw device-tree bytes and hands back a [`DtNode`]: an
//! opaque handle exposing only the resources the graph needs (register
//! ranges and interrupts). Hardware-backed subsystems accept a node or run
//! without one.

use crate::irq::TriggerMode;

/// A physical register range of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtRegion {
    /// Physical base address.
    pub paddr: u64,
    /// Size in bytes.
    pub size: u64,
}

/// An interrupt line of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtIrq {
    /// Hardware interrupt number.
    pub number: u32,
    /// Trigger mode.
    pub trigger: TriggerMode,
}

/// Resolved handle to one device-tree node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DtNode {
    name: String,
    regions: Vec<DtRegion>,
    irqs: Vec<DtIrq>,
}

impl DtNode {
    /// Creates a node handle with no resources.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: Vec::new(),
            irqs: Vec::new(),
        }
    }

    /// Adds a register range.
    #[must_use]
    pub fn with_region(mut self, paddr: u64, size: u64) -> Self {
        self.regions.push(DtRegion { paddr, size });
        self
    }

    /// Adds an interrupt line.
    #[must_use]
    pub fn with_irq(mut self, number: u32, trigger: TriggerMode) -> Self {
        self.irqs.push(DtIrq { number, trigger });
        self
    }

    /// Node name (the last path component).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register ranges, in declaration order.
    #[must_use]
    pub fn regions(&self) -> &[DtRegion] {
        &self.regions
    }

    /// Interrupt lines, in declaration order.
    #[must_use]
    pub fn irqs(&self) -> &[DtIrq] {
        &self.irqs
    }
}

/// A collaborator that resolves node paths against a parsed device tree.
pub trait DeviceTreeSource {
    /// Looks up a node by path; `None` if the node does not exist.
    fn lookup(&self, path: &str) -> Option<DtNode>;
}
