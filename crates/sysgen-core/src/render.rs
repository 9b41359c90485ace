//! System document rendering.
//!
//! The document model mirrors the entity graph one-to-one and derives both
//! `Serialize` and `Deserialize`, so a rendered document can be parsed back
//! and compared structurally. Collections keep assembler insertion order and
//! struct fields serialize in declaration order; rendering the same graph
//! twice produces byte-identical output.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{Map, MapPerms};
use crate::pd::{PdHandle, DEFAULT_BUDGET};
use crate::system::SystemDescription;
use crate::vm::VmHandle;
use crate::{Arch, TriggerMode};

/// One address-space mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDoc {
    /// Name of the mapped memory region.
    pub mr: String,
    /// Virtual address.
    pub vaddr: u64,
    /// Permission letters ("rwx" form; empty for a reservation).
    pub perms: String,
    /// Whether the mapping is cached.
    pub cached: bool,
    /// Symbol patched with the mapping's vaddr, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setvar_vaddr: Option<String>,
}

/// One bound interrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqDoc {
    /// Hardware interrupt number.
    pub number: u32,
    /// Trigger mode.
    pub trigger: TriggerMode,
    /// Local id within the owning PD.
    pub id: u8,
}

/// One vCPU of a virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuDoc {
    /// vCPU id.
    pub id: u8,
    /// Physical CPU affinity, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u8>,
}

/// One virtual machine, nested in its hosting PD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDoc {
    /// VM name.
    pub name: String,
    /// vCPUs in creation order.
    pub vcpus: Vec<VcpuDoc>,
    /// Guest address-space mappings.
    pub maps: Vec<MapDoc>,
}

/// One child-PD slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDoc {
    /// Id within the parent's id space.
    pub id: u8,
    /// The child protection domain.
    pub pd: PdDoc,
}

/// One protection domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdDoc {
    /// PD name.
    pub name: String,
    /// Program image reference.
    pub program_image: String,
    /// Scheduling priority.
    pub priority: u8,
    /// Scheduling budget in microseconds.
    pub budget: u32,
    /// Scheduling period in microseconds.
    pub period: u32,
    /// Stack size in bytes, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<u32>,
    /// Physical CPU affinity, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u8>,
    /// Whether the PD is passive.
    pub passive: bool,
    /// Address-space mappings.
    pub maps: Vec<MapDoc>,
    /// Bound interrupts.
    pub irqs: Vec<IrqDoc>,
    /// Child PDs.
    pub children: Vec<ChildDoc>,
    /// Hosted virtual machine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VmDoc>,
}

/// One memory region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrDoc {
    /// Region name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Fixed physical address, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paddr: Option<u64>,
}

/// One channel end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEndDoc {
    /// Endpoint PD name.
    pub pd: String,
    /// Local id within that PD.
    pub id: u8,
    /// Whether this end may notify the other.
    pub notify: bool,
    /// Whether this end may issue protected procedure calls.
    pub pp: bool,
}

/// One channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDoc {
    /// End A.
    pub a: ChannelEndDoc,
    /// End B.
    pub b: ChannelEndDoc,
}

/// The rendered system description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDocument {
    /// Target architecture.
    pub arch: Arch,
    /// Top of usable physical memory.
    pub paddr_top: u64,
    /// Top-level protection domains, in registration order.
    pub protection_domains: Vec<PdDoc>,
    /// Memory regions, in registration order.
    pub memory_regions: Vec<MrDoc>,
    /// Channels, in registration order.
    pub channels: Vec<ChannelDoc>,
}

impl SystemDocument {
    /// Builds the document from the current graph state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SdfError::StaleHandle`] if a registered entity
    /// references a destroyed one.
    pub fn build(sdf: &SystemDescription) -> Result<Self> {
        let mut protection_domains = Vec::new();
        for &pd in sdf.registered_pds() {
            protection_domains.push(pd_doc(sdf, pd)?);
        }

        let mut memory_regions = Vec::new();
        for &mr in sdf.registered_mrs() {
            let region = sdf.mr(mr)?;
            memory_regions.push(MrDoc {
                name: region.name().to_string(),
                size: region.size(),
                paddr: region.paddr(),
            });
        }

        let mut channels = Vec::new();
        for &ch in sdf.registered_channels() {
            let channel = sdf.channel(ch)?;
            channels.push(ChannelDoc {
                a: end_doc(sdf, channel.end_a())?,
                b: end_doc(sdf, channel.end_b())?,
            });
        }

        Ok(Self {
            arch: sdf.arch(),
            paddr_top: sdf.paddr_top(),
            protection_domains,
            memory_regions,
            channels,
        })
    }

    /// Serializes the document as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SdfError::Render`] on serialization failure.
    pub fn to_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Parses a document rendered by [`SystemDocument::to_json`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::SdfError::Render`] if the input is not a valid
    /// document.
    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }
}

fn end_doc(sdf: &SystemDescription, end: crate::channel::ChannelEnd) -> Result<ChannelEndDoc> {
    Ok(ChannelEndDoc {
        pd: sdf.pd(end.pd)?.name().to_string(),
        id: end.id,
        notify: end.notify,
        pp: end.pp,
    })
}

fn pd_doc(sdf: &SystemDescription, pd: PdHandle) -> Result<PdDoc> {
    let entity = sdf.pd(pd)?;

    let mut maps = Vec::new();
    for map in entity.maps() {
        maps.push(map_doc(sdf, map)?);
    }

    let irqs = entity
        .irqs()
        .iter()
        .map(|irq| IrqDoc {
            number: irq.number(),
            trigger: irq.trigger(),
            id: irq.id().unwrap_or_default(),
        })
        .collect();

    let mut children = Vec::new();
    for child in entity.children() {
        children.push(ChildDoc {
            id: child.id,
            pd: pd_doc(sdf, child.pd)?,
        });
    }

    let virtual_machine = match entity.vm() {
        Some(vm) => Some(vm_doc(sdf, vm)?),
        None => None,
    };

    let budget = entity.budget().unwrap_or(DEFAULT_BUDGET);
    Ok(PdDoc {
        name: entity.name().to_string(),
        program_image: entity.program_image().to_string(),
        priority: entity.priority(),
        budget,
        period: entity.period().unwrap_or(budget),
        stack_size: entity.stack_size(),
        cpu: entity.cpu(),
        passive: entity.passive(),
        maps,
        irqs,
        children,
        virtual_machine,
    })
}

fn vm_doc(sdf: &SystemDescription, vm: VmHandle) -> Result<VmDoc> {
    let entity = sdf.vm(vm)?;
    let mut maps = Vec::new();
    for map in entity.maps() {
        maps.push(map_doc(sdf, map)?);
    }
    Ok(VmDoc {
        name: entity.name().to_string(),
        vcpus: entity
            .vcpus()
            .iter()
            .map(|vcpu| VcpuDoc {
                id: vcpu.id,
                cpu: vcpu.cpu,
            })
            .collect(),
        maps,
    })
}

fn map_doc(sdf: &SystemDescription, map: &Map) -> Result<MapDoc> {
    Ok(MapDoc {
        mr: sdf.mr(map.mr())?.name().to_string(),
        vaddr: map.vaddr(),
        perms: map.perms().letters(),
        cached: map.cached(),
        setvar_vaddr: map.setvar_vaddr().map(str::to_string),
    })
}

impl MapDoc {
    /// The mapping's permission set.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SdfError::InvalidAddress`] if the letter form does
    /// not parse.
    pub fn perms(&self) -> Result<MapPerms> {
        MapPerms::from_letters(&self.perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::memory::{Map, MapPerms, MemoryRegion, PAGE_SIZE};
    use crate::pd::ProtectionDomain;
    use crate::vm::{Vcpu, VirtualMachine};

    fn sample_system() -> SystemDescription {
        let mut sdf = SystemDescription::new(Arch::Aarch64, 0xa000_0000).unwrap();

        let driver = sdf.create_pd(ProtectionDomain::new("driver", "driver.elf"));
        let client = sdf.create_pd(ProtectionDomain::new("client", "client.elf"));
        sdf.pd_mut(driver).unwrap().set_priority(200);
        sdf.add_pd(driver).unwrap();
        sdf.add_pd(client).unwrap();

        let mr = sdf
            .create_mr(MemoryRegion::new_physical("uart", PAGE_SIZE, 0x900_0000).unwrap());
        sdf.add_mr(mr).unwrap();
        let map = Map::new(mr, 0x200_0000, MapPerms::RW, false)
            .unwrap()
            .with_setvar_vaddr("uart_base");
        sdf.pd_mut(driver).unwrap().add_map(map);

        let vm = sdf
            .create_vm(VirtualMachine::new("guest", vec![Vcpu::new(0).on_cpu(1)]).unwrap());
        sdf.pd_attach_vm(driver, vm).unwrap();

        let ch = sdf
            .channel_create(driver, client, ChannelOptions::default())
            .unwrap();
        sdf.add_channel(ch).unwrap();

        sdf
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = sample_system().render().unwrap();
        let b = sample_system().render().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_trip() {
        let sdf = sample_system();
        let document = SystemDocument::build(&sdf).unwrap();
        let json = document.to_json().unwrap();
        let parsed = SystemDocument::from_json(&json).unwrap();
        assert_eq!(document, parsed);
    }

    #[test]
    fn test_document_shape() {
        let document = SystemDocument::build(&sample_system()).unwrap();
        assert_eq!(document.protection_domains.len(), 2);
        assert_eq!(document.memory_regions.len(), 1);
        assert_eq!(document.channels.len(), 1);

        let driver = &document.protection_domains[0];
        assert_eq!(driver.name, "driver");
        assert_eq!(driver.priority, 200);
        assert_eq!(driver.maps[0].perms().unwrap(), MapPerms::RW);
        assert_eq!(driver.maps[0].setvar_vaddr.as_deref(), Some("uart_base"));
        let vm = driver.virtual_machine.as_ref().unwrap();
        assert_eq!(vm.vcpus[0].cpu, Some(1));

        assert_eq!(document.channels[0].a.pd, "driver");
        assert_eq!(document.channels[0].b.pd, "client");
    }

    #[test]
    fn test_render_to_writes_the_document() {
        let sdf = sample_system();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("system.json");

        sdf.render_to(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, sdf.render().unwrap());
    }

    #[test]
    fn test_budget_and_period_defaults() {
        let mut sdf = SystemDescription::new(Arch::Aarch64, 0xa000_0000).unwrap();
        let pd = sdf.create_pd(ProtectionDomain::new("pd", "pd.elf"));
        sdf.pd_mut(pd).unwrap().set_budget(250);
        sdf.add_pd(pd).unwrap();

        let document = SystemDocument::build(&sdf).unwrap();
        assert_eq!(document.protection_domains[0].budget, 250);
        // Period defaults to the budget when unset.
        assert_eq!(document.protection_domains[0].period, 250);
    }
}
