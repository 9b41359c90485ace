//! Virtual machine monitor composite.
//!
//! Binds a VMM-hosting PD to a guest VM: connect attaches the VM, places
//! guest RAM, identity-maps recorded passthrough devices into the guest and
//! binds their interrupts into the monitor PD. No PD↔PD channel is created;
//! a channel needs two distinct protection domains and the guest is not one.

use std::path::Path;

use sysgen_core::{
    ChannelHandle, DtNode, Irq, MapPerms, MrHandle, PdHandle, SdfError, SystemDescription,
    VmHandle, PAGE_SIZE,
};

use crate::config::{blob_name, BlobWriter};
use crate::error::{Result, SddfError};
use crate::wiring::{self, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const MAGIC: [u8; 4] = *b"SVMM";

/// Guest-physical base of relocated (non one-to-one) guest RAM.
const GUEST_RAM_VADDR: u64 = 0x4000_0000;

#[derive(Debug, Clone)]
struct Passthrough {
    name: String,
    node: DtNode,
    irq_ids: Vec<u8>,
}

/// Builder for one virtual machine monitor instance.
pub struct Vmm {
    config: SddfConfig,
    vmm_pd: PdHandle,
    vm: VmHandle,
    ram_size: u64,
    one_to_one_ram: bool,
    passthrough: Vec<Passthrough>,
    state: Lifecycle,
    ram_vaddr: Option<u64>,
    guest_ram: Option<MrHandle>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl Vmm {
    /// Binds a monitor PD to the guest VM it will host. `ram_size` is the
    /// guest RAM to place; with `one_to_one_ram` the guest sees RAM at its
    /// host physical address.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale or `ram_size` is zero or not
    /// page-aligned.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        vmm_pd: PdHandle,
        vm: VmHandle,
        ram_size: u64,
        one_to_one_ram: bool,
    ) -> Result<Self> {
        sdf.pd(vmm_pd)?;
        sdf.vm(vm)?;
        if ram_size == 0 || ram_size % PAGE_SIZE != 0 {
            return Err(SddfError::Core(SdfError::InvalidAddress(format!(
                "guest RAM size {ram_size:#x} is not a positive page multiple"
            ))));
        }
        Ok(Self {
            config: config.clone(),
            vmm_pd,
            vm,
            ram_size,
            one_to_one_ram,
            passthrough: Vec::new(),
            state: Lifecycle::Created,
            ram_vaddr: None,
            guest_ram: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Records a hardware device to pass through to the guest.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` after connect or `DuplicateDevice` if the
    /// name was already added.
    pub fn add_passthrough_device(&mut self, name: &str, node: &DtNode) -> Result<()> {
        ensure_state(
            "add_passthrough_device",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        if self.passthrough.iter().any(|device| device.name == name) {
            return Err(SddfError::DuplicateDevice(name.to_string()));
        }
        tracing::debug!(device = name, "passthrough device added");
        self.passthrough.push(Passthrough {
            name: name.to_string(),
            node: node.clone(),
            irq_ids: Vec::new(),
        });
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Attaches the VM to the monitor PD, places guest RAM and wires every
    /// recorded passthrough device. Region and channel creation is atomic
    /// on failure; the VM attach happens last, after wiring succeeded.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` out of lifecycle order, `NotRegistered`,
    /// `StructuralCycle` if either side is already attached, or any
    /// allocation error.
    pub fn connect(&mut self, sdf: &mut SystemDescription) -> Result<()> {
        ensure_state(
            "connect",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        check_participants(sdf, &[self.vmm_pd])?;
        let vm_name = sdf.vm(self.vm)?.name().to_string();
        let pd_name = sdf.pd(self.vmm_pd)?.name().to_string();
        if sdf.pd(self.vmm_pd)?.vm().is_some() {
            return Err(SddfError::Core(SdfError::StructuralCycle(format!(
                "'{pd_name}' already hosts a virtual machine"
            ))));
        }
        if sdf.vm_attached_to(self.vm).is_some() {
            return Err(SddfError::Core(SdfError::StructuralCycle(format!(
                "virtual machine '{vm_name}' is already attached"
            ))));
        }

        let vmm_pd = self.vmm_pd;
        let vm = self.vm;
        let ram_size = self.ram_size;
        let one_to_one = self.one_to_one_ram;
        let passthrough = self.passthrough.clone();
        let ((ram_vaddr, guest_ram, irq_ids), channels, mrs) = wiring::connect(sdf, |w| {
            let ram_name = format!("{vm_name}_guest_ram");
            let (ram, ram_vaddr) = if one_to_one {
                let ram = w.dma_region(ram_name, ram_size)?;
                let paddr = w
                    .sdf()
                    .mr(ram)?
                    .paddr()
                    .ok_or_else(|| SdfError::InvalidAddress("guest RAM lost its placement".into()))?;
                (ram, paddr)
            } else {
                (w.shared_region(ram_name, ram_size)?, GUEST_RAM_VADDR)
            };
            w.map_into_vm(
                vm,
                ram,
                ram_vaddr,
                MapPerms::READ | MapPerms::WRITE | MapPerms::EXECUTE,
                true,
            )?;
            // The monitor needs the guest's memory in its own space too.
            w.map_into_pd(vmm_pd, ram, MapPerms::RW, true)?;

            let mut irq_ids = Vec::new();
            for device in &passthrough {
                for (index, region) in device.node.regions().iter().enumerate() {
                    let name = if device.node.regions().len() == 1 {
                        format!("{vm_name}_{}", device.name)
                    } else {
                        format!("{vm_name}_{}_{index}", device.name)
                    };
                    let mr = w.device_region(name, region.size, region.paddr)?;
                    // Passthrough hardware keeps its physical address in the
                    // guest's view.
                    w.map_into_vm(vm, mr, region.paddr, MapPerms::RW, false)?;
                }
                let mut ids = Vec::new();
                for irq in device.node.irqs() {
                    ids.push(w.bind_irq(vmm_pd, Irq::new(irq.number, irq.trigger))?);
                }
                irq_ids.push(ids);
            }
            Ok((ram_vaddr, ram, irq_ids))
        })?;

        sdf.pd_attach_vm(self.vmm_pd, self.vm)?;

        for (device, ids) in self.passthrough.iter_mut().zip(irq_ids) {
            device.irq_ids = ids;
        }
        self.ram_vaddr = Some(ram_vaddr);
        self.guest_ram = Some(guest_ram);
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(
            sddf = %self.config.root().display(),
            vm = %vm_name,
            passthrough = self.passthrough.len(),
            "vmm connected"
        );
        Ok(())
    }

    /// Emits the monitor PD's configuration blob into `output_dir`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` before connect or an IO error if the
    /// directory is not writable.
    pub fn serialise_config(&mut self, sdf: &SystemDescription, output_dir: &Path) -> Result<()> {
        ensure_state(
            "serialise_config",
            self.state,
            &[Lifecycle::Connected, Lifecycle::Serialized],
        )?;
        let pd_name = sdf.pd(self.vmm_pd)?.name().to_string();
        let vcpus = sdf.vm(self.vm)?.vcpus().len();

        let mut blob = BlobWriter::new(MAGIC);
        blob.u64(self.ram_vaddr.unwrap_or_default());
        blob.u64(self.ram_size);
        blob.flag(self.one_to_one_ram);
        blob.u8(vcpus as u8);
        blob.u32(self.passthrough.len() as u32);
        for device in &self.passthrough {
            blob.u8(device.irq_ids.len() as u8);
            for &id in &device.irq_ids {
                blob.u8(id);
            }
        }
        blob.write_to(output_dir, &blob_name("vmm", &pd_name))?;

        self.state = Lifecycle::Serialized;
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> Lifecycle {
        self.state
    }

    /// Guest-physical address of guest RAM, once connected.
    #[must_use]
    pub const fn ram_vaddr(&self) -> Option<u64> {
        self.ram_vaddr
    }

    /// Number of recorded passthrough devices.
    #[must_use]
    pub fn passthrough_count(&self) -> usize {
        self.passthrough.len()
    }

    /// The guest RAM region, once connected.
    #[must_use]
    pub const fn guest_ram(&self) -> Option<MrHandle> {
        self.guest_ram
    }

    /// Channels created by connect (none for the monitor wiring itself).
    #[must_use]
    pub fn channels(&self) -> &[ChannelHandle] {
        &self.channels
    }

    /// Memory regions created by connect, in wiring order.
    #[must_use]
    pub fn regions(&self) -> &[MrHandle] {
        &self.mrs
    }
}
