//! Shared connect plumbing.
//!
//! Every subsystem's `connect` runs inside a [`Wiring`] transaction: channels
//! and memory regions created through it are recorded, and if wiring fails
//! partway they are destroyed again (destroying an MR also purges its
//! mappings), so a failed connect leaves the system graph unchanged.

use sysgen_core::{
    ChannelHandle, ChannelOptions, DtNode, Irq, Map, MapPerms, MemoryRegion, MrHandle, PdHandle,
    SystemDescription, VmHandle,
};

use crate::error::{Result, SddfError};
use crate::Lifecycle;

/// Rejects `op` unless the builder is in one of `allowed`.
pub(crate) fn ensure_state(
    op: &'static str,
    state: Lifecycle,
    allowed: &[Lifecycle],
) -> Result<()> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(SddfError::InvalidState { op, state })
    }
}

/// Validates a prospective client PD and returns its name.
///
/// `reserved` holds the PDs with fixed roles (driver, virtualizers, copiers);
/// `existing` holds the already-added clients.
pub(crate) fn check_new_client(
    sdf: &SystemDescription,
    client: PdHandle,
    reserved: &[PdHandle],
    existing: &[PdHandle],
) -> Result<String> {
    let name = sdf.pd(client)?.name().to_string();
    if reserved.contains(&client) {
        return Err(SddfError::InvalidClient(name));
    }
    if existing.contains(&client) {
        return Err(SddfError::DuplicateClient(name));
    }
    Ok(name)
}

/// Fails with `NotRegistered` unless every PD is alive and part of the
/// system. Run before any wiring so the common failure modes cannot leave
/// partial state behind.
pub(crate) fn check_participants(sdf: &SystemDescription, pds: &[PdHandle]) -> Result<()> {
    for &pd in pds {
        let name = sdf.pd(pd)?.name().to_string();
        if !sdf.is_pd_registered(pd) {
            return Err(SddfError::Core(sysgen_core::SdfError::NotRegistered(name)));
        }
    }
    Ok(())
}

/// The allocated end ids of a channel created during wiring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WiredChannel {
    pub id_a: u8,
    pub id_b: u8,
}

/// Transactional view of the system graph during one connect.
pub(crate) struct Wiring<'a> {
    sdf: &'a mut SystemDescription,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
    irqs: Vec<(PdHandle, u8)>,
}

impl<'a> Wiring<'a> {
    pub fn new(sdf: &'a mut SystemDescription) -> Self {
        Self {
            sdf,
            channels: Vec::new(),
            mrs: Vec::new(),
            irqs: Vec::new(),
        }
    }

    pub fn sdf(&mut self) -> &mut SystemDescription {
        self.sdf
    }

    /// Creates and registers a channel, recording it for rollback.
    pub fn channel(
        &mut self,
        pd_a: PdHandle,
        pd_b: PdHandle,
        opts: ChannelOptions,
    ) -> Result<WiredChannel> {
        let handle = self.sdf.channel_create(pd_a, pd_b, opts)?;
        if let Err(err) = self.sdf.add_channel(handle) {
            // Registration failed after id allocation; undo immediately so
            // the channel is not left dangling outside the transaction.
            let _ = self.sdf.channel_destroy(handle);
            return Err(err.into());
        }
        self.channels.push(handle);
        let (id_a, id_b) = self.sdf.channel_end_ids(handle)?;
        Ok(WiredChannel { id_a, id_b })
    }

    /// Creates and registers a floating shared-memory region.
    pub fn shared_region(&mut self, name: impl Into<String>, size: u64) -> Result<MrHandle> {
        let mr = self.sdf.create_mr(MemoryRegion::new(name, size)?);
        self.register_mr(mr)?;
        Ok(mr)
    }

    /// Creates and registers a DMA-capable region backed by physical memory
    /// drawn from the system's downward allocator.
    pub fn dma_region(&mut self, name: impl Into<String>, size: u64) -> Result<MrHandle> {
        let paddr = self.sdf.alloc_device_paddr(size)?;
        let mr = self
            .sdf
            .create_mr(MemoryRegion::new_physical(name, size, paddr)?);
        self.register_mr(mr)?;
        Ok(mr)
    }

    /// Creates and registers a region pinned at a device's physical address.
    pub fn device_region(
        &mut self,
        name: impl Into<String>,
        size: u64,
        paddr: u64,
    ) -> Result<MrHandle> {
        let mr = self
            .sdf
            .create_mr(MemoryRegion::new_physical(name, size, paddr)?);
        self.register_mr(mr)?;
        Ok(mr)
    }

    fn register_mr(&mut self, mr: MrHandle) -> Result<()> {
        if let Err(err) = self.sdf.add_mr(mr) {
            let _ = self.sdf.destroy_mr(mr);
            return Err(err.into());
        }
        self.mrs.push(mr);
        Ok(())
    }

    /// Maps a region into a PD at the PD's next free generated address.
    pub fn map_into_pd(
        &mut self,
        pd: PdHandle,
        mr: MrHandle,
        perms: MapPerms,
        cached: bool,
    ) -> Result<u64> {
        let size = self.sdf.mr(mr)?.size();
        let entity = self.sdf.pd_mut(pd)?;
        let vaddr = entity.alloc_vaddr(size);
        entity.add_map(Map::new(mr, vaddr, perms, cached)?);
        Ok(vaddr)
    }

    /// Maps a region into a VM's guest address space at a fixed address.
    pub fn map_into_vm(
        &mut self,
        vm: VmHandle,
        mr: MrHandle,
        vaddr: u64,
        perms: MapPerms,
        cached: bool,
    ) -> Result<()> {
        let map = Map::new(mr, vaddr, perms, cached)?;
        self.sdf.vm_mut(vm)?.add_map(map);
        Ok(())
    }

    /// Binds an interrupt into a PD, recording it for rollback.
    pub fn bind_irq(&mut self, pd: PdHandle, irq: Irq) -> Result<u8> {
        let id = self.sdf.pd_bind_irq(pd, irq)?;
        self.irqs.push((pd, id));
        Ok(id)
    }

    /// Binds a hardware device to its driver PD: one pinned region per
    /// register range, mapped uncached, plus every interrupt line.
    pub fn bind_device(&mut self, driver: PdHandle, node: &DtNode) -> Result<()> {
        for (index, region) in node.regions().iter().enumerate() {
            let name = if node.regions().len() == 1 {
                format!("{}_regs", node.name())
            } else {
                format!("{}_regs_{index}", node.name())
            };
            let mr = self.device_region(name, region.size, region.paddr)?;
            self.map_into_pd(driver, mr, MapPerms::RW, false)?;
        }
        for irq in node.irqs() {
            self.bind_irq(driver, Irq::new(irq.number, irq.trigger))?;
        }
        tracing::debug!(device = %node.name(), "bound device to driver");
        Ok(())
    }

    /// Keeps everything created so far and returns it.
    pub fn commit(self) -> (Vec<ChannelHandle>, Vec<MrHandle>) {
        (self.channels, self.mrs)
    }

    /// Destroys everything created so far, newest first.
    pub fn rollback(self) {
        for &ch in self.channels.iter().rev() {
            let _ = self.sdf.channel_destroy(ch);
        }
        for &mr in self.mrs.iter().rev() {
            let _ = self.sdf.destroy_mr(mr);
        }
        for &(pd, id) in self.irqs.iter().rev() {
            let _ = self.sdf.pd_unbind_irq(pd, id);
        }
    }
}

/// Runs `wire` transactionally: on error every channel and region it created
/// is destroyed before the error is returned.
pub(crate) fn connect<T>(
    sdf: &mut SystemDescription,
    wire: impl FnOnce(&mut Wiring<'_>) -> Result<T>,
) -> Result<(T, Vec<ChannelHandle>, Vec<MrHandle>)> {
    let mut wiring = Wiring::new(sdf);
    match wire(&mut wiring) {
        Ok(value) => {
            let (channels, mrs) = wiring.commit();
            Ok((value, channels, mrs))
        }
        Err(err) => {
            wiring.rollback();
            Err(err)
        }
    }
}
