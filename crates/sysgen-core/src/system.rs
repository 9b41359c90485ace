//! The graph assembler.
//!
//! A [`SystemDescription`] is the top-level container for one
//! system-description session. It owns every entity in generation-checked
//! arenas, enforces the global invariants (unique names, acyclic parent/child
//! relations, one VM per PD) and allocates local ids for relations that
//! consume them. [`SystemDescription::render`] serializes the current graph;
//! everything before that is bookkeeping.

use std::path::Path;

use crate::channel::{Channel, ChannelEnd, ChannelHandle, ChannelOptions};
use crate::error::{Result, SdfError};
use crate::irq::Irq;
use crate::memory::{MemoryRegion, MrHandle, PAGE_SIZE};
use crate::pd::{ChildPd, PdHandle, ProtectionDomain};
use crate::render::SystemDocument;
use crate::store::Arena;
use crate::vm::{VirtualMachine, VmHandle};
use crate::Arch;

/// Top-level container for one generated system.
pub struct SystemDescription {
    arch: Arch,
    paddr_top: u64,
    pds: Arena<ProtectionDomain>,
    mrs: Arena<MemoryRegion>,
    vms: Arena<VirtualMachine>,
    channels: Arena<Channel>,
    top_level: Vec<PdHandle>,
    registered_mrs: Vec<MrHandle>,
    registered_channels: Vec<ChannelHandle>,
    device_paddr_next: u64,
}

impl SystemDescription {
    /// Creates an empty system for `arch` with physical memory ending at
    /// `paddr_top` (exclusive). Physically-backed regions created by
    /// subsystems are allocated downward from there.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] if `paddr_top` is not
    /// page-aligned.
    pub fn new(arch: Arch, paddr_top: u64) -> Result<Self> {
        if paddr_top % PAGE_SIZE != 0 {
            return Err(SdfError::InvalidAddress(format!(
                "paddr_top {paddr_top:#x} is not page-aligned"
            )));
        }
        Ok(Self {
            arch,
            paddr_top,
            pds: Arena::new(),
            mrs: Arena::new(),
            vms: Arena::new(),
            channels: Arena::new(),
            top_level: Vec::new(),
            registered_mrs: Vec::new(),
            registered_channels: Vec::new(),
            device_paddr_next: paddr_top,
        })
    }

    /// Target architecture.
    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    /// Top of usable physical memory.
    #[must_use]
    pub const fn paddr_top(&self) -> u64 {
        self.paddr_top
    }

    // ------------------------------------------------------------------
    // Entity creation and destruction
    // ------------------------------------------------------------------

    /// Takes ownership of a PD and returns its handle.
    pub fn create_pd(&mut self, pd: ProtectionDomain) -> PdHandle {
        tracing::debug!(name = %pd.name(), "created PD");
        self.pds.insert(pd)
    }

    /// Destroys a PD.
    ///
    /// Channels, maps and child slots that still mention the PD are a caller
    /// error; their handles fail with [`SdfError::StaleHandle`] from here on
    /// rather than being cascade-deleted.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] if the PD was already destroyed.
    pub fn destroy_pd(&mut self, pd: PdHandle) -> Result<()> {
        let removed = self.pds.remove(pd)?;
        self.top_level.retain(|&h| h != pd);
        tracing::debug!(name = %removed.name(), "destroyed PD");
        Ok(())
    }

    /// Takes ownership of a memory region and returns its handle.
    pub fn create_mr(&mut self, mr: MemoryRegion) -> MrHandle {
        tracing::debug!(name = %mr.name(), size = mr.size(), "created MR");
        self.mrs.insert(mr)
    }

    /// Destroys a memory region, dropping its registration and every mapping
    /// of it held by a live PD or VM.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] if the region was already destroyed.
    pub fn destroy_mr(&mut self, mr: MrHandle) -> Result<()> {
        let removed = self.mrs.remove(mr)?;
        self.registered_mrs.retain(|&h| h != mr);
        for (_, pd) in self.pds.iter_mut() {
            pd.retain_maps(|map| map.mr() != mr);
        }
        for (_, vm) in self.vms.iter_mut() {
            vm.retain_maps(|map| map.mr() != mr);
        }
        tracing::debug!(name = %removed.name(), "destroyed MR");
        Ok(())
    }

    /// Takes ownership of a VM and returns its handle.
    pub fn create_vm(&mut self, vm: VirtualMachine) -> VmHandle {
        tracing::debug!(name = %vm.name(), vcpus = vm.vcpus().len(), "created VM");
        self.vms.insert(vm)
    }

    /// Destroys a VM. A PD still referencing it is a caller error.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] if the VM was already destroyed.
    pub fn destroy_vm(&mut self, vm: VmHandle) -> Result<()> {
        let removed = self.vms.remove(vm)?;
        tracing::debug!(name = %removed.name(), "destroyed VM");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entity access
    // ------------------------------------------------------------------

    /// Resolves a PD handle.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn pd(&self, pd: PdHandle) -> Result<&ProtectionDomain> {
        self.pds.get(pd)
    }

    /// Resolves a PD handle mutably, for entity-local setters.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn pd_mut(&mut self, pd: PdHandle) -> Result<&mut ProtectionDomain> {
        self.pds.get_mut(pd)
    }

    /// Resolves an MR handle.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn mr(&self, mr: MrHandle) -> Result<&MemoryRegion> {
        self.mrs.get(mr)
    }

    /// Resolves a VM handle.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn vm(&self, vm: VmHandle) -> Result<&VirtualMachine> {
        self.vms.get(vm)
    }

    /// Resolves a VM handle mutably.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn vm_mut(&mut self, vm: VmHandle) -> Result<&mut VirtualMachine> {
        self.vms.get_mut(vm)
    }

    /// Resolves a channel handle.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn channel(&self, ch: ChannelHandle) -> Result<&Channel> {
        self.channels.get(ch)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers a PD as a top-level element of the system.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::DuplicateName`] if a registered PD already uses
    /// the name, [`SdfError::AlreadyRegistered`] if this PD is already in
    /// the system, or [`SdfError::StaleHandle`].
    pub fn add_pd(&mut self, pd: PdHandle) -> Result<()> {
        let name = self.pds.get(pd)?.name().to_string();
        for existing in self.all_registered_pds() {
            if existing == pd {
                return Err(SdfError::AlreadyRegistered);
            }
            if self.pds.get(existing)?.name() == name {
                return Err(SdfError::DuplicateName(name));
            }
        }
        self.top_level.push(pd);
        tracing::debug!(name = %name, "registered PD");
        Ok(())
    }

    /// Registers a memory region.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::DuplicateName`], [`SdfError::AlreadyRegistered`]
    /// or [`SdfError::StaleHandle`].
    pub fn add_mr(&mut self, mr: MrHandle) -> Result<()> {
        let name = self.mrs.get(mr)?.name().to_string();
        for &existing in &self.registered_mrs {
            if existing == mr {
                return Err(SdfError::AlreadyRegistered);
            }
            if self.mrs.get(existing)?.name() == name {
                return Err(SdfError::DuplicateName(name));
            }
        }
        self.registered_mrs.push(mr);
        tracing::debug!(name = %name, "registered MR");
        Ok(())
    }

    /// Registers a channel. Both endpoint PDs must already be part of the
    /// system (top-level or as a child).
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::NotRegistered`], [`SdfError::AlreadyRegistered`]
    /// or [`SdfError::StaleHandle`].
    pub fn add_channel(&mut self, ch: ChannelHandle) -> Result<()> {
        let channel = *self.channels.get(ch)?;
        if self.registered_channels.contains(&ch) {
            return Err(SdfError::AlreadyRegistered);
        }
        for end in [channel.end_a(), channel.end_b()] {
            if !self.is_pd_registered(end.pd) {
                let name = self.pds.get(end.pd)?.name().to_string();
                return Err(SdfError::NotRegistered(name));
            }
        }
        self.registered_channels.push(ch);
        Ok(())
    }

    /// Top-level PDs in registration order.
    #[must_use]
    pub fn registered_pds(&self) -> &[PdHandle] {
        &self.top_level
    }

    /// Registered memory regions in registration order.
    #[must_use]
    pub fn registered_mrs(&self) -> &[MrHandle] {
        &self.registered_mrs
    }

    /// Registered channels in registration order.
    #[must_use]
    pub fn registered_channels(&self) -> &[ChannelHandle] {
        &self.registered_channels
    }

    /// Whether `pd` is part of the system, either top-level or as the child
    /// of a registered PD.
    #[must_use]
    pub fn is_pd_registered(&self, pd: PdHandle) -> bool {
        self.all_registered_pds().contains(&pd)
    }

    /// Every registered PD, preorder, top-level insertion order first.
    fn all_registered_pds(&self) -> Vec<PdHandle> {
        let mut out = Vec::new();
        let mut stack: Vec<PdHandle> = self.top_level.iter().rev().copied().collect();
        while let Some(pd) = stack.pop() {
            out.push(pd);
            if let Ok(entity) = self.pds.get(pd) {
                for child in entity.children().iter().rev() {
                    stack.push(child.pd);
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Registers `child` as a child PD of `parent`, allocating (or claiming)
    /// a slot in the parent's id space.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StructuralCycle`] if the relation would loop,
    /// [`SdfError::IdInUse`]/[`SdfError::IdExhausted`] on id trouble, or
    /// [`SdfError::StaleHandle`].
    pub fn pd_add_child(
        &mut self,
        parent: PdHandle,
        child: PdHandle,
        fixed_id: Option<u8>,
    ) -> Result<u8> {
        let child_name = self.pds.get(child)?.name().to_string();
        let parent_name = self.pds.get(parent)?.name().to_string();
        if parent == child {
            return Err(SdfError::StructuralCycle(format!(
                "'{parent_name}' cannot be its own child"
            )));
        }
        if self.is_descendant(child, parent) {
            return Err(SdfError::StructuralCycle(format!(
                "'{child_name}' is an ancestor of '{parent_name}'"
            )));
        }
        let parent_entity = self.pds.get_mut(parent)?;
        let id = parent_entity.allocate_local_id(fixed_id)?;
        parent_entity.push_child(ChildPd { id, pd: child });
        tracing::debug!(parent = %parent_name, child = %child_name, id, "added child PD");
        Ok(id)
    }

    /// Whether `target` is reachable from `root` through child edges.
    fn is_descendant(&self, root: PdHandle, target: PdHandle) -> bool {
        let mut stack = vec![root];
        while let Some(pd) = stack.pop() {
            if let Ok(entity) = self.pds.get(pd) {
                for child in entity.children() {
                    if child.pd == target {
                        return true;
                    }
                    stack.push(child.pd);
                }
            }
        }
        false
    }

    /// Attaches a VM to a PD. A PD hosts at most one VM and a VM is hosted
    /// by at most one PD.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StructuralCycle`] if either side is already
    /// attached, or [`SdfError::StaleHandle`].
    pub fn pd_attach_vm(&mut self, pd: PdHandle, vm: VmHandle) -> Result<()> {
        let vm_name = self.vms.get(vm)?.name().to_string();
        let pd_name = self.pds.get(pd)?.name().to_string();
        if self.pds.get(pd)?.vm().is_some() {
            return Err(SdfError::StructuralCycle(format!(
                "'{pd_name}' already hosts a virtual machine"
            )));
        }
        if self.pds.iter().any(|(_, entity)| entity.vm() == Some(vm)) {
            return Err(SdfError::StructuralCycle(format!(
                "virtual machine '{vm_name}' is already attached"
            )));
        }
        self.pds.get_mut(pd)?.set_vm(vm);
        tracing::debug!(pd = %pd_name, vm = %vm_name, "attached VM");
        Ok(())
    }

    /// The PD a VM is attached to, if any.
    #[must_use]
    pub fn vm_attached_to(&self, vm: VmHandle) -> Option<PdHandle> {
        self.pds
            .iter()
            .find(|(_, entity)| entity.vm() == Some(vm))
            .map(|(handle, _)| handle)
    }

    /// Binds a hardware interrupt into a PD, allocating (or claiming) its
    /// local id. Returns the id.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::IdInUse`]/[`SdfError::IdExhausted`] on id
    /// trouble, or [`SdfError::StaleHandle`].
    pub fn pd_bind_irq(&mut self, pd: PdHandle, mut irq: Irq) -> Result<u8> {
        let entity = self.pds.get_mut(pd)?;
        let id = entity.allocate_local_id(irq.id())?;
        irq.set_id(id);
        let number = irq.number();
        entity.push_irq(irq);
        tracing::debug!(irq = number, id, "bound IRQ");
        Ok(id)
    }

    /// Removes an interrupt binding by its local id, returning the id to the
    /// PD's pool. A no-op if no binding uses the id.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed or foreign handle.
    pub fn pd_unbind_irq(&mut self, pd: PdHandle, id: u8) -> Result<()> {
        if self.pds.get_mut(pd)?.remove_irq(id) {
            tracing::debug!(id, "unbound IRQ");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Creates a channel between two distinct, registered PDs, allocating a
    /// local id on each end (or claiming the fixed ids in `opts`).
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::IdenticalEndpoints`] if both ends name the same
    /// PD, [`SdfError::NotRegistered`] if an endpoint is not part of the
    /// system, [`SdfError::IdInUse`]/[`SdfError::IdExhausted`] on id
    /// trouble, or [`SdfError::StaleHandle`].
    pub fn channel_create(
        &mut self,
        pd_a: PdHandle,
        pd_b: PdHandle,
        opts: ChannelOptions,
    ) -> Result<ChannelHandle> {
        if pd_a == pd_b {
            return Err(SdfError::IdenticalEndpoints);
        }
        for pd in [pd_a, pd_b] {
            if !self.is_pd_registered(pd) {
                let name = self.pds.get(pd)?.name().to_string();
                return Err(SdfError::NotRegistered(name));
            }
        }
        let id_a = self.pds.get_mut(pd_a)?.allocate_local_id(opts.id_a)?;
        let id_b = match self.pds.get_mut(pd_b)?.allocate_local_id(opts.id_b) {
            Ok(id) => id,
            Err(err) => {
                // Undo the half-allocated end before reporting.
                if let Ok(entity) = self.pds.get_mut(pd_a) {
                    entity.release_local_id(id_a);
                }
                return Err(err);
            }
        };
        let channel = Channel::from_ends(
            ChannelEnd {
                pd: pd_a,
                id: id_a,
                notify: opts.notify_a,
                pp: opts.pp_a,
            },
            ChannelEnd {
                pd: pd_b,
                id: id_b,
                notify: opts.notify_b,
                pp: opts.pp_b,
            },
        );
        tracing::debug!(id_a, id_b, "created channel");
        Ok(self.channels.insert(channel))
    }

    /// The allocated end ids of a channel, `(end A, end B)`.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] for a destroyed channel.
    pub fn channel_end_ids(&self, ch: ChannelHandle) -> Result<(u8, u8)> {
        Ok(self.channels.get(ch)?.end_ids())
    }

    /// Destroys a channel, releasing both end ids back to their PDs' pools
    /// and dropping the registration if present.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] if the channel was already
    /// destroyed.
    pub fn channel_destroy(&mut self, ch: ChannelHandle) -> Result<()> {
        let channel = self.channels.remove(ch)?;
        self.registered_channels.retain(|&h| h != ch);
        for end in [channel.end_a(), channel.end_b()] {
            // A destroyed endpoint PD takes its id pool with it.
            if let Ok(pd) = self.pds.get_mut(end.pd) {
                pd.release_local_id(end.id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Physical allocation
    // ------------------------------------------------------------------

    /// Hands out a physical range for a DMA-capable region or guest RAM,
    /// growing downward from `paddr_top`.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::AddressExhausted`] when the space below
    /// `paddr_top` is used up.
    pub fn alloc_device_paddr(&mut self, size: u64) -> Result<u64> {
        let aligned = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        if aligned == 0 || aligned > self.device_paddr_next {
            return Err(SdfError::AddressExhausted(self.paddr_top));
        }
        self.device_paddr_next -= aligned;
        tracing::debug!(
            paddr = self.device_paddr_next,
            size = aligned,
            "allocated device memory"
        );
        Ok(self.device_paddr_next)
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Renders the system document. A pure read: two identical call
    /// sequences yield byte-identical output.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::StaleHandle`] if a registered entity references a
    /// destroyed one, or [`SdfError::Render`] on serialization failure.
    pub fn render(&self) -> Result<String> {
        SystemDocument::build(self)?.to_json()
    }

    /// Renders the system document and writes it to `path`.
    ///
    /// # Errors
    ///
    /// As [`SystemDescription::render`], plus [`SdfError::Io`] if the file
    /// cannot be written.
    pub fn render_to(&self, path: &Path) -> Result<()> {
        let document = self.render()?;
        std::fs::write(path, document)?;
        tracing::info!(path = %path.display(), "wrote system document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> SystemDescription {
        SystemDescription::new(Arch::Aarch64, 0xa000_0000).unwrap()
    }

    fn registered_pd(sdf: &mut SystemDescription, name: &str) -> PdHandle {
        let pd = sdf.create_pd(ProtectionDomain::new(name, format!("{name}.elf")));
        sdf.add_pd(pd).unwrap();
        pd
    }

    #[test]
    fn test_duplicate_pd_name_rejected() {
        let mut sdf = system();
        registered_pd(&mut sdf, "client");

        let dup = sdf.create_pd(ProtectionDomain::new("client", "other.elf"));
        let err = sdf.add_pd(dup).unwrap_err();
        assert!(matches!(err, SdfError::DuplicateName(name) if name == "client"));
        assert_eq!(sdf.registered_pds().len(), 1);
    }

    #[test]
    fn test_channel_requires_registered_endpoints() {
        let mut sdf = system();
        let a = registered_pd(&mut sdf, "a");
        let b = sdf.create_pd(ProtectionDomain::new("b", "b.elf"));

        let err = sdf.channel_create(a, b, ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, SdfError::NotRegistered(name) if name == "b"));

        let err = sdf.channel_create(a, a, ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, SdfError::IdenticalEndpoints));
    }

    #[test]
    fn test_channel_id_allocation_lowest_unused() {
        let mut sdf = system();
        let a = registered_pd(&mut sdf, "a");
        let b = registered_pd(&mut sdf, "b");
        let c = registered_pd(&mut sdf, "c");

        let ab = sdf.channel_create(a, b, ChannelOptions::default()).unwrap();
        let ac = sdf.channel_create(a, c, ChannelOptions::default()).unwrap();
        assert_eq!(sdf.channel_end_ids(ab).unwrap(), (0, 0));
        assert_eq!(sdf.channel_end_ids(ac).unwrap(), (1, 0));

        // Destroying the first channel frees (a:0, b:0); the next channel on
        // those PDs picks the released ids up again.
        sdf.channel_destroy(ab).unwrap();
        let ab2 = sdf.channel_create(a, b, ChannelOptions::default()).unwrap();
        assert_eq!(sdf.channel_end_ids(ab2).unwrap(), (0, 0));
    }

    #[test]
    fn test_channel_fixed_id_conflict() {
        let mut sdf = system();
        let a = registered_pd(&mut sdf, "a");
        let b = registered_pd(&mut sdf, "b");

        let opts = ChannelOptions {
            id_a: Some(7),
            ..ChannelOptions::default()
        };
        sdf.channel_create(a, b, opts).unwrap();
        let err = sdf.channel_create(a, b, opts).unwrap_err();
        assert!(matches!(err, SdfError::IdInUse(7)));
    }

    #[test]
    fn test_failed_channel_releases_first_end() {
        let mut sdf = system();
        let a = registered_pd(&mut sdf, "a");
        let b = registered_pd(&mut sdf, "b");

        let opts = ChannelOptions {
            id_b: Some(3),
            ..ChannelOptions::default()
        };
        sdf.channel_create(a, b, opts).unwrap();
        // Second claim of b:3 fails after a's end was provisionally taken.
        assert!(sdf.channel_create(a, b, opts).is_err());

        // a's id space must be untouched by the failure: 0 is taken by the
        // first channel, so the next allocation is 1.
        let ok = sdf.channel_create(a, b, ChannelOptions::default()).unwrap();
        assert_eq!(sdf.channel_end_ids(ok).unwrap(), (1, 0));
    }

    #[test]
    fn test_child_cycle_rejected() {
        let mut sdf = system();
        let parent = registered_pd(&mut sdf, "parent");
        let child = sdf.create_pd(ProtectionDomain::new("child", "child.elf"));
        let grandchild = sdf.create_pd(ProtectionDomain::new("grandchild", "gc.elf"));

        sdf.pd_add_child(parent, child, None).unwrap();
        sdf.pd_add_child(child, grandchild, None).unwrap();

        assert!(matches!(
            sdf.pd_add_child(grandchild, parent, None),
            Err(SdfError::StructuralCycle(_))
        ));
        assert!(matches!(
            sdf.pd_add_child(parent, parent, None),
            Err(SdfError::StructuralCycle(_))
        ));
    }

    #[test]
    fn test_child_ids_allocate_lowest_unused() {
        let mut sdf = system();
        let parent = registered_pd(&mut sdf, "parent");
        let a = sdf.create_pd(ProtectionDomain::new("a", "a.elf"));
        let b = sdf.create_pd(ProtectionDomain::new("b", "b.elf"));
        let c = sdf.create_pd(ProtectionDomain::new("c", "c.elf"));

        assert_eq!(sdf.pd_add_child(parent, a, None).unwrap(), 0);
        assert_eq!(sdf.pd_add_child(parent, b, Some(2)).unwrap(), 2);
        assert_eq!(sdf.pd_add_child(parent, c, None).unwrap(), 1);
    }

    #[test]
    fn test_child_is_registered_through_parent() {
        let mut sdf = system();
        let parent = registered_pd(&mut sdf, "parent");
        let child = sdf.create_pd(ProtectionDomain::new("child", "child.elf"));
        sdf.pd_add_child(parent, child, None).unwrap();

        assert!(sdf.is_pd_registered(child));
        // A channel to a child PD is legal.
        assert!(sdf
            .channel_create(parent, child, ChannelOptions::default())
            .is_ok());
    }

    #[test]
    fn test_vm_attach_exclusive() {
        let mut sdf = system();
        let host = registered_pd(&mut sdf, "vmm");
        let other = registered_pd(&mut sdf, "other");
        let vm = sdf
            .create_vm(VirtualMachine::new("guest", vec![crate::vm::Vcpu::new(0)]).unwrap());

        sdf.pd_attach_vm(host, vm).unwrap();
        assert!(matches!(
            sdf.pd_attach_vm(host, vm),
            Err(SdfError::StructuralCycle(_))
        ));
        assert!(matches!(
            sdf.pd_attach_vm(other, vm),
            Err(SdfError::StructuralCycle(_))
        ));
    }

    #[test]
    fn test_stale_handle_after_destroy() {
        let mut sdf = system();
        let pd = registered_pd(&mut sdf, "gone");
        sdf.destroy_pd(pd).unwrap();

        assert!(matches!(sdf.pd(pd), Err(SdfError::StaleHandle(_))));
        assert!(matches!(sdf.add_pd(pd), Err(SdfError::StaleHandle(_))));
        assert_eq!(sdf.registered_pds().len(), 0);
    }

    #[test]
    fn test_destroy_mr_purges_maps() {
        let mut sdf = system();
        let pd = registered_pd(&mut sdf, "pd");
        let mr = sdf.create_mr(MemoryRegion::new("buf", PAGE_SIZE).unwrap());
        sdf.add_mr(mr).unwrap();

        let map = crate::memory::Map::new(mr, 0x200_0000, crate::memory::MapPerms::RW, true)
            .unwrap();
        sdf.pd_mut(pd).unwrap().add_map(map);

        sdf.destroy_mr(mr).unwrap();
        assert!(sdf.pd(pd).unwrap().maps().is_empty());
        assert!(sdf.registered_mrs().is_empty());
    }

    #[test]
    fn test_device_paddr_grows_downward() {
        let mut sdf = system();
        let first = sdf.alloc_device_paddr(PAGE_SIZE * 2).unwrap();
        let second = sdf.alloc_device_paddr(PAGE_SIZE).unwrap();

        assert_eq!(first, 0xa000_0000 - PAGE_SIZE * 2);
        assert_eq!(second, first - PAGE_SIZE);
    }
}
