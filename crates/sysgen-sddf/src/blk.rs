//! Block subsystem: driver behind a single virtualizer.
//!
//! Each client names the partition it talks to. Partition indices are not
//! unique across clients; sharing a partition is legal and mediated by the
//! virtualizer.

use std::path::Path;

use sysgen_core::{
    ChannelHandle, ChannelOptions, DtNode, MapPerms, MrHandle, PdHandle, SystemDescription,
};

use crate::config::{blob_name, BlobWriter};
use crate::error::{Result, SddfError};
use crate::wiring::{self, check_new_client, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const MAGIC: [u8; 4] = *b"SBLK";

const QUEUE_SIZE: u64 = 0x1000;

/// DMA data region per client.
const DATA_SIZE: u64 = 0x1_0000;

/// Storage-info page published by the virtualizer to each client.
const STORAGE_INFO_SIZE: u64 = 0x1000;

#[derive(Debug)]
struct BlkClient {
    pd: PdHandle,
    name: String,
    partition: u32,
    client_id: Option<u8>,
    virt_id: Option<u8>,
}

/// Builder for one block subsystem instance.
pub struct Blk {
    config: SddfConfig,
    device: Option<DtNode>,
    driver: PdHandle,
    virt: PdHandle,
    clients: Vec<BlkClient>,
    state: Lifecycle,
    driver_virt: Option<(u8, u8)>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl Blk {
    /// Binds a block subsystem to its driver and virtualizer PDs.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale or driver and virtualizer are the same PD.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        device: Option<DtNode>,
        driver: PdHandle,
        virt: PdHandle,
    ) -> Result<Self> {
        sdf.pd(driver)?;
        let virt_name = sdf.pd(virt)?.name().to_string();
        if driver == virt {
            return Err(SddfError::InvalidClient(virt_name));
        }
        Ok(Self {
            config: config.clone(),
            device,
            driver,
            virt,
            clients: Vec::new(),
            state: Lifecycle::Created,
            driver_virt: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Adds a client PD reading and writing `partition`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` after connect, `InvalidClient` if the PD is
    /// the driver or virtualizer, or `DuplicateClient` if the PD was already
    /// added. The client list is unchanged on failure.
    pub fn add_client(
        &mut self,
        sdf: &SystemDescription,
        client: PdHandle,
        partition: u32,
    ) -> Result<()> {
        ensure_state(
            "add_client",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        let existing: Vec<PdHandle> = self.clients.iter().map(|c| c.pd).collect();
        let name = check_new_client(sdf, client, &[self.driver, self.virt], &existing)?;
        tracing::debug!(client = %name, partition, "blk client added");
        self.clients.push(BlkClient {
            pd: client,
            name,
            partition,
            client_id: None,
            virt_id: None,
        });
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Wires the subsystem: device binding, driver↔virtualizer channel and
    /// queues, and per client a channel, request/response queues, a DMA data
    /// region and a read-only storage-info page. Atomic on failure.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` out of lifecycle order, `NotRegistered`,
    /// or any id/allocation error.
    pub fn connect(&mut self, sdf: &mut SystemDescription) -> Result<()> {
        ensure_state(
            "connect",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        let mut participants = vec![self.driver, self.virt];
        participants.extend(self.clients.iter().map(|c| c.pd));
        check_participants(sdf, &participants)?;

        let device = self.device.clone();
        let driver = self.driver;
        let virt = self.virt;
        let client_info: Vec<(PdHandle, String)> = self
            .clients
            .iter()
            .map(|c| (c.pd, c.name.clone()))
            .collect();
        let ((driver_virt, ids), channels, mrs) = wiring::connect(sdf, |w| {
            if let Some(node) = &device {
                w.bind_device(driver, node)?;
            }
            let trunk = w.channel(virt, driver, ChannelOptions::default())?;
            for queue in ["req", "resp"] {
                let mr = w.shared_region(format!("blk_driver_{queue}"), QUEUE_SIZE)?;
                w.map_into_pd(driver, mr, MapPerms::RW, true)?;
                w.map_into_pd(virt, mr, MapPerms::RW, true)?;
            }

            let mut ids = Vec::new();
            for (client, name) in &client_info {
                let ch = w.channel(*client, virt, ChannelOptions::calling())?;
                for queue in ["req", "resp"] {
                    let mr = w.shared_region(format!("blk_{queue}_{name}"), QUEUE_SIZE)?;
                    w.map_into_pd(*client, mr, MapPerms::RW, true)?;
                    w.map_into_pd(virt, mr, MapPerms::RW, true)?;
                }
                let data = w.dma_region(format!("blk_data_{name}"), DATA_SIZE)?;
                w.map_into_pd(*client, data, MapPerms::RW, true)?;
                w.map_into_pd(virt, data, MapPerms::RW, true)?;
                let info = w.shared_region(format!("blk_storage_info_{name}"), STORAGE_INFO_SIZE)?;
                w.map_into_pd(*client, info, MapPerms::READ, true)?;
                w.map_into_pd(virt, info, MapPerms::RW, true)?;
                ids.push((ch.id_a, ch.id_b));
            }
            Ok(((trunk.id_b, trunk.id_a), ids))
        })?;

        for (client, (client_id, virt_id)) in self.clients.iter_mut().zip(ids) {
            client.client_id = Some(client_id);
            client.virt_id = Some(virt_id);
        }
        self.driver_virt = Some(driver_virt);
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(
            sddf = %self.config.root().display(),
            clients = self.clients.len(),
            "blk subsystem connected"
        );
        Ok(())
    }

    /// Emits one configuration blob per participating PD into `output_dir`.
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
        let driver_name = sdf.pd(self.driver)?.name().to_string();
        let virt_name = sdf.pd(self.virt)?.name().to_string();
        let (driver_id, virt_driver_id) = self.driver_virt.unwrap_or_default();

        let mut driver_blob = BlobWriter::new(MAGIC);
        driver_blob.u8(driver_id);
        driver_blob.write_to(output_dir, &blob_name("blk", &driver_name))?;

        let mut virt_blob = BlobWriter::new(MAGIC);
        virt_blob.u8(virt_driver_id);
        virt_blob.u8(self.clients.len() as u8);
        for client in &self.clients {
            virt_blob.u8(client.virt_id.unwrap_or_default());
            virt_blob.u32(client.partition);
        }
        virt_blob.write_to(output_dir, &blob_name("blk", &virt_name))?;

        for client in &self.clients {
            let mut blob = BlobWriter::new(MAGIC);
            blob.u8(client.client_id.unwrap_or_default());
            blob.u32(client.partition);
            blob.write_to(output_dir, &blob_name("blk", &client.name))?;
        }
        self.state = Lifecycle::Serialized;
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> Lifecycle {
        self.state
    }

    /// Number of clients added so far.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Channels created by connect, in wiring order.
    #[must_use]
    pub fn channels(&self) -> &[ChannelHandle] {
        &self.channels
    }

    /// Shared memory regions created by connect, in wiring order.
    #[must_use]
    pub fn regions(&self) -> &[MrHandle] {
        &self.mrs
    }
}
