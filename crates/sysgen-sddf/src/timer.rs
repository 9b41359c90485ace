//! Timer subsystem: one driver serving clients directly.
//!
//! The timer is the one device class without a virtualizer; every client
//! gets a single call channel straight to the driver.

use std::path::Path;

use sysgen_core::{ChannelHandle, ChannelOptions, DtNode, MrHandle, PdHandle, SystemDescription};

use crate::config::{blob_name, BlobWriter};
use crate::error::Result;
use crate::wiring::{self, check_new_client, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const MAGIC: [u8; 4] = *b"STMR";

#[derive(Debug)]
struct TimerClient {
    pd: PdHandle,
    name: String,
    client_id: Option<u8>,
    driver_id: Option<u8>,
}

/// Builder for one timer subsystem instance.
pub struct Timer {
    config: SddfConfig,
    device: Option<DtNode>,
    driver: PdHandle,
    clients: Vec<TimerClient>,
    state: Lifecycle,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl Timer {
    /// Binds a timer subsystem to its driver PD and optional device node.
    ///
    /// # Errors
    ///
    /// Fails if the driver handle is stale.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        device: Option<DtNode>,
        driver: PdHandle,
    ) -> Result<Self> {
        sdf.pd(driver)?;
        Ok(Self {
            config: config.clone(),
            device,
            driver,
            clients: Vec::new(),
            state: Lifecycle::Created,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Adds a client PD.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` after connect, `InvalidClient` if the PD is
    /// the driver, or `DuplicateClient` if it was already added. The client
    /// list is unchanged on failure.
    pub fn add_client(&mut self, sdf: &SystemDescription, client: PdHandle) -> Result<()> {
        ensure_state(
            "add_client",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        let existing: Vec<PdHandle> = self.clients.iter().map(|c| c.pd).collect();
        let name = check_new_client(sdf, client, &[self.driver], &existing)?;
        tracing::debug!(client = %name, "timer client added");
        self.clients.push(TimerClient {
            pd: client,
            name,
            client_id: None,
            driver_id: None,
        });
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Wires the subsystem: binds the device to the driver and creates one
    /// call channel per client. Atomic on failure.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` out of lifecycle order, `NotRegistered` if
    /// a participant is not part of the system, or any id/allocation error.
    pub fn connect(&mut self, sdf: &mut SystemDescription) -> Result<()> {
        ensure_state(
            "connect",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        let mut participants = vec![self.driver];
        participants.extend(self.clients.iter().map(|c| c.pd));
        check_participants(sdf, &participants)?;

        let device = self.device.clone();
        let driver = self.driver;
        let client_pds: Vec<PdHandle> = self.clients.iter().map(|c| c.pd).collect();
        let (ids, channels, mrs) = wiring::connect(sdf, |w| {
            if let Some(node) = &device {
                w.bind_device(driver, node)?;
            }
            let mut ids = Vec::new();
            for &client in &client_pds {
                let ch = w.channel(client, driver, ChannelOptions::calling())?;
                ids.push((ch.id_a, ch.id_b));
            }
            Ok(ids)
        })?;

        for (client, (client_id, driver_id)) in self.clients.iter_mut().zip(ids) {
            client.client_id = Some(client_id);
            client.driver_id = Some(driver_id);
        }
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(
            sddf = %self.config.root().display(),
            clients = self.clients.len(),
            "timer subsystem connected"
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

        let mut driver_blob = BlobWriter::new(MAGIC);
        driver_blob.u8(self.clients.len() as u8);
        for client in &self.clients {
            driver_blob.u8(client.driver_id.unwrap_or_default());
        }
        driver_blob.write_to(output_dir, &blob_name("timer", &driver_name))?;

        for client in &self.clients {
            let mut blob = BlobWriter::new(MAGIC);
            blob.u8(client.client_id.unwrap_or_default());
            blob.write_to(output_dir, &blob_name("timer", &client.name))?;
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
