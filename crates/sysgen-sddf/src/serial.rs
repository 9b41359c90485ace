//! Serial subsystem: driver behind separate TX and RX virtualizers.
//!
//! The RX side is optional; a transmit-only console omits it and clients get
//! only the TX path.

use std::path::Path;

use sysgen_core::{
    ChannelHandle, ChannelOptions, DtNode, MapPerms, MrHandle, PdHandle, SystemDescription,
};

use crate::config::{blob_name, BlobWriter};
use crate::error::{Result, SddfError};
use crate::wiring::{self, check_new_client, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const MAGIC: [u8; 4] = *b"SSER";

const QUEUE_SIZE: u64 = 0x1000;
const DATA_SIZE: u64 = 0x2000;

#[derive(Debug)]
struct SerialClient {
    pd: PdHandle,
    name: String,
    tx: Option<(u8, u8)>,
    rx: Option<(u8, u8)>,
}

/// Builder for one serial subsystem instance.
pub struct Serial {
    config: SddfConfig,
    device: Option<DtNode>,
    driver: PdHandle,
    virt_tx: PdHandle,
    virt_rx: Option<PdHandle>,
    enable_color: bool,
    clients: Vec<SerialClient>,
    state: Lifecycle,
    driver_tx: Option<(u8, u8)>,
    driver_rx: Option<(u8, u8)>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl Serial {
    /// Binds a serial subsystem to its driver and virtualizer PDs.
    /// `enable_color` turns on per-client output coloring in the TX
    /// virtualizer.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale or two of the bound PDs coincide.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        device: Option<DtNode>,
        driver: PdHandle,
        virt_tx: PdHandle,
        virt_rx: Option<PdHandle>,
        enable_color: bool,
    ) -> Result<Self> {
        sdf.pd(driver)?;
        let tx_name = sdf.pd(virt_tx)?.name().to_string();
        if driver == virt_tx {
            return Err(SddfError::InvalidClient(tx_name));
        }
        if let Some(rx) = virt_rx {
            let rx_name = sdf.pd(rx)?.name().to_string();
            if rx == driver || rx == virt_tx {
                return Err(SddfError::InvalidClient(rx_name));
            }
        }
        Ok(Self {
            config: config.clone(),
            device,
            driver,
            virt_tx,
            virt_rx,
            enable_color,
            clients: Vec::new(),
            state: Lifecycle::Created,
            driver_tx: None,
            driver_rx: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Adds a client PD.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` after connect, `InvalidClient` if the PD
    /// has a fixed role in this subsystem, or `DuplicateClient`. The client
    /// list is unchanged on failure.
    pub fn add_client(&mut self, sdf: &SystemDescription, client: PdHandle) -> Result<()> {
        ensure_state(
            "add_client",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        let mut reserved = vec![self.driver, self.virt_tx];
        reserved.extend(self.virt_rx);
        let existing: Vec<PdHandle> = self.clients.iter().map(|c| c.pd).collect();
        let name = check_new_client(sdf, client, &reserved, &existing)?;
        tracing::debug!(client = %name, "serial client added");
        self.clients.push(SerialClient {
            pd: client,
            name,
            tx: None,
            rx: None,
        });
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Wires the subsystem: device binding, driver↔virtualizer channels and
    /// queues for each direction, and per client a channel plus queue/data
    /// regions through every present virtualizer. Atomic on failure.
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
        let mut participants = vec![self.driver, self.virt_tx];
        participants.extend(self.virt_rx);
        participants.extend(self.clients.iter().map(|c| c.pd));
        check_participants(sdf, &participants)?;

        let device = self.device.clone();
        let driver = self.driver;
        let virt_tx = self.virt_tx;
        let virt_rx = self.virt_rx;
        let client_info: Vec<(PdHandle, String)> = self
            .clients
            .iter()
            .map(|c| (c.pd, c.name.clone()))
            .collect();
        let ((driver_tx, driver_rx, ids), channels, mrs) = wiring::connect(sdf, |w| {
            if let Some(node) = &device {
                w.bind_device(driver, node)?;
            }

            let wire_leg = |w: &mut wiring::Wiring<'_>,
                            a: PdHandle,
                            virt: PdHandle,
                            prefix: &str,
                            name: &str|
             -> Result<(u8, u8)> {
                let ch = w.channel(a, virt, ChannelOptions::default())?;
                let queue = w.shared_region(format!("serial_{prefix}_queue_{name}"), QUEUE_SIZE)?;
                let data = w.shared_region(format!("serial_{prefix}_data_{name}"), DATA_SIZE)?;
                for mr in [queue, data] {
                    w.map_into_pd(a, mr, MapPerms::RW, true)?;
                    w.map_into_pd(virt, mr, MapPerms::RW, true)?;
                }
                Ok((ch.id_a, ch.id_b))
            };

            let driver_tx = wire_leg(w, driver, virt_tx, "tx", "driver")?;
            let driver_rx = match virt_rx {
                Some(rx) => Some(wire_leg(w, driver, rx, "rx", "driver")?),
                None => None,
            };

            let mut ids = Vec::new();
            for (client, name) in &client_info {
                let tx = wire_leg(w, *client, virt_tx, "tx", name)?;
                let rx = match virt_rx {
                    Some(virt) => Some(wire_leg(w, *client, virt, "rx", name)?),
                    None => None,
                };
                ids.push((tx, rx));
            }
            Ok((driver_tx, driver_rx, ids))
        })?;

        for (client, (tx, rx)) in self.clients.iter_mut().zip(ids) {
            client.tx = Some(tx);
            client.rx = rx;
        }
        self.driver_tx = Some(driver_tx);
        self.driver_rx = driver_rx;
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(
            sddf = %self.config.root().display(),
            clients = self.clients.len(),
            rx = self.virt_rx.is_some(),
            "serial subsystem connected"
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
        let (driver_tx_id, virt_tx_driver_id) = self.driver_tx.unwrap_or_default();

        let mut driver_blob = BlobWriter::new(MAGIC);
        driver_blob.u8(driver_tx_id);
        driver_blob.flag(self.driver_rx.is_some());
        driver_blob.u8(self.driver_rx.map(|(id, _)| id).unwrap_or_default());
        driver_blob.write_to(output_dir, &blob_name("serial", &driver_name))?;

        let virt_tx_name = sdf.pd(self.virt_tx)?.name().to_string();
        let mut tx_blob = BlobWriter::new(MAGIC);
        tx_blob.u8(virt_tx_driver_id);
        tx_blob.flag(self.enable_color);
        tx_blob.u8(self.clients.len() as u8);
        for client in &self.clients {
            tx_blob.u8(client.tx.map(|(_, id)| id).unwrap_or_default());
        }
        tx_blob.write_to(output_dir, &blob_name("serial", &virt_tx_name))?;

        if let Some(virt_rx) = self.virt_rx {
            let virt_rx_name = sdf.pd(virt_rx)?.name().to_string();
            let mut rx_blob = BlobWriter::new(MAGIC);
            rx_blob.u8(self.driver_rx.map(|(_, id)| id).unwrap_or_default());
            rx_blob.u8(self.clients.len() as u8);
            for client in &self.clients {
                rx_blob.u8(client.rx.map(|(_, id)| id).unwrap_or_default());
            }
            rx_blob.write_to(output_dir, &blob_name("serial", &virt_rx_name))?;
        }

        for client in &self.clients {
            let mut blob = BlobWriter::new(MAGIC);
            blob.u8(client.tx.map(|(id, _)| id).unwrap_or_default());
            blob.flag(client.rx.is_some());
            blob.u8(client.rx.map(|(id, _)| id).unwrap_or_default());
            blob.write_to(output_dir, &blob_name("serial", &client.name))?;
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
