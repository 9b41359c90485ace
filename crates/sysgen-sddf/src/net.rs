//! Network subsystem: driver behind separate RX and TX virtualizers, with a
//! dedicated copier PD per client.
//!
//! Received frames flow driver → RX virtualizer → copier → client; the
//! copier isolates each client from the shared hardware buffers. Transmit
//! shares memory with the TX virtualizer directly. Every client brings its
//! own copier and MAC address; MACs and copiers must be unique and no PD may
//! appear as both a client and a copier.

use std::fmt;
use std::path::Path;

use sysgen_core::{
    ChannelHandle, ChannelOptions, DtNode, MapPerms, MrHandle, PdHandle, SystemDescription,
};

use crate::config::{blob_name, BlobWriter};
use crate::error::{Result, SddfError};
use crate::wiring::{self, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const MAGIC: [u8; 4] = *b"SNET";

const QUEUE_SIZE: u64 = 0x1000;

/// DMA frame buffer region per client.
const DATA_SIZE: u64 = 0x2_0000;

/// A six-octet Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mac([u8; 6]);

impl Mac {
    /// Wraps raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// A usable station address: unicast, not all-zero, not broadcast.
    #[must_use]
    pub fn is_valid_unicast(&self) -> bool {
        let multicast = self.0[0] & 0x01 != 0;
        let all_zero = self.0 == [0; 6];
        let broadcast = self.0 == [0xff; 6];
        !multicast && !all_zero && !broadcast
    }
}

impl From<[u8; 6]> for Mac {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug)]
struct NetClient {
    pd: PdHandle,
    copier: PdHandle,
    mac: Mac,
    name: String,
    copier_name: String,
    /// (client id, copier id) on the client↔copier channel.
    client_copier: Option<(u8, u8)>,
    /// (copier id, virtualizer id) on the copier↔RX-virtualizer channel.
    copier_virt: Option<(u8, u8)>,
}

/// Builder for one network subsystem instance.
pub struct Net {
    config: SddfConfig,
    device: Option<DtNode>,
    driver: PdHandle,
    virt_rx: PdHandle,
    virt_tx: PdHandle,
    clients: Vec<NetClient>,
    state: Lifecycle,
    driver_rx: Option<(u8, u8)>,
    driver_tx: Option<(u8, u8)>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl Net {
    /// Binds a network subsystem to its driver and RX/TX virtualizer PDs.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale or two of the bound PDs coincide.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        device: Option<DtNode>,
        driver: PdHandle,
        virt_rx: PdHandle,
        virt_tx: PdHandle,
    ) -> Result<Self> {
        sdf.pd(driver)?;
        let rx_name = sdf.pd(virt_rx)?.name().to_string();
        let tx_name = sdf.pd(virt_tx)?.name().to_string();
        if virt_rx == driver {
            return Err(SddfError::InvalidClient(rx_name));
        }
        if virt_tx == driver || virt_tx == virt_rx {
            return Err(SddfError::InvalidClient(tx_name));
        }
        Ok(Self {
            config: config.clone(),
            device,
            driver,
            virt_rx,
            virt_tx,
            clients: Vec::new(),
            state: Lifecycle::Created,
            driver_rx: None,
            driver_tx: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Adds a client PD together with its dedicated copier PD and station
    /// MAC address.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidState` after connect, `InvalidMacAddr` for an
    /// unusable MAC, `InvalidClient` if either PD already has a conflicting
    /// role, `DuplicateClient` for a repeated client PD,
    /// `DuplicateCopier` for a reused copier, or `DuplicateMacAddr` for a
    /// repeated MAC. The client list is unchanged on failure.
    pub fn add_client_with_copier(
        &mut self,
        sdf: &SystemDescription,
        client: PdHandle,
        copier: PdHandle,
        mac: Mac,
    ) -> Result<()> {
        ensure_state(
            "add_client_with_copier",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        if !mac.is_valid_unicast() {
            return Err(SddfError::InvalidMacAddr(mac));
        }
        let name = sdf.pd(client)?.name().to_string();
        let copier_name = sdf.pd(copier)?.name().to_string();

        let reserved = [self.driver, self.virt_rx, self.virt_tx];
        if reserved.contains(&client) || client == copier {
            return Err(SddfError::InvalidClient(name));
        }
        if reserved.contains(&copier) {
            return Err(SddfError::InvalidClient(copier_name));
        }
        for existing in &self.clients {
            if existing.pd == client {
                return Err(SddfError::DuplicateClient(name));
            }
            if existing.copier == copier {
                return Err(SddfError::DuplicateCopier(copier_name));
            }
            // A PD cannot serve as a client in one slot and a copier in
            // another.
            if existing.copier == client {
                return Err(SddfError::InvalidClient(name));
            }
            if existing.pd == copier {
                return Err(SddfError::InvalidClient(copier_name));
            }
            if existing.mac == mac {
                return Err(SddfError::DuplicateMacAddr(mac));
            }
        }

        tracing::debug!(client = %name, copier = %copier_name, mac = %mac, "net client added");
        self.clients.push(NetClient {
            pd: client,
            copier,
            mac,
            name,
            copier_name,
            client_copier: None,
            copier_virt: None,
        });
        self.state = Lifecycle::Configured;
        Ok(())
    }

    /// Wires the subsystem: device binding, the two fixed
    /// driver↔virtualizer channels with their hardware queues, and per
    /// client the client↔copier and copier↔RX-virtualizer channels plus
    /// queue and frame-buffer regions. Atomic on failure.
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
        let mut participants = vec![self.driver, self.virt_rx, self.virt_tx];
        for client in &self.clients {
            participants.push(client.pd);
            participants.push(client.copier);
        }
        check_participants(sdf, &participants)?;

        let device = self.device.clone();
        let driver = self.driver;
        let virt_rx = self.virt_rx;
        let virt_tx = self.virt_tx;
        let client_info: Vec<(PdHandle, PdHandle, String)> = self
            .clients
            .iter()
            .map(|c| (c.pd, c.copier, c.name.clone()))
            .collect();
        let ((driver_rx, driver_tx, ids), channels, mrs) = wiring::connect(sdf, |w| {
            if let Some(node) = &device {
                w.bind_device(driver, node)?;
            }

            let rx_trunk = w.channel(virt_rx, driver, ChannelOptions::default())?;
            let tx_trunk = w.channel(virt_tx, driver, ChannelOptions::default())?;
            for (virt, side) in [(virt_rx, "rx"), (virt_tx, "tx")] {
                for queue in ["free", "active"] {
                    let mr = w.shared_region(format!("net_{side}_{queue}_hw"), QUEUE_SIZE)?;
                    w.map_into_pd(driver, mr, MapPerms::RW, true)?;
                    w.map_into_pd(virt, mr, MapPerms::RW, true)?;
                }
            }

            let mut ids = Vec::new();
            for (client, copier, name) in &client_info {
                let client_copier = w.channel(*client, *copier, ChannelOptions::default())?;
                let copier_virt = w.channel(*copier, virt_rx, ChannelOptions::default())?;

                // RX queues on both sides of the copier.
                for queue in ["free", "active"] {
                    let upstream =
                        w.shared_region(format!("net_rx_{queue}_{name}"), QUEUE_SIZE)?;
                    w.map_into_pd(virt_rx, upstream, MapPerms::RW, true)?;
                    w.map_into_pd(*copier, upstream, MapPerms::RW, true)?;

                    let downstream =
                        w.shared_region(format!("net_cli_rx_{queue}_{name}"), QUEUE_SIZE)?;
                    w.map_into_pd(*copier, downstream, MapPerms::RW, true)?;
                    w.map_into_pd(*client, downstream, MapPerms::RW, true)?;
                }
                // TX queues shared straight with the TX virtualizer.
                for queue in ["free", "active"] {
                    let mr = w.shared_region(format!("net_tx_{queue}_{name}"), QUEUE_SIZE)?;
                    w.map_into_pd(*client, mr, MapPerms::RW, true)?;
                    w.map_into_pd(virt_tx, mr, MapPerms::RW, true)?;
                }
                let data = w.dma_region(format!("net_data_{name}"), DATA_SIZE)?;
                w.map_into_pd(*client, data, MapPerms::RW, true)?;
                w.map_into_pd(*copier, data, MapPerms::RW, true)?;

                ids.push((
                    (client_copier.id_a, client_copier.id_b),
                    (copier_virt.id_a, copier_virt.id_b),
                ));
            }
            Ok((
                (rx_trunk.id_b, rx_trunk.id_a),
                (tx_trunk.id_b, tx_trunk.id_a),
                ids,
            ))
        })?;

        for (client, (client_copier, copier_virt)) in self.clients.iter_mut().zip(ids) {
            client.client_copier = Some(client_copier);
            client.copier_virt = Some(copier_virt);
        }
        self.driver_rx = Some(driver_rx);
        self.driver_tx = Some(driver_tx);
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(
            sddf = %self.config.root().display(),
            clients = self.clients.len(),
            "net subsystem connected"
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
        let virt_rx_name = sdf.pd(self.virt_rx)?.name().to_string();
        let virt_tx_name = sdf.pd(self.virt_tx)?.name().to_string();
        let (driver_rx_id, virt_rx_driver_id) = self.driver_rx.unwrap_or_default();
        let (driver_tx_id, virt_tx_driver_id) = self.driver_tx.unwrap_or_default();

        let mut driver_blob = BlobWriter::new(MAGIC);
        driver_blob.u8(driver_rx_id);
        driver_blob.u8(driver_tx_id);
        driver_blob.write_to(output_dir, &blob_name("net", &driver_name))?;

        let mut rx_blob = BlobWriter::new(MAGIC);
        rx_blob.u8(virt_rx_driver_id);
        rx_blob.u8(self.clients.len() as u8);
        for client in &self.clients {
            rx_blob.u8(client.copier_virt.map(|(_, id)| id).unwrap_or_default());
            rx_blob.bytes(&client.mac.octets());
        }
        rx_blob.write_to(output_dir, &blob_name("net", &virt_rx_name))?;

        let mut tx_blob = BlobWriter::new(MAGIC);
        tx_blob.u8(virt_tx_driver_id);
        tx_blob.u8(self.clients.len() as u8);
        for client in &self.clients {
            tx_blob.bytes(&client.mac.octets());
        }
        tx_blob.write_to(output_dir, &blob_name("net", &virt_tx_name))?;

        for client in &self.clients {
            let mut copier_blob = BlobWriter::new(MAGIC);
            copier_blob.u8(client.copier_virt.map(|(id, _)| id).unwrap_or_default());
            copier_blob.u8(client.client_copier.map(|(_, id)| id).unwrap_or_default());
            copier_blob.write_to(output_dir, &blob_name("net", &client.copier_name))?;

            let mut client_blob = BlobWriter::new(MAGIC);
            client_blob.u8(client.client_copier.map(|(id, _)| id).unwrap_or_default());
            client_blob.bytes(&client.mac.octets());
            client_blob.write_to(output_dir, &blob_name("net", &client.name))?;
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
