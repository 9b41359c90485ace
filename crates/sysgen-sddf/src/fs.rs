//! Filesystem composites.
//!
//! [`FatFs`] pairs a filesystem-server PD with one client over a call
//! channel and shared command/completion/data regions. [`NfsFs`] embeds a
//! whole network subsystem (for mount traffic), a serial dependency (for
//! logging) and a timer dependency (for retry timing); its connect brings
//! the embedded subsystems up before wiring its own channel.

use std::path::Path;

use sysgen_core::{
    ChannelHandle, ChannelOptions, MapPerms, MrHandle, PdHandle, SystemDescription,
};

use crate::config::{blob_name, BlobWriter};
use crate::error::{Result, SddfError};
use crate::net::{Mac, Net};
use crate::serial::Serial;
use crate::timer::Timer;
use crate::wiring::{self, check_participants, ensure_state};
use crate::{Lifecycle, SddfConfig};

const FAT_MAGIC: [u8; 4] = *b"SFAT";
const NFS_MAGIC: [u8; 4] = *b"SNFS";

const QUEUE_SIZE: u64 = 0x1000;
const DATA_SIZE: u64 = 0x1_0000;

/// Wires one fs↔client leg: a call channel plus command/completion/data
/// regions mapped into both sides. Returns (client id, server id).
fn wire_fs_leg(
    w: &mut wiring::Wiring<'_>,
    prefix: &str,
    fs: PdHandle,
    client: PdHandle,
    client_name: &str,
) -> Result<(u8, u8)> {
    let ch = w.channel(client, fs, ChannelOptions::calling())?;
    for region in ["command", "completion"] {
        let mr = w.shared_region(format!("{prefix}_{region}_{client_name}"), QUEUE_SIZE)?;
        w.map_into_pd(client, mr, MapPerms::RW, true)?;
        w.map_into_pd(fs, mr, MapPerms::RW, true)?;
    }
    let data = w.shared_region(format!("{prefix}_data_{client_name}"), DATA_SIZE)?;
    w.map_into_pd(client, data, MapPerms::RW, true)?;
    w.map_into_pd(fs, data, MapPerms::RW, true)?;
    Ok((ch.id_a, ch.id_b))
}

/// Builder for a FAT filesystem server with a single client.
pub struct FatFs {
    config: SddfConfig,
    fs: PdHandle,
    client: PdHandle,
    state: Lifecycle,
    ids: Option<(u8, u8)>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl FatFs {
    /// Binds the composite to its filesystem-server and client PDs.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale or both roles name the same PD.
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        fs: PdHandle,
        client: PdHandle,
    ) -> Result<Self> {
        sdf.pd(fs)?;
        let client_name = sdf.pd(client)?.name().to_string();
        if fs == client {
            return Err(SddfError::InvalidClient(client_name));
        }
        Ok(Self {
            config: config.clone(),
            fs,
            client,
            state: Lifecycle::Created,
            ids: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Wires the fs↔client channel and shared regions. Atomic on failure.
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
        check_participants(sdf, &[self.fs, self.client])?;

        let fs = self.fs;
        let client = self.client;
        let client_name = sdf.pd(client)?.name().to_string();
        let (ids, channels, mrs) = wiring::connect(sdf, |w| {
            wire_fs_leg(w, "fat", fs, client, &client_name)
        })?;

        self.ids = Some(ids);
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(sddf = %self.config.root().display(), "fat filesystem connected");
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
        let fs_name = sdf.pd(self.fs)?.name().to_string();
        let client_name = sdf.pd(self.client)?.name().to_string();
        let (client_id, fs_id) = self.ids.unwrap_or_default();

        let mut fs_blob = BlobWriter::new(FAT_MAGIC);
        fs_blob.u8(fs_id);
        fs_blob.write_to(output_dir, &blob_name("fat", &fs_name))?;

        let mut client_blob = BlobWriter::new(FAT_MAGIC);
        client_blob.u8(client_id);
        client_blob.write_to(output_dir, &blob_name("fat", &client_name))?;

        self.state = Lifecycle::Serialized;
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> Lifecycle {
        self.state
    }

    /// Channels created by connect.
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

/// Builder for an NFS filesystem server with a single client and embedded
/// network, serial and timer dependencies.
pub struct NfsFs {
    config: SddfConfig,
    fs: PdHandle,
    client: PdHandle,
    net: Net,
    net_copier: PdHandle,
    mac: Mac,
    serial: Serial,
    timer: Timer,
    state: Lifecycle,
    ids: Option<(u8, u8)>,
    channels: Vec<ChannelHandle>,
    mrs: Vec<MrHandle>,
}

impl NfsFs {
    /// Binds the composite, taking ownership of the not-yet-connected
    /// network, serial and timer builders it depends on. The filesystem
    /// server joins each of them as a client during connect.
    ///
    /// # Errors
    ///
    /// Fails if a handle is stale, fs and client coincide, or an embedded
    /// builder is already past the configuration stage.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SddfConfig,
        sdf: &SystemDescription,
        fs: PdHandle,
        client: PdHandle,
        net: Net,
        net_copier: PdHandle,
        mac: Mac,
        serial: Serial,
        timer: Timer,
    ) -> Result<Self> {
        sdf.pd(fs)?;
        sdf.pd(net_copier)?;
        let client_name = sdf.pd(client)?.name().to_string();
        if fs == client {
            return Err(SddfError::InvalidClient(client_name));
        }
        for (embedded, state) in [
            ("embed network", net.state()),
            ("embed serial", serial.state()),
            ("embed timer", timer.state()),
        ] {
            ensure_state(embedded, state, &[Lifecycle::Created, Lifecycle::Configured])?;
        }
        Ok(Self {
            config: config.clone(),
            fs,
            client,
            net,
            net_copier,
            mac,
            serial,
            timer,
            state: Lifecycle::Created,
            ids: None,
            channels: Vec::new(),
            mrs: Vec::new(),
        })
    }

    /// Joins the filesystem server to the embedded subsystems, connects
    /// them, then wires the fs↔client channel. The final leg is atomic;
    /// each embedded connect is atomic on its own.
    ///
    /// # Errors
    ///
    /// Any error an embedded add-client/connect can produce, plus the usual
    /// connect failures for the fs↔client leg.
    pub fn connect(&mut self, sdf: &mut SystemDescription) -> Result<()> {
        ensure_state(
            "connect",
            self.state,
            &[Lifecycle::Created, Lifecycle::Configured],
        )?;
        check_participants(sdf, &[self.fs, self.client, self.net_copier])?;

        self.net
            .add_client_with_copier(sdf, self.fs, self.net_copier, self.mac)?;
        self.serial.add_client(sdf, self.fs)?;
        self.timer.add_client(sdf, self.fs)?;
        self.net.connect(sdf)?;
        self.serial.connect(sdf)?;
        self.timer.connect(sdf)?;

        let fs = self.fs;
        let client = self.client;
        let client_name = sdf.pd(client)?.name().to_string();
        let (ids, channels, mrs) = wiring::connect(sdf, |w| {
            wire_fs_leg(w, "nfs", fs, client, &client_name)
        })?;

        self.ids = Some(ids);
        self.channels = channels;
        self.mrs = mrs;
        self.state = Lifecycle::Connected;
        tracing::info!(sddf = %self.config.root().display(), "nfs filesystem connected");
        Ok(())
    }

    /// Emits configuration blobs for the embedded subsystems and then for
    /// the fs and client PDs.
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
        self.net.serialise_config(sdf, output_dir)?;
        self.serial.serialise_config(sdf, output_dir)?;
        self.timer.serialise_config(sdf, output_dir)?;

        let fs_name = sdf.pd(self.fs)?.name().to_string();
        let client_name = sdf.pd(self.client)?.name().to_string();
        let (client_id, fs_id) = self.ids.unwrap_or_default();

        let mut fs_blob = BlobWriter::new(NFS_MAGIC);
        fs_blob.u8(fs_id);
        fs_blob.bytes(&self.mac.octets());
        fs_blob.write_to(output_dir, &blob_name("nfs", &fs_name))?;

        let mut client_blob = BlobWriter::new(NFS_MAGIC);
        client_blob.u8(client_id);
        client_blob.write_to(output_dir, &blob_name("nfs", &client_name))?;

        self.state = Lifecycle::Serialized;
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> Lifecycle {
        self.state
    }

    /// The embedded network subsystem.
    #[must_use]
    pub const fn net(&self) -> &Net {
        &self.net
    }

    /// Channels created by this composite's own leg (the embedded
    /// subsystems track theirs separately).
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
