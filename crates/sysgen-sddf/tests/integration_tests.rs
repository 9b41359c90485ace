//! Integration tests for subsystem wiring.
//!
//! These drive whole subsystems against a real system description and check
//! the wiring, id allocation, atomicity and serialization behavior end to
//! end.

use std::path::Path;

use sysgen_core::{
    Arch, ChannelOptions, DtNode, Irq, PdHandle, ProtectionDomain, SystemDescription,
    SystemDocument, TriggerMode, LOCAL_ID_CAP,
};
use sysgen_sddf::{
    Blk, FatFs, Gpu, I2c, Lifecycle, Mac, Net, NfsFs, SddfConfig, SddfError, Serial, Timer, Vmm,
};

fn system() -> SystemDescription {
    SystemDescription::new(Arch::Aarch64, 0xa000_0000).unwrap()
}

fn cfg() -> SddfConfig {
    SddfConfig::new("/opt/sddf")
}

fn pd(sdf: &mut SystemDescription, name: &str) -> PdHandle {
    let handle = sdf.create_pd(ProtectionDomain::new(name, format!("{name}.elf")));
    sdf.add_pd(handle).unwrap();
    handle
}

fn mac(last: u8) -> Mac {
    Mac::new([0x02, 0x00, 0x00, 0x00, 0x00, last])
}

// ============================================================================
// I2C: the worked example scenario
// ============================================================================

#[test]
fn test_i2c_example_scenario() {
    let mut sdf = system();
    let client = pd(&mut sdf, "client");
    let virt = pd(&mut sdf, "virt");
    let driver = pd(&mut sdf, "driver");

    let mut i2c = I2c::new(&cfg(), &sdf, None, driver, virt).unwrap();
    i2c.add_client(&sdf, client).unwrap();
    i2c.connect(&mut sdf).unwrap();

    sdf.pd_mut(client).unwrap().set_priority(200);
    sdf.pd_mut(virt).unwrap().set_priority(199);
    sdf.pd_mut(driver).unwrap().set_priority(198);

    let document = SystemDocument::from_json(&sdf.render().unwrap()).unwrap();
    assert_eq!(document.protection_domains.len(), 3);
    assert_eq!(document.channels.len(), 2);
    assert_eq!(document.protection_domains[0].priority, 200);
    assert_eq!(document.protection_domains[2].priority, 198);

    // driver↔virt trunk plus virt↔client leg.
    assert_eq!(i2c.channels().len(), 2);
    assert_eq!(i2c.state(), Lifecycle::Connected);
}

#[test]
fn test_duplicate_client_rejected() {
    let mut sdf = system();
    let client = pd(&mut sdf, "client");
    let virt = pd(&mut sdf, "virt");
    let driver = pd(&mut sdf, "driver");

    let mut i2c = I2c::new(&cfg(), &sdf, None, driver, virt).unwrap();
    i2c.add_client(&sdf, client).unwrap();
    let err = i2c.add_client(&sdf, client).unwrap_err();
    assert!(matches!(err, SddfError::DuplicateClient(name) if name == "client"));
    assert_eq!(i2c.client_count(), 1);
}

#[test]
fn test_driver_cannot_be_client() {
    let mut sdf = system();
    let virt = pd(&mut sdf, "virt");
    let driver = pd(&mut sdf, "driver");

    let mut i2c = I2c::new(&cfg(), &sdf, None, driver, virt).unwrap();
    for role in [driver, virt] {
        assert!(matches!(
            i2c.add_client(&sdf, role),
            Err(SddfError::InvalidClient(_))
        ));
    }
    assert_eq!(i2c.client_count(), 0);
}

// ============================================================================
// Network: MAC/copier uniqueness and channel counts
// ============================================================================

#[test]
fn test_network_duplicate_mac_rejected() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "eth");
    let virt_rx = pd(&mut sdf, "rx");
    let virt_tx = pd(&mut sdf, "tx");
    let a = pd(&mut sdf, "a");
    let ca = pd(&mut sdf, "a_copier");
    let b = pd(&mut sdf, "b");
    let cb = pd(&mut sdf, "b_copier");

    let mut net = Net::new(&cfg(), &sdf, None, driver, virt_rx, virt_tx).unwrap();
    net.add_client_with_copier(&sdf, a, ca, mac(1)).unwrap();

    let err = net
        .add_client_with_copier(&sdf, b, cb, mac(1))
        .unwrap_err();
    assert!(matches!(err, SddfError::DuplicateMacAddr(_)));
    assert_eq!(net.client_count(), 1);
}

#[test]
fn test_network_connect_channel_count() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "eth");
    let virt_rx = pd(&mut sdf, "rx");
    let virt_tx = pd(&mut sdf, "tx");
    let a = pd(&mut sdf, "a");
    let ca = pd(&mut sdf, "a_copier");
    let b = pd(&mut sdf, "b");
    let cb = pd(&mut sdf, "b_copier");

    let mut net = Net::new(&cfg(), &sdf, None, driver, virt_rx, virt_tx).unwrap();
    net.add_client_with_copier(&sdf, a, ca, mac(1)).unwrap();
    net.add_client_with_copier(&sdf, b, cb, mac(2)).unwrap();
    net.connect(&mut sdf).unwrap();

    // Two fixed driver↔virtualizer channels plus two per client
    // (client↔copier, copier↔RX-virtualizer).
    assert_eq!(net.channels().len(), 2 + 2 * 2);
    assert_eq!(sdf.registered_channels().len(), 6);
}

#[test]
fn test_network_role_conflicts() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "eth");
    let virt_rx = pd(&mut sdf, "rx");
    let virt_tx = pd(&mut sdf, "tx");
    let a = pd(&mut sdf, "a");
    let ca = pd(&mut sdf, "a_copier");
    let b = pd(&mut sdf, "b");
    let cb = pd(&mut sdf, "b_copier");

    let mut net = Net::new(&cfg(), &sdf, None, driver, virt_rx, virt_tx).unwrap();
    net.add_client_with_copier(&sdf, a, ca, mac(1)).unwrap();

    // Reusing a's copier for b.
    assert!(matches!(
        net.add_client_with_copier(&sdf, b, ca, mac(2)),
        Err(SddfError::DuplicateCopier(_))
    ));
    // A previous copier cannot become a client.
    assert!(matches!(
        net.add_client_with_copier(&sdf, ca, cb, mac(3)),
        Err(SddfError::InvalidClient(_))
    ));
    // A previous client cannot become a copier.
    assert!(matches!(
        net.add_client_with_copier(&sdf, b, a, mac(4)),
        Err(SddfError::InvalidClient(_))
    ));
    // A PD cannot copier for itself.
    assert!(matches!(
        net.add_client_with_copier(&sdf, b, b, mac(5)),
        Err(SddfError::InvalidClient(_))
    ));
    assert_eq!(net.client_count(), 1);
}

#[test]
fn test_network_invalid_mac_rejected() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "eth");
    let virt_rx = pd(&mut sdf, "rx");
    let virt_tx = pd(&mut sdf, "tx");
    let a = pd(&mut sdf, "a");
    let ca = pd(&mut sdf, "a_copier");

    let mut net = Net::new(&cfg(), &sdf, None, driver, virt_rx, virt_tx).unwrap();
    for bad in [Mac::new([0; 6]), Mac::new([0xff; 6]), Mac::new([0x01, 0, 0, 0, 0, 9])] {
        assert!(matches!(
            net.add_client_with_copier(&sdf, a, ca, bad),
            Err(SddfError::InvalidMacAddr(_))
        ));
    }
    assert_eq!(net.client_count(), 0);
}

// ============================================================================
// Lifecycle and atomicity
// ============================================================================

#[test]
fn test_lifecycle_enforced() {
    let mut sdf = system();
    let client = pd(&mut sdf, "client");
    let other = pd(&mut sdf, "other");
    let driver = pd(&mut sdf, "driver");

    let mut timer = Timer::new(&cfg(), &sdf, None, driver).unwrap();

    // serialise before connect is out of order.
    let tmp = tempfile::tempdir().unwrap();
    assert!(matches!(
        timer.serialise_config(&sdf, tmp.path()),
        Err(SddfError::InvalidState { .. })
    ));

    timer.add_client(&sdf, client).unwrap();
    timer.connect(&mut sdf).unwrap();

    // add_client and connect are one-shot past this point.
    assert!(matches!(
        timer.add_client(&sdf, other),
        Err(SddfError::InvalidState { .. })
    ));
    assert!(matches!(
        timer.connect(&mut sdf),
        Err(SddfError::InvalidState { .. })
    ));
    assert_eq!(timer.client_count(), 1);
}

#[test]
fn test_connect_atomic_on_id_exhaustion() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");
    let a = pd(&mut sdf, "a");
    let b = pd(&mut sdf, "b");

    // Burn driver ids until exactly one is free.
    for id in 0..(LOCAL_ID_CAP - 1) {
        sdf.pd_bind_irq(driver, Irq::new(u32::from(id), TriggerMode::Edge).with_id(id))
            .unwrap();
    }

    let mut timer = Timer::new(&cfg(), &sdf, None, driver).unwrap();
    timer.add_client(&sdf, a).unwrap();
    timer.add_client(&sdf, b).unwrap();

    // The first client takes the last driver id, the second exhausts the
    // space; everything wired so far must be rolled back.
    assert!(timer.connect(&mut sdf).is_err());
    assert_eq!(sdf.registered_channels().len(), 0);
    assert_ne!(timer.state(), Lifecycle::Connected);

    // The rolled-back channel released a's end id.
    let probe = sdf.channel_create(a, b, ChannelOptions::default()).unwrap();
    assert_eq!(sdf.channel_end_ids(probe).unwrap(), (0, 0));
}

#[test]
fn test_failed_connect_rolls_back_device_binding() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");
    let a = pd(&mut sdf, "a");
    let b = pd(&mut sdf, "b");

    // Leave two free driver ids: one for the device IRQ, one for the first
    // client; the second client pushes the space over the edge.
    for id in 0..(LOCAL_ID_CAP - 2) {
        sdf.pd_bind_irq(driver, Irq::new(u32::from(id), TriggerMode::Edge).with_id(id))
            .unwrap();
    }
    let irqs_before = sdf.pd(driver).unwrap().irqs().len();
    let maps_before = sdf.pd(driver).unwrap().maps().len();

    let node = DtNode::new("timer@f9010000")
        .with_region(0xf901_0000, 0x1000)
        .with_irq(36, TriggerMode::Level);
    let mut timer = Timer::new(&cfg(), &sdf, Some(node), driver).unwrap();
    timer.add_client(&sdf, a).unwrap();
    timer.add_client(&sdf, b).unwrap();

    assert!(timer.connect(&mut sdf).is_err());
    // The device region, its mapping and the IRQ bind are all undone.
    assert_eq!(sdf.registered_channels().len(), 0);
    assert_eq!(sdf.registered_mrs().len(), 0);
    assert_eq!(sdf.pd(driver).unwrap().irqs().len(), irqs_before);
    assert_eq!(sdf.pd(driver).unwrap().maps().len(), maps_before);
}

#[test]
fn test_connect_rejects_destroyed_client() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");
    let client = pd(&mut sdf, "client");

    let mut timer = Timer::new(&cfg(), &sdf, None, driver).unwrap();
    timer.add_client(&sdf, client).unwrap();
    sdf.destroy_pd(client).unwrap();

    assert!(timer.connect(&mut sdf).is_err());
    assert_eq!(sdf.registered_channels().len(), 0);
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_render_deterministic_across_runs() {
    let build = || {
        let mut sdf = system();
        let driver = pd(&mut sdf, "eth");
        let virt_rx = pd(&mut sdf, "rx");
        let virt_tx = pd(&mut sdf, "tx");
        let a = pd(&mut sdf, "a");
        let ca = pd(&mut sdf, "a_copier");

        let mut net = Net::new(&cfg(), &sdf, None, driver, virt_rx, virt_tx).unwrap();
        net.add_client_with_copier(&sdf, a, ca, mac(1)).unwrap();
        net.connect(&mut sdf).unwrap();
        sdf.render().unwrap()
    };
    assert_eq!(build(), build());
}

// ============================================================================
// Device binding
// ============================================================================

#[test]
fn test_device_binding_maps_registers_and_irqs() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");
    let client = pd(&mut sdf, "client");

    let node = DtNode::new("timer@13050000")
        .with_region(0x1305_0000, 0x1000)
        .with_irq(42, TriggerMode::Level);
    let mut timer = Timer::new(&cfg(), &sdf, Some(node), driver).unwrap();
    timer.add_client(&sdf, client).unwrap();
    timer.connect(&mut sdf).unwrap();

    let entity = sdf.pd(driver).unwrap();
    assert_eq!(entity.maps().len(), 1);
    assert_eq!(entity.irqs().len(), 1);
    assert_eq!(entity.irqs()[0].number(), 42);

    let document = SystemDocument::from_json(&sdf.render().unwrap()).unwrap();
    let mr = &document.memory_regions[0];
    assert_eq!(mr.name, "timer@13050000_regs");
    assert_eq!(mr.paddr, Some(0x1305_0000));
}

// ============================================================================
// Serial and block
// ============================================================================

#[test]
fn test_serial_with_rx_channel_count() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "uart");
    let virt_tx = pd(&mut sdf, "uart_tx");
    let virt_rx = pd(&mut sdf, "uart_rx");
    let client = pd(&mut sdf, "shell");

    let mut serial =
        Serial::new(&cfg(), &sdf, None, driver, virt_tx, Some(virt_rx), true).unwrap();
    serial.add_client(&sdf, client).unwrap();
    serial.connect(&mut sdf).unwrap();

    // Two driver legs plus two client legs.
    assert_eq!(serial.channels().len(), 4);
}

#[test]
fn test_serial_tx_only() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "uart");
    let virt_tx = pd(&mut sdf, "uart_tx");
    let client = pd(&mut sdf, "shell");

    let mut serial = Serial::new(&cfg(), &sdf, None, driver, virt_tx, None, false).unwrap();
    serial.add_client(&sdf, client).unwrap();
    serial.connect(&mut sdf).unwrap();

    assert_eq!(serial.channels().len(), 2);
}

#[test]
fn test_gpu_wiring_includes_data_region() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "gpu_driver");
    let virt = pd(&mut sdf, "gpu_virt");
    let client = pd(&mut sdf, "compositor");

    let mut gpu = Gpu::new(&cfg(), &sdf, None, driver, virt).unwrap();
    gpu.add_client(&sdf, client).unwrap();
    gpu.connect(&mut sdf).unwrap();

    assert_eq!(gpu.channels().len(), 2);
    // req/resp queues plus the DMA data region.
    assert_eq!(gpu.regions().len(), 3);
    let data = sdf.mr(gpu.regions()[2]).unwrap();
    assert_eq!(data.name(), "gpu_data_compositor");
    assert!(data.paddr().is_some());
}

#[test]
fn test_blk_clients_may_share_a_partition() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "blk_driver");
    let virt = pd(&mut sdf, "blk_virt");
    let a = pd(&mut sdf, "a");
    let b = pd(&mut sdf, "b");

    let mut blk = Blk::new(&cfg(), &sdf, None, driver, virt).unwrap();
    blk.add_client(&sdf, a, 0).unwrap();
    blk.add_client(&sdf, b, 0).unwrap();
    blk.connect(&mut sdf).unwrap();
    assert_eq!(blk.client_count(), 2);
}

// ============================================================================
// Configuration blobs
// ============================================================================

#[test]
fn test_serialise_config_writes_one_blob_per_pd() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");
    let client = pd(&mut sdf, "client");

    let mut timer = Timer::new(&cfg(), &sdf, None, driver).unwrap();
    timer.add_client(&sdf, client).unwrap();
    timer.connect(&mut sdf).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    timer.serialise_config(&sdf, tmp.path()).unwrap();
    assert_eq!(timer.state(), Lifecycle::Serialized);

    for name in ["timer_driver.data", "timer_client.data"] {
        let blob = std::fs::read(tmp.path().join(name)).unwrap();
        assert_eq!(&blob[..4], b"STMR");
    }
}

#[test]
fn test_serialise_config_fails_on_missing_dir() {
    let mut sdf = system();
    let driver = pd(&mut sdf, "driver");

    let mut timer = Timer::new(&cfg(), &sdf, None, driver).unwrap();
    timer.connect(&mut sdf).unwrap();
    let err = timer
        .serialise_config(&sdf, Path::new("/nonexistent-sysgen-out"))
        .unwrap_err();
    assert!(matches!(err, SddfError::Io(_)));
}

// ============================================================================
// Composites
// ============================================================================

#[test]
fn test_fat_filesystem() {
    let mut sdf = system();
    let fs = pd(&mut sdf, "fatfs");
    let client = pd(&mut sdf, "app");

    let mut fat = FatFs::new(&cfg(), &sdf, fs, client).unwrap();
    fat.connect(&mut sdf).unwrap();
    assert_eq!(fat.channels().len(), 1);
    assert_eq!(sdf.registered_channels().len(), 1);

    let tmp = tempfile::tempdir().unwrap();
    fat.serialise_config(&sdf, tmp.path()).unwrap();
    assert!(tmp.path().join("fat_fatfs.data").exists());
    assert!(tmp.path().join("fat_app.data").exists());
}

#[test]
fn test_nfs_composite_connects_embedded_subsystems() {
    let mut sdf = system();
    let fs = pd(&mut sdf, "nfs");
    let client = pd(&mut sdf, "app");
    let copier = pd(&mut sdf, "nfs_copier");
    let eth = pd(&mut sdf, "eth");
    let virt_rx = pd(&mut sdf, "rx");
    let virt_tx = pd(&mut sdf, "tx");
    let uart = pd(&mut sdf, "uart");
    let uart_tx = pd(&mut sdf, "uart_tx");
    let clock = pd(&mut sdf, "clock");

    let net = Net::new(&cfg(), &sdf, None, eth, virt_rx, virt_tx).unwrap();
    let serial = Serial::new(&cfg(), &sdf, None, uart, uart_tx, None, false).unwrap();
    let timer = Timer::new(&cfg(), &sdf, None, clock).unwrap();

    let mut nfs = NfsFs::new(
        &cfg(),
        &sdf,
        fs,
        client,
        net,
        copier,
        mac(9),
        serial,
        timer,
    )
    .unwrap();
    nfs.connect(&mut sdf).unwrap();
    assert_eq!(nfs.state(), Lifecycle::Connected);
    assert_eq!(nfs.net().client_count(), 1);

    // net: 2 fixed + 2 for the fs client; serial: driver leg + fs leg;
    // timer: fs leg; nfs itself: fs↔client.
    assert_eq!(sdf.registered_channels().len(), 4 + 2 + 1 + 1);

    let tmp = tempfile::tempdir().unwrap();
    nfs.serialise_config(&sdf, tmp.path()).unwrap();
    for name in ["nfs_nfs.data", "nfs_app.data", "net_eth.data", "timer_clock.data"] {
        assert!(tmp.path().join(name).exists(), "missing {name}");
    }
}

#[test]
fn test_vmm_passthrough() {
    let mut sdf = system();
    let monitor = pd(&mut sdf, "vmm");
    let vm = sdf.create_vm(
        sysgen_core::VirtualMachine::new("guest", vec![sysgen_core::Vcpu::new(0)]).unwrap(),
    );

    let node = DtNode::new("gpio@30200000")
        .with_region(0x3020_0000, 0x1000)
        .with_irq(100, TriggerMode::Edge);
    let mut vmm = Vmm::new(&cfg(), &sdf, monitor, vm, 0x80_0000, false).unwrap();
    vmm.add_passthrough_device("gpio", &node).unwrap();
    assert!(matches!(
        vmm.add_passthrough_device("gpio", &node),
        Err(SddfError::DuplicateDevice(_))
    ));
    vmm.connect(&mut sdf).unwrap();

    // Guest sees RAM plus the passthrough device; the monitor holds the IRQ.
    assert_eq!(sdf.pd(monitor).unwrap().vm(), Some(vm));
    assert_eq!(sdf.vm(vm).unwrap().maps().len(), 2);
    assert_eq!(sdf.pd(monitor).unwrap().irqs().len(), 1);
    assert_eq!(vmm.ram_vaddr(), Some(0x4000_0000));

    let tmp = tempfile::tempdir().unwrap();
    vmm.serialise_config(&sdf, tmp.path()).unwrap();
    assert!(tmp.path().join("vmm_vmm.data").exists());
}
