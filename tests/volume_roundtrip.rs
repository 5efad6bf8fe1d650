//! End-to-end checks against `Volume` through its public API only, the way
//! a real embedding application would drive it (§12 "whole-volume
//! scenarios"). Unit tests inside each module cover a single subsystem in
//! isolation; this file exercises the full format -> write -> unmount ->
//! remount -> read lifecycle across the whole stack.

use std::fs::OpenOptions;

use hn4::config::Config;
use hn4::device::DeviceType;
use hn4::hal::{FileHal, HwFlags, MemHal};
use hn4::io;
use hn4::volume::Volume;

const VOLUME_BYTES: u64 = 4 * 1024 * 1024;
const BLOCK_SIZE: u32 = 512;

#[test]
fn full_lifecycle_survives_unmount_and_remount_on_mem_hal()
{
    let hal = MemHal::new(VOLUME_BYTES, BLOCK_SIZE);
    let cfg = Config::default_for(DeviceType::Ssd);

    let volume = Volume::format_and_mount(Box::new(hal), &cfg).unwrap().value;
    let index = volume.create_file("letter.txt").unwrap();

    let payload = b"a long enough payload to exercise the header and CRC path";
    io::atomic_write(&volume, index, 0, payload).unwrap();

    let anchor = volume.cortex().get(index).unwrap();
    let read_back = io::atomic_read(&volume, &anchor, 0).unwrap().value;
    assert_eq!(&read_back[..payload.len()], &payload[..]);

    // A second write to the same logical index is a shadow hop: the old
    // block must be freed, not leaked, and the new content must win.
    let updated = b"replaced";
    io::atomic_write(&volume, index, 0, updated).unwrap();
    let anchor = volume.cortex().get(index).unwrap();
    let read_back = io::atomic_read(&volume, &anchor, 0).unwrap().value;
    assert_eq!(&read_back[..updated.len()], &updated[..]);

    // Unmount, then remount against the same backing HAL and confirm the
    // anchor and its data are still reachable (quorum superblock recovery
    // plus cortex rebuild, §4.5.1/§12).
    let hal = volume.unmount().unwrap().value;

    let remounted = Volume::mount(hal, &cfg).unwrap().value;
    let index = remounted.find_file("letter.txt").expect("anchor survives remount");
    let anchor = remounted.cortex().get(index).unwrap();
    let read_back = io::atomic_read(&remounted, &anchor, 0).unwrap().value;
    assert_eq!(&read_back[..updated.len()], &updated[..]);

    remounted.unmount().unwrap();
}

#[test]
fn delete_then_undelete_round_trips_through_a_real_file()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");

    let file = OpenOptions::new().create(true).read(true).write(true).open(&path).unwrap();
    file.set_len(VOLUME_BYTES).unwrap();

    let hal = FileHal::new(file, BLOCK_SIZE, HwFlags::default());
    let cfg = Config::default_for(DeviceType::Usb);

    let volume = Volume::format_and_mount(Box::new(hal), &cfg).unwrap().value;
    let index = volume.create_file("tombstoned.txt").unwrap();
    io::atomic_write(&volume, index, 0, b"recoverable payload").unwrap();

    volume.delete_file(index).unwrap();
    assert!(volume.find_file("tombstoned.txt").is_none(), "a tombstoned anchor is not a live match");

    io::undelete(&volume, "tombstoned.txt").unwrap();
    let index = volume.find_file("tombstoned.txt").expect("undelete restores the live lookup");
    let anchor = volume.cortex().get(index).unwrap();
    assert!(!anchor.data_class.has_tombstone());

    let read_back = io::atomic_read(&volume, &anchor, 0).unwrap().value;
    assert_eq!(&read_back[..b"recoverable payload".len()], b"recoverable payload");

    volume.unmount().unwrap();

    // Re-open the same on-disk image from scratch, proving durability
    // across a process boundary rather than just across a mount handle.
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let hal = FileHal::new(file, BLOCK_SIZE, HwFlags::default());
    let remounted = Volume::mount(Box::new(hal), &cfg).unwrap().value;

    let index = remounted.find_file("tombstoned.txt").expect("recovered anchor survives a fresh mount");
    let anchor = remounted.cortex().get(index).unwrap();
    let read_back = io::atomic_read(&remounted, &anchor, 0).unwrap().value;
    assert_eq!(&read_back[..b"recoverable payload".len()], b"recoverable payload");

    remounted.unmount().unwrap();
}

#[test]
fn many_files_each_keep_independent_placement_and_content()
{
    let hal = MemHal::new(VOLUME_BYTES, BLOCK_SIZE);
    let cfg = Config::default_for(DeviceType::Ssd);
    let volume = Volume::format_and_mount(Box::new(hal), &cfg).unwrap().value;

    let names: Vec<String> = (0..16).map(|i| format!("f{i}.txt")).collect();
    for (i, name) in names.iter().enumerate() {
        let index = volume.create_file(name).unwrap();
        let payload = format!("payload for file {i}");
        io::atomic_write(&volume, index, 0, payload.as_bytes()).unwrap();
    }

    for (i, name) in names.iter().enumerate() {
        let index = volume.find_file(name).unwrap();
        let anchor = volume.cortex().get(index).unwrap();
        let read_back = io::atomic_read(&volume, &anchor, 0).unwrap().value;
        let expected = format!("payload for file {i}");
        assert_eq!(&read_back[..expected.len()], expected.as_bytes());
    }

    volume.unmount().unwrap();
}
