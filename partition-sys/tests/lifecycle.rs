// SPDX-License-Identifier: GPL-3.0-only

//! Loop device lifecycle against the running kernel.
//!
//! Needs root, `/dev/loop-control` and `mkfs.ext2`. Skipped unless
//! `PARTITION_TESTING_ENABLE_LOOP_TESTS=1` is set.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::mount::{mount, umount, MsFlags};
use partition_sys::{Action, Config, Dispatcher, LoopDevice, Outcome, StateProbe, SysError};

const ENABLE_ENV: &str = "PARTITION_TESTING_ENABLE_LOOP_TESTS";

fn enabled(label: &str) -> bool {
    if std::env::var(ENABLE_ENV).ok().as_deref() != Some("1") {
        eprintln!("skipping {label}: set {ENABLE_ENV}=1 to run loop device tests");
        return false;
    }
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping {label}: requires root");
        return false;
    }
    true
}

/// A zero-filled 8 MiB file: no partition table, no filesystem
fn blank_image(dir: &Path, name: &str) -> PathBuf {
    let image = dir.join(name);
    let file = std::fs::File::create(&image).expect("create image");
    file.set_len(8 * 1024 * 1024).expect("size image");
    image
}

/// A small ext2 image without a partition table
fn ext2_image(dir: &Path) -> Option<PathBuf> {
    let Ok(mkfs) = which::which("mkfs.ext2") else {
        eprintln!("skipping: mkfs.ext2 not installed");
        return None;
    };

    let image = blank_image(dir, "disk.img");

    let status = Command::new(mkfs)
        .args(["-q", "-F"])
        .arg(&image)
        .status()
        .expect("run mkfs.ext2");
    assert!(status.success(), "mkfs.ext2 failed");
    Some(image)
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Config::default())
}

/// Loop devices the kernel reports as backed by `image`
fn devices_backed_by(image: &Path) -> Vec<PathBuf> {
    let image = std::fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
    let entries = std::fs::read_dir("/sys/block").expect("read /sys/block");

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !name.starts_with("loop") {
                return None;
            }
            let backing = std::fs::read_to_string(entry.path().join("loop/backing_file")).ok()?;
            (Path::new(backing.trim()) == image).then(|| PathBuf::from(format!("/dev/{name}")))
        })
        .collect()
}

/// Clearing is deferred while udev still holds the device open.
fn assert_released(image: &Path) {
    for _ in 0..40 {
        if devices_backed_by(image).is_empty() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(25));
    }
    panic!("{} is still associated: {:?}", image.display(), devices_backed_by(image));
}

fn current_mounts() -> StateProbe {
    StateProbe::new("/proc/self/mounts")
}

fn added_device(outcome: Outcome) -> PathBuf {
    match outcome {
        Outcome::Added { device, .. } => device,
        other => panic!("expected Added, got {other:?}"),
    }
}

#[test]
fn add_then_remove_leaves_no_association() {
    if !enabled("add_then_remove_leaves_no_association") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let dispatcher = dispatcher();

    let device = added_device(
        dispatcher
            .run(Action::Add {
                image: image.clone(),
            })
            .expect("add succeeds"),
    );
    let status = LoopDevice::open(&device)
        .and_then(|d| d.status())
        .expect("status readable");
    assert_eq!(
        status.map(|s| s.backing_file),
        Some(image.display().to_string())
    );

    dispatcher
        .run(Action::Remove {
            target: device.clone(),
        })
        .expect("remove succeeds");

    let status = LoopDevice::open(&device)
        .and_then(|d| d.status())
        .expect("status readable");
    assert_eq!(status, None);
}

#[test]
fn mount_umount_remove_scenario() {
    if !enabled("mount_umount_remove_scenario") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let mount_point = dir.path().join("mnt").join("fw");
    let dispatcher = dispatcher();

    let device = added_device(dispatcher.run(Action::Add { image }).expect("add succeeds"));

    dispatcher
        .run(Action::Mount {
            source: device.clone(),
            mount_point: mount_point.clone(),
        })
        .expect("mount succeeds");
    assert!(mount_point.is_dir(), "mount point is created");

    let second = dir.path().join("second");
    let again = dispatcher.run(Action::Mount {
        source: device.clone(),
        mount_point: second,
    });
    assert!(matches!(again, Err(SysError::Mount { .. })));

    dispatcher
        .run(Action::Umount {
            target: mount_point.clone(),
        })
        .expect("umount succeeds");
    dispatcher
        .run(Action::Remove { target: device })
        .expect("remove succeeds");
}

#[test]
fn remove_by_mount_point_unmounts_first() {
    if !enabled("remove_by_mount_point_unmounts_first") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let mount_point = dir.path().join("fw");
    let dispatcher = dispatcher();

    let mounted = dispatcher
        .run(Action::Mount {
            source: image,
            mount_point: mount_point.clone(),
        })
        .expect("mount of image succeeds");
    let Outcome::Mounted {
        allocated: Some(device),
        ..
    } = mounted
    else {
        panic!("expected a freshly allocated loop device, got {mounted:?}");
    };

    let removed = dispatcher
        .run(Action::Remove {
            target: mount_point.clone(),
        })
        .expect("remove succeeds");
    match removed {
        Outcome::Removed {
            device: released,
            unmounted,
            ..
        } => {
            assert_eq!(released, device);
            assert_eq!(unmounted, vec![mount_point]);
        }
        other => panic!("expected Removed, got {other:?}"),
    }
}

#[test]
fn add_of_missing_image_allocates_nothing() {
    if !enabled("add_of_missing_image_allocates_nothing") {
        return;
    }
    let result = dispatcher().run(Action::Add {
        image: PathBuf::from("/does/not/exist"),
    });
    assert!(matches!(result, Err(SysError::NotFound(_))));
}

#[test]
fn slot_bound_elsewhere_is_left_intact() {
    if !enabled("slot_bound_elsewhere_is_left_intact") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let theirs = blank_image(dir.path(), "theirs.img");
    let ours = blank_image(dir.path(), "ours.img");
    let dispatcher = dispatcher();

    let device = added_device(
        dispatcher
            .run(Action::Add {
                image: theirs.clone(),
            })
            .expect("add succeeds"),
    );

    let loop_device = LoopDevice::open(&device).expect("open bound device");
    let result = loop_device.associate(&ours, true);
    assert!(
        matches!(
            result,
            Err(SysError::Association {
                source: Errno::EBUSY,
                ..
            })
        ),
        "unexpected result: {result:?}"
    );

    let status = loop_device.status().expect("status readable");
    assert_eq!(
        status.map(|s| s.backing_file),
        Some(theirs.display().to_string())
    );
    drop(loop_device);

    dispatcher
        .run(Action::Remove { target: device })
        .expect("remove succeeds");
}

#[test]
fn failed_image_mount_releases_new_device() {
    if !enabled("failed_image_mount_releases_new_device") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let image = blank_image(dir.path(), "blank.img");

    let result = dispatcher().run(Action::Mount {
        source: image.clone(),
        mount_point: dir.path().join("fw"),
    });
    assert!(
        matches!(result, Err(SysError::Mount { .. })),
        "unexpected result: {result:?}"
    );
    assert_released(&image);
}

#[test]
fn busy_mount_keeps_association() {
    if !enabled("busy_mount_keeps_association") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let mount_point = dir.path().join("fw");
    let dispatcher = dispatcher();

    let device = added_device(
        dispatcher
            .run(Action::Add {
                image: image.clone(),
            })
            .expect("add succeeds"),
    );
    dispatcher
        .run(Action::Mount {
            source: device.clone(),
            mount_point: mount_point.clone(),
        })
        .expect("mount succeeds");

    let held = std::fs::File::create(mount_point.join("held")).expect("open file on mount");
    let result = dispatcher.run(Action::Remove {
        target: device.clone(),
    });
    assert!(
        matches!(result, Err(SysError::Busy { .. })),
        "unexpected result: {result:?}"
    );
    assert_eq!(devices_backed_by(&image), vec![device.clone()]);
    assert_eq!(
        current_mounts().source_at(&mount_point).expect("probe"),
        Some(device.clone())
    );

    drop(held);
    dispatcher
        .run(Action::Remove { target: device })
        .expect("remove succeeds once idle");
    assert_released(&image);
}

#[test]
fn nested_mounts_are_released_innermost_first() {
    if !enabled("nested_mounts_are_released_innermost_first") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let outer = dir.path().join("fw");
    let inner = outer.join("boot");
    let dispatcher = dispatcher();

    let device = added_device(dispatcher.run(Action::Add { image }).expect("add succeeds"));
    dispatcher
        .run(Action::Mount {
            source: device.clone(),
            mount_point: outer.clone(),
        })
        .expect("mount succeeds");
    std::fs::create_dir(&inner).expect("create nested mount point");
    mount(
        Some(outer.as_path()),
        inner.as_path(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .expect("bind mount");

    match dispatcher
        .run(Action::Remove {
            target: device.clone(),
        })
        .expect("remove succeeds")
    {
        Outcome::Removed { unmounted, .. } => assert_eq!(unmounted, vec![inner, outer]),
        other => panic!("expected Removed, got {other:?}"),
    }
}

#[test]
fn foreign_mount_on_top_is_not_unmounted() {
    if !enabled("foreign_mount_on_top_is_not_unmounted") {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let Some(image) = ext2_image(dir.path()) else {
        return;
    };
    let mount_point = dir.path().join("fw");
    let dispatcher = dispatcher();

    let device = added_device(dispatcher.run(Action::Add { image }).expect("add succeeds"));
    dispatcher
        .run(Action::Mount {
            source: device.clone(),
            mount_point: mount_point.clone(),
        })
        .expect("mount succeeds");
    mount(
        Some("unrelated"),
        mount_point.as_path(),
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .expect("mount tmpfs on top");

    let removed = dispatcher.run(Action::Remove {
        target: device.clone(),
    });
    assert!(
        matches!(removed, Err(SysError::Busy { .. })),
        "unexpected result: {removed:?}"
    );
    let unmounted = dispatcher.run(Action::Umount {
        target: device.clone(),
    });
    assert!(
        matches!(unmounted, Err(SysError::Busy { .. })),
        "unexpected result: {unmounted:?}"
    );
    assert_eq!(
        current_mounts().source_at(&mount_point).expect("probe"),
        Some(PathBuf::from("unrelated"))
    );

    umount(mount_point.as_path()).expect("unmount tmpfs");
    dispatcher
        .run(Action::Remove { target: device })
        .expect("remove succeeds once uncovered");
}
