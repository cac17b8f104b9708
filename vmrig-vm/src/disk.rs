//! Disk device assignment
//!
//! Disks without an explicit device get the next free `prefix + letter`
//! (`vda`, `vdb`, ...). Assignment only depends on the ordered input and the
//! set of devices already taken, so resolving the same list twice gives the
//! same result.

use std::collections::{BTreeMap, HashMap, HashSet};

use vmrig_core::error::{VmrigError, VmrigResult};
use vmrig_core::types::DiskSpec;

/// Letters available per prefix
pub const MAX_DEVICES_PER_PREFIX: usize = 26;

/// Assigns device identifiers within one prefix namespace
#[derive(Debug, Clone)]
pub struct DiskDeviceResolver {
    prefix: String,
    /// Next letter to try; never moves backwards
    offset: usize,
}

impl DiskDeviceResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            offset: 0,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Assign devices to every disk lacking one.
    ///
    /// `existing` holds devices already present on the machine; they are
    /// never handed out again.
    pub fn resolve(
        &mut self,
        disks: &[DiskSpec],
        existing: &BTreeMap<String, DiskSpec>,
    ) -> VmrigResult<Vec<DiskSpec>> {
        check_duplicates(disks)?;

        let mut taken: HashSet<String> = existing.keys().cloned().collect();
        taken.extend(disks.iter().filter_map(|disk| disk.device.clone()));

        let mut resolved = Vec::with_capacity(disks.len());
        for disk in disks {
            let mut disk = disk.clone();
            if disk.device.is_none() {
                let device = self.next_device(&taken)?;
                taken.insert(device.clone());
                disk.device = Some(device);
            }
            resolved.push(disk);
        }
        Ok(resolved)
    }

    fn next_device(&mut self, taken: &HashSet<String>) -> VmrigResult<String> {
        while self.offset < MAX_DEVICES_PER_PREFIX {
            let letter = char::from(b'a' + self.offset as u8);
            self.offset += 1;
            let candidate = format!("{}{}", self.prefix, letter);
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(VmrigError::NoDeviceAvailable {
            prefix: self.prefix.clone(),
        })
    }
}

/// Reject two disks explicitly declaring the same device
pub fn check_duplicates(disks: &[DiskSpec]) -> VmrigResult<()> {
    let mut seen: HashMap<&str, &DiskSpec> = HashMap::new();
    for disk in disks {
        let Some(device) = disk.device.as_deref() else {
            continue;
        };
        if let Some(first) = seen.insert(device, disk) {
            return Err(VmrigError::DuplicateDiskDevice {
                device: device.to_string(),
                first: first.to_string(),
                second: disk.to_string(),
            });
        }
    }
    Ok(())
}

/// Resolve a mixed-bus disk list, one resolver per bus prefix.
///
/// Output order matches input order.
pub fn resolve_by_bus(
    disks: &[DiskSpec],
    existing: &BTreeMap<String, DiskSpec>,
) -> VmrigResult<Vec<DiskSpec>> {
    check_duplicates(disks)?;

    let mut groups: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
    for (index, disk) in disks.iter().enumerate() {
        groups
            .entry(disk.bus.device_prefix())
            .or_default()
            .push(index);
    }

    // Explicit devices on other buses still occupy their names.
    let mut taken = existing.clone();
    for disk in disks {
        if let Some(device) = &disk.device {
            taken.insert(device.clone(), disk.clone());
        }
    }

    let mut resolved: Vec<Option<DiskSpec>> = vec![None; disks.len()];
    for (prefix, indexes) in groups {
        let group: Vec<DiskSpec> = indexes.iter().map(|&i| disks[i].clone()).collect();
        let mut resolver = DiskDeviceResolver::new(prefix);
        for (index, disk) in indexes.into_iter().zip(resolver.resolve(&group, &taken)?) {
            resolved[index] = Some(disk);
        }
    }

    resolved
        .into_iter()
        .map(|disk| disk.ok_or_else(|| VmrigError::internal("disk left unresolved")))
        .collect()
}

/// Devices of the existing disk set keyed by device name
pub fn existing_devices<'a>(disks: impl IntoIterator<Item = &'a DiskSpec>) -> BTreeMap<String, DiskSpec> {
    disks
        .into_iter()
        .filter_map(|disk| disk.device.clone().map(|device| (device, disk.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vmrig_core::types::DiskBus;

    fn devices(disks: &[DiskSpec]) -> Vec<String> {
        disks
            .iter()
            .map(|d| d.device.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_sequential_assignment() {
        let disks = vec![DiskSpec::named("a"), DiskSpec::named("b")];
        let resolved = DiskDeviceResolver::new("vd")
            .resolve(&disks, &BTreeMap::new())
            .unwrap();
        assert_eq!(devices(&resolved), vec!["vda", "vdb"]);
        assert_eq!(resolved[0].name.as_deref(), Some("a"));
        assert_eq!(resolved[1].name.as_deref(), Some("b"));
    }

    #[test]
    fn test_skips_explicit_and_existing() {
        let disks = vec![
            DiskSpec::named("a"),
            DiskSpec::named("b").with_device("vdb"),
            DiskSpec::named("c"),
        ];
        let existing = existing_devices(&[DiskSpec::named("root").with_device("vda")]);
        let resolved = DiskDeviceResolver::new("vd")
            .resolve(&disks, &existing)
            .unwrap();
        assert_eq!(devices(&resolved), vec!["vdc", "vdb", "vdd"]);
    }

    #[test]
    fn test_duplicate_device_names_both_disks() {
        let disks = vec![
            DiskSpec::named("first").with_device("vda"),
            DiskSpec::named("second").with_device("vda"),
        ];
        let err = DiskDeviceResolver::new("vd")
            .resolve(&disks, &BTreeMap::new())
            .unwrap_err();
        match &err {
            VmrigError::DuplicateDiskDevice {
                device,
                first,
                second,
            } => {
                assert_eq!(device, "vda");
                assert!(first.contains("first"));
                assert!(second.contains("second"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_configuration());
    }

    #[test]
    fn test_exhaustion() {
        let disks: Vec<DiskSpec> = (0..27).map(|i| DiskSpec::named(format!("d{i}"))).collect();
        let err = DiskDeviceResolver::new("vd")
            .resolve(&disks, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, VmrigError::NoDeviceAvailable { ref prefix } if prefix == "vd"));
    }

    #[test]
    fn test_offset_is_monotonic_within_resolver() {
        let mut resolver = DiskDeviceResolver::new("vd");
        let first = resolver
            .resolve(&[DiskSpec::named("a")], &BTreeMap::new())
            .unwrap();
        let second = resolver
            .resolve(&[DiskSpec::named("b")], &BTreeMap::new())
            .unwrap();
        assert_eq!(devices(&first), vec!["vda"]);
        assert_eq!(devices(&second), vec!["vdb"]);
    }

    #[test]
    fn test_prefix_independence() {
        let existing = existing_devices(&[
            DiskSpec::named("v").with_device("vda"),
            DiskSpec::named("s").with_device("sda"),
        ]);
        let disks = vec![DiskSpec::named("a"), DiskSpec::named("b")];

        let sd = DiskDeviceResolver::new("sd")
            .resolve(&disks, &existing)
            .unwrap();
        assert_eq!(devices(&sd), vec!["sdb", "sdc"]);

        let vd = DiskDeviceResolver::new("vd")
            .resolve(&disks, &existing)
            .unwrap();
        assert_eq!(devices(&vd), vec!["vdb", "vdc"]);
    }

    #[test]
    fn test_resolve_by_bus_keeps_order() {
        let disks = vec![
            DiskSpec::named("root"),
            DiskSpec::named("scsi").with_bus(DiskBus::Scsi),
            DiskSpec::named("data"),
            DiskSpec::named("ide").with_bus(DiskBus::Ide),
        ];
        let resolved = resolve_by_bus(&disks, &BTreeMap::new()).unwrap();
        assert_eq!(devices(&resolved), vec!["vda", "sda", "vdb", "hda"]);
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(count in 0usize..=26, prefix in "(vd|sd|hd)") {
            let disks: Vec<DiskSpec> = (0..count).map(|i| DiskSpec::named(format!("d{i}"))).collect();
            let first = DiskDeviceResolver::new(prefix.clone()).resolve(&disks, &BTreeMap::new()).unwrap();
            let second = DiskDeviceResolver::new(prefix.clone()).resolve(&disks, &BTreeMap::new()).unwrap();
            prop_assert_eq!(&first, &second);

            let unique: HashSet<_> = devices(&first).into_iter().collect();
            prop_assert_eq!(unique.len(), count);
            for device in devices(&first) {
                prop_assert!(device.starts_with(&prefix));
            }
        }

        #[test]
        fn prop_never_emits_other_prefix(taken in proptest::collection::btree_set(0u8..26, 0..10)) {
            let existing: BTreeMap<String, DiskSpec> = taken
                .iter()
                .flat_map(|&i| {
                    let letter = char::from(b'a' + i);
                    [format!("vd{letter}"), format!("sd{letter}")]
                })
                .map(|device| (device.clone(), DiskSpec::named("existing").with_device(device)))
                .collect();
            let disks = vec![DiskSpec::named("new")];
            let resolved = DiskDeviceResolver::new("sd").resolve(&disks, &existing).unwrap();
            let device = resolved[0].device.clone().unwrap();
            prop_assert!(device.starts_with("sd"));
            prop_assert!(!existing.contains_key(&device));
        }
    }
}
