//! Checks of the settings shared by nodes and role defaults.
use indexmap::IndexMap;
use serde_json::Value;

use crate::{
    config::{NetworkInterface, NodeConfigs},
    patch::{self, shape},
    synthesis::template,
    validation::{Kind, Report, Validator, labels, syntax},
};

/// Positions of every non-empty name, in order of first appearance.
pub(super) fn group_by_name<'a>(names: impl Iterator<Item = &'a str>) -> IndexMap<&'a str, Vec<usize>> {
    let mut groups: IndexMap<&str, Vec<usize>> = IndexMap::new();
    for (index, name) in names.enumerate() {
        let name = name.trim();
        if !name.is_empty() {
            groups.entry(name).or_default().push(index);
        }
    }
    groups
}

/// Reports one issue per name used more than once, pointing at its second occurrence.
fn check_duplicates<'a>(
    names: impl Iterator<Item = &'a str>,
    list: &Validator<'_>,
    name_field: Option<&str>,
    kind: Kind,
    what: &str,
    report: &mut Report,
) {
    for (name, indices) in group_by_name(names) {
        if let [first, second, ..] = indices[..] {
            let item = list.index(second);
            let message = format!("{what} {name:?} is declared more than once (first at index {first})");
            match name_field {
                Some(field) => report.report(&item.field(field), kind, message),
                None => report.report(&item, kind, message),
            }
        }
    }
}

pub(super) fn check_node_configs(configs: &NodeConfigs, validator: &Validator<'_>, report: &mut Report) {
    check_install_disk(configs, validator, report);
    check_network(configs, validator, report);
    check_metadata(configs, validator, report);
    check_patches(configs, validator, report);

    let cert_sans = validator.field("certSANs");
    for (index, san) in configs.cert_sans.iter().enumerate() {
        if let Err(error) = syntax::is_address(san) {
            report.report(
                &cert_sans.index(index),
                Kind::InvalidAddress,
                format!("certificate SAN {san:?} {error}"),
            );
        }
    }

    let kernel_modules = validator.field("kernelModules");
    for (index, module) in configs.kernel_modules.iter().enumerate() {
        if module.name.trim().is_empty() {
            report.report(
                &kernel_modules.index(index).field("name"),
                Kind::Required,
                "a kernel module name is required",
            );
        }
    }
    check_duplicates(
        configs.kernel_modules.iter().map(|module| module.name.as_str()),
        &kernel_modules,
        Some("name"),
        Kind::DuplicateKernelModule,
        "kernel module",
        report,
    );

    let volumes = validator.field("volumes");
    for (index, volume) in configs.volumes.iter().enumerate() {
        if volume.name.trim().is_empty() {
            report.report(
                &volumes.index(index).field("name"),
                Kind::Required,
                "a volume name is required",
            );
        }
    }
    check_duplicates(
        configs.volumes.iter().map(|volume| volume.name.as_str()),
        &volumes,
        Some("name"),
        Kind::DuplicateVolume,
        "volume",
        report,
    );

    if let Some(schematic) = &configs.schematic {
        let schematic_field = validator.field("schematic");
        let customization = schematic_field.field("customization");
        let system_extensions = customization.field("systemExtensions");
        check_duplicates(
            schematic
                .customization
                .system_extensions
                .official_extensions
                .iter()
                .map(String::as_str),
            &system_extensions.field("officialExtensions"),
            None,
            Kind::DuplicateExtension,
            "system extension",
            report,
        );
    }

    let machine_files = validator.field("machineFiles");
    for (index, file) in configs.machine_files.iter().enumerate() {
        if file.path.trim().is_empty() {
            report.report(
                &machine_files.index(index).field("path"),
                Kind::Required,
                "a machine file path is required",
            );
        }
    }
}

fn check_install_disk(configs: &NodeConfigs, validator: &Validator<'_>, report: &mut Report) {
    if let Some(disk) = &configs.install_disk {
        if !disk.starts_with("/dev/") {
            report.report(
                &validator.field("installDisk"),
                Kind::InvalidInstallTarget,
                format!("install disk {disk:?} must be a device path like /dev/sda"),
            );
        }
    }

    let machine_disks = validator.field("machineDisks");
    for (index, disk) in configs.machine_disks.iter().enumerate() {
        if !disk.device.starts_with("/dev/") {
            report.report(
                &machine_disks.index(index).field("device"),
                Kind::InvalidInstallTarget,
                format!("machine disk {device:?} must be a device path", device = disk.device),
            );
        }
    }
}

/// The aggregate (bond or bridge) claiming an interface as its member.
struct Claim {
    aggregate: &'static str,
    owner: String,
}

fn check_network(configs: &NodeConfigs, validator: &Validator<'_>, report: &mut Report) {
    let interfaces = validator.field("networkInterfaces");
    let mut claims: IndexMap<&str, Claim> = IndexMap::new();

    for (index, interface) in configs.network_interfaces.iter().enumerate() {
        let item = interfaces.index(index);
        check_interface_addresses(interface, &item, report);

        if interface.bond.is_some() && interface.bridge.is_some() {
            report.report(
                &item,
                Kind::InterfaceConflict,
                format!(
                    "interface {name} can not be both a bond and a bridge",
                    name = interface.display_name(index)
                ),
            );
        }

        let members = [
            ("bond", interface.bond.as_ref().map(|bond| &bond.interfaces)),
            ("bridge", interface.bridge.as_ref().map(|bridge| &bridge.interfaces)),
        ];
        for (aggregate, member_list) in members {
            let Some(member_list) = member_list else {
                continue;
            };
            let aggregate_field = item.field(aggregate);
            let members_field = aggregate_field.field("interfaces");
            let owner = interface.display_name(index);

            for member in member_list {
                match claims.get(member.as_str()) {
                    Some(previous) if previous.aggregate == aggregate && previous.owner == owner => {}
                    Some(previous) => report.report(
                        &members_field,
                        Kind::InterfaceConflict,
                        format!(
                            "interface {member} is a member of {previous_aggregate} {previous_owner} \
                             and of {aggregate} {owner}",
                            previous_aggregate = previous.aggregate,
                            previous_owner = previous.owner,
                        ),
                    ),
                    None => {
                        claims.insert(member.as_str(), Claim {
                            aggregate,
                            owner: owner.clone(),
                        });
                    }
                }
            }
        }
    }

    let nameservers = validator.field("nameservers");
    for (index, nameserver) in configs.nameservers.iter().enumerate() {
        if let Err(error) = syntax::is_ip_address(nameserver) {
            report.report(
                &nameservers.index(index),
                Kind::InvalidAddress,
                format!("nameserver {nameserver:?} {error}"),
            );
        }
    }
}

fn check_interface_addresses(interface: &NetworkInterface, item: &Validator<'_>, report: &mut Report) {
    let addresses = item.field("addresses");
    for (index, address) in interface.addresses.iter().enumerate() {
        if let Err(error) = syntax::is_interface_address(address) {
            report.report(
                &addresses.index(index),
                Kind::InvalidCidr,
                format!("address {address:?} {error}"),
            );
        }
    }

    let routes = item.field("routes");
    for (index, route) in interface.routes.iter().enumerate() {
        let route_item = routes.index(index);
        if let Some(network) = &route.network {
            if let Err(error) = syntax::is_route_network(network) {
                report.report(
                    &route_item.field("network"),
                    Kind::InvalidCidr,
                    format!("route network {network:?} {error}"),
                );
            }
        }
        if let Some(gateway) = &route.gateway {
            if let Err(error) = syntax::is_ip_address(gateway) {
                report.report(
                    &route_item.field("gateway"),
                    Kind::InvalidAddress,
                    format!("gateway {gateway:?} {error}"),
                );
            }
        }
    }

    let vlans = item.field("vlans");
    for (index, vlan) in interface.vlans.iter().enumerate() {
        let vlan_addresses = vlans.index(index);
        let vlan_addresses = vlan_addresses.field("addresses");
        for (address_index, address) in vlan.addresses.iter().enumerate() {
            if let Err(error) = syntax::is_interface_address(address) {
                report.report(
                    &vlan_addresses.index(address_index),
                    Kind::InvalidCidr,
                    format!("address {address:?} {error}"),
                );
            }
        }
    }
}

fn check_metadata(configs: &NodeConfigs, validator: &Validator<'_>, report: &mut Report) {
    for (field, entries, is_label) in [
        ("nodeLabels", &configs.node_labels, true),
        ("nodeAnnotations", &configs.node_annotations, false),
    ] {
        let map = validator.field(field);
        for (key, value) in entries {
            let entry = map.key(key);
            if let Err(error) = labels::check_key(key) {
                report.report(&entry, Kind::InvalidLabel, error.to_string());
            }

            if template::is_template(value) {
                if let Err(error) = template::check(value) {
                    report.report(&entry, Kind::InvalidTemplate, error.to_string());
                }
            } else if is_label {
                if let Err(error) = labels::check_label_value(value) {
                    report.report(&entry, Kind::InvalidLabel, error.to_string());
                }
            }
        }
    }

    let taints = validator.field("nodeTaints");
    for (key, value) in &configs.node_taints {
        let entry = taints.key(key);
        if let Err(error) = labels::check_key(key) {
            report.report(&entry, Kind::InvalidLabel, error.to_string());
        }
        if let Err(error) = labels::check_taint(value) {
            report.report(&entry, Kind::InvalidLabel, error.to_string());
        }
    }
}

fn check_patches(configs: &NodeConfigs, validator: &Validator<'_>, report: &mut Report) {
    let inline_patch = validator.field("inlinePatch");
    if !configs.inline_patch.is_empty() {
        report.report(
            &inline_patch,
            Kind::Deprecated,
            "inlinePatch is deprecated, use patches instead",
        );
    }
    for (index, patch) in configs.inline_patch.iter().enumerate() {
        if !patch.is_object() {
            report.report(
                &inline_patch.index(index),
                Kind::InvalidPatch,
                "an inline merge patch must be a mapping",
            );
        }
    }

    let config_patches = validator.field("configPatches");
    if !configs.config_patches.is_empty() {
        report.report(
            &config_patches,
            Kind::Deprecated,
            "configPatches is deprecated, use patches instead",
        );
    }
    for (index, operation) in configs.config_patches.iter().enumerate() {
        if let Err(error) = shape::check_operation(operation) {
            report.report(&config_patches.index(index), Kind::InvalidPatch, error.to_string());
        }
    }

    let patches = validator.field("patches");
    for (index, reference) in configs.patches.iter().enumerate() {
        // File references are checked once they are read
        let patch::Reference::Inline(text) = patch::Reference::parse(reference) else {
            continue;
        };

        let item = patches.index(index);
        match serde_yaml::from_str::<Value>(text) {
            Err(error) => report.report(
                &item,
                Kind::InvalidPatch,
                format!("inline patch is not valid YAML: {error}"),
            ),
            Ok(Value::Array(operations)) => {
                for (operation_index, error) in shape::check_all(&operations) {
                    report.report(&item.index(operation_index), Kind::InvalidPatch, error.to_string());
                }
            }
            Ok(_) => {}
        }
    }
}
