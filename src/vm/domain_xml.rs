//! Libvirt domain XML.

use crate::error::{Error, Result};
use crate::vm::info::{CpuInfo, DiskInfo, MemoryInfo, NetInfo, VmInfo};
use crate::vm::params::VmParams;
use crate::xml::{parse_dom, XmlNode, XmlWriter};
use std::path::Path;

/// Render a KVM domain definition for `params`.
///
/// The disk is attached as `vda` on virtio and the optional cloud-init seed as
/// a read-only sata cdrom.
pub fn render_domain(params: &VmParams, disk_path: &Path, cloud_init_iso: Option<&Path>) -> Result<String> {
    let memory_mib = (params.memory.size_bytes / (1024 * 1024)).to_string();
    let vcpus = params.cpu.count.to_string();
    let disk_path = disk_path.display().to_string();
    let net_kind = params.network.kind.as_deref().unwrap_or("network");
    let net_source = params.network.source.as_deref().unwrap_or("default");
    let net_model = params.network.model.as_deref().unwrap_or("virtio");
    let source_attr = if net_kind == "bridge" { "bridge" } else { "network" };

    let mut w = XmlWriter::indented(2);
    w.start_element("domain", &[("type", "kvm")])?;
    w.text_element("name", &params.name)?;
    if !params.description.is_empty() {
        w.text_element("description", &params.description)?;
    }
    w.text_element_with_attrs("memory", &memory_mib, &[("unit", "MiB")])?;
    w.text_element_with_attrs("currentMemory", &memory_mib, &[("unit", "MiB")])?;
    w.text_element_with_attrs("vcpu", &vcpus, &[("placement", "static")])?;

    w.start_element("os", &[])?;
    w.text_element_with_attrs("type", "hvm", &[("arch", "x86_64")])?;
    w.empty_element("boot", &[("dev", "hd")])?;
    w.end_element("os")?;

    w.start_element("features", &[])?;
    w.empty_element("acpi", &[])?;
    w.empty_element("apic", &[])?;
    w.end_element("features")?;

    match params.cpu.model.as_str() {
        "" | "host-model" => w.empty_element("cpu", &[("mode", "host-model")])?,
        "host-passthrough" => w.empty_element("cpu", &[("mode", "host-passthrough")])?,
        model => {
            w.start_element("cpu", &[("mode", "custom"), ("match", "exact")])?;
            w.text_element("model", model)?;
            w.end_element("cpu")?;
        }
    }

    w.text_element("on_poweroff", "destroy")?;
    w.text_element("on_reboot", "restart")?;
    w.text_element("on_crash", "destroy")?;

    w.start_element("devices", &[])?;

    w.start_element("disk", &[("type", "file"), ("device", "disk")])?;
    w.empty_element("driver", &[("name", "qemu"), ("type", params.disk_format().as_str())])?;
    w.empty_element("source", &[("file", disk_path.as_str())])?;
    w.empty_element("target", &[("dev", "vda"), ("bus", "virtio")])?;
    w.end_element("disk")?;

    if let Some(iso) = cloud_init_iso {
        let iso = iso.display().to_string();
        w.start_element("disk", &[("type", "file"), ("device", "cdrom")])?;
        w.empty_element("driver", &[("name", "qemu"), ("type", "raw")])?;
        w.empty_element("source", &[("file", iso.as_str())])?;
        w.empty_element("target", &[("dev", "sda"), ("bus", "sata")])?;
        w.empty_element("readonly", &[])?;
        w.end_element("disk")?;
    }

    w.start_element("interface", &[("type", net_kind)])?;
    w.empty_element("source", &[(source_attr, net_source)])?;
    w.empty_element("model", &[("type", net_model)])?;
    w.end_element("interface")?;

    w.start_element("serial", &[("type", "pty")])?;
    w.empty_element("target", &[("port", "0")])?;
    w.end_element("serial")?;
    w.start_element("console", &[("type", "pty")])?;
    w.empty_element("target", &[("type", "serial"), ("port", "0")])?;
    w.end_element("console")?;

    w.end_element("devices")?;
    w.end_element("domain")?;
    w.into_string()
}

/// Parse `virsh dumpxml` output. The power state is not part of the
/// definition and is left at its default.
pub fn parse_domain(xml: &str) -> Result<VmInfo> {
    let dom = parse_dom(xml)?;
    if dom.name != "domain" {
        return Err(Error::Xml(format!("expected <domain>, found <{}>", dom.name)));
    }

    let name = text_of(&dom, "name");
    if name.is_empty() {
        return Err(Error::Xml("domain has no name".to_string()));
    }

    let memory = dom
        .child("memory")
        .map(|m| MemoryInfo {
            size_bytes: scale(m.text.trim().parse().unwrap_or(0), m.attr("unit").unwrap_or("KiB")),
        })
        .unwrap_or_default();

    let mut cpu = CpuInfo {
        count: dom
            .child("vcpu")
            .and_then(|v| v.text.trim().parse().ok())
            .unwrap_or(1),
        ..CpuInfo::default()
    };
    if let Some(node) = dom.child("cpu") {
        cpu.model = node
            .child("model")
            .map(|m| m.text.trim().to_string())
            .filter(|m| !m.is_empty())
            .or_else(|| node.attr("mode").map(str::to_string))
            .unwrap_or_default();
        if let Some(topology) = node.child("topology") {
            cpu.sockets = topology.attr("sockets").and_then(|v| v.parse().ok());
            cpu.cores = topology.attr("cores").and_then(|v| v.parse().ok());
            cpu.threads = topology.attr("threads").and_then(|v| v.parse().ok());
        }
    }

    let mut disks = Vec::new();
    let mut networks = Vec::new();
    if let Some(devices) = dom.child("devices") {
        disks = devices
            .children_named("disk")
            .filter(|d| d.attr("device").unwrap_or("disk") == "disk")
            .map(parse_disk)
            .collect();
        networks = devices.children_named("interface").map(parse_interface).collect();
    }

    Ok(VmInfo {
        name,
        uuid: text_of(&dom, "uuid"),
        status: Default::default(),
        cpu,
        memory,
        disks,
        networks,
        description: text_of(&dom, "description"),
    })
}

fn parse_disk(disk: &XmlNode) -> DiskInfo {
    let source = disk.child("source");
    let attr = |name: &str| {
        source
            .and_then(|s| s.attr(name))
            .unwrap_or_default()
            .to_string()
    };
    let path = match attr("file") {
        p if p.is_empty() => attr("dev"),
        p => p,
    };
    let mut volume_name = attr("volume");
    if volume_name.is_empty() {
        volume_name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    let target = disk.child("target");

    DiskInfo {
        path,
        storage_pool: attr("pool"),
        volume_name,
        format: disk
            .child("driver")
            .and_then(|d| d.attr("type"))
            .unwrap_or("raw")
            .to_string(),
        size_bytes: 0,
        bus: target.and_then(|t| t.attr("bus")).unwrap_or_default().to_string(),
        device: target.and_then(|t| t.attr("dev")).unwrap_or_default().to_string(),
    }
}

fn parse_interface(iface: &XmlNode) -> NetInfo {
    let kind = iface.attr("type").unwrap_or("network").to_string();
    let source = iface
        .child("source")
        .and_then(|s| s.attr("network").or_else(|| s.attr("bridge")))
        .unwrap_or_default()
        .to_string();
    NetInfo {
        kind,
        source,
        mac: iface
            .child("mac")
            .and_then(|m| m.attr("address"))
            .unwrap_or_default()
            .to_string(),
        model: iface
            .child("model")
            .and_then(|m| m.attr("type"))
            .unwrap_or_default()
            .to_string(),
    }
}

fn text_of(node: &XmlNode, child: &str) -> String {
    node.child(child)
        .map(|n| n.text.trim().to_string())
        .unwrap_or_default()
}

/// Convert a libvirt memory quantity to bytes.
fn scale(value: u64, unit: &str) -> u64 {
    let factor: u64 = match unit {
        "b" | "bytes" => 1,
        "KB" => 1000,
        "k" | "KiB" => 1024,
        "MB" => 1000 * 1000,
        "M" | "MiB" => 1024 * 1024,
        "GB" => 1000 * 1000 * 1000,
        "G" | "GiB" => 1024 * 1024 * 1024,
        _ => 1024,
    };
    value.saturating_mul(factor)
}
