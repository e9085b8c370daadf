//! OVF 1.0 descriptor rendering.
//!
//! The descriptor is fixed apart from a handful of typed values, so it is
//! written element by element rather than through a text template.

use crate::error::Result;
use crate::host::{Clock, FileSystem, IdGenerator};
use crate::vm::info::VmInfo;
use crate::xml::XmlWriter;
use std::path::Path;
use std::sync::Arc;

/// OVF envelope namespace.
pub const OVF_NAMESPACE: &str = "http://schemas.dmtf.org/ovf/envelope/1";

/// Name of the single logical network.
pub const NETWORK_NAME: &str = "VM Network";

/// Hardware family when none is given.
pub const DEFAULT_HARDWARE_VERSION: &str = "vmx-10";

/// Guest OS identifier when none is given.
pub const DEFAULT_OS_TYPE: &str = "otherLinux64Guest";

const NAMESPACES: [(&str, &str); 7] = [
    ("xmlns", OVF_NAMESPACE),
    ("xmlns:cim", "http://schemas.dmtf.org/wbem/wscim/1/common"),
    ("xmlns:ovf", OVF_NAMESPACE),
    (
        "xmlns:rasd",
        "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData",
    ),
    ("xmlns:vmw", "http://www.vmware.com/schema/ovf"),
    (
        "xmlns:vssd",
        "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData",
    ),
    ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
];

const STREAM_OPTIMIZED: &str =
    "http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized";

const MIB: u64 = 1024 * 1024;

/// Values substituted into the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvfTemplateData {
    /// Id linking the disk to its file reference.
    pub file_id: String,
    /// VM name.
    pub vm_name: String,
    /// VM uuid.
    pub vm_id: String,
    /// Disk file name (never a path).
    pub disk_path: String,
    /// Exact disk file size.
    pub disk_size_bytes: u64,
    /// Disk capacity in MiB, rounded up.
    pub disk_size_mb: u64,
    /// Number of vCPUs.
    pub cpu_count: u32,
    /// Memory in MiB.
    pub memory_size_mb: u64,
    /// RFC 3339 render time.
    pub timestamp: String,
    /// Virtual hardware family.
    pub hardware_version: String,
    /// Guest OS identifier.
    pub os_type: String,
}

/// Renders and writes OVF descriptors.
#[derive(Clone)]
pub struct OvfGenerator {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    fs: Arc<dyn FileSystem>,
}

impl OvfGenerator {
    /// Create a generator.
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, fs: Arc<dyn FileSystem>) -> Self {
        Self { clock, ids, fs }
    }

    /// Template values for `vm` with the disk at `disk_path`.
    pub fn template_data(&self, vm: &VmInfo, disk_path: &Path, disk_size_bytes: u64) -> OvfTemplateData {
        let vm_id = if vm.uuid.is_empty() {
            self.ids.next_id()
        } else {
            vm.uuid.clone()
        };
        let memory_size_mb = match vm.memory.size_mb() {
            0 => 1024,
            mb => mb,
        };
        OvfTemplateData {
            file_id: self.ids.next_id(),
            vm_name: vm.name.clone(),
            vm_id,
            disk_path: disk_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            disk_size_bytes,
            disk_size_mb: disk_size_bytes.div_ceil(MIB),
            cpu_count: vm.cpu.count.max(1),
            memory_size_mb,
            timestamp: self.clock.now().to_rfc3339(),
            hardware_version: DEFAULT_HARDWARE_VERSION.to_string(),
            os_type: DEFAULT_OS_TYPE.to_string(),
        }
    }

    /// Render a descriptor for `vm` referencing the disk at `disk_path`.
    pub fn generate(&self, vm: &VmInfo, disk_path: &Path, disk_size_bytes: u64) -> Result<String> {
        render(&self.template_data(vm, disk_path, disk_size_bytes))
    }

    /// Write a descriptor with mode 0644, replacing any existing file.
    pub fn write_to_file(&self, content: &str, path: &Path) -> Result<()> {
        self.fs.write_file(path, content.as_bytes(), 0o644)
    }
}

/// Render the descriptor. Output depends only on `data`.
pub fn render(data: &OvfTemplateData) -> Result<String> {
    let disk_size_bytes = data.disk_size_bytes.to_string();
    let disk_size_mb = data.disk_size_mb.to_string();
    let cpu_count = data.cpu_count.to_string();
    let memory_mb = data.memory_size_mb.to_string();
    let cpu_label = format!("{} virtual CPU(s)", cpu_count);
    let memory_label = format!("{} MB of memory", memory_mb);

    let mut w = XmlWriter::indented(2);
    w.declaration()?;
    w.start_element("Envelope", &NAMESPACES)?;

    w.start_element("References", &[])?;
    w.empty_element(
        "File",
        &[
            ("ovf:href", data.disk_path.as_str()),
            ("ovf:id", data.file_id.as_str()),
            ("ovf:size", disk_size_bytes.as_str()),
        ],
    )?;
    w.end_element("References")?;

    w.start_element("DiskSection", &[])?;
    w.text_element("Info", "Virtual disk information")?;
    w.empty_element(
        "Disk",
        &[
            ("ovf:capacity", disk_size_mb.as_str()),
            ("ovf:capacityAllocationUnits", "byte * 2^20"),
            ("ovf:diskId", "vmdisk1"),
            ("ovf:fileRef", data.file_id.as_str()),
            ("ovf:format", STREAM_OPTIMIZED),
        ],
    )?;
    w.end_element("DiskSection")?;

    w.start_element("NetworkSection", &[])?;
    w.text_element("Info", "The list of logical networks")?;
    w.start_element("Network", &[("ovf:name", NETWORK_NAME)])?;
    w.text_element("Description", "The VM Network network")?;
    w.end_element("Network")?;
    w.end_element("NetworkSection")?;

    w.start_element("VirtualSystem", &[("ovf:id", data.vm_name.as_str())])?;
    w.text_element("Info", "A virtual machine")?;
    w.text_element("Name", &data.vm_name)?;

    w.start_element("OperatingSystemSection", &[("ovf:id", data.os_type.as_str())])?;
    w.text_element("Info", "The kind of installed guest operating system")?;
    w.text_element("Description", "Linux")?;
    w.end_element("OperatingSystemSection")?;

    w.start_element("VirtualHardwareSection", &[])?;
    w.text_element("Info", "Virtual hardware requirements")?;
    w.start_element("System", &[])?;
    w.text_element("vssd:ElementName", "Virtual Hardware Family")?;
    w.text_element("vssd:InstanceID", "0")?;
    w.text_element("vssd:VirtualSystemIdentifier", &data.vm_name)?;
    w.text_element("vssd:VirtualSystemType", &data.hardware_version)?;
    w.end_element("System")?;

    item(
        &mut w,
        &[
            ("AllocationUnits", "hertz * 10^6"),
            ("Description", "Number of Virtual CPUs"),
            ("ElementName", cpu_label.as_str()),
            ("InstanceID", "1"),
            ("ResourceType", "3"),
            ("VirtualQuantity", cpu_count.as_str()),
        ],
    )?;
    item(
        &mut w,
        &[
            ("AllocationUnits", "byte * 2^20"),
            ("Description", "Memory Size"),
            ("ElementName", memory_label.as_str()),
            ("InstanceID", "2"),
            ("ResourceType", "4"),
            ("VirtualQuantity", memory_mb.as_str()),
        ],
    )?;
    item(
        &mut w,
        &[
            ("Address", "0"),
            ("Description", "SCSI Controller"),
            ("ElementName", "SCSI controller 0"),
            ("InstanceID", "3"),
            ("ResourceSubType", "lsilogic"),
            ("ResourceType", "6"),
        ],
    )?;
    item(
        &mut w,
        &[
            ("AddressOnParent", "0"),
            ("ElementName", "Hard disk 1"),
            ("HostResource", "ovf:/disk/vmdisk1"),
            ("InstanceID", "4"),
            ("Parent", "3"),
            ("ResourceType", "17"),
        ],
    )?;
    item(
        &mut w,
        &[
            ("AddressOnParent", "7"),
            ("AutomaticAllocation", "true"),
            ("Connection", NETWORK_NAME),
            ("Description", "E1000 Network Adapter"),
            ("ElementName", "Network adapter 1"),
            ("InstanceID", "5"),
            ("ResourceSubType", "E1000"),
            ("ResourceType", "10"),
        ],
    )?;
    w.end_element("VirtualHardwareSection")?;

    w.start_element("ProductSection", &[])?;
    w.text_element("Info", "Information about the installed software")?;
    w.text_element("Product", &data.vm_name)?;
    w.text_element("Vendor", "kvmgr")?;
    w.text_element("Version", crate::VERSION)?;
    w.text_element("FullVersion", &format!("{} exported {}", crate::VERSION, data.timestamp))?;
    w.end_element("ProductSection")?;

    w.end_element("VirtualSystem")?;
    w.end_element("Envelope")?;
    w.into_string()
}

/// One `<Item>` of `rasd:` properties.
fn item(w: &mut XmlWriter, properties: &[(&str, &str)]) -> Result<()> {
    w.start_element("Item", &[])?;
    for (name, value) in properties {
        w.text_element(&format!("rasd:{}", name), value)?;
    }
    w.end_element("Item")
}
