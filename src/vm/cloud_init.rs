//! Cloud-init NoCloud seed generation.
//!
//! Documents supplied by the caller are used verbatim; missing ones are
//! rendered from defaults with `serde_yaml`. The seed ISO is built by
//! `genisoimage`, or `mkisofs` where that is not installed.

use crate::command::{CommandOptions, CommandRunner};
use crate::error::{Error, Result};
use crate::vm::params::VmParams;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Volume id cloud-init's NoCloud datasource looks for.
pub const VOLUME_ID: &str = "cidata";

const ISO_TOOLS: [&str; 2] = ["genisoimage", "mkisofs"];

/// The three NoCloud documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInitConfig {
    /// `user-data`.
    pub user_data: String,
    /// `meta-data`.
    pub meta_data: String,
    /// `network-config`.
    pub network_config: String,
}

#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    users: Vec<User<'a>>,
    packages: [&'static str; 1],
    runcmd: [&'static str; 1],
}

#[derive(Serialize)]
struct User<'a> {
    name: &'static str,
    groups: &'static str,
    shell: &'static str,
    sudo: [&'static str; 1],
    #[serde(skip_serializing_if = "no_keys")]
    ssh_authorized_keys: &'a [String],
}

#[derive(Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

#[derive(Serialize)]
struct NetworkConfig {
    version: u8,
    ethernets: std::collections::BTreeMap<&'static str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    #[serde(rename = "match")]
    matcher: Match,
    dhcp4: bool,
    dhcp6: bool,
}

#[derive(Serialize)]
struct Match {
    name: &'static str,
}

/// Renders cloud-init documents and builds seed ISOs.
#[derive(Clone)]
pub struct CloudInitBuilder {
    runner: Arc<dyn CommandRunner>,
}

impl CloudInitBuilder {
    /// Create a builder that shells out through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Documents for `params`, defaulting whatever the caller left empty.
    pub fn generate(&self, params: &VmParams) -> Result<CloudInitConfig> {
        let provided = &params.cloud_init;
        let user_data = if provided.user_data.is_empty() {
            default_user_data(params)?
        } else {
            provided.user_data.clone()
        };
        let meta_data = if provided.meta_data.is_empty() {
            to_yaml(&MetaData {
                instance_id: &params.name,
                local_hostname: &params.name,
            })?
        } else {
            provided.meta_data.clone()
        };
        let network_config = if provided.network_config.is_empty() {
            default_network_config()?
        } else {
            provided.network_config.clone()
        };
        tracing::debug!(vm_name = %params.name, "generated cloud-init documents");
        Ok(CloudInitConfig {
            user_data,
            meta_data,
            network_config,
        })
    }

    /// Write `config` into a seed ISO at `output`.
    pub async fn build_iso(
        &self,
        cancel: &CancellationToken,
        config: &CloudInitConfig,
        output: &Path,
    ) -> Result<()> {
        let staging = tempfile::Builder::new().prefix("cloud-init-").tempdir()?;
        for (name, content) in [
            ("user-data", &config.user_data),
            ("meta-data", &config.meta_data),
            ("network-config", &config.network_config),
        ] {
            std::fs::write(staging.path().join(name), content)?;
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let args: Vec<String> = vec![
            "-output".into(),
            output.display().to_string(),
            "-volid".into(),
            VOLUME_ID.into(),
            "-joliet".into(),
            "-rock".into(),
            staging.path().display().to_string(),
        ];
        let options = CommandOptions {
            combined_output: true,
            ..CommandOptions::default()
        };

        for tool in ISO_TOOLS {
            match self.runner.run(cancel, tool, &args, &options).await {
                Ok(_) => {
                    tracing::info!(output = %output.display(), tool, "generated cloud-init iso");
                    return Ok(());
                }
                Err(Error::CommandNotFound(_)) => {
                    tracing::debug!(tool, "iso tool not installed");
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => return Err(Error::CloudInit(format!("generating iso: {}", e))),
            }
        }
        Err(Error::CloudInit(
            "neither genisoimage nor mkisofs found".to_string(),
        ))
    }
}

fn no_keys(keys: &&[String]) -> bool {
    keys.is_empty()
}

fn default_user_data(params: &VmParams) -> Result<String> {
    let doc = UserData {
        hostname: &params.name,
        users: vec![User {
            name: "cloud-user",
            groups: "sudo",
            shell: "/bin/bash",
            sudo: ["ALL=(ALL) NOPASSWD:ALL"],
            ssh_authorized_keys: &params.cloud_init.ssh_keys,
        }],
        packages: ["qemu-guest-agent"],
        runcmd: ["systemctl enable --now qemu-guest-agent"],
    };
    Ok(format!("#cloud-config\n{}", to_yaml(&doc)?))
}

fn default_network_config() -> Result<String> {
    let mut ethernets = std::collections::BTreeMap::new();
    ethernets.insert(
        "all-en",
        Ethernet {
            matcher: Match { name: "en*" },
            dhcp4: true,
            dhcp6: false,
        },
    );
    to_yaml(&NetworkConfig {
        version: 2,
        ethernets,
    })
}

fn to_yaml<T: Serialize>(doc: &T) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|e| Error::CloudInit(e.to_string()))
}
