// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! First-boot configuration rendering
//!
//! Each VM gets two cloud-init documents: an instance metadata document
//! (hostname, instance id, static network configuration, disk auto-grow
//! policy) and a `#cloud-config` user-data document (admin user, SSH key,
//! passwordless sudo, package list).
//!
//! Rendering is a pure function of the VM spec and the fleet-wide guest
//! parameters: identical inputs always produce byte-identical output.
//! The documents are built as typed structures and serialized with
//! `serde_yaml`, so values containing YAML metacharacters are quoted by
//! the serializer rather than spliced into a template string.  Missing or
//! malformed inputs fail with [`TemplateError`] before any provider call
//! is made.

use flotilla_common::fleet::CommonParams;
use flotilla_common::fleet::VmSpec;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Guest NIC name configured by the metadata document.  Clones of the
/// hardware-version-aligned template always enumerate their first vNIC
/// under this name.
const GUEST_NIC: &str = "ens192";

/// Number of DNS servers the metadata document requires.
const DNS_SERVER_COUNT: usize = 2;

/// Shell assigned to the admin user.
const ADMIN_SHELL: &str = "/bin/bash";

/// Boot-document rendering failed.  Raised pre-flight, before any remote
/// mutation.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum TemplateError {
    #[error("expected exactly 2 dns servers, found {found}")]
    DnsServerCount { found: usize },

    #[error("guest parameter {field:?} must not be empty")]
    EmptyField { field: &'static str },

    #[error("cannot parse {field:?} value {value:?} as an IPv4 address")]
    BadAddress { field: &'static str, value: String },

    #[error("serializing {document} document: {message}")]
    Serialize { document: &'static str, message: String },
}

/// Instance metadata document
#[derive(Debug, Deserialize, Serialize)]
struct Metadata {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: String,
    network: NetworkConfig,
    growpart: Growpart,
}

/// Network configuration in netplan-compatible "version 2" form
#[derive(Debug, Deserialize, Serialize)]
struct NetworkConfig {
    version: u32,
    ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Debug, Deserialize, Serialize)]
struct Ethernet {
    addresses: Vec<String>,
    gateway4: String,
    nameservers: Nameservers,
}

#[derive(Debug, Deserialize, Serialize)]
struct Nameservers {
    search: Vec<String>,
    addresses: Vec<String>,
}

/// Root filesystem auto-grow policy: always grow to fill the disk size
/// requested by the VM spec.
#[derive(Debug, Deserialize, Serialize)]
struct Growpart {
    mode: String,
    devices: Vec<String>,
}

/// User configuration document (serialized under a `#cloud-config` header)
#[derive(Debug, Deserialize, Serialize)]
struct UserConfig {
    users: Vec<User>,
    packages: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct User {
    name: String,
    ssh_authorized_keys: Vec<String>,
    sudo: String,
    shell: String,
}

/// The rendered per-VM boot documents, as plain YAML text
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootDocuments {
    pub metadata: String,
    pub user_data: String,
}

/// How an encoded document's content is encoded.  The marker travels with
/// the blob so the provider never has to guess.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Base64,
}

/// An opaque, encoded document blob handed to the provider adapter
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EncodedDocument {
    pub content: String,
    pub encoding: Encoding,
}

impl EncodedDocument {
    fn base64(plaintext: &str) -> EncodedDocument {
        use base64::Engine;
        EncodedDocument {
            content: base64::engine::general_purpose::STANDARD
                .encode(plaintext),
            encoding: Encoding::Base64,
        }
    }
}

/// Boot documents in the encoded form the provider consumes
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EncodedBootDocuments {
    pub metadata: EncodedDocument,
    pub user_data: EncodedDocument,
}

impl BootDocuments {
    /// Encode both documents for the provider boundary.
    pub fn encode(&self) -> EncodedBootDocuments {
        EncodedBootDocuments {
            metadata: EncodedDocument::base64(&self.metadata),
            user_data: EncodedDocument::base64(&self.user_data),
        }
    }
}

fn nonempty(
    field: &'static str,
    value: &str,
) -> Result<(), TemplateError> {
    if value.is_empty() {
        return Err(TemplateError::EmptyField { field });
    }
    Ok(())
}

fn parse_addr(
    field: &'static str,
    value: &str,
) -> Result<Ipv4Addr, TemplateError> {
    value.parse().map_err(|_| TemplateError::BadAddress {
        field,
        value: value.to_string(),
    })
}

fn to_yaml<T: Serialize>(
    document: &'static str,
    value: &T,
) -> Result<String, TemplateError> {
    serde_yaml::to_string(value).map_err(|error| TemplateError::Serialize {
        document,
        message: error.to_string(),
    })
}

/// Render both boot documents for one VM.
///
/// Pure and deterministic.  All input checking happens here so that a
/// malformed fleet document fails before the first provider call.
pub fn render(
    key: &str,
    spec: &VmSpec,
    common: &CommonParams,
) -> Result<BootDocuments, TemplateError> {
    if common.dns_servers.len() != DNS_SERVER_COUNT {
        return Err(TemplateError::DnsServerCount {
            found: common.dns_servers.len(),
        });
    }
    nonempty("ssh_username", &common.ssh_username)?;
    nonempty("ssh_public_key", &common.ssh_public_key)?;
    nonempty("search_domain", &common.search_domain)?;
    let gateway = parse_addr("gateway", &common.gateway)?;
    let address = parse_addr("ipv4_address", &spec.ipv4_address)?;
    for server in &common.dns_servers {
        parse_addr("dns_servers", server)?;
    }

    let metadata = Metadata {
        instance_id: key.to_string(),
        local_hostname: spec.name.clone(),
        network: NetworkConfig {
            version: 2,
            ethernets: BTreeMap::from([(
                GUEST_NIC.to_string(),
                Ethernet {
                    addresses: vec![format!(
                        "{}/{}",
                        address, common.prefix_len
                    )],
                    gateway4: gateway.to_string(),
                    nameservers: Nameservers {
                        search: vec![common.search_domain.clone()],
                        addresses: common.dns_servers.clone(),
                    },
                },
            )]),
        },
        growpart: Growpart {
            mode: "auto".to_string(),
            devices: vec!["/".to_string()],
        },
    };

    let user_config = UserConfig {
        users: vec![User {
            name: common.ssh_username.clone(),
            ssh_authorized_keys: vec![common.ssh_public_key.clone()],
            sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
            shell: ADMIN_SHELL.to_string(),
        }],
        packages: common.packages.clone(),
    };

    Ok(BootDocuments {
        metadata: to_yaml("metadata", &metadata)?,
        user_data: format!(
            "#cloud-config\n{}",
            to_yaml("user-data", &user_config)?
        ),
    })
}
