//! Libvirt object model and driver.
//!
//! `LibvirtDriver` is the seam between handlers and the synchronous
//! `virt` client: every call is offloaded to `spawn_blocking` so the
//! async handlers never block the runtime on libvirt RPC. A production
//! implementation (`Connection`) wraps a real `virt::connect::Connect`;
//! an in-memory `FakeDriver` backs unit tests without a hypervisor.

pub mod guest_agent;
pub mod objects;

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use virt::connect::Connect;
use virt::domain::Domain as VirtDomain;
use virt::network::Network as VirtNetwork;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{ApiError, ApiResult};

/// Coarse instance-facing state, after collapsing libvirt's full state
/// space per the mapping in the instance lifecycle design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Stopping,
    Stopped,
    Opaque,
}

impl DomainState {
    pub fn from_libvirt(state: u32) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::Stopping,
            sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Stopped,
            _ => DomainState::Opaque,
        }
    }

    pub fn as_aws_str(&self) -> &'static str {
        match self {
            DomainState::Running => "running",
            DomainState::Stopping => "stopping",
            DomainState::Stopped => "stopped",
            DomainState::Opaque => "pending",
        }
    }
}

/// The driver seam handlers depend on. Implementations must serialize
/// their own access to the underlying connection; callers don't lock.
#[async_trait]
pub trait LibvirtDriver: Send + Sync {
    async fn domain_xml(&self, name: &str) -> ApiResult<String>;
    async fn domain_state(&self, name: &str) -> ApiResult<DomainState>;
    async fn list_domain_names(&self) -> ApiResult<Vec<String>>;
    async fn volume_xml(&self, pool: &str, name: &str) -> ApiResult<String>;
    async fn list_volume_names(&self, pool: &str) -> ApiResult<Vec<String>>;
    async fn network_xml(&self, name: &str) -> ApiResult<String>;

    /// `virt-clone --original=<image> --name=<id> --auto-clone`, followed
    /// by `virt-sysprep` to reset host identity, then autostart + create.
    async fn clone_and_start_domain(&self, image: &str, new_id: &str) -> ApiResult<()>;

    /// `virt-clone --original=<source> --name=<new_name> --auto-clone`
    /// only: registers a new domain as an image template without
    /// sysprepping or starting it.
    async fn clone_domain_template(&self, source: &str, new_name: &str) -> ApiResult<()>;

    async fn shutdown_domain(&self, name: &str) -> ApiResult<()>;
    async fn destroy_and_undefine_domain(&self, name: &str) -> ApiResult<()>;

    /// Undefines a domain without destroying it first; callers must
    /// verify it is inactive.
    async fn undefine_domain(&self, name: &str) -> ApiResult<()>;

    async fn create_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> ApiResult<()>;
    async fn delete_volume(&self, pool: &str, name: &str) -> ApiResult<()>;
    async fn attach_disk(&self, domain: &str, pool: &str, volume: &str, device: &str) -> ApiResult<()>;
    async fn detach_disk(&self, domain: &str, device: &str) -> ApiResult<()>;

    /// Apply one command/section libvirt network-update operation,
    /// honoring the pre-7.2.0 argument-order quirk internally.
    async fn network_update(&self, network: &str, command: u32, section: u32, xml: &str) -> ApiResult<()>;

    /// `guest-exec` / `guest-exec-status` passthrough (see `guest_agent`).
    async fn qemu_agent_command(&self, domain: &str, command_json: &str) -> ApiResult<String>;
}

/// Production driver backed by a real libvirt connection.
pub struct Connection {
    uri: String,
    inner: StdMutex<Connect>,
    lib_version: u64,
}

impl Connection {
    pub fn open(uri: &str) -> ApiResult<Self> {
        let conn = Connect::open(Some(uri)).map_err(ApiError::internal)?;
        let lib_version = conn.get_lib_version().map_err(ApiError::internal)?;
        Ok(Connection { uri: uri.to_string(), inner: StdMutex::new(conn), lib_version })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> ApiResult<T>) -> ApiResult<T> {
        let guard = self.inner.lock().unwrap();
        f(&guard)
    }
}

#[async_trait]
impl LibvirtDriver for Connection {
    #[instrument(skip(self))]
    async fn domain_xml(&self, name: &str) -> ApiResult<String> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &name)
                .map_err(|_| ApiError::InstanceNotFound(name.clone()))?;
            domain.get_xml_desc(0).map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn domain_state(&self, name: &str) -> ApiResult<DomainState> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &name)
                .map_err(|_| ApiError::InstanceNotFound(name.clone()))?;
            let (state, _reason) = domain.get_state().map_err(ApiError::internal)?;
            Ok(DomainState::from_libvirt(state))
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn list_domain_names(&self) -> ApiResult<Vec<String>> {
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<Vec<String>> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            conn.list_all_domains(0)
                .map_err(ApiError::internal)?
                .iter()
                .map(|d| d.get_name().map_err(ApiError::internal))
                .collect()
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> ApiResult<String> {
        let pool = pool.to_string();
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let sp = virt::storage_pool::StoragePool::lookup_by_name(&conn, &pool).map_err(ApiError::internal)?;
            let vol = StorageVol::lookup_by_name(&sp, &name).map_err(|_| ApiError::VolumeNotFound(name.clone()))?;
            vol.get_xml_desc(0).map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn list_volume_names(&self, pool: &str) -> ApiResult<Vec<String>> {
        let pool = pool.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<Vec<String>> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let sp = virt::storage_pool::StoragePool::lookup_by_name(&conn, &pool).map_err(ApiError::internal)?;
            sp.list_volumes().map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn network_xml(&self, name: &str) -> ApiResult<String> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let net = VirtNetwork::lookup_by_name(&conn, &name).map_err(ApiError::internal)?;
            net.get_xml_desc(0).map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    #[instrument(skip(self))]
    async fn clone_and_start_domain(&self, image: &str, new_id: &str) -> ApiResult<()> {
        let image = image.to_string();
        let new_id = new_id.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let status = Command::new("virt-clone")
                .arg(format!("--connect={uri}"))
                .arg(format!("--original={image}"))
                .arg(format!("--name={new_id}"))
                .arg("--auto-clone")
                .status()
                .map_err(ApiError::internal)?;
            if !status.success() {
                return Err(ApiError::internal(format!("virt-clone exited with {status}")));
            }

            let status = Command::new("virt-sysprep")
                .arg(format!("--connect={uri}"))
                .arg("-d")
                .arg(&new_id)
                .arg("--hostname")
                .arg(&new_id)
                .arg("--operation")
                .arg("defaults,-ssh-userdir,-ssh-hostkeys")
                .status()
                .map_err(ApiError::internal)?;
            if !status.success() {
                return Err(ApiError::internal(format!("virt-sysprep exited with {status}")));
            }

            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &new_id).map_err(ApiError::internal)?;
            domain.set_autostart(true).map_err(ApiError::internal)?;
            domain.create().map_err(ApiError::internal)?;
            Ok(())
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn clone_domain_template(&self, source: &str, new_name: &str) -> ApiResult<()> {
        let source = source.to_string();
        let new_name = new_name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let status = Command::new("virt-clone")
                .arg(format!("--connect={uri}"))
                .arg(format!("--original={source}"))
                .arg(format!("--name={new_name}"))
                .arg("--auto-clone")
                .status()
                .map_err(ApiError::internal)?;
            if !status.success() {
                return Err(ApiError::internal(format!("virt-clone exited with {status}")));
            }
            Ok(())
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn shutdown_domain(&self, name: &str) -> ApiResult<()> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &name)
                .map_err(|_| ApiError::InstanceNotFound(name.clone()))?;
            domain.shutdown().map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn destroy_and_undefine_domain(&self, name: &str) -> ApiResult<()> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &name)
                .map_err(|_| ApiError::InstanceNotFound(name.clone()))?;
            if domain.is_active().unwrap_or(false) {
                domain.destroy().map_err(ApiError::internal)?;
            }
            domain.undefine().map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn undefine_domain(&self, name: &str) -> ApiResult<()> {
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let domain = VirtDomain::lookup_by_name(&conn, &name)
                .map_err(|_| ApiError::InstanceNotFound(name.clone()))?;
            domain.undefine().map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn create_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> ApiResult<()> {
        let pool = pool.to_string();
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let sp = virt::storage_pool::StoragePool::lookup_by_name(&conn, &pool).map_err(ApiError::internal)?;
            let xml = format!(
                "<volume>\n  <name>{name}</name>\n  <capacity unit='bytes'>{capacity_bytes}</capacity>\n  \
                 <target>\n    <format type='qcow2'/>\n    <compat>1.1</compat>\n    <features><lazy_refcounts/></features>\n  </target>\n</volume>",
            );
            StorageVol::create_xml(&sp, &xml, sys::VIR_STORAGE_VOL_CREATE_PREALLOC_METADATA)
                .map_err(ApiError::internal)?;
            Ok(())
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> ApiResult<()> {
        let pool = pool.to_string();
        let name = name.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let sp = virt::storage_pool::StoragePool::lookup_by_name(&conn, &pool).map_err(ApiError::internal)?;
            let vol = StorageVol::lookup_by_name(&sp, &name).map_err(|_| ApiError::VolumeNotFound(name.clone()))?;
            vol.delete(0).map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn attach_disk(&self, domain: &str, pool: &str, volume: &str, device: &str) -> ApiResult<()> {
        let domain = domain.to_string();
        let pool = pool.to_string();
        let volume = volume.to_string();
        let device = device.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let dom = VirtDomain::lookup_by_name(&conn, &domain)
                .map_err(|_| ApiError::InstanceNotFound(domain.clone()))?;
            let xml = format!(
                "<disk type='volume' device='disk'>\n  <source pool='{pool}' volume='{volume}'/>\n  \
                 <target dev='{device}' bus='virtio'/>\n</disk>",
            );
            dom.attach_device_flags(
                &xml,
                sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG,
            )
            .map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn detach_disk(&self, domain: &str, device: &str) -> ApiResult<()> {
        let domain = domain.to_string();
        let device = device.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let dom = VirtDomain::lookup_by_name(&conn, &domain)
                .map_err(|_| ApiError::InstanceNotFound(domain.clone()))?;
            let xml = dom.get_xml_desc(0).map_err(ApiError::internal)?;
            let dev_xml = objects::Domain::from_xml(&xml)?
                .disks
                .into_iter()
                .find(|d| d.device == device)
                .map(|d| format!(
                    "<disk type='volume' device='disk'>\n  <source pool='{}' volume='{}'/>\n  <target dev='{}' bus='virtio'/>\n</disk>",
                    d.pool, d.volume, d.device,
                ))
                .ok_or_else(|| ApiError::AttachmentNotFound(device.clone()))?;
            dom.detach_device_flags(
                &dev_xml,
                sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG,
            )
            .map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn network_update(&self, network: &str, command: u32, section: u32, xml: &str) -> ApiResult<()> {
        let network = network.to_string();
        let xml = xml.to_string();
        let uri = self.uri.clone();
        let lib_version = self.lib_version;
        tokio::task::spawn_blocking(move || -> ApiResult<()> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let net = VirtNetwork::lookup_by_name(&conn, &network).map_err(ApiError::internal)?;
            // Pre-7.2.0 libvirt swaps the (command, section) argument order.
            if lib_version < 7_002_000 {
                net.update(section, command, -1, &xml, 0).map_err(ApiError::internal)
            } else {
                net.update(command, section, -1, &xml, 0).map_err(ApiError::internal)
            }
        })
        .await
        .map_err(ApiError::internal)?
    }

    async fn qemu_agent_command(&self, domain: &str, command_json: &str) -> ApiResult<String> {
        let domain = domain.to_string();
        let command_json = command_json.to_string();
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || -> ApiResult<String> {
            let conn = Connect::open(Some(&uri)).map_err(ApiError::internal)?;
            let dom = VirtDomain::lookup_by_name(&conn, &domain)
                .map_err(|_| ApiError::InstanceNotFound(domain.clone()))?;
            debug!(%command_json, "dispatching qemu-agent command");
            dom.qemu_agent_command(&command_json, 10, 0).map_err(ApiError::internal)
        })
        .await
        .map_err(ApiError::internal)?
    }
}

/// In-memory stand-in used by tests: domains/volumes/networks are plain
/// strings keyed by name, and guest-agent commands are answered by a
/// caller-supplied closure table rather than a real agent.
#[derive(Default)]
pub struct FakeDriver {
    pub domains: Mutex<HashMap<String, (String, DomainState)>>,
    pub volumes: Mutex<HashMap<(String, String), String>>,
    pub networks: Mutex<HashMap<String, String>>,
    pub agent_responses: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LibvirtDriver for FakeDriver {
    async fn domain_xml(&self, name: &str) -> ApiResult<String> {
        self.domains
            .lock()
            .await
            .get(name)
            .map(|(xml, _)| xml.clone())
            .ok_or_else(|| ApiError::InstanceNotFound(name.to_string()))
    }

    async fn domain_state(&self, name: &str) -> ApiResult<DomainState> {
        self.domains
            .lock()
            .await
            .get(name)
            .map(|(_, state)| *state)
            .ok_or_else(|| ApiError::InstanceNotFound(name.to_string()))
    }

    async fn list_domain_names(&self) -> ApiResult<Vec<String>> {
        Ok(self.domains.lock().await.keys().cloned().collect())
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> ApiResult<String> {
        self.volumes
            .lock()
            .await
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::VolumeNotFound(name.to_string()))
    }

    async fn list_volume_names(&self, pool: &str) -> ApiResult<Vec<String>> {
        Ok(self
            .volumes
            .lock()
            .await
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn network_xml(&self, name: &str) -> ApiResult<String> {
        self.networks.lock().await.get(name).cloned().ok_or_else(|| ApiError::internal("unknown network"))
    }

    async fn clone_and_start_domain(&self, image: &str, new_id: &str) -> ApiResult<()> {
        let xml = format!(
            "<domain type='kvm'>\n  <name>{new_id}</name>\n  <devices>\n    <disk type='volume' device='disk'>\n      \
             <source pool='default' volume='{new_id}.qcow2'/>\n      <target dev='vdb' bus='virtio'/>\n    </disk>\n  </devices>\n</domain>"
        );
        let _ = image;
        self.domains.lock().await.insert(new_id.to_string(), (xml, DomainState::Running));
        Ok(())
    }

    async fn clone_domain_template(&self, source: &str, new_name: &str) -> ApiResult<()> {
        let xml = format!("<domain type='kvm'>\n  <name>{new_name}</name>\n  <devices/>\n</domain>");
        let _ = source;
        self.domains.lock().await.insert(new_name.to_string(), (xml, DomainState::Stopped));
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> ApiResult<()> {
        let mut domains = self.domains.lock().await;
        let (xml, state) = domains.get(name).cloned().ok_or_else(|| ApiError::InstanceNotFound(name.to_string()))?;
        let _ = state;
        domains.insert(name.to_string(), (xml, DomainState::Stopped));
        Ok(())
    }

    async fn destroy_and_undefine_domain(&self, name: &str) -> ApiResult<()> {
        self.domains.lock().await.remove(name);
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> ApiResult<()> {
        self.domains
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::InstanceNotFound(name.to_string()))
    }

    async fn create_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> ApiResult<()> {
        let xml = format!(
            "<volume>\n  <name>{name}</name>\n  <capacity unit='bytes'>{capacity_bytes}</capacity>\n  \
             <target><path>/var/lib/libvirt/images/{pool}/{name}</path></target>\n</volume>"
        );
        self.volumes.lock().await.insert((pool.to_string(), name.to_string()), xml);
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> ApiResult<()> {
        self.volumes.lock().await.remove(&(pool.to_string(), name.to_string()));
        Ok(())
    }

    async fn attach_disk(&self, _domain: &str, _pool: &str, _volume: &str, _device: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn detach_disk(&self, _domain: &str, _device: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn network_update(&self, _network: &str, _command: u32, _section: u32, _xml: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn qemu_agent_command(&self, _domain: &str, _command_json: &str) -> ApiResult<String> {
        let mut responses = self.agent_responses.lock().await;
        if responses.is_empty() {
            return Err(ApiError::internal("no queued fake agent response"));
        }
        Ok(responses.remove(0))
    }
}
