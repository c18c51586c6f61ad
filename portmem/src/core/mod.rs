//! Broker segment layout and shared-memory contexts.
//!
//! The daemon creates one segment holding the port pools; applications
//! attach to it read-mostly. Pool capacities are build-time constants so the
//! whole layout is a single `#[repr(C)]` value with a fixed size.

use std::mem;
use std::ptr;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::PortmemError;
use crate::pool::PortPool;
use crate::port::{ClientPortData, ServerPortData};

pub const MAX_CLIENT_PORTS: usize = 256;
pub const MAX_SERVER_PORTS: usize = 64;
pub const MAX_NAME_LENGTH: usize = 100;

pub static SHMEM_FILE_NAME: &str = "portmem-broker";

const SEGMENT_MAGIC: u32 = 0x504f_5254; // "PORT"
const SEGMENT_VERSION: u32 = 1;

/// Root of the shared segment: identity header plus the port pools.
#[repr(C)]
pub struct BrokerSegment {
    magic: u32,
    version: u32,
    pub client_ports: PortPool<ClientPortData, MAX_CLIENT_PORTS>,
    pub server_ports: PortPool<ServerPortData, MAX_SERVER_PORTS>,
}

impl BrokerSegment {
    fn vacant() -> BrokerSegment {
        BrokerSegment {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            client_ports: PortPool::new(),
            server_ports: PortPool::new(),
        }
    }

    /// Heap-backed segment for tests and single-process embedding.
    pub fn boxed() -> Box<BrokerSegment> {
        Box::new(BrokerSegment::vacant())
    }

    fn is_compatible(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.version == SEGMENT_VERSION
    }
}

/// Where the broker segment link lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub shmem_file_name: String,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            data_dir: "/dev/shm".to_string(),
            shmem_file_name: SHMEM_FILE_NAME.to_string(),
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder::default()
    }

    fn flink(&self) -> String {
        format!("{}/{}", self.data_dir, self.shmem_file_name)
    }
}

#[derive(Debug, Default)]
pub struct ShmemConfigBuilder {
    data_dir: Option<String>,
    shmem_file_name: Option<String>,
}

impl ShmemConfigBuilder {
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> ShmemConfigBuilder {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn shmem_file_name(mut self, name: impl Into<String>) -> ShmemConfigBuilder {
        self.shmem_file_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<ShmemConfig, PortmemError> {
        let data_dir = self
            .data_dir
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| PortmemError::Config("data_dir must be set".to_string()))?;
        let shmem_file_name = self
            .shmem_file_name
            .unwrap_or_else(|| SHMEM_FILE_NAME.to_string());
        Ok(ShmemConfig {
            data_dir,
            shmem_file_name,
        })
    }
}

/// Owned mapping of the broker segment.
pub struct SharedSegment {
    shmem: Shmem,
}

impl SharedSegment {
    pub fn segment(&self) -> &BrokerSegment {
        // The mapping is at least size_of::<BrokerSegment>() bytes and was
        // either initialized by daemon_context or validated on attach.
        unsafe { &*(self.shmem.as_ptr() as *const BrokerSegment) }
    }
}

/// Creates the broker segment, or attaches if the link already exists. The
/// daemon calls this once at startup, before any application attaches.
pub fn daemon_context(cfg: &ShmemConfig) -> Result<SharedSegment, PortmemError> {
    let size = mem::size_of::<BrokerSegment>();
    match ShmemConf::new().size(size).flink(cfg.flink()).create() {
        Ok(shmem) => {
            unsafe { ptr::write(shmem.as_ptr() as *mut BrokerSegment, BrokerSegment::vacant()) };
            Ok(SharedSegment { shmem })
        }
        Err(ShmemError::LinkExists) => attach(cfg),
        Err(e) => Err(e.into()),
    }
}

/// Attaches to an existing broker segment. Never creates one.
pub fn app_context(cfg: &ShmemConfig) -> Result<SharedSegment, PortmemError> {
    attach(cfg)
}

fn attach(cfg: &ShmemConfig) -> Result<SharedSegment, PortmemError> {
    let shmem = ShmemConf::new().flink(cfg.flink()).open()?;
    if shmem.len() < mem::size_of::<BrokerSegment>() {
        return Err(PortmemError::IncompatibleSegment);
    }
    let mapping = SharedSegment { shmem };
    if !mapping.segment().is_compatible() {
        return Err(PortmemError::IncompatibleSegment);
    }
    Ok(mapping)
}
