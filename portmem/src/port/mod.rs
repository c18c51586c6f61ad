//! Shared-memory-resident port records and the user handles applications
//! mutate them through.
//!
//! Every record lives inside a pool slot in the broker segment and is read
//! concurrently by other processes. Mutable fields are therefore individual
//! atomics with a single designated writer: applications own their intent
//! flags (`connect_requested`, `offering_requested`, the tombstone), the
//! Port Manager owns everything derived (`connection_state`, client counts).
//! Identity fields are written once at allocation, before the slot is
//! published, and never change afterwards.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::core::MAX_NAME_LENGTH;
use crate::errors::PortmemError;

/// Fixed-capacity inline string, safe to place in shared memory.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct IdString {
    len: u8,
    bytes: [u8; MAX_NAME_LENGTH],
}

impl IdString {
    pub const fn empty() -> IdString {
        IdString {
            len: 0,
            bytes: [0; MAX_NAME_LENGTH],
        }
    }

    pub fn new(s: &str) -> Result<IdString, PortmemError> {
        if s.len() > MAX_NAME_LENGTH {
            return Err(PortmemError::NameTooLong {
                len: s.len(),
                max: MAX_NAME_LENGTH,
            });
        }
        let mut bytes = [0u8; MAX_NAME_LENGTH];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(IdString {
            len: s.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for IdString {
    fn eq(&self, other: &IdString) -> bool {
        self.bytes[..self.len as usize] == other.bytes[..other.len as usize]
    }
}

impl Eq for IdString {}

impl fmt::Debug for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for IdString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a port offers or requests: service, instance and event name.
/// Immutable once a port is created; compared for equality during matching.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct ServiceDescription {
    pub service: IdString,
    pub instance: IdString,
    pub event: IdString,
}

impl ServiceDescription {
    pub const fn empty() -> ServiceDescription {
        ServiceDescription {
            service: IdString::empty(),
            instance: IdString::empty(),
            event: IdString::empty(),
        }
    }

    pub fn new(service: &str, instance: &str, event: &str) -> Result<ServiceDescription, PortmemError> {
        Ok(ServiceDescription {
            service: IdString::new(service)?,
            instance: IdString::new(instance)?,
            event: IdString::new(event)?,
        })
    }
}

impl fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

/// Producer-side behavior when the receive queue of the peer is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QueueFullPolicy {
    #[default]
    DiscardOldestData = 0,
    BlockProducer = 1,
}

/// Consumer-side behavior when production outruns consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConsumerTooSlowPolicy {
    #[default]
    DiscardOldestData = 0,
    WaitForConsumer = 1,
}

/// Connection progress of a client port. Written exclusively by the
/// discovery pass; applications only read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    NotConnected = 0,
    WaitForOffer = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            1 => ConnectionState::WaitForOffer,
            2 => ConnectionState::Connected,
            _ => ConnectionState::NotConnected,
        }
    }
}

/// Association with the payload memory segment a port allocates chunks from.
/// Opaque to the broker; handed through to the chunk sender configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct MemoryManagerHandle(pub u32);

/// Role-specific extra configuration, forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct PortConfigInfo {
    pub device_id: u32,
    pub memory_type: u32,
}

/// Receive-queue configuration for the chunk transport layer. The broker
/// initializes it and never touches the queue itself.
#[derive(Debug)]
#[repr(C)]
pub struct ChunkReceiverData {
    queue_capacity: u64,
    queue_full_policy: QueueFullPolicy,
}

impl ChunkReceiverData {
    fn new(queue_capacity: u64, queue_full_policy: QueueFullPolicy) -> ChunkReceiverData {
        ChunkReceiverData {
            queue_capacity,
            queue_full_policy,
        }
    }

    pub fn queue_capacity(&self) -> u64 {
        self.queue_capacity
    }

    pub fn queue_full_policy(&self) -> QueueFullPolicy {
        self.queue_full_policy
    }
}

/// Send-side configuration for the chunk transport layer.
#[derive(Debug)]
#[repr(C)]
pub struct ChunkSenderData {
    memory_manager: MemoryManagerHandle,
    config_info: PortConfigInfo,
    consumer_too_slow_policy: ConsumerTooSlowPolicy,
}

impl ChunkSenderData {
    fn new(
        memory_manager: MemoryManagerHandle,
        config_info: PortConfigInfo,
        consumer_too_slow_policy: ConsumerTooSlowPolicy,
    ) -> ChunkSenderData {
        ChunkSenderData {
            memory_manager,
            config_info,
            consumer_too_slow_policy,
        }
    }

    pub fn memory_manager(&self) -> MemoryManagerHandle {
        self.memory_manager
    }

    pub fn config_info(&self) -> PortConfigInfo {
        self.config_info
    }

    pub fn consumer_too_slow_policy(&self) -> ConsumerTooSlowPolicy {
        self.consumer_too_slow_policy
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub response_queue_capacity: u64,
    pub node_name: IdString,
    pub connect_on_create: bool,
    pub response_queue_full_policy: QueueFullPolicy,
    pub server_too_slow_policy: ConsumerTooSlowPolicy,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            response_queue_capacity: 16,
            node_name: IdString::empty(),
            connect_on_create: true,
            response_queue_full_policy: QueueFullPolicy::default(),
            server_too_slow_policy: ConsumerTooSlowPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub request_queue_capacity: u64,
    pub node_name: IdString,
    pub offer_on_create: bool,
    pub request_queue_full_policy: QueueFullPolicy,
    pub client_too_slow_policy: ConsumerTooSlowPolicy,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            request_queue_capacity: 16,
            node_name: IdString::empty(),
            offer_on_create: true,
            request_queue_full_policy: QueueFullPolicy::default(),
            client_too_slow_policy: ConsumerTooSlowPolicy::default(),
        }
    }
}

/// Client-side port record.
#[repr(C)]
pub struct ClientPortData {
    service_description: ServiceDescription,
    runtime_name: IdString,
    node_name: IdString,
    to_be_destroyed: AtomicBool,
    connect_requested: AtomicBool,
    connection_state: AtomicU8,
    chunk_receiver: ChunkReceiverData,
    chunk_sender: ChunkSenderData,
}

impl ClientPortData {
    pub(crate) fn new(
        service_description: &ServiceDescription,
        options: &ClientOptions,
        runtime_name: &IdString,
        memory_manager: MemoryManagerHandle,
        config_info: PortConfigInfo,
    ) -> ClientPortData {
        ClientPortData {
            service_description: *service_description,
            runtime_name: *runtime_name,
            node_name: options.node_name,
            to_be_destroyed: AtomicBool::new(false),
            connect_requested: AtomicBool::new(options.connect_on_create),
            connection_state: AtomicU8::new(ConnectionState::NotConnected as u8),
            chunk_receiver: ChunkReceiverData::new(
                options.response_queue_capacity,
                options.response_queue_full_policy,
            ),
            chunk_sender: ChunkSenderData::new(
                memory_manager,
                config_info,
                options.server_too_slow_policy,
            ),
        }
    }

    pub fn service_description(&self) -> &ServiceDescription {
        &self.service_description
    }

    pub fn runtime_name(&self) -> &IdString {
        &self.runtime_name
    }

    pub fn node_name(&self) -> &IdString {
        &self.node_name
    }

    pub fn is_to_be_destroyed(&self) -> bool {
        self.to_be_destroyed.load(Ordering::Acquire)
    }

    pub fn connect_requested(&self) -> bool {
        self.connect_requested.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state as u8, Ordering::Release);
    }

    pub fn chunk_receiver(&self) -> &ChunkReceiverData {
        &self.chunk_receiver
    }

    pub fn chunk_sender(&self) -> &ChunkSenderData {
        &self.chunk_sender
    }
}

impl Default for ClientPortData {
    fn default() -> ClientPortData {
        ClientPortData::new(
            &ServiceDescription::empty(),
            &ClientOptions::default(),
            &IdString::empty(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        )
    }
}

/// Server-side port record.
#[repr(C)]
pub struct ServerPortData {
    service_description: ServiceDescription,
    runtime_name: IdString,
    node_name: IdString,
    to_be_destroyed: AtomicBool,
    offering_requested: AtomicBool,
    connected_clients: AtomicU32,
    chunk_receiver: ChunkReceiverData,
    chunk_sender: ChunkSenderData,
}

impl ServerPortData {
    pub(crate) fn new(
        service_description: &ServiceDescription,
        options: &ServerOptions,
        runtime_name: &IdString,
        memory_manager: MemoryManagerHandle,
        config_info: PortConfigInfo,
    ) -> ServerPortData {
        ServerPortData {
            service_description: *service_description,
            runtime_name: *runtime_name,
            node_name: options.node_name,
            to_be_destroyed: AtomicBool::new(false),
            offering_requested: AtomicBool::new(options.offer_on_create),
            connected_clients: AtomicU32::new(0),
            chunk_receiver: ChunkReceiverData::new(
                options.request_queue_capacity,
                options.request_queue_full_policy,
            ),
            chunk_sender: ChunkSenderData::new(
                memory_manager,
                config_info,
                options.client_too_slow_policy,
            ),
        }
    }

    pub fn service_description(&self) -> &ServiceDescription {
        &self.service_description
    }

    pub fn runtime_name(&self) -> &IdString {
        &self.runtime_name
    }

    pub fn node_name(&self) -> &IdString {
        &self.node_name
    }

    pub fn is_to_be_destroyed(&self) -> bool {
        self.to_be_destroyed.load(Ordering::Acquire)
    }

    pub fn offering_requested(&self) -> bool {
        self.offering_requested.load(Ordering::Acquire)
    }

    pub fn has_clients(&self) -> bool {
        self.connected_clients.load(Ordering::Acquire) > 0
    }

    pub(crate) fn reset_connected_clients(&self) {
        self.connected_clients.store(0, Ordering::Release);
    }

    pub(crate) fn add_connected_client(&self) {
        self.connected_clients.fetch_add(1, Ordering::AcqRel);
    }

    pub fn chunk_receiver(&self) -> &ChunkReceiverData {
        &self.chunk_receiver
    }

    pub fn chunk_sender(&self) -> &ChunkSenderData {
        &self.chunk_sender
    }
}

impl Default for ServerPortData {
    fn default() -> ServerPortData {
        ServerPortData::new(
            &ServiceDescription::empty(),
            &ServerOptions::default(),
            &IdString::empty(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        )
    }
}

/// Application-side view of one client port. Only toggles the holder's own
/// intent flags; reaching `Connected` is the discovery pass's job.
#[derive(Clone, Copy)]
pub struct ClientPortUser<'a> {
    data: &'a ClientPortData,
}

impl<'a> ClientPortUser<'a> {
    pub fn new(data: &'a ClientPortData) -> ClientPortUser<'a> {
        ClientPortUser { data }
    }

    pub fn connect(&self) {
        self.data.connect_requested.store(true, Ordering::Release);
    }

    pub fn disconnect(&self) {
        self.data.connect_requested.store(false, Ordering::Release);
    }

    /// Marks the port for destruction. Idempotent; storage is reclaimed by a
    /// later discovery pass, never here.
    pub fn destroy(&self) {
        self.data.to_be_destroyed.store(true, Ordering::Release);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.data.connection_state()
    }

    pub fn service_description(&self) -> &ServiceDescription {
        self.data.service_description()
    }
}

/// Application-side view of one server port.
#[derive(Clone, Copy)]
pub struct ServerPortUser<'a> {
    data: &'a ServerPortData,
}

impl<'a> ServerPortUser<'a> {
    pub fn new(data: &'a ServerPortData) -> ServerPortUser<'a> {
        ServerPortUser { data }
    }

    pub fn offer(&self) {
        self.data.offering_requested.store(true, Ordering::Release);
    }

    pub fn stop_offer(&self) {
        self.data.offering_requested.store(false, Ordering::Release);
    }

    /// Marks the port for destruction. Idempotent.
    pub fn destroy(&self) {
        self.data.to_be_destroyed.store(true, Ordering::Release);
    }

    pub fn is_offering(&self) -> bool {
        self.data.offering_requested()
    }

    /// True iff at least one client was `Connected` against this server in
    /// the last matching pass.
    pub fn has_clients(&self) -> bool {
        self.data.has_clients()
    }

    pub fn service_description(&self) -> &ServiceDescription {
        self.data.service_description()
    }
}
