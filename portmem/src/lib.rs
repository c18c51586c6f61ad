mod core;
pub mod errors;
pub mod manager;
pub mod pool;
pub mod port;

pub use crate::core::{
    app_context, daemon_context, BrokerSegment, SharedSegment, ShmemConfig, ShmemConfigBuilder,
    MAX_CLIENT_PORTS, MAX_NAME_LENGTH, MAX_SERVER_PORTS, SHMEM_FILE_NAME,
};
pub use crate::errors::{ErrorSink, Fault, LogSink, PortPoolError, PortmemError, Severity};
pub use crate::manager::PortManager;
pub use crate::port::{
    ClientOptions, ClientPortData, ClientPortUser, ConnectionState, ConsumerTooSlowPolicy,
    IdString, MemoryManagerHandle, PortConfigInfo, QueueFullPolicy, ServerOptions, ServerPortData,
    ServerPortUser, ServiceDescription,
};
