//! The Port Manager: allocates port records from the segment pools, enforces
//! server uniqueness and runs the discovery pass that matches clients to
//! servers.
//!
//! The manager runs single-threaded inside the daemon and is the sole writer
//! of pool occupancy and of all derived port state. Applications in other
//! processes only flip their own intent flags; a pass that runs after such a
//! write observes it. Discovery never blocks, never allocates and never
//! fails.

use tracing::{debug, warn};

use crate::core::BrokerSegment;
use crate::errors::{ErrorSink, Fault, PortPoolError, Severity};
use crate::port::{
    ClientOptions, ClientPortData, ConnectionState, IdString, MemoryManagerHandle, PortConfigInfo,
    ServerOptions, ServerPortData, ServiceDescription,
};

pub struct PortManager<'a> {
    segment: &'a BrokerSegment,
    error_sink: &'a dyn ErrorSink,
}

impl<'a> PortManager<'a> {
    pub fn new(segment: &'a BrokerSegment, error_sink: &'a dyn ErrorSink) -> PortManager<'a> {
        PortManager {
            segment,
            error_sink,
        }
    }

    /// Allocates a server port. At most one live, non-tombstoned server may
    /// exist per service description; a collision is reported to the error
    /// sink at moderate severity and returned as a typed failure. A
    /// tombstoned predecessor does not block the new allocation.
    pub fn acquire_server_port_data(
        &self,
        service_description: &ServiceDescription,
        options: &ServerOptions,
        runtime_name: &IdString,
        memory_manager: MemoryManagerHandle,
        config_info: PortConfigInfo,
    ) -> Result<&'a ServerPortData, PortPoolError> {
        let duplicate = self.segment.server_ports.iter_live().any(|server| {
            !server.is_to_be_destroyed() && server.service_description() == service_description
        });
        if duplicate {
            warn!(service = %service_description, runtime = %runtime_name,
                "rejecting second server for service");
            self.error_sink
                .report(Fault::ServerPortNotUnique, Severity::Moderate);
            return Err(PortPoolError::UniqueServerPortAlreadyExists);
        }

        let record = ServerPortData::new(
            service_description,
            options,
            runtime_name,
            memory_manager,
            config_info,
        );
        let port = self
            .segment
            .server_ports
            .allocate(record)
            .map_err(|_| PortPoolError::ServerPortListFull)?;
        debug!(service = %service_description, runtime = %runtime_name, "server port acquired");

        // Clients already waiting for this offer connect right away.
        self.match_ports();
        Ok(port)
    }

    /// Allocates a client port. No uniqueness constraint: any number of
    /// clients may target the same service description.
    pub fn acquire_client_port_data(
        &self,
        service_description: &ServiceDescription,
        options: &ClientOptions,
        runtime_name: &IdString,
        memory_manager: MemoryManagerHandle,
        config_info: PortConfigInfo,
    ) -> Result<&'a ClientPortData, PortPoolError> {
        let record = ClientPortData::new(
            service_description,
            options,
            runtime_name,
            memory_manager,
            config_info,
        );
        let port = self
            .segment
            .client_ports
            .allocate(record)
            .map_err(|_| PortPoolError::ClientPortListFull)?;
        debug!(service = %service_description, runtime = %runtime_name, "client port acquired");

        // The initial connection state reflects the server landscape at
        // creation time.
        self.match_ports();
        Ok(port)
    }

    /// One full reconciliation pass: reclaim slots whose tombstone a previous
    /// pass observed, take freshly tombstoned records out of circulation,
    /// then recompute connection state for every live client. Idempotent;
    /// iteration order carries no guarantees.
    pub fn do_discovery(&self) {
        self.release_retired();
        self.retire_tombstoned();
        self.match_ports();
    }

    fn release_retired(&self) {
        let released = self.segment.client_ports.release_retired()
            + self.segment.server_ports.release_retired();
        if released > 0 {
            debug!(released, "reclaimed retired port slots");
        }
    }

    fn retire_tombstoned(&self) {
        for server in self.segment.server_ports.iter_live() {
            if server.is_to_be_destroyed() {
                debug!(service = %server.service_description(), "retiring server port");
                self.segment.server_ports.retire(server);
            }
        }
        for client in self.segment.client_ports.iter_live() {
            if client.is_to_be_destroyed() {
                debug!(service = %client.service_description(), "retiring client port");
                self.segment.client_ports.retire(client);
            }
        }
    }

    fn match_ports(&self) {
        for server in self.segment.server_ports.iter_live() {
            server.reset_connected_clients();
        }
        for client in self.segment.client_ports.iter_live() {
            if client.is_to_be_destroyed() {
                continue;
            }
            let state = if !client.connect_requested() {
                ConnectionState::NotConnected
            } else {
                match self.find_offering_server(client.service_description()) {
                    Some(server) => {
                        server.add_connected_client();
                        ConnectionState::Connected
                    }
                    None => ConnectionState::WaitForOffer,
                }
            };
            client.set_connection_state(state);
        }
    }

    fn find_offering_server(&self, sd: &ServiceDescription) -> Option<&'a ServerPortData> {
        self.segment.server_ports.iter_live().find(|server| {
            !server.is_to_be_destroyed()
                && server.offering_requested()
                && server.service_description() == sd
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BrokerSegment, MAX_CLIENT_PORTS, MAX_SERVER_PORTS};
    use crate::errors::RecordingSink;
    use crate::port::{ClientPortUser, ConsumerTooSlowPolicy, QueueFullPolicy, ServerPortUser};

    fn sd() -> ServiceDescription {
        ServiceDescription::new("hyp", "no", "toad").unwrap()
    }

    fn runtime() -> IdString {
        IdString::new("hypnotoad").unwrap()
    }

    fn client_options() -> ClientOptions {
        ClientOptions {
            response_queue_capacity: 2,
            node_name: IdString::new("node").unwrap(),
            ..ClientOptions::default()
        }
    }

    fn server_options() -> ServerOptions {
        ServerOptions {
            request_queue_capacity: 2,
            node_name: IdString::new("node").unwrap(),
            ..ServerOptions::default()
        }
    }

    struct Fixture {
        segment: Box<BrokerSegment>,
        sink: RecordingSink,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                segment: BrokerSegment::boxed(),
                sink: RecordingSink::new(),
            }
        }

        fn manager(&self) -> PortManager<'_> {
            PortManager::new(&self.segment, &self.sink)
        }
    }

    fn create_client<'a>(manager: &PortManager<'a>, options: &ClientOptions) -> ClientPortUser<'a> {
        let data = manager
            .acquire_client_port_data(
                &sd(),
                options,
                &runtime(),
                MemoryManagerHandle::default(),
                PortConfigInfo::default(),
            )
            .expect("client port allocation failed");
        ClientPortUser::new(data)
    }

    fn create_server<'a>(manager: &PortManager<'a>, options: &ServerOptions) -> ServerPortUser<'a> {
        let data = manager
            .acquire_server_port_data(
                &sd(),
                options,
                &runtime(),
                MemoryManagerHandle::default(),
                PortConfigInfo::default(),
            )
            .expect("server port allocation failed");
        ServerPortUser::new(data)
    }

    #[test]
    fn acquire_client_port_data_returns_initialized_port() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = client_options();
        options.connect_on_create = false;
        options.response_queue_full_policy = QueueFullPolicy::BlockProducer;
        options.server_too_slow_policy = ConsumerTooSlowPolicy::WaitForConsumer;

        let port = manager
            .acquire_client_port_data(
                &sd(),
                &options,
                &runtime(),
                MemoryManagerHandle::default(),
                PortConfigInfo::default(),
            )
            .unwrap();

        assert_eq!(*port.service_description(), sd());
        assert_eq!(*port.runtime_name(), runtime());
        assert_eq!(*port.node_name(), options.node_name);
        assert!(!port.is_to_be_destroyed());
        assert!(!port.connect_requested());
        assert_eq!(port.chunk_receiver().queue_capacity(), 2);
        assert_eq!(
            port.chunk_receiver().queue_full_policy(),
            QueueFullPolicy::BlockProducer
        );
        assert_eq!(
            port.chunk_sender().consumer_too_slow_policy(),
            ConsumerTooSlowPolicy::WaitForConsumer
        );
    }

    #[test]
    fn acquire_server_port_data_returns_initialized_port() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = server_options();
        options.offer_on_create = false;
        options.request_queue_full_policy = QueueFullPolicy::BlockProducer;
        options.client_too_slow_policy = ConsumerTooSlowPolicy::WaitForConsumer;

        let port = manager
            .acquire_server_port_data(
                &sd(),
                &options,
                &runtime(),
                MemoryManagerHandle::default(),
                PortConfigInfo::default(),
            )
            .unwrap();

        assert_eq!(*port.service_description(), sd());
        assert_eq!(*port.runtime_name(), runtime());
        assert_eq!(*port.node_name(), options.node_name);
        assert!(!port.is_to_be_destroyed());
        assert!(!port.offering_requested());
        assert_eq!(port.chunk_receiver().queue_capacity(), 2);
        assert_eq!(
            port.chunk_receiver().queue_full_policy(),
            QueueFullPolicy::BlockProducer
        );
        assert_eq!(
            port.chunk_sender().consumer_too_slow_policy(),
            ConsumerTooSlowPolicy::WaitForConsumer
        );
    }

    #[test]
    fn second_server_for_same_service_fails_and_reports_once() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        create_server(&manager, &server_options());

        let result = manager.acquire_server_port_data(
            &sd(),
            &server_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );

        assert_eq!(result.err(), Some(PortPoolError::UniqueServerPortAlreadyExists));
        assert_eq!(
            fixture.sink.reports(),
            vec![(Fault::ServerPortNotUnique, Severity::Moderate)]
        );
    }

    #[test]
    fn second_server_succeeds_after_first_is_tombstoned() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let first = create_server(&manager, &server_options());

        first.destroy();

        let result = manager.acquire_server_port_data(
            &sd(),
            &server_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );

        assert!(result.is_ok());
        assert!(fixture.sink.reports().is_empty());
    }

    #[test]
    fn server_pool_exhaustion_is_an_ordinary_failure() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        for i in 0..MAX_SERVER_PORTS {
            let description =
                ServiceDescription::new("svc", "inst", &format!("event-{i}")).unwrap();
            manager
                .acquire_server_port_data(
                    &description,
                    &server_options(),
                    &runtime(),
                    MemoryManagerHandle::default(),
                    PortConfigInfo::default(),
                )
                .unwrap();
        }

        let overflow = ServiceDescription::new("svc", "inst", "overflow").unwrap();
        let result = manager.acquire_server_port_data(
            &overflow,
            &server_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );

        assert_eq!(result.err(), Some(PortPoolError::ServerPortListFull));
        assert!(fixture.sink.reports().is_empty());
    }

    #[test]
    fn client_pool_exhaustion_is_an_ordinary_failure() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        for _ in 0..MAX_CLIENT_PORTS {
            create_client(&manager, &client_options());
        }

        let result = manager.acquire_client_port_data(
            &sd(),
            &client_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );

        assert_eq!(result.err(), Some(PortPoolError::ClientPortListFull));
    }

    #[test]
    fn connect_on_create_without_server_waits_for_offer() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = client_options();
        options.connect_on_create = true;

        let client = create_client(&manager, &options);
        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);

        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);
    }

    #[test]
    fn connect_on_create_with_non_offering_server_waits_for_offer() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut client_opts = client_options();
        client_opts.connect_on_create = true;
        let mut server_opts = server_options();
        server_opts.offer_on_create = false;

        create_server(&manager, &server_opts);
        let client = create_client(&manager, &client_opts);

        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);
    }

    #[test]
    fn connect_on_create_with_offering_server_connects_immediately() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        create_server(&manager, &server_options());
        let client = create_client(&manager, &client_options());

        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn waiting_client_connects_when_server_is_created_afterwards() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let client = create_client(&manager, &client_options());
        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);

        create_server(&manager, &server_options());
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn client_without_connect_request_stays_not_connected() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = client_options();
        options.connect_on_create = false;

        create_server(&manager, &server_options());
        let client = create_client(&manager, &options);
        assert_eq!(client.connection_state(), ConnectionState::NotConnected);

        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::NotConnected);
    }

    #[test]
    fn explicit_connect_takes_effect_on_next_discovery() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = client_options();
        options.connect_on_create = false;

        create_server(&manager, &server_options());
        let client = create_client(&manager, &options);

        client.connect();
        assert_eq!(client.connection_state(), ConnectionState::NotConnected);
        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_takes_effect_on_next_discovery() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        create_server(&manager, &server_options());
        let client = create_client(&manager, &client_options());
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        client.disconnect();
        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::NotConnected);
    }

    #[test]
    fn stop_offer_moves_connected_clients_to_wait_for_offer() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let server = create_server(&manager, &server_options());
        let client = create_client(&manager, &client_options());
        assert_eq!(client.connection_state(), ConnectionState::Connected);

        server.stop_offer();
        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);
    }

    #[test]
    fn destroying_the_server_moves_connected_clients_to_wait_for_offer() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let server = create_server(&manager, &server_options());
        let client = create_client(&manager, &client_options());

        server.destroy();
        manager.do_discovery();
        assert_eq!(client.connection_state(), ConnectionState::WaitForOffer);
    }

    #[test]
    fn destroying_a_client_clears_it_from_the_server() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let server = create_server(&manager, &server_options());
        let client = create_client(&manager, &client_options());
        assert!(server.has_clients());

        client.destroy();
        manager.do_discovery();
        assert!(!server.has_clients());
    }

    #[test]
    fn clients_on_one_server_are_independent() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let server = create_server(&manager, &server_options());
        let doomed = create_client(&manager, &client_options());
        let survivor = create_client(&manager, &client_options());

        doomed.destroy();
        manager.do_discovery();

        assert_eq!(survivor.connection_state(), ConnectionState::Connected);
        assert!(server.has_clients());
    }

    #[test]
    fn multiple_clients_with_connect_on_create_all_connect() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        create_server(&manager, &server_options());
        let first = create_client(&manager, &client_options());
        let second = create_client(&manager, &client_options());

        assert_eq!(first.connection_state(), ConnectionState::Connected);
        assert_eq!(second.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn only_clients_that_requested_connect_become_connected() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        let mut options = client_options();
        options.connect_on_create = false;

        create_server(&manager, &server_options());
        let passive = create_client(&manager, &options);
        let active = create_client(&manager, &options);

        active.connect();
        manager.do_discovery();

        assert_eq!(passive.connection_state(), ConnectionState::NotConnected);
        assert_eq!(active.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn discovery_is_idempotent_when_nothing_changed() {
        let fixture = Fixture::new();
        let manager = fixture.manager();

        let server = create_server(&manager, &server_options());
        let mut options = client_options();
        options.connect_on_create = false;
        let passive = create_client(&manager, &options);
        let connected = create_client(&manager, &client_options());

        manager.do_discovery();
        let snapshot = (
            passive.connection_state(),
            connected.connection_state(),
            server.has_clients(),
        );

        manager.do_discovery();
        assert_eq!(
            snapshot,
            (
                passive.connection_state(),
                connected.connection_state(),
                server.has_clients(),
            )
        );
    }

    #[test]
    fn tombstoned_slots_are_reclaimed_one_pass_after_observation() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        for i in 0..MAX_SERVER_PORTS {
            let description =
                ServiceDescription::new("svc", "inst", &format!("event-{i}")).unwrap();
            let port = manager
                .acquire_server_port_data(
                    &description,
                    &server_options(),
                    &runtime(),
                    MemoryManagerHandle::default(),
                    PortConfigInfo::default(),
                )
                .unwrap();
            ServerPortUser::new(port).destroy();
        }

        // First pass observes the tombstones; storage is still claimed.
        manager.do_discovery();
        let early = manager.acquire_server_port_data(
            &sd(),
            &server_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );
        assert_eq!(early.err(), Some(PortPoolError::ServerPortListFull));

        // Second pass reclaims; the pool is usable again.
        manager.do_discovery();
        let reclaimed = manager.acquire_server_port_data(
            &sd(),
            &server_options(),
            &runtime(),
            MemoryManagerHandle::default(),
            PortConfigInfo::default(),
        );
        assert!(reclaimed.is_ok());
    }
}
