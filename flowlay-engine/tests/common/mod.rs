//! Shared topology setup: one in-process medium, a crossed control
//! channel, a connector on one end and an acceptor on the other.

use std::sync::Arc;

// ---

use flowlay_engine::{ClientConnector, EngineOptions, ServerAcceptor};
use flowlay_link_sim::{control_pair, SimConfig, SimEndpoint, SimMedium};

// ---

pub fn init_tracing() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---

pub fn topology(
    config: SimConfig,
    options: EngineOptions,
) -> (ClientConnector, ServerAcceptor, Arc<SimMedium>) {
    // ---
    init_tracing();

    let medium = SimMedium::new(config);
    let ((client_control, client_rx), (server_control, server_rx)) = control_pair();

    let connector = ClientConnector::new(
        Arc::new(SimEndpoint::new(Arc::clone(&medium))),
        Arc::new(client_control),
        client_rx,
        options.clone(),
    );
    let acceptor = ServerAcceptor::new(
        Arc::new(SimEndpoint::new(Arc::clone(&medium))),
        Arc::new(server_control),
        server_rx,
        options,
    );

    (connector, acceptor, medium)
}
