pub mod connections;
pub mod devices;
pub mod ipam;
pub mod node_endpoints;
pub mod outbox;
pub mod revisions;
pub mod users;
pub mod wireguard_peers;
