pub mod replica_client;
pub mod version_registry;

pub use replica_client::ReplicaClient;
pub use version_registry::VersionRegistry;
