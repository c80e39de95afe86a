pub mod client;
pub mod replica;

pub use client::ClientService;
pub use replica::ReplicaService;
