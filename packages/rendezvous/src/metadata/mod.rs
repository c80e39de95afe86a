pub mod branch;
pub mod request;
pub mod subscriber;

pub use branch::{Branch, BranchClose};
pub use request::Request;
pub use subscriber::Subscriber;
