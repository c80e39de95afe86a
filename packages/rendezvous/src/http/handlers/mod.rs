pub mod branches;
mod config;
pub mod dependencies;
mod info;
mod not_found;
pub(crate) mod openapi;
pub mod replica;
pub mod requests;
pub mod status;
pub mod subscribe;
pub mod wait;
pub mod zones;

pub use branches::{handle_close_branch, handle_register_branch, handle_register_branches};
pub use config::handle_config;
pub use dependencies::handle_fetch_dependencies;
pub use info::handle_info;
pub use not_found::handle_not_found;
pub use requests::handle_register_request;
pub use status::handle_check_status;
pub use subscribe::handle_subscribe;
pub use wait::handle_wait;
pub use zones::handle_add_async_zone;
