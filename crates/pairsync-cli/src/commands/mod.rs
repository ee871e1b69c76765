//! CLI subcommands

pub mod bind_server;
pub mod clean_folder;
pub mod console;
pub mod roots;
pub mod status;
pub mod unbind_server;
