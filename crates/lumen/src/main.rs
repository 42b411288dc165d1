//! Lumen.
//!
//! A command line front-end to the lumen image loader. It loads single images through the full
//! caching pipeline, inspects the tiles of large images, and cleans up the disk cache.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            lumen_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
