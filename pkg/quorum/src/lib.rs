#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

extern crate byteorder;
extern crate fs2;
extern crate libc;
extern crate rand;
extern crate serde;
extern crate toml;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
		}

		errors {
			LogLocked(dir: ::std::path::PathBuf) {
				description("log directory is locked by another instance")
				display("log directory {:?} is locked by another instance", dir)
			}
		}
	}
}

pub mod config;
pub mod consensus;
pub mod env;
pub mod local;
pub mod protos;
mod state;
pub mod storage;

pub use config::NodeConfig;
pub use consensus::Server;
pub use env::{Receive, ServerEnv, TimeoutKind};
pub use state::State;
pub use storage::Log;
