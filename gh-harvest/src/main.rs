//! Command-line tool for exhaustive GitHub code-search collection.

use gh_harvest_lib::{run, Host};
use std::io::Write;
use std::io::{stderr, stdout};

/// Default host that talks to the real OS.
#[derive(Debug, Clone, Default)]
pub struct RealHost;

impl Host for RealHost {
    fn output(&mut self) -> impl Write {
        stdout()
    }

    fn error(&mut self) -> impl Write {
        stderr()
    }

    fn exit(&mut self, code: i32) {
        std::process::exit(code);
    }
}

#[tokio::main]
async fn main() -> Result<(), gh_harvest_lib::Error> {
    run(&mut RealHost, std::env::args()).await
}
