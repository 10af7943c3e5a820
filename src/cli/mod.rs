pub mod args;

pub use args::{Arguments, DispatchMode, ReadFormat};

use clap::Parser;

pub fn parse() -> Arguments {
    Arguments::parse()
}
