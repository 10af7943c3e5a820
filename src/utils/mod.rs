pub mod command;
pub mod fastx;
pub mod file;
pub mod pileup;
pub mod pool;
pub mod runlog;
pub mod streams;
pub mod subsample;
pub mod system;
pub mod taxa;
