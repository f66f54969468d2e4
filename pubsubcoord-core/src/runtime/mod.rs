//! Runtime helpers shared by the binaries and background tasks

pub mod shutdown;

pub use shutdown::ShutdownSignal;
