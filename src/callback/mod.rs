//! Callback trampolines - native code calling back into managed handlers
//!
//! Design: handlers never run on a native stack unguarded. Arguments are
//! marshalled in, the handler runs under `catch_unwind`, and failures are
//! queued for the next safe point instead of unwinding through C frames.
//!
//! Architecture:
//! - `trampoline.rs` - libffi closures, dispatch side table, closure retirement
//! - `signal.rs` - GObject signal connect/disconnect on top of trampolines

mod signal;
mod trampoline;

pub use signal::{HandlerId, SignalTable};
pub use trampoline::TrampolineTable;

#[cfg(test)]
mod tests;
