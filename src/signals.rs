//! Process signal wiring.
//!
//! SIGINT and SIGTERM stop the responder. The handlers are registered
//! without `SA_RESTART` on purpose: the responder sits in a blocking
//! `recv`, and termination relies on that call returning EINTR.

use std::sync::{Arc, OnceLock};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::bail;
use crate::error::Result;
use crate::responder::Responder;

static RESPONDER: OnceLock<Arc<Responder>> = OnceLock::new();

extern "C" fn handle_termination(_signal: libc::c_int) {
    // Responder::terminate only performs an atomic store.
    if let Some(responder) = RESPONDER.get() {
        responder.terminate();
    }
}

/// Install SIGINT/SIGTERM handlers that stop the given responder.
pub fn install_termination_handlers(responder: Arc<Responder>) -> Result<()> {
    if RESPONDER.set(responder).is_err() {
        bail!("termination handlers are already installed");
    }

    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only performs async-signal-safe atomic stores.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}
