//! Process control for a dynamic-tracing client.
//!
//! A control thread is created for each victim process, to provide
//! callbacks on process exit, drive the attach-time rendezvous, handle
//! breakpoint dispatch, and act as the single point every trace-related
//! request flows through — working around the OS restriction that the
//! tracing primitive answers only to the thread that attached.
//!
//! Because of that restriction the debugger library underneath is not
//! multithread-capable, so a marshalling layer routes all communication
//! with it through the control thread. Thread-safety is provided *only*
//! for calls routed through that layer; the registry's own exported
//! calls are, like the rest of the client library, single-caller.
//!
//! Records are kept, one per victim, in a pid-indexed hash inside the
//! [`Registry`], which also maintains them in least-recently-used order
//! so that cached-but-unreferenced handles can be retired (descriptors
//! closed, record kept) once the cache outgrows its cap.
//!
//! Victim death is delivered on a simple notification bus: the dying
//! target is queued and every sleeper on the registry is woken to drain
//! it.

pub mod config;
pub mod debugger;
pub mod error;
pub mod flags;
pub mod stop;
pub mod sys;

mod attach;
mod controller;
mod lock;
mod marshal;
mod registry;
mod target;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use debugger::{
    AuxKey, BkptDisposition, BkptHandler, Debugger, PokeRequest, ProbeLayer, ProcState, PsHandle,
    RtldDb, RtldEvent, RtldEventFn, RtldEventKind, RtldState,
};
pub use error::ProcError;
pub use registry::{Notification, Registry};
pub use stop::{ProcFlags, StopAt, StopFlags};
pub use target::Target;
