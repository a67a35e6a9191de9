//! kmirror informer: reflector (list-then-watch), shared informer with handler
//! fan-out, and the per-kind informer registry.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod factory;
pub mod handler;
pub mod informer;
pub mod reflector;
pub mod testing;

pub use backoff::Backoff;
pub use factory::InformerFactory;
pub use handler::{EventHandler, HandlerFns, HandlerId};
pub use informer::{InformerState, SharedInformer};
pub use reflector::{Reflector, ReflectorPhase};
