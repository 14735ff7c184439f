use crate::message::{ChangePayload, EventType};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Error a handler may return; it is logged and discarded.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for receiving row changes on a channel.
///
/// Closures taking `&ChangePayload` implement it directly. Implement it on a
/// struct when the handler needs to know which registration fired it, or
/// wants to report a failure.
///
/// # Example
///
/// ```ignore
/// use ws_realtime::{Callback, ChangePayload, EventHandler, EventType, HandlerError};
///
/// struct AuditLog;
///
/// impl EventHandler for AuditLog {
///     fn receive(&self, event: EventType, payload: &ChangePayload) -> Result<(), HandlerError> {
///         println!("{} on {}.{}", event, payload.schema, payload.table);
///         Ok(())
///     }
/// }
///
/// channel.on(EventType::All, Callback::new(AuditLog));
/// channel.on(EventType::Insert, Callback::new(|p: &ChangePayload| println!("{:?}", p.new)));
/// ```
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per matching payload.
    ///
    /// `event` is the type the handler was registered under, which is
    /// `EventType::All` for wildcard registrations.
    fn receive(&self, event: EventType, payload: &ChangePayload) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&ChangePayload) + Send + Sync + 'static,
{
    fn receive(&self, _event: EventType, payload: &ChangePayload) -> Result<(), HandlerError> {
        self(payload);
        Ok(())
    }
}

/// Shared handle to a registered handler.
///
/// Equality and hashing are by identity: clones of one `Callback` are the
/// same handler, two `Callback::new` calls are different handlers even when
/// wrapping equal closures. Keep a clone to pass to `Channel::off` later.
#[derive(Clone)]
pub struct Callback(Arc<dyn EventHandler>);

impl Callback {
    pub fn new(handler: impl EventHandler) -> Self {
        Self(Arc::new(handler))
    }

    /// Invoke the handler, isolating both returned errors and panics
    pub(crate) fn invoke(
        &self,
        event: EventType,
        payload: &ChangePayload,
    ) -> Result<(), HandlerFailure> {
        match catch_unwind(AssertUnwindSafe(|| self.0.receive(event, payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HandlerFailure::Error(e.to_string())),
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                Err(HandlerFailure::Panic(panic_msg))
            }
        }
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Callback {}

impl Hash for Callback {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", self.addr())
    }
}

/// Why a handler invocation did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandlerFailure {
    Error(String),
    Panic(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFailure::Error(msg) => write!(f, "returned error: {}", msg),
            HandlerFailure::Panic(msg) => write!(f, "panicked: {}", msg),
        }
    }
}
