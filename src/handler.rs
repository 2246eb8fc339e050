//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* types in a single
//! `HashMap<Method, Tree>`. A collection holds one concrete type, so each
//! handler is hidden behind a trait object (`dyn ErasedHandler`) and stored
//! uniformly.
//!
//! ```text
//! async fn get_user(req: Request) -> Result<Response, FailureRecord> { … }
//!        ↓ router.get("/users/{id}", get_user)
//! get_user.into_boxed_handler()                  ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(get_user))                  ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req)  at request time             ← one vtable dispatch
//!        ↓
//! Box::pin(async { get_user(req).await.into_outcome() })  ← BoxFuture
//! ```
//!
//! The runtime cost per request is **one Arc clone** (atomic inc) plus
//! **one virtual call**, small next to the network I/O around it.
//!
//! The `Err` side of the outcome is what the server hands to the
//! [`ErrorResponder`](crate::ErrorResponder).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::failure::FailureRecord;
use crate::request::Request;
use crate::response::{IntoOutcome, Response};

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a handler outcome.
///
/// `Pin<Box<…>>` because the runtime polls the future in place and it must
/// not move after the first poll. `Send + 'static` let tokio move it across
/// worker threads.
pub(crate) type BoxFuture =
    Pin<Box<dyn Future<Output = Result<Response, FailureRecord>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler::into_boxed_handler`.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
///
/// `#[doc(hidden)] pub` for the same reason as `ErasedHandler`.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any function or
/// closure shaped like
///
/// ```text
/// async fn name(req: Request) -> impl IntoOutcome
/// ```
///
/// so both plain responses and `Result<_, FailureRecord>` work. The trait is
/// **sealed** through the private `Sealed` supertrait: only the blanket impl
/// below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

/// `Sealed` is private, so other crates cannot name it and cannot implement
/// `Handler` on their own types.
mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

/// `Fn(Request) -> Fut` covers:
///   - named `async fn` items
///   - closures returning an `async` block
///   - any struct that implements `Fn`
impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Bridges a concrete handler `F` to [`ErasedHandler`].
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        // Calling the wrapped function yields the concrete `Fut`; it is mapped
        // to an outcome and boxed to match the trait signature.
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_outcome() })
    }
}
