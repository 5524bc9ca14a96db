//! Node overload signal consulted before each delivery is dispatched.

/// Reports whether the node should hold back new deliveries.
///
/// Checked once per ready job before a delivery permit is taken; while it
/// returns true the shard loop waits `overload_backoff_delay` and asks again.
pub trait OverloadDetector: Send + Sync + 'static {
    fn is_overloaded(&self) -> bool;
}

/// Never reports overload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverOverloaded;

impl OverloadDetector for NeverOverloaded {
    fn is_overloaded(&self) -> bool {
        false
    }
}

impl<F> OverloadDetector for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_overloaded(&self) -> bool {
        self()
    }
}
