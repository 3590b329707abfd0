//! Protocol driver seam.

use std::sync::Arc;

use async_trait::async_trait;

use crate::item::{OutputItem, PayloadItem};

/// A protocol driver: performs one request/response exchange and
/// returns a timed result. Implementations must never panic on wire
/// input; failures are recorded on the returned item.
#[async_trait]
pub trait Nib: Send {
    /// Execute one exchange for the given payload.
    ///
    /// The item is mutable so drivers may finalise wire-level
    /// placeholders (such as the content-length sentinel) in place.
    async fn punch(&mut self, item: &mut PayloadItem) -> OutputItem;
}

/// Factory producing one driver instance per worker.
pub type NibMaker = Arc<dyn Fn() -> Box<dyn Nib> + Send + Sync>;

/// No-op driver for dry runs and scheduler tests: every punch
/// succeeds instantly with status 200.
#[derive(Debug, Default)]
pub struct DummyNib;

#[async_trait]
impl Nib for DummyNib {
    async fn punch(&mut self, _item: &mut PayloadItem) -> OutputItem {
        let mut out = OutputItem::started();
        out.status = 200;
        out.elapsed = out.start.elapsed();
        out
    }
}
