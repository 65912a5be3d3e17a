//! Apply/Delete Reconciler
//!
//! Walks an object list in order and submits each object to the
//! `ObjectClient`. There is no rollback: objects handled before a failure
//! stay as they are.

use crate::domain::objects::RenderedObject;
use crate::domain::ports::ObjectClient;
use crate::error::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What happened to each object of one reconcile call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Objects applied, or deleted when uninstalling
    pub changed: Vec<String>,
    /// Objects that were already absent on delete
    pub absent: Vec<String>,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.changed.len() + self.absent.len()
    }
}

/// Apply (or delete, when `is_deleting`) every object in list order.
///
/// Deleting an object that does not exist succeeds. The first other error
/// is returned unchanged. The token is checked before each object.
pub async fn reconcile(
    objects: &[RenderedObject],
    is_deleting: bool,
    client: &dyn ObjectClient,
    cancel: &CancellationToken,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for object in objects {
        if cancel.is_cancelled() {
            info!("Reconcile cancelled after {} objects", summary.total());
            return Err(Error::Cancelled);
        }

        let name = object.display_name();
        if is_deleting {
            match client.delete(object).await {
                Ok(()) => {
                    debug!("Deleted {}", name);
                    summary.changed.push(name);
                }
                Err(e) if e.is_not_found() => {
                    debug!("{} already absent", name);
                    summary.absent.push(name);
                }
                Err(e) => return Err(e),
            }
        } else {
            client.apply(object).await?;
            debug!("Applied {}", name);
            summary.changed.push(name);
        }
    }

    Ok(summary)
}
