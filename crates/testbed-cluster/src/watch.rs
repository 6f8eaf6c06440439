//! Waiting on one object's events
//!
//! [`watch_until`] blocks on a single-object subscription until a predicate
//! accepts an event. The stream is owned by the call and dropped on every
//! return path, which ends the subscription. A stream that closes before the
//! predicate is satisfied means the object is gone, reported as NotFound.

use futures::StreamExt;
use kube::api::DynamicObject;
use serde::Deserialize;
use testbed_common::{Error, RunContext};
use tracing::{debug, info};

use crate::store::{EventStream, ObjectStore, ResourceEvent, ResourceRef};

/// The only part of a cluster's status the provisioner reads
#[derive(Debug, Default, Deserialize)]
pub struct PhaseProjection {
    /// `status`, absent until the controller first reports
    #[serde(default)]
    pub status: Option<PhaseStatus>,
}

/// `status.phase`
#[derive(Debug, Default, Deserialize)]
pub struct PhaseStatus {
    /// Controller-reported phase, e.g. `Provisioning`
    #[serde(default)]
    pub phase: Option<String>,
}

/// Read `status.phase` from an object
///
/// `Ok(None)` when status or phase is absent (still pending);
/// [`Error::Structural`] when either is present with the wrong type.
pub fn observed_phase(object: &DynamicObject) -> Result<Option<String>, Error> {
    let projection = PhaseProjection::deserialize(&object.data).map_err(|e| {
        let resource = ResourceRef::from_object(object)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| "object".to_string());
        Error::structural(resource, format!("status.phase: {e}"))
    })?;
    Ok(projection.status.and_then(|s| s.phase))
}

/// Predicate satisfied once `status.phase` equals `expected`
///
/// A deletion while waiting yields NotFound.
pub fn phase_reached(expected: &str) -> impl FnMut(&ResourceEvent) -> Result<bool, Error> + '_ {
    move |event| {
        let object = event.object();
        if event.is_deleted() {
            let resource = ResourceRef::from_object(object)
                .map(|r| r.to_string())
                .unwrap_or_else(|_| "object".to_string());
            return Err(Error::not_found(resource));
        }
        let phase = observed_phase(object)?;
        debug!(
            name = object.metadata.name.as_deref().unwrap_or_default(),
            phase = phase.as_deref().unwrap_or_default(),
            "observed phase"
        );
        Ok(phase.as_deref() == Some(expected))
    }
}

/// Block until `predicate` accepts an event for `target`
///
/// Starts from the object's current state. Returns the predicate's error as
/// soon as it produces one, NotFound when the stream ends first, and
/// [`Error::Timeout`] when `ctx` finishes first.
pub async fn watch_until<S, P>(
    ctx: &RunContext,
    store: &S,
    target: &ResourceRef,
    predicate: P,
) -> Result<(), Error>
where
    S: ObjectStore + ?Sized,
    P: FnMut(&ResourceEvent) -> Result<bool, Error>,
{
    let events = store.watch(target, None).await?;
    consume_until(ctx, events, target, predicate).await
}

async fn consume_until<P>(
    ctx: &RunContext,
    mut events: EventStream,
    target: &ResourceRef,
    mut predicate: P,
) -> Result<(), Error>
where
    P: FnMut(&ResourceEvent) -> Result<bool, Error>,
{
    loop {
        tokio::select! {
            _ = ctx.done() => {
                return Err(Error::timeout(format!("watch {target}"), Vec::new()));
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if predicate(&event)? {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::not_found(target.to_string())),
            },
        }
    }
}

/// Delete `target` and block until the deletion is observed
///
/// The object is read first and the watch is opened from the version that
/// read returned, before the delete is issued; the Deleted event therefore
/// cannot slip past the subscription. A missing object is reported as
/// NotFound without waiting.
pub async fn delete_and_wait<S>(
    ctx: &RunContext,
    store: &S,
    target: &ResourceRef,
) -> Result<(), Error>
where
    S: ObjectStore + ?Sized,
{
    let current = store.get(target).await?;
    let resource_version = current.metadata.resource_version.clone();

    let events = store.watch(target, resource_version).await?;
    store.delete(target).await?;
    info!(resource = %target, "deletion requested, waiting for confirmation");

    consume_until(ctx, events, target, |event| Ok(event.is_deleted())).await?;
    info!(resource = %target, "deletion confirmed");
    Ok(())
}
