//! Multi-key operations across areas.
//!
//! A batch is partitioned by area, each area gets exactly one driver call
//! (two for metadata merges and versioned writes: one read, one write), and
//! the areas run
//! concurrently. Results come back in the order the caller listed the keys.
//! A failing area does not stop the others, but its error is always
//! returned.

use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::driver::{AreaDriver, AreaDrivers};
use crate::error::Result;
use crate::key::{meta_key, partition_by_area, reassemble, Partition, Routed};
use crate::meta::{self, Meta};
use crate::migrate::{stamp_version, ReadyFuture};
use crate::request::{GetRequest, ItemMeta, ItemRef, ItemValue, RemoveRequest};

type Groups<P> = Vec<(Arc<AreaDriver>, Vec<Routed<P>>)>;

/// Partition a request and look up every area's driver before dispatching.
///
/// Routing errors surface here, before any backend call.
fn route<P>(drivers: &AreaDrivers, partition: Partition<P>) -> Result<Groups<P>> {
    partition
        .into_groups()
        .into_iter()
        .map(|(area, group)| drivers.get(area).map(|driver| (driver.clone(), group)))
        .collect()
}

/// Wait for the migration gate of every defined item in the batch.
async fn wait_ready<'a>(gates: impl Iterator<Item = &'a Option<ReadyFuture>>) {
    join_all(gates.flatten().cloned()).await;
}

/// Run one future per area concurrently and gather their results.
async fn dispatch<P, R, F, Fut>(groups: Groups<P>, per_area: F) -> Result<Vec<R>>
where
    F: Fn(Arc<AreaDriver>, Vec<Routed<P>>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let areas: Vec<_> = groups.iter().map(|(driver, _)| driver.area()).collect();
    let results = join_all(
        groups
            .into_iter()
            .map(|(driver, group)| per_area(driver, group)),
    )
    .await;

    let mut gathered = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (area, result) in areas.into_iter().zip(results) {
        match result {
            Ok(output) => gathered.push(output),
            Err(err) => {
                warn!(%area, error = %err, "area batch failed");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(gathered),
    }
}

async fn get_area(
    driver: Arc<AreaDriver>,
    group: Vec<Routed<GetRequest>>,
) -> Result<Vec<(usize, ItemValue)>> {
    let keys: Vec<String> = group.iter().map(|r| r.local_key.clone()).collect();
    let values = driver.get_many(&keys).await?;

    Ok(group
        .into_iter()
        .zip(values)
        .map(|(routed, value)| {
            let value = match value {
                Some(value) => value,
                None => routed.payload.resolve_missing(),
            };
            (routed.index, ItemValue { key: routed.key, value })
        })
        .collect())
}

/// Values written through versioned items carry their schema version: the
/// shadow keys are read once, stamped, and committed with the values in one
/// write.
async fn set_area(driver: Arc<AreaDriver>, group: Vec<Routed<(ItemRef, Value)>>) -> Result<()> {
    let stamped: Vec<(String, String, u32)> = group
        .iter()
        .filter(|routed| !routed.payload.1.is_null())
        .filter_map(|routed| {
            let version = routed.payload.0.version?;
            Some((routed.key.clone(), meta_key(&routed.local_key), version))
        })
        .collect();

    let mut shadows: BTreeMap<String, Meta> = BTreeMap::new();
    if !stamped.is_empty() {
        let keys: Vec<String> = stamped.iter().map(|(_, shadow, _)| shadow.clone()).collect();
        let stored = driver.get_many(&keys).await?;
        for ((key, shadow, target), stored) in stamped.into_iter().zip(stored) {
            let existing = shadows
                .remove(&shadow)
                .unwrap_or_else(|| meta::normalize(stored));
            shadows.insert(shadow, stamp_version(existing, &key, target)?);
        }
    }

    let writes = group
        .into_iter()
        .map(|routed| (routed.local_key, routed.payload.1))
        .chain(
            shadows
                .into_iter()
                .map(|(shadow, meta)| (shadow, Value::Object(meta))),
        )
        .collect();
    driver.set_many(writes).await
}

async fn get_meta_area(
    driver: Arc<AreaDriver>,
    group: Vec<Routed<ItemRef>>,
) -> Result<Vec<(usize, ItemMeta)>> {
    let shadows: Vec<String> = group.iter().map(|r| meta_key(&r.local_key)).collect();
    let stored = driver.get_many(&shadows).await?;

    Ok(group
        .into_iter()
        .zip(stored)
        .map(|(routed, stored)| {
            let meta = meta::normalize(stored);
            (routed.index, ItemMeta { key: routed.key, meta })
        })
        .collect())
}

async fn set_meta_area(driver: Arc<AreaDriver>, group: Vec<Routed<(ItemRef, Meta)>>) -> Result<()> {
    let shadows: Vec<String> = group.iter().map(|r| meta_key(&r.local_key)).collect();
    let stored = driver.get_many(&shadows).await?;

    // Repeated keys merge in request order.
    let mut merged: BTreeMap<String, Meta> = BTreeMap::new();
    for ((routed, shadow), stored) in group.into_iter().zip(shadows).zip(stored) {
        let base = merged
            .remove(&shadow)
            .unwrap_or_else(|| meta::normalize(stored));
        merged.insert(shadow, meta::merge(base, routed.payload.1));
    }

    let writes = merged
        .into_iter()
        .map(|(shadow, meta)| (shadow, meta::stored_form(meta)))
        .collect();
    driver.set_many(writes).await
}

async fn remove_area(driver: Arc<AreaDriver>, group: Vec<Routed<RemoveRequest>>) -> Result<()> {
    let mut keys = Vec::with_capacity(group.len());
    for routed in group {
        if routed.payload.remove_meta {
            keys.push(meta_key(&routed.local_key));
        }
        keys.push(routed.local_key);
    }
    driver.remove_many(&keys).await
}

/// Read several values, applying per-entry fallbacks.
///
/// Fallback precedence: call-site fallback, then the item's fallback, then `null`.
pub async fn get_items(drivers: &AreaDrivers, requests: Vec<GetRequest>) -> Result<Vec<ItemValue>> {
    let partition = partition_by_area(requests.into_iter().map(|r| (r.target.key.clone(), r)))?;
    let len = partition.len();
    let groups = route(drivers, partition)?;
    wait_ready(groups.iter().flat_map(|(_, g)| g.iter().map(|r| &r.payload.target.ready))).await;
    debug!(count = len, areas = groups.len(), "get_items");

    let results = dispatch(groups, get_area).await?;
    Ok(reassemble(len, results.into_iter().flatten()))
}

/// Write several values. `null` values remove their key.
///
/// Entries of versioned items record the item's version like
/// [`DefinedItem::set_value`](crate::DefinedItem::set_value) does, and a
/// stored version above it fails the entry's area with `VersionDowngrade`.
pub async fn set_items(drivers: &AreaDrivers, entries: Vec<(ItemRef, Value)>) -> Result<()> {
    let partition = partition_by_area(entries.into_iter().map(|(r, v)| (r.key.clone(), (r, v))))?;
    let groups = route(drivers, partition)?;
    wait_ready(groups.iter().flat_map(|(_, g)| g.iter().map(|r| &r.payload.0.ready))).await;
    debug!(areas = groups.len(), "set_items");

    dispatch(groups, set_area).await?;
    Ok(())
}

/// Read the metadata of several keys.
pub async fn get_item_metas(drivers: &AreaDrivers, targets: Vec<ItemRef>) -> Result<Vec<ItemMeta>> {
    let partition = partition_by_area(targets.into_iter().map(|r| (r.key.clone(), r)))?;
    let len = partition.len();
    let groups = route(drivers, partition)?;
    wait_ready(groups.iter().flat_map(|(_, g)| g.iter().map(|r| &r.payload.ready))).await;

    let results = dispatch(groups, get_meta_area).await?;
    Ok(reassemble(len, results.into_iter().flatten()))
}

/// Merge metadata into several keys: one read and one write per area.
///
/// Subject to the same read-modify-write race as [`meta::set_meta`].
pub async fn set_item_metas(drivers: &AreaDrivers, entries: Vec<(ItemRef, Meta)>) -> Result<()> {
    let partition = partition_by_area(entries.into_iter().map(|(r, m)| (r.key.clone(), (r, m))))?;
    let groups = route(drivers, partition)?;
    wait_ready(groups.iter().flat_map(|(_, g)| g.iter().map(|r| &r.payload.0.ready))).await;

    dispatch(groups, set_meta_area).await?;
    Ok(())
}

/// Remove several values, and their metadata where requested.
pub async fn remove_items(drivers: &AreaDrivers, requests: Vec<RemoveRequest>) -> Result<()> {
    let partition = partition_by_area(requests.into_iter().map(|r| (r.target.key.clone(), r)))?;
    let groups = route(drivers, partition)?;
    wait_ready(groups.iter().flat_map(|(_, g)| g.iter().map(|r| &r.payload.target.ready))).await;

    dispatch(groups, remove_area).await?;
    Ok(())
}
