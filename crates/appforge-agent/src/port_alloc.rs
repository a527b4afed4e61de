use std::collections::BTreeSet;

use crate::config::PortRange;
use crate::error::ProjectError;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;

/// First port in `range` not present in `excluded`.
pub fn first_free_port(range: PortRange, excluded: &BTreeSet<u16>) -> Option<u16> {
    (range.start..=range.end).find(|p| !excluded.contains(p))
}

/// Pick a host port for a new project.
///
/// Ports held by tracked projects are excluded, and so are ports the runtime
/// reports as published (containers the registry does not know about). The
/// runtime listing is best-effort: if it fails we fall back to registry-only
/// knowledge and let a later bind conflict surface on start.
pub async fn allocate(
    registry: &Registry,
    runtime: &ContainerRuntime,
    range: PortRange,
) -> Result<u16, ProjectError> {
    let mut excluded: BTreeSet<u16> = registry
        .ports()
        .await
        .into_iter()
        .filter(|p| range.contains(*p))
        .collect();

    match runtime.published_ports().await {
        Ok(live) => excluded.extend(live.into_iter().filter(|p| range.contains(*p))),
        Err(e) => {
            tracing::warn!(error = %e, "runtime port listing unavailable, allocating from registry only");
        }
    }

    first_free_port(range, &excluded).ok_or(ProjectError::NoCapacity {
        start: range.start,
        end: range.end,
    })
}
