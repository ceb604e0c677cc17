use k8s_openapi::api::core::v1::Pod;

use ktail_types::{ContainerSpec, PodSnapshot};

/// Decode a Pod into an owned snapshot, or explain why it cannot be used
pub fn pod_snapshot(pod: &Pod) -> Result<PodSnapshot, String> {
    let meta = &pod.metadata;
    let name = meta.name.clone().ok_or("pod has no metadata.name")?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| format!("pod {} has no metadata.namespace", name))?;
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| format!("pod {}/{} has no spec", namespace, name))?;

    Ok(PodSnapshot {
        namespace,
        name,
        uid: meta.uid.clone(),
        labels: meta.labels.clone().unwrap_or_default(),
        containers: spec
            .containers
            .iter()
            .map(|c| ContainerSpec {
                name: c.name.clone(),
                image: c.image.clone(),
            })
            .collect(),
    })
}
