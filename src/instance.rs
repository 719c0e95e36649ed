//! Enumerates the virtual machine instances known to the cluster manager.

use crate::api::{self, Api, ApiError, Backoff, JobId, JobResult};
use serde::Deserialize;

/// A virtual machine instance, as far as access control is concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// The instance's name. Also the name of its key file.
    pub id: String,

    /// The port on the hosting node that forwards to the instance's console.
    pub network_port: u16,
}

/// One entry of the instance collection. The API returns more fields; only `id` matters here.
#[derive(Debug, Deserialize)]
struct InstanceSummary {
    id: String,
}

/// The parts of a single-instance resource that we use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct InstanceInfo {
    pub network_port: u16,
}

/// Returns the IDs of all instances, in the order the API lists them.
pub async fn list_instances<A: Api + ?Sized>(api: &A) -> Result<Vec<String>, ApiError> {
    let instances: Vec<InstanceSummary> = api::get_json(api, "/instances").await?;
    Ok(instances.into_iter().map(|i| i.id).collect())
}

/// Returns the single-instance details for `id`.
///
/// # Errors
///
/// Returns [ApiError::NotFound] if the cluster manager answers with HTTP 404, and passes other
/// errors through unchanged.
pub async fn instance_info<A: Api + ?Sized>(api: &A, id: &str) -> Result<InstanceInfo, ApiError> {
    api::get_json(api, &format!("/instances/{id}"))
        .await
        .map_err(|error| not_found(error, id))
}

/// Fetches `id` and combines it with its details into an [Instance].
pub async fn instance<A: Api + ?Sized>(api: &A, id: &str) -> Result<Instance, ApiError> {
    let info = instance_info(api, id).await?;
    Ok(Instance {
        id: id.to_owned(),
        network_port: info.network_port,
    })
}

/// Requests the static (configuration) information for `id` and waits for the job to finish.
pub async fn instance_static_info<A: Api + ?Sized>(
    api: &A,
    id: &str,
    backoff: &Backoff,
) -> Result<JobResult, ApiError> {
    let job: JobId = api::get_json(api, &format!("/instances/{id}/info?static=1"))
        .await
        .map_err(|error| not_found(error, id))?;
    api::poll_job(api, &job, Some(id), backoff).await
}

fn not_found(error: ApiError, id: &str) -> ApiError {
    match error {
        ApiError::Status { status: 404, .. } => ApiError::NotFound(id.to_owned()),
        other => other,
    }
}

#[cfg(test)]
mod test;
