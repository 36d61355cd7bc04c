use thiserror::Error;
use tonic::Status;

use crate::device::DeviceRegistry;

/// Separator appended after each bus address in the allocation value.
pub const SEPARATOR: char = ',';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("invalid allocation request with non-existing device {id}")]
    UnknownDevice { id: String },
    #[error("invalid allocation request with unhealthy device {id}")]
    UnhealthyDevice { id: String },
}

impl From<AllocationError> for Status {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::UnknownDevice { .. } => Status::not_found(err.to_string()),
            AllocationError::UnhealthyDevice { .. } => {
                Status::failed_precondition(err.to_string())
            }
        }
    }
}

/// Validates every requested id of every container against one registry
/// view and returns, per container, the joined bus addresses.
///
/// All or nothing: the first unknown or unhealthy id fails the whole call.
/// The registry is only read.
pub fn allocate<'a, I>(
    registry: &DeviceRegistry,
    requests: I,
) -> Result<Vec<String>, AllocationError>
where
    I: IntoIterator<Item = &'a [String]>,
{
    registry.read(|devices| {
        requests
            .into_iter()
            .map(|ids| -> Result<String, AllocationError> {
                let mut value = String::new();
                for id in ids {
                    let device = devices
                        .get(id)
                        .ok_or_else(|| AllocationError::UnknownDevice { id: id.clone() })?;
                    if !device.health.is_healthy() {
                        return Err(AllocationError::UnhealthyDevice { id: id.clone() });
                    }
                    value.push_str(id);
                    value.push(SEPARATOR);
                }
                Ok(value)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::Device;
    use crate::device::Health;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_devices([
            Device::new("0000:00:03.0", Health::Healthy),
            Device::new("0000:00:04.0", Health::Healthy),
            Device::new("0000:00:05.0", Health::Unhealthy),
        ])
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn single_healthy_device() {
        let requests = [ids(&["0000:00:03.0"])];

        let values = allocate(&registry(), requests.iter().map(Vec::as_slice))
            .expect("should allocate");

        assert_eq!(values, vec!["0000:00:03.0,".to_string()]);
    }

    #[test]
    fn keeps_request_order_per_container() {
        let requests = [ids(&["0000:00:04.0", "0000:00:03.0"]), ids(&["0000:00:03.0"])];

        let values = allocate(&registry(), requests.iter().map(Vec::as_slice))
            .expect("should allocate");

        assert_eq!(
            values,
            vec![
                "0000:00:04.0,0000:00:03.0,".to_string(),
                "0000:00:03.0,".to_string()
            ]
        );
    }

    #[test]
    fn unknown_device_fails_whole_call() {
        let requests = [ids(&["0000:00:03.0"]), ids(&["0000:99:99.9"])];

        let err = allocate(&registry(), requests.iter().map(Vec::as_slice))
            .expect_err("should reject unknown device");

        assert_eq!(
            err,
            AllocationError::UnknownDevice {
                id: "0000:99:99.9".to_string()
            }
        );
        assert!(err.to_string().contains("0000:99:99.9"));
    }

    #[test]
    fn unhealthy_device_fails_and_leaves_registry_untouched() {
        let registry = registry();
        let before = registry.snapshot();
        let requests = [ids(&["0000:00:03.0", "0000:00:05.0"])];

        let err = allocate(&registry, requests.iter().map(Vec::as_slice))
            .expect_err("should reject unhealthy device");

        assert_eq!(
            err,
            AllocationError::UnhealthyDevice {
                id: "0000:00:05.0".to_string()
            }
        );
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn status_codes() {
        let status = Status::from(AllocationError::UnknownDevice {
            id: "x".to_string(),
        });
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status = Status::from(AllocationError::UnhealthyDevice {
            id: "x".to_string(),
        });
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
