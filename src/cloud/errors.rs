//! Provider error codes and their translation into domain errors

use crate::error::Error;

pub const LOAD_BALANCER_NOT_FOUND: &str = "LoadBalancerNotFound";
pub const TARGET_GROUP_NOT_FOUND: &str = "TargetGroupNotFound";
pub const LISTENER_NOT_FOUND: &str = "ListenerNotFound";
pub const INVALID_INSTANCE: &str = "InvalidInstance";
pub const INVALID_TARGET: &str = "InvalidTarget";
pub const SUBNET_NOT_FOUND: &str = "InvalidSubnetID.NotFound";
pub const DUPLICATE_LOAD_BALANCER_NAME: &str = "DuplicateLoadBalancerName";
pub const DUPLICATE_TARGET_GROUP_NAME: &str = "DuplicateTargetGroupName";
pub const DUPLICATE_LISTENER: &str = "DuplicateListener";
pub const RESOURCE_IN_USE: &str = "ResourceInUse";
pub const INCORRECT_INSTANCE_STATE: &str = "IncorrectInstanceState";
pub const ACCESS_DENIED: &str = "AccessDenied";
pub const UNAUTHORIZED_OPERATION: &str = "UnauthorizedOperation";
pub const THROTTLING: &str = "Throttling";
pub const DEPENDENCY_THROTTLE: &str = "DependencyThrottle";
pub const REQUEST_LIMIT_EXCEEDED: &str = "RequestLimitExceeded";

pub fn is_throttle_code(code: &str) -> bool {
    matches!(code, THROTTLING | DEPENDENCY_THROTTLE | REQUEST_LIMIT_EXCEEDED)
}

pub fn is_access_denied_code(code: &str) -> bool {
    matches!(code, ACCESS_DENIED | UNAUTHORIZED_OPERATION)
}

/// Map a raw provider error onto a domain sentinel where one exists
pub fn translate(err: Error) -> Error {
    let Error::Provider { code, message } = err else {
        return err;
    };
    match code.as_str() {
        LOAD_BALANCER_NOT_FOUND | TARGET_GROUP_NOT_FOUND | LISTENER_NOT_FOUND
        | SUBNET_NOT_FOUND => Error::NotFound(message),
        DUPLICATE_LOAD_BALANCER_NAME | DUPLICATE_TARGET_GROUP_NAME | DUPLICATE_LISTENER
        | RESOURCE_IN_USE => Error::Conflict(message),
        INCORRECT_INSTANCE_STATE => Error::InstanceNotRunning(message),
        ACCESS_DENIED | UNAUTHORIZED_OPERATION => Error::AccessDenied(message),
        _ => Error::Provider { code, message },
    }
}

/// Load balancer is missing, either as a raw provider code or already translated
pub fn is_load_balancer_not_found(err: &Error) -> bool {
    err.is_not_found() || err.provider_code() == Some(LOAD_BALANCER_NOT_FOUND)
}

/// Deregistering a target that is already gone succeeds
pub fn is_deregister_noop(err: &Error) -> bool {
    matches!(
        err.provider_code(),
        Some(LOAD_BALANCER_NOT_FOUND | TARGET_GROUP_NOT_FOUND | INVALID_INSTANCE | INVALID_TARGET)
    )
}
